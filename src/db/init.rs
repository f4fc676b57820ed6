use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// Open the default database under the data directory and apply migrations.
pub fn init_db() -> Result<Connection> {
    let db_path = crate::global::db_file()?;
    open_db(&db_path)
}

pub fn open_db(db_path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(db_path).context("Failed to open database connection")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at INTEGER NOT NULL,
            external_account TEXT NOT NULL,
            instance_url TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(user_id, provider)
        )",
        [],
    )
    .context("Failed to create credentials table")?;

    // The refresh sweep scans by expiry
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_credentials_expires_at ON credentials(expires_at)",
        [],
    )
    .context("Failed to create index on expires_at")?;

    Ok(())
}
