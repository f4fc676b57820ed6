//! Credential record persistence.
//!
//! Raw SQL with rusqlite, no ORM. Expiry is stored as unix seconds so the
//! refresh sweep can range-scan it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::credentials::{Credential, Provider};

const COLUMNS: &str = "id, user_id, provider, access_token, refresh_token, expires_at, \
                       external_account, instance_url";

/// Repository for credential records.
pub struct CredentialRepository;

impl CredentialRepository {
    /// Insert or replace the credential for `(user_id, provider)`.
    /// Returns the row ID.
    pub fn upsert(conn: &Connection, credential: &Credential) -> Result<i64> {
        conn.execute(
            "INSERT INTO credentials \
             (user_id, provider, access_token, refresh_token, expires_at, external_account, instance_url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(user_id, provider) DO UPDATE SET \
             access_token = excluded.access_token, refresh_token = excluded.refresh_token, \
             expires_at = excluded.expires_at, external_account = excluded.external_account, \
             instance_url = excluded.instance_url, updated_at = CURRENT_TIMESTAMP",
            params![
                credential.user_id,
                credential.provider.as_str(),
                credential.access_token,
                credential.refresh_token,
                credential.expires_at.timestamp(),
                credential.external_account,
                credential.instance_url,
            ],
        )
        .context("Failed to upsert credential")?;

        let id = conn
            .query_row(
                "SELECT id FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![credential.user_id, credential.provider.as_str()],
                |row| row.get(0),
            )
            .context("Failed to read credential id")?;
        Ok(id)
    }

    /// Persist a refreshed token set.
    ///
    /// Expiry only moves forward, and a missing refresh token keeps the stored one.
    pub fn update_tokens(conn: &Connection, credential: &Credential) -> Result<()> {
        let updated = conn
            .execute(
                "UPDATE credentials SET access_token = ?1, \
                 refresh_token = COALESCE(?2, refresh_token), \
                 expires_at = MAX(expires_at, ?3), \
                 instance_url = COALESCE(?4, instance_url), \
                 updated_at = CURRENT_TIMESTAMP \
                 WHERE id = ?5",
                params![
                    credential.access_token,
                    credential.refresh_token,
                    credential.expires_at.timestamp(),
                    credential.instance_url,
                    credential.id,
                ],
            )
            .context("Failed to update credential tokens")?;

        if updated == 0 {
            anyhow::bail!("Credential {} does not exist", credential.id);
        }
        Ok(())
    }

    pub fn get(conn: &Connection, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM credentials WHERE user_id = ?1 AND provider = ?2"
            ))
            .context("Failed to prepare credential query")?;

        let mut rows = stmt
            .query_map(params![user_id, provider.as_str()], Self::from_row)
            .context("Failed to query credential")?;

        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Credentials whose access token expires at or before `before`, soonest first.
    pub fn list_expiring(conn: &Connection, before: DateTime<Utc>) -> Result<Vec<Credential>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM credentials WHERE expires_at <= ?1 ORDER BY expires_at ASC"
            ))
            .context("Failed to prepare expiring credentials query")?;

        let records = stmt
            .query_map(params![before.timestamp()], Self::from_row)
            .context("Failed to query expiring credentials")?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Credential>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM credentials ORDER BY user_id, provider"
            ))
            .context("Failed to prepare credentials list query")?;

        let records = stmt
            .query_map([], Self::from_row)
            .context("Failed to query credentials")?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
        let provider: String = row.get(2)?;
        let provider = provider
            .parse::<Provider>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        let expires_at: i64 = row.get(5)?;

        Ok(Credential {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider,
            access_token: row.get(3)?,
            refresh_token: row.get(4)?,
            expires_at: DateTime::from_timestamp(expires_at, 0).unwrap_or(DateTime::UNIX_EPOCH),
            external_account: row.get(6)?,
            instance_url: row.get(7)?,
        })
    }
}
