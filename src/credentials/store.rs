//! Durable credential storage.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use super::{Credential, Provider};
use crate::db::{self, CredentialRepository};

/// Credential persistence keyed by (user, provider).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>>;

    /// Persist a refreshed token set for an existing credential.
    async fn update(&self, credential: &Credential) -> Result<()>;

    async fn list_expiring(&self, before: DateTime<Utc>) -> Result<Vec<Credential>>;
}

/// SQLite-backed store. Queries are short, so they run inline under a mutex.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(db::init_db()?))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::migrate(&conn)?;
        Ok(Self::new(conn))
    }

    /// Insert or replace a credential, e.g. after an account is connected.
    pub fn upsert(&self, credential: &Credential) -> Result<i64> {
        let conn = self.lock()?;
        CredentialRepository::upsert(&conn, credential)
    }

    pub fn list(&self) -> Result<Vec<Credential>> {
        let conn = self.lock()?;
        CredentialRepository::list(&conn)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let conn = self.lock()?;
        CredentialRepository::get(&conn, user_id, provider)
    }

    async fn update(&self, credential: &Credential) -> Result<()> {
        let conn = self.lock()?;
        CredentialRepository::update_tokens(&conn, credential)
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> Result<Vec<Credential>> {
        let conn = self.lock()?;
        CredentialRepository::list_expiring(&conn, before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_store_round_trip_through_trait() {
        let store = SqliteCredentialStore::in_memory().unwrap();
        let expires_at = DateTime::from_timestamp(Utc::now().timestamp() + 120, 0).unwrap();
        let mut credential = Credential {
            id: 0,
            user_id: "carol".to_string(),
            provider: Provider::HubSpot,
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            expires_at,
            external_account: "portal".to_string(),
            instance_url: None,
        };
        credential.id = store.upsert(&credential).unwrap();

        let due = store
            .list_expiring(Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(due, vec![credential.clone()]);

        credential.access_token = "b".to_string();
        store.update(&credential).await.unwrap();
        let loaded = store.get("carol", Provider::HubSpot).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "b");
    }
}
