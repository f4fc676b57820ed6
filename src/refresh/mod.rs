//! Background sweep that refreshes credentials shortly before they expire.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::RefreshConfig;
use crate::credentials::CredentialManager;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub refreshed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.refreshed + self.failed + self.timed_out
    }
}

enum Outcome {
    Refreshed,
    Failed,
    TimedOut,
}

pub struct RefreshSweeper {
    manager: Arc<CredentialManager>,
    window: ChronoDuration,
    task_timeout: Duration,
    interval: Duration,
    enabled: bool,
}

impl RefreshSweeper {
    pub fn new(manager: Arc<CredentialManager>, window: ChronoDuration, task_timeout: Duration) -> Self {
        Self {
            manager,
            window,
            task_timeout,
            interval: Duration::from_secs(300),
            enabled: true,
        }
    }

    pub fn from_config(manager: Arc<CredentialManager>, config: &RefreshConfig) -> Self {
        Self {
            manager,
            window: ChronoDuration::seconds(config.window_seconds),
            task_timeout: Duration::from_secs(config.task_timeout_seconds),
            interval: Duration::from_secs(config.interval_seconds.max(1)),
            enabled: config.enabled,
        }
    }

    /// Refresh every credential expiring within the window. Each credential
    /// gets its own task bounded by the task timeout; a task that runs over
    /// is dropped, and no single failure stops the others.
    pub async fn sweep_once(&self) -> anyhow::Result<SweepReport> {
        let cutoff = Utc::now() + self.window;
        let due = self.manager.store().list_expiring(cutoff).await?;
        if due.is_empty() {
            debug!("Refresh sweep: nothing expires before {}", cutoff);
            return Ok(SweepReport::default());
        }
        info!("Refresh sweep: {} credential(s) expire before {}", due.len(), cutoff);

        let mut tasks = JoinSet::new();
        for credential in due {
            let manager = self.manager.clone();
            let timeout = self.task_timeout;
            tasks.spawn(async move {
                let label = format!("{} credential {}", credential.provider, credential.id);
                match tokio::time::timeout(timeout, manager.refresh(&credential)).await {
                    Ok(Ok(refreshed)) => {
                        info!("Refresh sweep: {} now expires {}", label, refreshed.expires_at);
                        Outcome::Refreshed
                    }
                    Ok(Err(e)) => {
                        warn!("Refresh sweep: {} failed: {}", label, e);
                        Outcome::Failed
                    }
                    Err(_) => {
                        warn!("Refresh sweep: {} timed out after {:?}", label, timeout);
                        Outcome::TimedOut
                    }
                }
            });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Refreshed) => report.refreshed += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::TimedOut) => report.timed_out += 1,
                Err(e) => {
                    error!("Refresh sweep task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Refresh sweep finished: {} refreshed, {} failed, {} timed out",
            report.refreshed, report.failed, report.timed_out
        );
        Ok(report)
    }

    /// Run sweeps forever on the configured interval. Returns `None` when
    /// sweeping is disabled.
    pub fn spawn_background(self) -> Option<JoinHandle<()>> {
        if !self.enabled {
            info!("Credential refresh sweep is disabled");
            return None;
        }

        info!("Credential refresh sweep every {:?}", self.interval);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!("Refresh sweep could not list credentials: {:#}", e);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{
        Credential, CredentialStore, Provider, SqliteCredentialStore, TokenRefresher, TokenSet,
    };
    use crate::integrations::{ErrorKind, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Behaves by user id: "ok" refreshes, "bad" is rejected, "stuck" never answers.
    struct ScriptedRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for ScriptedRefresher {
        fn provider(&self) -> Provider {
            Provider::HubSpot
        }

        async fn refresh(&self, credential: &Credential) -> Result<TokenSet, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match credential.user_id.as_str() {
                "bad" => Err(ProviderError::new(
                    Provider::HubSpot,
                    ErrorKind::Auth,
                    Some(400),
                    r#"{"error":"invalid_grant"}"#,
                )),
                "stuck" => std::future::pending().await,
                _ => Ok(TokenSet {
                    access_token: format!("new-{}", credential.user_id),
                    refresh_token: None,
                    expires_at: Utc::now() + ChronoDuration::hours(6),
                    instance_url: None,
                }),
            }
        }
    }

    fn credential(user: &str, expires_in: ChronoDuration) -> Credential {
        Credential {
            id: 0,
            user_id: user.to_string(),
            provider: Provider::HubSpot,
            access_token: "old".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Utc::now() + expires_in,
            external_account: "portal".to_string(),
            instance_url: None,
        }
    }

    fn sweeper(users: &[(&str, ChronoDuration)]) -> (RefreshSweeper, Arc<SqliteCredentialStore>, Arc<ScriptedRefresher>) {
        let store = Arc::new(SqliteCredentialStore::in_memory().unwrap());
        for (user, expires_in) in users {
            store.upsert(&credential(user, *expires_in)).unwrap();
        }
        let refresher = Arc::new(ScriptedRefresher {
            calls: AtomicUsize::new(0),
        });
        let manager = CredentialManager::new(store.clone()).with_refresher(refresher.clone());
        let sweeper = RefreshSweeper::new(
            Arc::new(manager),
            ChronoDuration::minutes(10),
            Duration::from_secs(30),
        );
        (sweeper, store, refresher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_isolates_failures_and_timeouts() {
        let (sweeper, store, refresher) = sweeper(&[
            ("ok", ChronoDuration::minutes(5)),
            ("bad", ChronoDuration::minutes(5)),
            ("stuck", ChronoDuration::minutes(5)),
        ]);

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                refreshed: 1,
                failed: 1,
                timed_out: 1
            }
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
        let ok = store.get("ok", Provider::HubSpot).await.unwrap().unwrap();
        assert_eq!(ok.access_token, "new-ok");
        let bad = store.get("bad", Provider::HubSpot).await.unwrap().unwrap();
        assert_eq!(bad.access_token, "old");
    }

    #[tokio::test]
    async fn test_sweep_skips_credentials_outside_window() {
        let (sweeper, _store, refresher) = sweeper(&[
            ("ok", ChronoDuration::hours(2)),
            ("later", ChronoDuration::minutes(30)),
        ]);

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.total(), 0);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_sweeper_does_not_spawn() {
        let (sweeper, _store, _refresher) = sweeper(&[]);
        let disabled = RefreshSweeper {
            enabled: false,
            ..sweeper
        };
        assert!(disabled.spawn_background().is_none());
    }
}
