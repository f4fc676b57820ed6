//! Runs each [`WorkflowSession`] as its own task.
//!
//! The session loop only reacts to messages. Gateway and generation calls run
//! in spawned workers that post a tagged [`JobResult`] back to the session's
//! inbox, so a slow CRM or model call never blocks commands, and one session's
//! failure never touches another.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::{
    Job, JobResult, SessionCommand, SessionError, SessionEvent, SessionSnapshot, WorkflowSession,
};
use crate::credentials::Provider;
use crate::integrations::Gateway;
use crate::suggestions::{SuggestionController, Transcript};

/// Who the session works for and what it works on.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub provider: Provider,
    pub transcript: Transcript,
}

/// Shared services the workers call.
#[derive(Clone)]
pub struct SessionServices {
    pub gateway: Arc<Gateway>,
    pub suggestions: Arc<SuggestionController>,
}

enum SessionMessage {
    Command(SessionCommand),
    Result(JobResult),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close,
}

/// Sending side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(SessionMessage::Command(command))
            .map_err(|_| anyhow!("session is closed"))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Snapshot(reply))
            .map_err(|_| anyhow!("session is closed"))?;
        rx.await.map_err(|_| anyhow!("session is closed"))
    }

    pub fn close(&self) {
        let _ = self.tx.send(SessionMessage::Close);
    }
}

/// Start a session task. Events are delivered on the returned receiver until
/// the session closes.
pub fn spawn_session(
    context: SessionContext,
    services: SessionServices,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, inbox) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let worker_tx = tx.downgrade();
    tokio::spawn(run_session(
        Arc::new(context),
        services,
        inbox,
        worker_tx,
        events_tx,
    ));

    (SessionHandle { tx }, events_rx)
}

async fn run_session(
    context: Arc<SessionContext>,
    services: SessionServices,
    mut inbox: mpsc::UnboundedReceiver<SessionMessage>,
    worker_tx: mpsc::WeakUnboundedSender<SessionMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut session = WorkflowSession::new();
    debug!("Session started for {} on {}", context.user_id, context.provider);

    while let Some(message) = inbox.recv().await {
        let transition = match message {
            SessionMessage::Command(command) => session.handle(command),
            SessionMessage::Result(result) => session.on_result(result),
            SessionMessage::Snapshot(reply) => {
                let _ = reply.send(session.snapshot());
                continue;
            }
            SessionMessage::Close => session.close(),
        };

        for event in transition.events {
            let _ = events.send(event);
        }
        for job in transition.jobs {
            dispatch(job, context.clone(), services.clone(), worker_tx.clone());
        }

        if session.is_closed() {
            break;
        }
    }

    debug!("Session for {} finished", context.user_id);
}

fn dispatch(
    job: Job,
    context: Arc<SessionContext>,
    services: SessionServices,
    reply: mpsc::WeakUnboundedSender<SessionMessage>,
) {
    tokio::spawn(async move {
        let result = execute(job, &context, &services).await;
        // The session may have closed while we worked.
        if let Some(tx) = reply.upgrade() {
            let _ = tx.send(SessionMessage::Result(result));
        }
    });
}

async fn execute(job: Job, context: &SessionContext, services: &SessionServices) -> JobResult {
    let gateway = &services.gateway;
    match job {
        Job::Search { tag, query } => {
            let result = async {
                let credential = gateway.load_credential(&context.user_id, context.provider).await?;
                gateway.search(credential, &query).await
            }
            .await
            .map_err(SessionError::from);
            JobResult::Searched { tag, result }
        }
        Job::LoadContact { tag, contact_id } => {
            let result = async {
                let credential = gateway.load_credential(&context.user_id, context.provider).await?;
                gateway.get(credential, &contact_id).await
            }
            .await
            .map_err(SessionError::from);
            JobResult::ContactLoaded { tag, result }
        }
        Job::Generate { tag } => {
            let result = services
                .suggestions
                .generate(&context.transcript, context.provider)
                .await
                .map_err(SessionError::from);
            JobResult::Generated { tag, result }
        }
        Job::Apply {
            tag,
            contact_id,
            suggestions,
        } => {
            let result = async {
                let credential = gateway.load_credential(&context.user_id, context.provider).await?;
                services
                    .suggestions
                    .apply_updates(gateway, credential, &contact_id, &suggestions)
                    .await
            }
            .await
            .map_err(SessionError::from);
            JobResult::Applied { tag, result }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session {0} is closed")]
    Closed(Uuid),
}

struct SessionEntry {
    handle: SessionHandle,
    events: Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    last_seen: Mutex<Instant>,
}

/// Idle time after which an untouched session is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Open sessions by id, for the HTTP surface.
pub struct SessionRegistry {
    services: SessionServices,
    sessions: Mutex<HashMap<Uuid, Arc<SessionEntry>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub async fn open(&self, context: SessionContext) -> Uuid {
        let id = Uuid::new_v4();
        info!(
            "Opening session {} for {} on {}",
            id, context.user_id, context.provider
        );
        let (handle, events) = spawn_session(context, self.services.clone());
        self.sessions.lock().await.insert(
            id,
            Arc::new(SessionEntry {
                handle,
                events: Mutex::new(events),
                last_seen: Mutex::new(Instant::now()),
            }),
        );
        id
    }

    /// Look up a session and mark it as used.
    async fn entry(&self, id: Uuid) -> Result<Arc<SessionEntry>, RegistryError> {
        let entry = self
            .sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))?;
        *entry.last_seen.lock().await = Instant::now();
        Ok(entry)
    }

    pub async fn send(&self, id: Uuid, command: SessionCommand) -> Result<(), RegistryError> {
        let entry = self.entry(id).await?;
        entry.handle.send(command).map_err(|_| RegistryError::Closed(id))
    }

    pub async fn snapshot(&self, id: Uuid) -> Result<SessionSnapshot, RegistryError> {
        let entry = self.entry(id).await?;
        entry.handle.snapshot().await.map_err(|_| RegistryError::Closed(id))
    }

    /// Collect pending events, waiting up to `wait` for the first one. A
    /// session that has closed is forgotten once its last events are taken.
    pub async fn events(&self, id: Uuid, wait: Duration) -> Result<Vec<SessionEvent>, RegistryError> {
        let entry = self.entry(id).await?;
        let mut rx = entry.events.lock().await;
        let mut collected = Vec::new();
        let mut finished = false;

        if !wait.is_zero() {
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(event)) => collected.push(event),
                Ok(None) => finished = true,
                Err(_) => {}
            }
        }
        loop {
            match rx.try_recv() {
                Ok(event) => collected.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    finished = true;
                    break;
                }
            }
        }
        drop(rx);

        if finished {
            debug!("Session {} drained, removing", id);
            self.sessions.lock().await.remove(&id);
        }
        Ok(collected)
    }

    pub async fn close(&self, id: Uuid) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        entry.handle.close();
        info!("Closed session {}", id);
        Ok(())
    }

    /// Close every session nobody has touched within the idle timeout.
    /// Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let entries: Vec<(Uuid, Arc<SessionEntry>)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut idle = Vec::new();
        for (id, entry) in entries {
            if entry.last_seen.lock().await.elapsed() >= self.idle_timeout {
                idle.push(id);
            }
        }

        let mut reaped = 0;
        for id in idle {
            if self.close(id).await.is_ok() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Closed {} idle session(s)", reaped);
        }
        reaped
    }

    /// Reap idle sessions every `interval` until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        info!(
            "Idle session reaper every {:?} (timeout {:?})",
            interval, self.idle_timeout
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.reap_idle().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialManager, SqliteCredentialStore, TokenRefresher, TokenSet};
    use crate::integrations::{CanonicalField, Contact, CrmAdapter, ProviderError};
    use crate::suggestions::{GenerationError, GenerativeClient, RateLimitPolicy, TranscriptSegment};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeCrm {
        updates: std::sync::Mutex<Vec<BTreeMap<String, String>>>,
    }

    impl FakeCrm {
        fn contact(id: &str) -> Contact {
            let mut fields = BTreeMap::new();
            fields.insert(CanonicalField::FirstName, format!("Contact{id}"));
            fields.insert(CanonicalField::City, "Boston".to_string());
            Contact::new(id, Provider::HubSpot, fields)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeCrm {
        fn provider(&self) -> Provider {
            Provider::HubSpot
        }

        async fn refresh(&self, _credential: &Credential) -> Result<TokenSet, ProviderError> {
            Ok(TokenSet {
                access_token: "fresh".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + ChronoDuration::hours(1),
                instance_url: None,
            })
        }
    }

    #[async_trait]
    impl CrmAdapter for FakeCrm {
        async fn search(&self, _credential: &Credential, query: &str) -> Result<Vec<Contact>, ProviderError> {
            Ok(vec![Self::contact(&format!("{query}-1"))])
        }

        async fn get(&self, _credential: &Credential, id: &str) -> Result<Contact, ProviderError> {
            Ok(Self::contact(id))
        }

        async fn update(
            &self,
            _credential: &Credential,
            id: &str,
            properties: &BTreeMap<String, String>,
        ) -> Result<Contact, ProviderError> {
            self.updates.lock().unwrap().push(properties.clone());
            Ok(Self::contact(id))
        }
    }

    /// The first call blocks until released; later calls answer at once.
    struct GatedClient {
        calls: AtomicUsize,
        started: mpsc::UnboundedSender<usize>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl GenerativeClient for GatedClient {
        async fn complete(&self, _prompt: &str) -> Result<String, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(call);
            if call == 0 {
                self.release.notified().await;
                return Ok(r#"[{"field":"city","value":"Stale City"}]"#.to_string());
            }
            Ok(r#"[{"field":"city","value":"Denver"},{"field":"phone","value":"555-0100"}]"#.to_string())
        }
    }

    struct Harness {
        registry: SessionRegistry,
        crm: Arc<FakeCrm>,
        started: mpsc::UnboundedReceiver<usize>,
        release: Arc<Notify>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteCredentialStore::in_memory().unwrap());
        store
            .upsert(&Credential {
                id: 0,
                user_id: "user-1".to_string(),
                provider: Provider::HubSpot,
                access_token: "token".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: Utc::now() + ChronoDuration::hours(1),
                external_account: "portal".to_string(),
                instance_url: None,
            })
            .unwrap();

        let crm = Arc::new(FakeCrm {
            updates: std::sync::Mutex::new(Vec::new()),
        });
        let manager = CredentialManager::new(store).with_refresher(crm.clone());
        let gateway = Gateway::new(Arc::new(manager)).with_adapter(crm.clone());

        let (started_tx, started) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let client = Arc::new(GatedClient {
            calls: AtomicUsize::new(0),
            started: started_tx,
            release: release.clone(),
        });
        let suggestions = SuggestionController::new(client, RateLimitPolicy::default()).unwrap();

        let registry = SessionRegistry::new(SessionServices {
            gateway: Arc::new(gateway),
            suggestions: Arc::new(suggestions),
        });
        Harness {
            registry,
            crm,
            started,
            release,
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            user_id: "user-1".to_string(),
            provider: Provider::HubSpot,
            transcript: Transcript {
                title: None,
                participants: vec!["Ann".to_string()],
                segments: vec![TranscriptSegment {
                    speaker: "Ann".to_string(),
                    start_seconds: 1.0,
                    text: "I moved to Denver, new number is 555-0100.".to_string(),
                }],
            },
        }
    }

    async fn next_events(registry: &SessionRegistry, id: Uuid) -> Vec<SessionEvent> {
        registry.events(id, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_search_round_trip() {
        let h = harness();
        let id = h.registry.open(context()).await;

        h.registry
            .send(id, SessionCommand::Search { query: "ann".to_string() })
            .await
            .unwrap();
        let events = next_events(&h.registry, id).await;

        assert!(matches!(
            &events[..],
            [SessionEvent::ResultsReady { contacts, .. }] if contacts[0].id == "ann-1"
        ));
    }

    #[tokio::test]
    async fn test_late_generation_for_previous_contact_is_discarded() {
        let mut h = harness();
        let id = h.registry.open(context()).await;

        h.registry
            .send(id, SessionCommand::Select { contact_id: "1".to_string() })
            .await
            .unwrap();
        assert_eq!(h.started.recv().await, Some(0));

        h.registry
            .send(id, SessionCommand::Select { contact_id: "2".to_string() })
            .await
            .unwrap();
        let events = next_events(&h.registry, id).await;
        match &events[..] {
            [SessionEvent::SuggestionsReady { contact, suggestions }] => {
                assert_eq!(contact.id, "2");
                assert_eq!(suggestions[0].proposed_value, "Denver");
            }
            other => panic!("unexpected events {other:?}"),
        }

        h.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = h.registry.snapshot(id).await.unwrap();
        assert_eq!(snapshot.contact.map(|c| c.id), Some("2".to_string()));
        assert_eq!(snapshot.suggestions[0].proposed_value, "Denver");
        assert!(h.registry.events(id, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_applies_checked_fields_and_closes() {
        let mut h = harness();
        let id = h.registry.open(context()).await;
        // Use up the gated first call.
        h.release.notify_one();

        h.registry
            .send(id, SessionCommand::Select { contact_id: "7".to_string() })
            .await
            .unwrap();
        h.started.recv().await;
        let _ = next_events(&h.registry, id).await;

        h.registry
            .send(id, SessionCommand::Generate)
            .await
            .unwrap();
        let events = next_events(&h.registry, id).await;
        assert!(matches!(&events[..], [SessionEvent::SuggestionsReady { .. }]));

        let mut selected = BTreeMap::new();
        selected.insert(CanonicalField::Phone, true);
        h.registry
            .send(id, SessionCommand::Submit { selected: Some(selected) })
            .await
            .unwrap();

        let mut events = next_events(&h.registry, id).await;
        if events.len() < 2 {
            events.extend(next_events(&h.registry, id).await);
        }
        assert!(matches!(
            &events[..],
            [SessionEvent::Applied { count: 1, .. }, SessionEvent::Closed]
        ));
        let updates = h.crm.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1);
        assert_eq!(updates[0].get("phone").map(String::as_str), Some("555-0100"));

        // Drained and closed sessions are forgotten.
        let _ = h.registry.events(id, Duration::from_millis(50)).await;
        assert!(matches!(
            h.registry.send(id, SessionCommand::Clear).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_sessions_are_reaped() {
        let registry = Arc::new(harness().registry.with_idle_timeout(Duration::from_secs(60)));
        for _ in 0..20 {
            let id = registry.open(context()).await;
            registry
                .send(id, SessionCommand::Search { query: "ab".to_string() })
                .await
                .unwrap();
        }
        assert_eq!(registry.len().await, 20);

        let reaper = registry.spawn_reaper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(registry.is_empty().await);
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_used_session_survives_reaping() {
        let registry = harness().registry.with_idle_timeout(Duration::from_secs(60));
        let active = registry.open(context()).await;
        let idle = registry.open(context()).await;

        tokio::time::advance(Duration::from_secs(40)).await;
        registry.snapshot(active).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.reap_idle().await, 1);
        assert!(registry.snapshot(active).await.is_ok());
        assert!(matches!(
            registry.snapshot(idle).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness();
        let err = h.registry.snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_removes_session() {
        let h = harness();
        let id = h.registry.open(context()).await;
        assert_eq!(h.registry.len().await, 1);

        h.registry.close(id).await.unwrap();

        assert!(h.registry.is_empty().await);
        assert!(h.registry.close(id).await.is_err());
    }
}
