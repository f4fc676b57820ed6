use crate::api::ApiServer;
use crate::config::Config;
use crate::credentials::{CredentialManager, Provider, SqliteCredentialStore};
use crate::integrations::{build_adapter, Gateway};
use crate::refresh::{RefreshSweeper, SweepReport};
use crate::suggestions::{GeminiClient, RateLimitPolicy, SuggestionController};
use crate::workflow::{SessionRegistry, SessionServices};
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Credential manager and gateway wired with every provider's adapter.
pub struct Integrations {
    pub credentials: Arc<CredentialManager>,
    pub gateway: Arc<Gateway>,
}

pub fn build_integrations(config: &Config) -> Result<Integrations> {
    let store = Arc::new(SqliteCredentialStore::open_default()?);
    let mut manager = CredentialManager::new(store);
    let mut adapters = Vec::new();

    for provider in Provider::ALL {
        let handle = build_adapter(provider, config)?;
        manager = manager.with_refresher(handle.refresher);
        adapters.push(handle.adapter);
    }

    let credentials = Arc::new(manager);
    let gateway = adapters
        .into_iter()
        .fold(Gateway::new(credentials.clone()), |gateway, adapter| gateway.with_adapter(adapter));

    Ok(Integrations {
        credentials,
        gateway: Arc::new(gateway),
    })
}

pub async fn run_service() -> Result<()> {
    info!("Starting crmlink service");

    let config = Config::load()?;
    let integrations = build_integrations(&config)?;

    if config.ai.api_key.is_none() {
        warn!("No generative service API key configured; suggestion requests will fail");
    }
    let client = Arc::new(GeminiClient::new(config.ai.clone())?);
    let suggestions = SuggestionController::new(client, RateLimitPolicy::from_config(&config.ai))?;

    let registry = Arc::new(
        SessionRegistry::new(SessionServices {
            gateway: integrations.gateway.clone(),
            suggestions: Arc::new(suggestions),
        })
        .with_idle_timeout(config.sessions.idle_timeout()),
    );
    registry.spawn_reaper(config.sessions.reap_interval());

    spawn_refresh_sweeper(RefreshSweeper::from_config(
        integrations.credentials.clone(),
        &config.refresh,
    ));

    let api_server = ApiServer::new(registry, &config.api);
    let server = tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            error!("API server failed: {}", e);
        }
    });

    info!("crmlink is ready!");
    info!(
        "Open a session: curl -X POST http://{}:{}/sessions",
        config.api.host, config.api.port
    );

    tokio::select! {
        _ = server => {},
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}

/// Run one refresh sweep now and return its counts.
pub async fn run_refresh_once() -> Result<SweepReport> {
    let config = Config::load()?;
    let integrations = build_integrations(&config)?;
    RefreshSweeper::from_config(integrations.credentials, &config.refresh)
        .sweep_once()
        .await
}

fn spawn_refresh_sweeper(sweeper: RefreshSweeper) {
    match sweeper.spawn_background() {
        Some(_handle) => info!("Credential refresh sweep running in background"),
        None => info!("Credential refresh sweep not started (disabled)"),
    }
}
