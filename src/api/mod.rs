//! REST API server for crmlink.
//!
//! Provides HTTP endpoints for:
//! - Contact workflow sessions (open, command, events, close)
//! - Mention segmentation and contact questions for the assistant

pub mod error;
pub mod routes;

use crate::config::ApiConfig;
use crate::workflow::SessionRegistry;
use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;

pub struct ApiServer {
    host: String,
    port: u16,
    registry: Arc<SessionRegistry>,
}

impl ApiServer {
    pub fn new(registry: Arc<SessionRegistry>, config: &ApiConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            registry,
        }
    }

    pub async fn start(self) -> Result<()> {
        let app = router(self.registry);
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("API server listening on http://{}", addr);
        info!("Endpoints:");
        info!("  GET    /                     - Service info");
        info!("  GET    /version              - Get version info");
        info!("  POST   /sessions             - Open a contact session");
        info!("  GET    /sessions/:id         - Session snapshot");
        info!("  POST   /sessions/:id/commands - Send a session command");
        info!("  GET    /sessions/:id/events  - Poll session events");
        info!("  DELETE /sessions/:id         - Close a session");
        info!("  POST   /assistant/segment    - Split text into mentions");
        info!("  POST   /assistant/ask        - Ask about the meeting");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// The full application router.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/version", get(version))
        .nest("/sessions", routes::sessions::router(registry.clone()))
        .nest("/assistant", routes::assistant::router(registry))
        .layer(ServiceBuilder::new())
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "crmlink",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "crmlink"
    }))
}
