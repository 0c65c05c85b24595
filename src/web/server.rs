//! Relay server using Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::router::create_app_router;
use crate::config::{Settings, TaskDefaults};
use crate::error::{Error, Result};
use crate::relay::RelayHub;
use crate::tasks::{SqliteTaskStore, TaskService, TaskStore};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Web server configuration.
pub struct WebServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub tasks: Arc<TaskService>,
    pub started_at: Instant,
}

impl AppState {
    /// Task operations submit through the in-process hub.
    pub fn new(hub: Arc<RelayHub>, store: Arc<dyn TaskStore>, defaults: TaskDefaults) -> Self {
        let tasks = TaskService::new(store, hub.clone(), defaults);
        Self {
            hub,
            tasks: Arc::new(tasks),
            started_at: Instant::now(),
        }
    }
}

/// Run the relay server until Ctrl-C.
pub async fn run_server(config: WebServerConfig, state: AppState) -> Result<()> {
    let app = create_app_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

    tracing::info!("Starting relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down relay");
        })
        .await?;

    Ok(())
}

/// Build state from settings and run the relay.
pub async fn run_relay_server(settings: &Settings) -> Result<()> {
    let hub = Arc::new(RelayHub::with_known_agents(settings.known_agents()));
    let store_path = settings.store.resolve_path()?;
    let store = Arc::new(SqliteTaskStore::open(&store_path)?);
    tracing::info!("Task store at {}", store_path.display());

    let state = AppState::new(hub, store, settings.tasks.clone());
    let config = WebServerConfig {
        port: settings.relay.port,
        host: settings.relay.host.clone(),
    };

    run_server(config, state).await
}
