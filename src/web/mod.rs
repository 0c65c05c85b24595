//! Relay server module (Axum + WebSocket transport + REST API).

pub mod api;
pub mod router;
pub mod server;
pub mod ws;

pub use router::create_app_router;
pub use server::{run_relay_server, run_server, AppState, WebServerConfig};
