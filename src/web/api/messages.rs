//! Relay endpoints: presence, stats and one-shot message submission.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ApiJson;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::relay::{AgentInfo, HubStats, InboxAck, SendRequest, SubmitReceipt, Submitter};
use crate::web::server::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
}

#[derive(Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxResponse {
    pub agent_id: String,
    pub count: usize,
    pub messages: Vec<Message>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboxAckRequest {
    #[serde(default)]
    pub message_ids: Option<Vec<String>>,
}

/// Service banner.
pub async fn index() -> Json<Value> {
    Json(json!({
        "service": "a2a-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "/ws",
        "endpoints": ["/health", "/agents", "/stats", "/inbox/:agent_id", "/inbox/:agent_id/ack", "/send", "/tasks"],
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: stats.connected_agents,
    })
}

/// List every agent the hub knows about.
pub async fn list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.hub.agents().await,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

/// Peek at an agent's pending queue without draining it.
pub async fn inbox(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Json<InboxResponse> {
    let messages = state.hub.inbox(&agent_id).await;
    Json(InboxResponse {
        agent_id,
        count: messages.len(),
        messages,
    })
}

/// Drop handled messages from a polling agent's queue.
///
/// An empty body, or one without `messageIds`, drains the whole queue.
pub async fn ack_inbox(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Result<Json<InboxAck>> {
    let request: InboxAckRequest = if body.is_empty() {
        InboxAckRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| Error::validation(format!("Invalid ack body: {}", e)))?
    };
    let ack = state
        .hub
        .ack_inbox(&agent_id, request.message_ids.as_deref())
        .await;
    Ok(Json(ack))
}

/// Relay one message without holding a connection open.
pub async fn send_message(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SendRequest>,
) -> Result<Json<SubmitReceipt>> {
    let receipt = state.hub.submit(request).await?;
    Ok(Json(receipt))
}
