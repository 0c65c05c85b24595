//! WebSocket transport for agent endpoints.
//!
//! One socket carries one agent identity at a time. Outbound events flow
//! through an unbounded channel owned by the hub; the socket task forwards
//! them and feeds inbound frames back into the hub.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::protocol::{ClientEvent, SentPayload, ServerEvent};
use crate::relay::{reclaim_undelivered, Outbound, RelayHub, SendRequest, Submitter};
use crate::web::server::AppState;

/// Agent identity bound to this socket.
struct Session {
    agent_id: String,
    connection_id: u64,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut outbound = UnboundedReceiverStream::new(rx);
    let mut session: Option<Session> = None;
    let mut unwritten = Vec::new();

    tracing::debug!("WebSocket connected");

    loop {
        tokio::select! {
            Some(event) = outbound.next() => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode {} event: {}", event.event_type(), e);
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    if let ServerEvent::Message(message) = event {
                        unwritten.push(message);
                    }
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&hub, &text, &tx, &mut session).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Anything accepted by the channel but not written goes back to the queue.
    let mut rx = outbound.into_inner();
    unwritten.extend(reclaim_undelivered(&mut rx));
    if let Some(session) = session {
        hub.disconnect_with_requeue(&session.agent_id, session.connection_id, unwritten)
            .await;
    }
    tracing::debug!("WebSocket closed");
}

async fn handle_frame(hub: &RelayHub, text: &str, tx: &Outbound, session: &mut Option<Session>) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            let _ = tx.send(ServerEvent::error(format!("Invalid event: {}", e)));
            return;
        }
    };

    match event {
        ClientEvent::Register(payload) => {
            match hub
                .register(&payload.agent_id, payload.agent_name.as_deref(), tx.clone())
                .await
            {
                Ok(registration) => {
                    let agent_id = registration.registered.agent_id;
                    if let Some(previous) = session.take() {
                        if previous.agent_id != agent_id {
                            hub.disconnect(&previous.agent_id, previous.connection_id)
                                .await;
                        }
                    }
                    *session = Some(Session {
                        agent_id,
                        connection_id: registration.connection_id,
                    });
                }
                Err(e) => {
                    let _ = tx.send(ServerEvent::error(e.to_string()));
                }
            }
        }
        ClientEvent::Send(payload) => {
            let Some(current) = session.as_ref() else {
                let _ = tx.send(ServerEvent::error("Not registered"));
                return;
            };
            let request = SendRequest {
                from: current.agent_id.clone(),
                to: payload.to,
                content: payload.content,
                message_type: payload.message_type,
                priority: payload.priority,
                subject: payload.subject,
            };
            let reply = match hub.submit(request).await {
                Ok(receipt) => ServerEvent::Sent(SentPayload {
                    message_id: receipt.message_id,
                    delivered: receipt.delivered,
                    queued: receipt.queued,
                }),
                Err(e) => ServerEvent::error(e.to_string()),
            };
            let _ = tx.send(reply);
        }
        ClientEvent::Heartbeat => {
            if let Some(current) = session.as_ref() {
                hub.heartbeat(&current.agent_id).await;
            }
        }
    }
}
