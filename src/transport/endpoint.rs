//! Agent-side persistent connection to the relay.
//!
//! The endpoint reconnects forever with a fixed delay, re-registers on every
//! connect, buffers outbound sends while disconnected and surfaces every hub
//! event on a channel. Only `EndpointHandle::shutdown` stops it.

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::{
    AgentStatusPayload, ClientEvent, Message, RegisterPayload, RegisteredPayload, SendPayload,
    SentPayload, ServerEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_url: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl EndpointConfig {
    pub fn new(relay_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            agent_id: agent_id.into(),
            agent_name: None,
            reconnect_delay: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Endpoint settings for `agent_id`, with timings from the relay section.
    pub fn from_settings(settings: &Settings, agent_id: impl Into<String>) -> Self {
        Self {
            relay_url: settings.relay.url.clone(),
            agent_id: agent_id.into(),
            agent_name: settings.agent.name.clone(),
            reconnect_delay: Duration::from_millis(settings.relay.reconnect_delay_ms),
            heartbeat_interval: Duration::from_secs(settings.relay.heartbeat_interval_secs.max(1)),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.agent_name = name;
        self
    }
}

/// What the endpoint surfaces to the embedding program.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    Connected,
    Registered(RegisteredPayload),
    Message(Message),
    Sent(SentPayload),
    AgentStatus(AgentStatusPayload),
    Error(String),
    Disconnected(String),
}

impl From<ServerEvent> for EndpointEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Registered(payload) => EndpointEvent::Registered(payload),
            ServerEvent::Message(message) => EndpointEvent::Message(message),
            ServerEvent::Sent(payload) => EndpointEvent::Sent(payload),
            ServerEvent::AgentStatus(payload) => EndpointEvent::AgentStatus(payload),
            ServerEvent::Error(payload) => EndpointEvent::Error(payload.message),
        }
    }
}

/// Control handle for a running endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    outbound: mpsc::UnboundedSender<SendPayload>,
    shutdown: watch::Sender<bool>,
}

impl EndpointHandle {
    /// Queue a message for the relay. Buffered while disconnected.
    pub fn send(&self, payload: SendPayload) -> Result<()> {
        self.outbound
            .send(payload)
            .map_err(|_| Error::Transport("endpoint has stopped".to_string()))
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Map a relay base URL to its WebSocket endpoint.
pub fn ws_url(relay_url: &str) -> Result<String> {
    let trimmed = relay_url.trim().trim_end_matches('/');
    let mapped = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(Error::Config(format!("Unsupported relay URL: {}", relay_url)));
    };

    if mapped.ends_with("/ws") {
        Ok(mapped)
    } else {
        Ok(format!("{}/ws", mapped))
    }
}

/// Start an endpoint task.
///
/// The event channel closes once the endpoint has shut down.
pub fn spawn_endpoint(
    config: EndpointConfig,
) -> Result<(EndpointHandle, mpsc::UnboundedReceiver<EndpointEvent>)> {
    if config.agent_id.trim().is_empty() {
        return Err(Error::validation("agent id is required"));
    }
    let url = ws_url(&config.relay_url)?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let endpoint = Endpoint {
        config,
        url,
        outbound: outbound_rx,
        pending: VecDeque::new(),
        shutdown: shutdown_rx,
        events: events_tx,
    };
    tokio::spawn(endpoint.run());

    Ok((
        EndpointHandle {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        },
        events_rx,
    ))
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

struct Endpoint {
    config: EndpointConfig,
    url: String,
    outbound: mpsc::UnboundedReceiver<SendPayload>,
    /// Sends not yet written to a live socket, oldest first.
    pending: VecDeque<SendPayload>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl Endpoint {
    async fn run(mut self) {
        tracing::info!(agent_id = %self.config.agent_id, url = %self.url, "Endpoint starting");

        loop {
            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            };

            match connected {
                Ok((stream, _)) => {
                    tracing::info!(agent_id = %self.config.agent_id, "Connected to relay");
                    self.emit(EndpointEvent::Connected);
                    match self.session(stream).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) => {
                            tracing::warn!(agent_id = %self.config.agent_id, "Disconnected: {}", reason);
                            self.emit(EndpointEvent::Disconnected(reason));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, "Connect failed: {}", e);
                    self.emit(EndpointEvent::Error(format!("connect failed: {}", e)));
                }
            }

            if !self.wait_before_retry().await {
                break;
            }
        }

        tracing::info!(agent_id = %self.config.agent_id, "Endpoint stopped");
    }

    /// Sleep out the retry delay while still buffering sends.
    /// Returns false when shutdown was requested.
    async fn wait_before_retry(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = wait_for_shutdown(&mut self.shutdown) => return false,
                Some(payload) = self.outbound.recv() => self.pending.push_back(payload),
            }
        }
    }

    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let register = ClientEvent::Register(RegisterPayload {
            agent_id: self.config.agent_id.clone(),
            agent_name: self.config.agent_name.clone(),
        });
        if let Err(e) = send_event(&mut write, &register).await {
            return SessionEnd::Closed(e.to_string());
        }

        while let Some(payload) = self.pending.pop_front() {
            if let Err(e) = send_event(&mut write, &ClientEvent::Send(payload.clone())).await {
                self.pending.push_front(payload);
                return SessionEnd::Closed(e.to_string());
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_event(&mut write, &ClientEvent::Heartbeat).await {
                        return SessionEnd::Closed(e.to_string());
                    }
                }
                Some(payload) = self.outbound.recv() => {
                    if let Err(e) = send_event(&mut write, &ClientEvent::Send(payload.clone())).await {
                        self.pending.push_back(payload);
                        return SessionEnd::Closed(e.to_string());
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.surface(&text),
                    Some(Ok(WsMessage::Close(_))) => {
                        return SessionEnd::Closed("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("connection ended".to_string()),
                },
            }
        }
    }

    fn surface(&self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => EndpointEvent::from(event),
            Err(e) => EndpointEvent::Error(format!("undecodable frame: {}", e)),
        };
        match &event {
            EndpointEvent::Registered(payload) => tracing::info!(
                agent_id = %payload.agent_id,
                queued = payload.queued_messages,
                online = payload.connected_agents.len(),
                "Registered with relay"
            ),
            EndpointEvent::Error(message) => tracing::warn!("Relay error: {}", message),
            _ => {}
        }
        self.emit(event);
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_event<S>(write: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    <S as Sink<WsMessage>>::Error: std::fmt::Display,
{
    let text = serde_json::to_string(event)?;
    write
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Resolves once shutdown is requested or every handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskDefaults;
    use crate::protocol::MessageType;
    use crate::relay::RelayHub;
    use crate::tasks::SqliteTaskStore;
    use crate::web::{create_app_router, AppState};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn serve(listener: TcpListener) {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let state = AppState::new(Arc::new(RelayHub::new()), store, TaskDefaults::default());
        tokio::spawn(async move {
            axum::serve(listener, create_app_router(state)).await.unwrap();
        });
    }

    fn config(addr: std::net::SocketAddr, agent: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(format!("http://{}", addr), agent);
        config.reconnect_delay = Duration::from_millis(50);
        config
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<EndpointEvent>, pred: F) -> EndpointEvent
    where
        F: Fn(&EndpointEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("endpoint stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn send_to(to: &str, body: &str) -> SendPayload {
        SendPayload {
            to: to.to_string(),
            content: json!({ "message": body }),
            message_type: Some(MessageType::Query),
            subject: None,
            priority: None,
        }
    }

    #[test]
    fn test_ws_url_mapping() {
        assert_eq!(ws_url("http://localhost:3000").unwrap(), "ws://localhost:3000/ws");
        assert_eq!(ws_url("https://relay.example.com/").unwrap(), "wss://relay.example.com/ws");
        assert_eq!(ws_url("ws://10.0.0.2:3000/ws").unwrap(), "ws://10.0.0.2:3000/ws");
        assert!(matches!(ws_url("ftp://nope"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_offline_message_flushed_on_register() {
        crate::logging::init_test();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        serve(listener).await;

        let (sam, mut sam_events) = spawn_endpoint(config(addr, "sam")).unwrap();
        next_matching(&mut sam_events, |e| matches!(e, EndpointEvent::Registered(_))).await;

        sam.send(send_to("saber", "Are the cron jobs updated?")).unwrap();
        let sent = next_matching(&mut sam_events, |e| matches!(e, EndpointEvent::Sent(_))).await;
        let EndpointEvent::Sent(sent) = sent else { unreachable!() };
        assert!(!sent.delivered);
        assert!(sent.queued);

        let (saber, mut saber_events) = spawn_endpoint(config(addr, "saber")).unwrap();
        let received = next_matching(&mut saber_events, |e| matches!(e, EndpointEvent::Message(_))).await;
        let EndpointEvent::Message(message) = received else { unreachable!() };
        assert_eq!(message.from, "sam");
        assert_eq!(message.id, sent.message_id);
        let registered =
            next_matching(&mut saber_events, |e| matches!(e, EndpointEvent::Registered(_))).await;
        let EndpointEvent::Registered(registered) = registered else { unreachable!() };
        assert_eq!(registered.queued_messages, 1);

        let status = next_matching(&mut sam_events, |e| matches!(e, EndpointEvent::AgentStatus(_))).await;
        let EndpointEvent::AgentStatus(status) = status else { unreachable!() };
        assert_eq!(status.agent_id, "saber");
        assert!(status.online);

        saber.shutdown();
        let offline = next_matching(&mut sam_events, |e| {
            matches!(e, EndpointEvent::AgentStatus(s) if !s.online)
        })
        .await;
        assert!(matches!(offline, EndpointEvent::AgentStatus(s) if s.agent_id == "saber"));
        timeout(WAIT, async { while saber_events.recv().await.is_some() {} })
            .await
            .expect("saber endpoint did not stop");
        sam.shutdown();
    }

    #[tokio::test]
    async fn test_sends_buffered_until_relay_is_up() {
        crate::logging::init_test();
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (sam, mut sam_events) = spawn_endpoint(config(addr, "sam")).unwrap();
        next_matching(&mut sam_events, |e| matches!(e, EndpointEvent::Error(_))).await;
        sam.send(send_to("sam", "note to self")).unwrap();

        serve(TcpListener::bind(addr).await.unwrap()).await;

        let received = next_matching(&mut sam_events, |e| matches!(e, EndpointEvent::Message(_))).await;
        let EndpointEvent::Message(message) = received else { unreachable!() };
        assert_eq!(message.content["message"], "note to self");
        sam.shutdown();
    }
}
