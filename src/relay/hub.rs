//! Relay hub: agent presence and message delivery.
//!
//! The registry maps agent ids to slots. Each slot sits behind its own lock, so
//! register/route/disconnect for one agent are serialized while different agents
//! proceed in parallel. A message handed to a live connection's outbound channel
//! counts as delivered; anything else stays in the agent's FIFO queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::submit::{SendRequest, SubmitReceipt, Submitter};
use crate::error::{Error, Result};
use crate::protocol::{
    AgentStatusPayload, AgentSummary, Message, RegisteredPayload, ServerEvent,
};

/// Outbound half of a live connection.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

struct Connection {
    tx: Outbound,
}

struct AgentSlot {
    id: String,
    name: String,
    connection: Option<Connection>,
    /// Id of the most recent connection, live or not.
    connection_id: u64,
    pending: VecDeque<Message>,
    last_seen: Option<DateTime<Utc>>,
    delivered_count: u64,
}

impl AgentSlot {
    fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            connection: None,
            connection_id: 0,
            pending: VecDeque::new(),
            last_seen: None,
            delivered_count: 0,
        }
    }

    fn is_online(&self) -> bool {
        self.connection.is_some()
    }

    /// Hand a message to the live connection, or give it back.
    fn try_deliver(&mut self, message: Message) -> std::result::Result<(), Message> {
        let Some(conn) = &self.connection else {
            return Err(message);
        };
        match conn.tx.send(ServerEvent::Message(message)) {
            Ok(()) => {
                self.delivered_count += 1;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(agent_id = %self.id, "Outbound channel closed, treating agent as offline");
                self.connection = None;
                match err.0 {
                    ServerEvent::Message(message) => Err(message),
                    _ => unreachable!("only messages are delivered here"),
                }
            }
        }
    }

    /// Deliver queued messages in order. Stops at the first failed handover.
    fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(message) = self.pending.pop_front() {
            match self.try_deliver(message) {
                Ok(()) => flushed += 1,
                Err(message) => {
                    self.pending.push_front(message);
                    break;
                }
            }
        }
        flushed
    }

    fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            online: self.is_online(),
            last_seen: self.last_seen,
            queued_messages: self.pending.len(),
            delivered_count: self.delivered_count,
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub connection_id: u64,
    pub registered: RegisteredPayload,
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Queued,
}

/// Roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub queued_messages: usize,
    pub delivered_count: u64,
}

/// Result of draining part of an agent's queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxAck {
    pub acknowledged: usize,
    pub remaining: usize,
}

/// Hub-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connected_agents: usize,
    pub registered_agents: usize,
    pub queued_messages: usize,
}

/// Close a connection's outbound channel and take back the messages still
/// buffered in it. Later routes to the agent fall back to its queue.
pub fn reclaim_undelivered(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<Message> {
    rx.close();
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::Message(message) = event {
            messages.push(message);
        }
    }
    messages
}

#[derive(Default)]
pub struct RelayHub {
    agents: RwLock<HashMap<String, Arc<Mutex<AgentSlot>>>>,
    next_connection: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub with pre-known agents registered as offline.
    pub fn with_known_agents<I>(agents: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let map = agents
            .into_iter()
            .map(|(id, name)| {
                let slot = AgentSlot::new(&id, &name);
                (id, Arc::new(Mutex::new(slot)))
            })
            .collect();
        Self {
            agents: RwLock::new(map),
            next_connection: AtomicU64::new(0),
        }
    }

    /// Get or create the slot for an agent.
    async fn slot(&self, agent_id: &str) -> Arc<Mutex<AgentSlot>> {
        if let Some(slot) = self.agents.read().await.get(agent_id) {
            return slot.clone();
        }
        let mut agents = self.agents.write().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentSlot::new(agent_id, agent_id))))
            .clone()
    }

    async fn existing_slot(&self, agent_id: &str) -> Option<Arc<Mutex<AgentSlot>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn all_slots(&self) -> Vec<Arc<Mutex<AgentSlot>>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Display name for an agent, falling back to the id.
    pub async fn display_name(&self, agent_id: &str) -> String {
        match self.existing_slot(agent_id).await {
            Some(slot) => slot.lock().await.name.clone(),
            None => agent_id.to_string(),
        }
    }

    /// Mark an agent online on a new connection and flush its queue.
    ///
    /// Queued messages are pushed in FIFO order, followed by a `registered`
    /// event. Other online agents get an `agent_status` event.
    pub async fn register(
        &self,
        agent_id: &str,
        agent_name: Option<&str>,
        tx: Outbound,
    ) -> Result<Registration> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(Error::validation("agentId required"));
        }

        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = self.slot(agent_id).await;
        let (name, flushed) = {
            let mut slot = slot.lock().await;
            if let Some(name) = agent_name.map(str::trim).filter(|n| !n.is_empty()) {
                slot.name = name.to_string();
            }
            if slot.connection.is_some() {
                tracing::info!(agent_id, "Replacing existing connection");
            }
            slot.connection = Some(Connection { tx: tx.clone() });
            slot.connection_id = connection_id;
            slot.last_seen = Some(Utc::now());
            let flushed = slot.flush();
            (slot.name.clone(), flushed)
        };

        if flushed > 0 {
            tracing::info!(agent_id, flushed, "Delivered queued messages");
        }
        tracing::info!(agent_id, name = %name, connection_id, "Agent registered");

        let registered = RegisteredPayload {
            agent_id: agent_id.to_string(),
            queued_messages: flushed,
            connected_agents: self.online_roster().await,
        };
        if tx.send(ServerEvent::Registered(registered.clone())).is_err() {
            tracing::debug!(agent_id, "Connection closed before registered event");
        }

        self.broadcast_status(agent_id, &name, true).await;

        Ok(Registration {
            connection_id,
            registered,
        })
    }

    /// Deliver a message now if the recipient is online, otherwise queue it.
    pub async fn route(&self, message: Message) -> RouteOutcome {
        let slot = self.slot(&message.to).await;
        let mut slot = slot.lock().await;
        let message_id = message.id.clone();
        match slot.try_deliver(message) {
            Ok(()) => {
                tracing::info!(%message_id, to = %slot.id, "Message delivered");
                RouteOutcome::Delivered
            }
            Err(message) => {
                slot.pending.push_back(message);
                tracing::info!(
                    %message_id,
                    to = %slot.id,
                    queue_size = slot.pending.len(),
                    "Message queued"
                );
                RouteOutcome::Queued
            }
        }
    }

    /// Mark an agent offline. Ignored when `connection_id` is not the agent's
    /// latest connection. The queue is kept.
    pub async fn disconnect(&self, agent_id: &str, connection_id: u64) -> bool {
        self.disconnect_with_requeue(agent_id, connection_id, Vec::new())
            .await
    }

    /// Mark an agent offline and put back messages its connection accepted but
    /// never wrote. They go to the front of the queue in their original order,
    /// even when the disconnect is stale.
    pub async fn disconnect_with_requeue(
        &self,
        agent_id: &str,
        connection_id: u64,
        undelivered: Vec<Message>,
    ) -> bool {
        let Some(slot) = self.existing_slot(agent_id).await else {
            return false;
        };
        let name = {
            let mut slot = slot.lock().await;
            let requeued = undelivered.len();
            if requeued > 0 {
                slot.delivered_count = slot.delivered_count.saturating_sub(requeued as u64);
                for message in undelivered.into_iter().rev() {
                    slot.pending.push_front(message);
                }
                tracing::info!(agent_id, requeued, "Requeued unwritten messages");
            }
            if slot.connection_id != connection_id {
                tracing::debug!(agent_id, connection_id, "Ignoring stale disconnect");
                if requeued > 0 {
                    slot.flush();
                }
                return false;
            }
            slot.connection = None;
            slot.last_seen = Some(Utc::now());
            slot.name.clone()
        };

        tracing::info!(agent_id, "Agent disconnected");
        self.broadcast_status(agent_id, &name, false).await;
        true
    }

    /// Refresh presence for a live agent.
    pub async fn heartbeat(&self, agent_id: &str) {
        if let Some(slot) = self.existing_slot(agent_id).await {
            slot.lock().await.last_seen = Some(Utc::now());
        }
    }

    async fn broadcast_status(&self, agent_id: &str, name: &str, online: bool) {
        let event = ServerEvent::AgentStatus(AgentStatusPayload {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            online,
        });
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            if slot.id == agent_id {
                continue;
            }
            if let Some(conn) = &slot.connection {
                let _ = conn.tx.send(event.clone());
            }
        }
    }

    async fn online_roster(&self) -> Vec<AgentSummary> {
        let mut roster = Vec::new();
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            if slot.is_online() {
                roster.push(slot.summary());
            }
        }
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        match self.existing_slot(agent_id).await {
            Some(slot) => slot.lock().await.is_online(),
            None => false,
        }
    }

    /// All known agents, sorted by id.
    pub async fn agents(&self) -> Vec<AgentInfo> {
        let mut agents = Vec::new();
        for slot in self.all_slots().await {
            agents.push(slot.lock().await.info());
        }
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Messages waiting for an agent, oldest first.
    pub async fn inbox(&self, agent_id: &str) -> Vec<Message> {
        match self.existing_slot(agent_id).await {
            Some(slot) => slot.lock().await.pending.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drop queued messages a polling agent has handled. `None` drains the
    /// whole queue; ids that are not queued are ignored.
    pub async fn ack_inbox(&self, agent_id: &str, message_ids: Option<&[String]>) -> InboxAck {
        let Some(slot) = self.existing_slot(agent_id).await else {
            return InboxAck::default();
        };
        let mut slot = slot.lock().await;
        let before = slot.pending.len();
        match message_ids {
            Some(ids) => slot.pending.retain(|m| !ids.contains(&m.id)),
            None => slot.pending.clear(),
        }
        let ack = InboxAck {
            acknowledged: before - slot.pending.len(),
            remaining: slot.pending.len(),
        };
        tracing::info!(agent_id, acknowledged = ack.acknowledged, "Inbox acknowledged");
        ack
    }

    pub async fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            connected_agents: 0,
            registered_agents: 0,
            queued_messages: 0,
        };
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            stats.registered_agents += 1;
            stats.queued_messages += slot.pending.len();
            if slot.is_online() {
                stats.connected_agents += 1;
            }
        }
        stats
    }
}

#[async_trait]
impl Submitter for RelayHub {
    async fn submit(&self, request: SendRequest) -> Result<SubmitReceipt> {
        let from_name = self.display_name(request.from.trim()).await;
        let to_name = self.display_name(request.to.trim()).await;
        let message = request.into_message(from_name, to_name)?;
        let message_id = message.id.clone();
        let outcome = self.route(message).await;
        Ok(SubmitReceipt {
            message_id,
            delivered: outcome == RouteOutcome::Delivered,
            queued: outcome == RouteOutcome::Queued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn message(from: &str, to: &str, body: &str) -> Message {
        SendRequest::new(from, to, json!({ "message": body }))
            .into_message(from.to_string(), to.to_string())
            .unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn delivered_bodies(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Message(m) => Some(m.preview(100)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_route_to_online_agent_delivers() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("sam", Some("Sam"), tx).await.unwrap();
        drain(&mut rx);

        let outcome = hub.route(message("sybil", "sam", "hello")).await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(delivered_bodies(&drain(&mut rx)), vec!["hello"]);
        assert!(hub.inbox("sam").await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_queue_flushes_fifo_on_register() {
        let hub = RelayHub::new();
        for body in ["one", "two", "three"] {
            assert_eq!(hub.route(message("sybil", "saber", body)).await, RouteOutcome::Queued);
        }
        assert_eq!(hub.inbox("saber").await.len(), 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = hub.register("saber", None, tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(registration.registered.queued_messages, 3);
        assert_eq!(delivered_bodies(&events), vec!["one", "two", "three"]);
        assert!(matches!(events.last(), Some(ServerEvent::Registered(_))));
        assert!(hub.inbox("saber").await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_queue_and_broadcasts() {
        let hub = RelayHub::new();
        let (sam_tx, mut sam_rx) = mpsc::unbounded_channel();
        let (saber_tx, _saber_rx) = mpsc::unbounded_channel();
        hub.register("sam", Some("Sam"), sam_tx).await.unwrap();
        let saber = hub.register("saber", Some("Saber"), saber_tx).await.unwrap();
        drain(&mut sam_rx);

        assert!(hub.disconnect("saber", saber.connection_id).await);
        hub.route(message("sam", "saber", "later")).await;

        let events = drain(&mut sam_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::AgentStatus(s) if s.agent_id == "saber" && !s.online
        )));
        assert!(!hub.is_online("saber").await);
        assert_eq!(hub.inbox("saber").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let hub = RelayHub::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let old = hub.register("sam", None, old_tx).await.unwrap();
        hub.register("sam", None, new_tx).await.unwrap();

        assert!(!hub.disconnect("sam", old.connection_id).await);
        assert!(hub.is_online("sam").await);
    }

    #[tokio::test]
    async fn test_closed_channel_falls_back_to_queue() {
        let hub = RelayHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register("sam", None, tx).await.unwrap();
        drop(rx);

        let outcome = hub.route(message("sybil", "sam", "not lost")).await;

        assert_eq!(outcome, RouteOutcome::Queued);
        assert_eq!(hub.inbox("sam").await.len(), 1);
        assert!(!hub.is_online("sam").await);
    }

    #[tokio::test]
    async fn test_unwritten_messages_requeued_on_disconnect() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sam = hub.register("sam", None, tx).await.unwrap();
        drain(&mut rx);

        assert_eq!(hub.route(message("sybil", "sam", "first")).await, RouteOutcome::Delivered);
        assert_eq!(hub.route(message("sybil", "sam", "second")).await, RouteOutcome::Delivered);

        // The socket failed while writing "first"; "second" is still buffered.
        let mut undelivered = Vec::new();
        if let Ok(ServerEvent::Message(m)) = rx.try_recv() {
            undelivered.push(m);
        }
        undelivered.extend(reclaim_undelivered(&mut rx));

        // Routed after the channel closed but before the disconnect landed.
        assert_eq!(hub.route(message("sybil", "sam", "third")).await, RouteOutcome::Queued);

        assert!(hub.disconnect_with_requeue("sam", sam.connection_id, undelivered).await);
        drop(rx);

        let queued: Vec<_> = hub.inbox("sam").await.iter().map(|m| m.preview(100)).collect();
        assert_eq!(queued, vec!["first", "second", "third"]);
        assert_eq!(hub.agents().await[0].delivered_count, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("sam", None, tx).await.unwrap();
        assert_eq!(delivered_bodies(&drain(&mut rx)), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_stale_disconnect_still_requeues() {
        let hub = RelayHub::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let old = hub.register("sam", None, old_tx).await.unwrap();
        hub.route(message("sybil", "sam", "in flight")).await;
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        hub.register("sam", None, new_tx).await.unwrap();
        drain(&mut new_rx);

        let undelivered = reclaim_undelivered(&mut old_rx);
        assert!(!hub.disconnect_with_requeue("sam", old.connection_id, undelivered).await);

        assert!(hub.is_online("sam").await);
        assert_eq!(delivered_bodies(&drain(&mut new_rx)), vec!["in flight"]);
        assert!(hub.inbox("sam").await.is_empty());
    }

    #[tokio::test]
    async fn test_ack_inbox_by_id_and_all() {
        let hub = RelayHub::new();
        for body in ["one", "two", "three"] {
            hub.route(message("sybil", "saber", body)).await;
        }
        let queued = hub.inbox("saber").await;

        let ids = vec![queued[1].id.clone(), "missing".to_string()];
        let ack = hub.ack_inbox("saber", Some(ids.as_slice())).await;
        assert_eq!(ack, InboxAck { acknowledged: 1, remaining: 2 });
        let left: Vec<_> = hub.inbox("saber").await.iter().map(|m| m.preview(100)).collect();
        assert_eq!(left, vec!["one", "three"]);

        let ack = hub.ack_inbox("saber", None).await;
        assert_eq!(ack, InboxAck { acknowledged: 2, remaining: 0 });
        assert!(hub.inbox("saber").await.is_empty());
        assert_eq!(hub.ack_inbox("nobody", None).await, InboxAck::default());
    }

    #[tokio::test]
    async fn test_registered_roster_and_names() {
        let hub = RelayHub::with_known_agents(vec![("sage".to_string(), "Sage".to_string())]);
        let (sam_tx, _sam_rx) = mpsc::unbounded_channel();
        hub.register("sam", Some("Sam"), sam_tx).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let registration = hub.register("sybil", Some("Sybil"), tx).await.unwrap();

        let ids: Vec<_> = registration
            .registered
            .connected_agents
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(ids, vec!["sam", "sybil"]);
        assert_eq!(hub.display_name("sage").await, "Sage");
        assert_eq!(hub.display_name("nobody").await, "nobody");

        let stats = hub.stats().await;
        assert_eq!(stats.registered_agents, 3);
        assert_eq!(stats.connected_agents, 2);
    }

    #[tokio::test]
    async fn test_register_requires_agent_id() {
        let hub = RelayHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            hub.register("  ", None, tx).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_reports_queue_state() {
        let hub = RelayHub::new();
        let receipt = hub
            .submit(SendRequest::new("sybil", "sam", json!("{\"task\": 1}")))
            .await
            .unwrap();

        assert!(!receipt.delivered);
        assert!(receipt.queued);
        let queued = hub.inbox("sam").await;
        assert_eq!(queued[0].id, receipt.message_id);
        assert_eq!(queued[0].content, json!({"task": 1}));
    }

    #[tokio::test]
    async fn test_concurrent_routes_and_register_deliver_each_once() {
        let hub = Arc::new(RelayHub::new());
        let total = 200;

        let mut handles = Vec::new();
        for i in 0..total {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                hub.route(message("sybil", "sam", &format!("m{}", i))).await
            }));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("sam", None, tx).await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let received = delivered_bodies(&drain(&mut rx));
        let unique: HashSet<_> = received.iter().cloned().collect();
        assert_eq!(unique.len(), received.len());
        assert_eq!(received.len() + hub.inbox("sam").await.len(), total);
    }
}
