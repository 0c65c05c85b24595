//! Task protocol operations on top of a store and a submission path.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use super::model::{AckOutcome, BroadcastMeta, Task, TaskStatus, TaskView, BROADCAST};
use super::store::{TaskQuery, TaskStore};
use crate::config::TaskDefaults;
use crate::error::{Error, Result};
use crate::protocol::{MessageType, Priority};
use crate::relay::{SendRequest, Submitter};

/// Input for `send_task`. More than one recipient makes a broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTaskRequest {
    #[serde(default)]
    pub from_agent: String,
    #[serde(default)]
    pub to_agents: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout_hours: Option<f64>,
}

/// Delivery result for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDispatch {
    pub agent: String,
    pub task_id: String,
    pub delivered: bool,
    pub queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendTaskResult {
    pub parent_task_id: Option<String>,
    pub results: Vec<AgentDispatch>,
}

/// Query for `list_tasks`, also the `GET /tasks` query string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub overdue: bool,
    #[serde(default, rename = "all", alias = "include_completed")]
    pub include_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResult {
    pub task: Task,
    /// Parent rollup after this acknowledgment, for broadcast children.
    pub rollup: Option<BroadcastMeta>,
}

/// A broadcast parent with its children and derived counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRollup {
    pub parent: TaskView,
    pub children: Vec<TaskView>,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    /// Every child reached a terminal state.
    pub settled: bool,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    submitter: Arc<dyn Submitter>,
    defaults: TaskDefaults,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        submitter: Arc<dyn Submitter>,
        defaults: TaskDefaults,
    ) -> Self {
        Self {
            store,
            submitter,
            defaults,
        }
    }

    /// Create tasks for every recipient and try to deliver each one.
    ///
    /// Records are committed before any delivery attempt. A delivery failure
    /// is reported per agent and leaves that task at `sent`.
    pub async fn send_task(&self, request: SendTaskRequest) -> Result<SendTaskResult> {
        let from = request.from_agent.trim();
        if from.is_empty() {
            return Err(Error::validation("fromAgent is required"));
        }
        if request.message.trim().is_empty() {
            return Err(Error::validation("message is required"));
        }
        let recipients = normalize_recipients(&request.to_agents)?;
        let timeout_hours = request
            .timeout_hours
            .unwrap_or(self.defaults.default_timeout_hours);
        if !timeout_hours.is_finite() || timeout_hours <= 0.0 {
            return Err(Error::validation("timeoutHours must be positive"));
        }
        let subject = request.subject.filter(|s| !s.trim().is_empty());

        let parent = (recipients.len() > 1).then(|| {
            Task::broadcast_parent(
                from,
                recipients.clone(),
                request.message.as_str(),
                request.priority,
                timeout_hours,
            )
            .with_subject(subject.clone())
        });
        let parent_task_id = parent.as_ref().map(|p| p.task_id.clone());

        let children: Vec<Task> = recipients
            .iter()
            .map(|agent| {
                Task::new(
                    from,
                    agent.as_str(),
                    request.message.as_str(),
                    request.priority,
                    timeout_hours,
                )
                .with_subject(subject.clone())
                .with_parent(parent_task_id.clone())
            })
            .collect();

        let records: Vec<Task> = parent.into_iter().chain(children.iter().cloned()).collect();
        self.store.insert_tasks(&records)?;
        tracing::info!(
            from,
            recipients = children.len(),
            parent = parent_task_id.as_deref().unwrap_or("-"),
            "Created tasks"
        );

        let mut results = Vec::with_capacity(children.len());
        for task in &children {
            results.push(self.dispatch(task).await);
        }

        Ok(SendTaskResult {
            parent_task_id,
            results,
        })
    }

    async fn dispatch(&self, task: &Task) -> AgentDispatch {
        let content = json!({
            "message": format!(
                "[TASK {id}] {msg}\n\nWhen complete, run: a2a-relay task ack --task {id} --summary \"what you did\"",
                id = task.task_id,
                msg = task.message,
            ),
            "taskId": task.task_id,
        });
        let subject = task
            .subject
            .clone()
            .unwrap_or_else(|| format!("Task: {}", task.task_id));
        let request = SendRequest::new(task.from_agent.as_str(), task.to_agent.as_str(), content)
            .with_type(MessageType::Task)
            .with_priority(task.priority)
            .with_subject(subject);

        match self.submitter.submit(request).await {
            Ok(receipt) => {
                if receipt.delivered {
                    match self.store.mark_delivered(&task.task_id, Utc::now()) {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(
                            task_id = %task.task_id,
                            "Task moved past sent before delivery was recorded"
                        ),
                        Err(e) => tracing::warn!(
                            task_id = %task.task_id,
                            "Failed to record delivery: {}",
                            e
                        ),
                    }
                }
                AgentDispatch {
                    agent: task.to_agent.clone(),
                    task_id: task.task_id.clone(),
                    delivered: receipt.delivered,
                    queued: receipt.queued,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, agent = %task.to_agent, "Task dispatch failed: {}", e);
                AgentDispatch {
                    agent: task.to_agent.clone(),
                    task_id: task.task_id.clone(),
                    delivered: false,
                    queued: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Move a task to `acknowledged`. A no-op on an already acknowledged task.
    pub async fn claim_task(&self, task_id: &str, agent: Option<&str>) -> Result<Task> {
        let mut task = self.require(task_id)?;
        if task.is_broadcast_parent() {
            return Err(Error::validation(format!(
                "{} is a broadcast parent; claim a child task instead",
                task.task_id
            )));
        }
        warn_if_not_recipient(&task, agent);

        match task.status {
            TaskStatus::Acknowledged => return Ok(task),
            status if !status.can_transition_to(TaskStatus::Acknowledged) => {
                return Err(invalid_transition(&task, TaskStatus::Acknowledged));
            }
            _ => {}
        }

        let expected = task.status;
        task.status = TaskStatus::Acknowledged;
        task.acknowledged_at.get_or_insert_with(Utc::now);
        self.store.save_transition(&task, expected)?;
        tracing::info!(task_id = %task.task_id, "Task claimed");
        Ok(task)
    }

    /// Drive a task to `completed` or `failed` and update its broadcast rollup.
    ///
    /// Rollup and sender notification run after the child's write is committed;
    /// their failures are logged and never undo it.
    pub async fn acknowledge_task(
        &self,
        task_id: &str,
        outcome: AckOutcome,
        summary: &str,
        agent: Option<&str>,
    ) -> Result<AckResult> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(Error::validation("summary is required"));
        }
        let mut task = self.require(task_id)?;
        if task.is_broadcast_parent() {
            return Err(Error::validation(format!(
                "{} is a broadcast parent; acknowledge a child task instead",
                task.task_id
            )));
        }
        warn_if_not_recipient(&task, agent);

        let next = TaskStatus::from(outcome);
        if !task.status.can_transition_to(next) {
            return Err(invalid_transition(&task, next));
        }

        let now = Utc::now();
        let expected = task.status;
        task.status = next;
        task.acknowledged_at.get_or_insert(now);
        if next == TaskStatus::Completed {
            task.completed_at = Some(now);
        }
        task.completion_summary = Some(summary.to_string());
        self.store.save_transition(&task, expected)?;
        tracing::info!(task_id = %task.task_id, status = %task.status, "Task acknowledged");

        let rollup = match &task.parent_task_id {
            Some(parent_id) => match self.store.recompute_rollup(parent_id, now) {
                Ok(meta) => {
                    tracing::debug!(
                        parent_id = %parent_id,
                        completed = meta.completed,
                        total = meta.total,
                        "Broadcast rollup updated"
                    );
                    Some(meta)
                }
                Err(e) => {
                    tracing::error!(parent_id = %parent_id, "Rollup recomputation failed: {}", e);
                    None
                }
            },
            None => None,
        };

        let acting = agent
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(task.to_agent.as_str())
            .to_string();
        self.notify_sender(&task, &acting).await;

        Ok(AckResult { task, rollup })
    }

    async fn notify_sender(&self, task: &Task, acting: &str) {
        let summary = task.completion_summary.as_deref().unwrap_or_default();
        let content = json!({
            "message": format!("Task {} {} by {}: {}", task.task_id, task.status, acting, summary),
            "taskId": task.task_id,
            "status": task.status,
        });
        let request = SendRequest::new(acting, task.from_agent.as_str(), content)
            .with_type(MessageType::TaskAck)
            .with_priority(task.priority)
            .with_subject(format!("Task {}: {}", task.status, task.task_id));

        if let Err(e) = self.submitter.submit(request).await {
            let err = Error::Notification(e.to_string());
            tracing::warn!(task_id = %task.task_id, "{}", err);
        }
    }

    pub fn get_task(&self, task_id: &str) -> Result<TaskView> {
        Ok(TaskView::at(self.require(task_id)?, Utc::now()))
    }

    /// Tasks sorted by recipient, oldest first. Overdue is evaluated once per call.
    pub fn list_tasks(&self, filter: &ListFilter) -> Result<Vec<TaskView>> {
        let now = Utc::now();
        let window_ms = (self.defaults.completed_window_hours * 3_600_000.0) as i64;
        let query = TaskQuery {
            agent: filter
                .agent
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            terminal_since: filter
                .include_completed
                .then(|| now - Duration::milliseconds(window_ms)),
            include_broadcasts: false,
        };

        let mut views: Vec<TaskView> = self
            .store
            .list(&query)?
            .into_iter()
            .map(|task| TaskView::at(task, now))
            .filter(|view| !filter.overdue || view.overdue)
            .collect();
        views.sort_by(|a, b| {
            a.task
                .to_agent
                .cmp(&b.task.to_agent)
                .then(a.task.created_at.cmp(&b.task.created_at))
        });
        views.truncate(filter.limit.unwrap_or(self.defaults.list_limit));
        Ok(views)
    }

    pub fn broadcast_rollup(&self, parent_task_id: &str) -> Result<BroadcastRollup> {
        let parent = self.require(parent_task_id)?;
        if !parent.is_broadcast_parent() {
            return Err(Error::validation(format!(
                "{} is not a broadcast task",
                parent.task_id
            )));
        }
        let now = Utc::now();
        let children = self.store.children(&parent.task_id)?;
        let completed = count_status(&children, TaskStatus::Completed);
        let failed = count_status(&children, TaskStatus::Failed);
        let pending = children.len() - completed - failed;

        Ok(BroadcastRollup {
            parent: TaskView::at(parent, now),
            settled: !children.is_empty() && pending == 0,
            children: children
                .into_iter()
                .map(|task| TaskView::at(task, now))
                .collect(),
            completed,
            failed,
            pending,
        })
    }

    fn require(&self, task_id: &str) -> Result<Task> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(Error::validation("taskId is required"));
        }
        self.store
            .get(task_id)?
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))
    }
}

/// Trim, drop blanks and collapse duplicates, keeping first occurrence order.
fn normalize_recipients(to_agents: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for agent in to_agents.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        if agent == BROADCAST {
            return Err(Error::validation(format!(
                "'{}' is reserved and cannot be a recipient",
                BROADCAST
            )));
        }
        if seen.insert(agent) {
            recipients.push(agent.to_string());
        }
    }
    if recipients.is_empty() {
        return Err(Error::validation("at least one recipient is required"));
    }
    Ok(recipients)
}

fn warn_if_not_recipient(task: &Task, agent: Option<&str>) {
    if let Some(agent) = agent.map(str::trim).filter(|a| !a.is_empty()) {
        if agent != task.to_agent {
            tracing::warn!(
                task_id = %task.task_id,
                recipient = %task.to_agent,
                acting = agent,
                "Task handled by an agent other than its recipient"
            );
        }
    }
}

fn invalid_transition(task: &Task, to: TaskStatus) -> Error {
    Error::InvalidTransition {
        task_id: task.task_id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

fn count_status(tasks: &[Task], status: TaskStatus) -> usize {
    tasks.iter().filter(|t| t.status == status).count()
}
