//! Task records and their status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::Priority;

/// Recipient sentinel for the parent record of a broadcast.
pub const BROADCAST: &str = "broadcast";

/// Task lifecycle: `sent -> delivered -> acknowledged -> {completed | failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Sent,
    Delivered,
    Acknowledged,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Sent => 0,
            TaskStatus::Delivered => 1,
            TaskStatus::Acknowledged => 2,
            TaskStatus::Completed | TaskStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Only forward moves are allowed; terminal states are final.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Sent => "sent",
            TaskStatus::Delivered => "delivered",
            TaskStatus::Acknowledged => "acknowledged",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sent" => Ok(TaskStatus::Sent),
            "delivered" => Ok(TaskStatus::Delivered),
            "acknowledged" => Ok(TaskStatus::Acknowledged),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Terminal outcome reported by the recipient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    #[default]
    Completed,
    Failed,
}

impl From<AckOutcome> for TaskStatus {
    fn from(outcome: AckOutcome) -> Self {
        match outcome {
            AckOutcome::Completed => TaskStatus::Completed,
            AckOutcome::Failed => TaskStatus::Failed,
        }
    }
}

impl FromStr for AckOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "completed" | "complete" | "done" => Ok(AckOutcome::Completed),
            "failed" | "fail" => Ok(AckOutcome::Failed),
            _ => Err(format!("Outcome must be completed or failed, got: {}", s)),
        }
    }
}

/// Denormalized rollup kept on a broadcast parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BroadcastMeta {
    pub agents: Vec<String>,
    pub total: usize,
    pub completed: usize,
}

/// A tracked unit of work wrapping one relayed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message: String,
    pub subject: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub timeout_hours: f64,
    pub parent_task_id: Option<String>,
    pub completion_summary: Option<String>,
    pub metadata: Option<BroadcastMeta>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task in the `sent` state.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message: impl Into<String>,
        priority: Priority,
        timeout_hours: f64,
    ) -> Self {
        Self {
            task_id: generate_task_id(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message: message.into(),
            subject: None,
            priority,
            status: TaskStatus::Sent,
            timeout_hours,
            parent_task_id: None,
            completion_summary: None,
            metadata: None,
            created_at: Utc::now(),
            delivered_at: None,
            acknowledged_at: None,
            completed_at: None,
        }
    }

    /// Create the parent record of a broadcast to `agents`.
    pub fn broadcast_parent(
        from_agent: impl Into<String>,
        agents: Vec<String>,
        message: impl Into<String>,
        priority: Priority,
        timeout_hours: f64,
    ) -> Self {
        let mut task = Self::new(from_agent, BROADCAST, message, priority, timeout_hours);
        task.metadata = Some(BroadcastMeta {
            total: agents.len(),
            agents,
            completed: 0,
        });
        task
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_parent(mut self, parent_task_id: Option<String>) -> Self {
        self.parent_task_id = parent_task_id;
        self
    }

    pub fn is_broadcast_parent(&self) -> bool {
        self.to_agent == BROADCAST
    }

    pub fn age_hours_at(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 3_600_000.0
    }

    /// Overdue means open and older than `timeout_hours`. Never stored.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.age_hours_at(now) > self.timeout_hours
    }
}

/// Task plus derived fields, as served to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub overdue: bool,
    pub age_hours: f64,
}

impl TaskView {
    pub fn at(task: Task, now: DateTime<Utc>) -> Self {
        Self {
            overdue: task.is_overdue_at(now),
            age_hours: task.age_hours_at(now),
            task,
        }
    }
}

/// Generate a task id like `TASK-20260219-a1b2c3`.
pub fn generate_task_id() -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "TASK-{}-{}",
        Utc::now().format("%Y%m%d"),
        token.get(..6).unwrap_or(&token)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_task_id_format() {
        let id = generate_task_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TASK");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_task_id(), id);
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(TaskStatus::Sent.can_transition_to(TaskStatus::Delivered));
        assert!(TaskStatus::Sent.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Delivered.can_transition_to(TaskStatus::Acknowledged));
        assert!(TaskStatus::Acknowledged.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::Delivered.can_transition_to(TaskStatus::Sent));
        assert!(!TaskStatus::Acknowledged.can_transition_to(TaskStatus::Delivered));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_overdue_flips_once_and_ignores_terminal() {
        let mut task = Task::new("sybil", "saber", "Update cron jobs", Priority::Normal, 2.0);
        let created = task.created_at;

        assert!(!task.is_overdue_at(created + Duration::minutes(119)));
        assert!(!task.is_overdue_at(created + Duration::hours(2)));
        assert!(task.is_overdue_at(created + Duration::hours(3)));
        assert!(task.is_overdue_at(created + Duration::hours(3)));

        task.status = TaskStatus::Failed;
        assert!(!task.is_overdue_at(created + Duration::hours(30)));
    }

    #[test]
    fn test_broadcast_parent_metadata() {
        let parent = Task::broadcast_parent(
            "sybil",
            vec!["sam".to_string(), "saber".to_string()],
            "Update cron jobs",
            Priority::High,
            2.0,
        );
        assert!(parent.is_broadcast_parent());
        let meta = parent.metadata.unwrap();
        assert_eq!(meta.total, 2);
        assert_eq!(meta.completed, 0);
    }

    #[test]
    fn test_task_view_serializes_flat() {
        let task = Task::new("sybil", "sam", "Pull repo", Priority::Normal, 1.0);
        let now = task.created_at;
        let value = serde_json::to_value(TaskView::at(task, now)).unwrap();
        assert_eq!(value["toAgent"], "sam");
        assert_eq!(value["status"], "sent");
        assert_eq!(value["overdue"], false);
    }
}
