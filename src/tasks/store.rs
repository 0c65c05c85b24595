//! Durable task storage backed by SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::model::{BroadcastMeta, Task, TaskStatus, BROADCAST};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_tasks (
    task_id TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    message TEXT NOT NULL,
    subject TEXT,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    timeout_hours REAL NOT NULL,
    parent_task_id TEXT,
    completion_summary TEXT,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    delivered_at INTEGER,
    acknowledged_at INTEGER,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON agent_tasks(parent_task_id);
CREATE INDEX IF NOT EXISTS idx_tasks_recipient ON agent_tasks(to_agent, created_at);
"#;

const COLUMNS: &str = "task_id, from_agent, to_agent, message, subject, priority, status, \
    timeout_hours, parent_task_id, completion_summary, metadata, created_at, delivered_at, \
    acknowledged_at, completed_at";

/// Which rows a listing should fetch. Overdue filtering happens above the store.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub agent: Option<String>,
    /// Also return terminal tasks created at or after this instant.
    pub terminal_since: Option<DateTime<Utc>>,
    pub include_broadcasts: bool,
}

/// External durable store for tasks.
///
/// Status writes are conditional on the expected current status so that
/// concurrent writers cannot silently overwrite each other.
pub trait TaskStore: Send + Sync {
    /// Insert tasks atomically.
    fn insert_tasks(&self, tasks: &[Task]) -> Result<()>;

    fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Children of a broadcast, oldest first.
    fn children(&self, parent_task_id: &str) -> Result<Vec<Task>>;

    fn list(&self, query: &TaskQuery) -> Result<Vec<Task>>;

    /// `sent -> delivered`. Returns false when the task was no longer `sent`.
    fn mark_delivered(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Persist status, timestamps and summary of `task` if its stored status is `expected`.
    fn save_transition(&self, task: &Task, expected: TaskStatus) -> Result<()>;

    /// Recount a broadcast's children and write the rollup onto the parent.
    fn recompute_rollup(&self, parent_task_id: &str, at: DateTime<Utc>) -> Result<BroadcastMeta>;
}

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| Error::store("sqlite open", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::store("sqlite busy timeout", e))?;
        tracing::debug!("Opened task store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store("sqlite open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::store("sqlite init", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection lock poisoned".to_string()))
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::store("sqlite begin", e))?;
        for task in tasks {
            let metadata = task
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                &format!(
                    "INSERT INTO agent_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    COLUMNS
                ),
                params![
                    task.task_id,
                    task.from_agent,
                    task.to_agent,
                    task.message,
                    task.subject,
                    task.priority.to_string(),
                    task.status.as_str(),
                    task.timeout_hours,
                    task.parent_task_id,
                    task.completion_summary,
                    metadata,
                    task.created_at.timestamp_millis(),
                    task.delivered_at.map(|t| t.timestamp_millis()),
                    task.acknowledged_at.map(|t| t.timestamp_millis()),
                    task.completed_at.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(|e| Error::store("sqlite insert task", e))?;
        }
        tx.commit().map_err(|e| Error::store("sqlite commit", e))?;
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM agent_tasks WHERE task_id = ?1", COLUMNS),
                params![task_id],
                TaskRow::from_row,
            )
            .optional()
            .map_err(|e| Error::store("sqlite get task", e))?;
        row.map(TaskRow::into_task).transpose()
    }

    fn children(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        select_children(&conn, parent_task_id)
    }

    fn list(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM agent_tasks
                 WHERE (?1 IS NULL OR to_agent = ?1)
                   AND (?2 = 1 OR to_agent != ?3)
                   AND (status IN ('sent', 'delivered', 'acknowledged')
                        OR (?4 IS NOT NULL AND created_at >= ?4))
                 ORDER BY to_agent ASC, created_at ASC",
                COLUMNS
            ))
            .map_err(|e| Error::store("sqlite prepare list", e))?;
        let rows = stmt
            .query_map(
                params![
                    query.agent,
                    query.include_broadcasts,
                    BROADCAST,
                    query.terminal_since.map(|t| t.timestamp_millis()),
                ],
                TaskRow::from_row,
            )
            .map_err(|e| Error::store("sqlite list tasks", e))?;
        collect_tasks(rows)
    }

    fn mark_delivered(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE agent_tasks SET status = 'delivered', delivered_at = ?2
                 WHERE task_id = ?1 AND status = 'sent'",
                params![task_id, at.timestamp_millis()],
            )
            .map_err(|e| Error::store("sqlite mark delivered", e))?;
        Ok(changed > 0)
    }

    fn save_transition(&self, task: &Task, expected: TaskStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE agent_tasks
                 SET status = ?2, acknowledged_at = ?3, completed_at = ?4, completion_summary = ?5
                 WHERE task_id = ?1 AND status = ?6",
                params![
                    task.task_id,
                    task.status.as_str(),
                    task.acknowledged_at.map(|t| t.timestamp_millis()),
                    task.completed_at.map(|t| t.timestamp_millis()),
                    task.completion_summary,
                    expected.as_str(),
                ],
            )
            .map_err(|e| Error::store("sqlite update task", e))?;
        if changed > 0 {
            return Ok(());
        }

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM agent_tasks WHERE task_id = ?1)",
                params![task.task_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::store("sqlite check task", e))?;
        if exists {
            Err(Error::Conflict(format!(
                "task {} changed concurrently (expected status {})",
                task.task_id, expected
            )))
        } else {
            Err(Error::UnknownTask(task.task_id.clone()))
        }
    }

    fn recompute_rollup(&self, parent_task_id: &str, at: DateTime<Utc>) -> Result<BroadcastMeta> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::store("sqlite begin rollup", e))?;

        let children = select_children(&tx, parent_task_id)?;
        let meta = BroadcastMeta {
            agents: children.iter().map(|c| c.to_agent.clone()).collect(),
            total: children.len(),
            completed: children
                .iter()
                .filter(|c| c.status == TaskStatus::Completed)
                .count(),
        };
        let metadata = serde_json::to_string(&meta)?;

        let changed = tx
            .execute(
                "UPDATE agent_tasks SET metadata = ?2 WHERE task_id = ?1",
                params![parent_task_id, metadata],
            )
            .map_err(|e| Error::store("sqlite update rollup", e))?;
        if changed == 0 {
            return Err(Error::UnknownTask(parent_task_id.to_string()));
        }

        if meta.total > 0 && meta.completed >= meta.total {
            tx.execute(
                "UPDATE agent_tasks
                 SET status = 'completed', completed_at = ?2, completion_summary = ?3,
                     acknowledged_at = COALESCE(acknowledged_at, ?2)
                 WHERE task_id = ?1 AND status NOT IN ('completed', 'failed')",
                params![
                    parent_task_id,
                    at.timestamp_millis(),
                    format!("All {} agents completed", meta.total),
                ],
            )
            .map_err(|e| Error::store("sqlite complete broadcast", e))?;
        }

        tx.commit().map_err(|e| Error::store("sqlite commit rollup", e))?;
        Ok(meta)
    }
}

fn select_children(conn: &Connection, parent_task_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM agent_tasks
             WHERE parent_task_id = ?1 AND to_agent != ?2
             ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        ))
        .map_err(|e| Error::store("sqlite prepare children", e))?;
    let rows = stmt
        .query_map(params![parent_task_id, BROADCAST], TaskRow::from_row)
        .map_err(|e| Error::store("sqlite query children", e))?;
    collect_tasks(rows)
}

fn collect_tasks<I>(rows: I) -> Result<Vec<Task>>
where
    I: Iterator<Item = rusqlite::Result<TaskRow>>,
{
    rows.map(|row| {
        row.map_err(|e| Error::store("sqlite read task", e))
            .and_then(TaskRow::into_task)
    })
    .collect()
}

/// Raw column values, converted to a `Task` outside the rusqlite closure.
struct TaskRow {
    task_id: String,
    from_agent: String,
    to_agent: String,
    message: String,
    subject: Option<String>,
    priority: String,
    status: String,
    timeout_hours: f64,
    parent_task_id: Option<String>,
    completion_summary: Option<String>,
    metadata: Option<String>,
    created_at: i64,
    delivered_at: Option<i64>,
    acknowledged_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            from_agent: row.get(1)?,
            to_agent: row.get(2)?,
            message: row.get(3)?,
            subject: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            timeout_hours: row.get(7)?,
            parent_task_id: row.get(8)?,
            completion_summary: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
            delivered_at: row.get(12)?,
            acknowledged_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<BroadcastMeta>)
            .transpose()?;
        Ok(Task {
            priority: self
                .priority
                .parse()
                .map_err(|e: String| Error::Store(format!("task {}: {}", self.task_id, e)))?,
            status: self
                .status
                .parse()
                .map_err(|e: String| Error::Store(format!("task {}: {}", self.task_id, e)))?,
            created_at: millis(self.created_at)?,
            delivered_at: self.delivered_at.map(millis).transpose()?,
            acknowledged_at: self.acknowledged_at.map(millis).transpose()?,
            completed_at: self.completed_at.map(millis).transpose()?,
            task_id: self.task_id,
            from_agent: self.from_agent,
            to_agent: self.to_agent,
            message: self.message,
            subject: self.subject,
            timeout_hours: self.timeout_hours,
            parent_task_id: self.parent_task_id,
            completion_summary: self.completion_summary,
            metadata,
        })
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Store(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Priority;
    use chrono::Duration;

    fn task(to: &str) -> Task {
        Task::new("sybil", to, "Pull latest skills repo", Priority::Normal, 2.0)
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let original = task("sam").with_subject(Some("Skills".to_string()));
        store.insert_tasks(&[original.clone()]).unwrap();

        let loaded = store.get(&original.task_id).unwrap().unwrap();
        assert_eq!(loaded.to_agent, "sam");
        assert_eq!(loaded.subject.as_deref(), Some("Skills"));
        assert_eq!(loaded.status, TaskStatus::Sent);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            original.created_at.timestamp_millis()
        );
        assert!(store.get("TASK-missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("tasks.db");
        let t = task("sam");
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert_tasks(&[t.clone()]).unwrap();
        }
        let reopened = SqliteTaskStore::open(&path).unwrap();
        assert!(reopened.get(&t.task_id).unwrap().is_some());
    }

    #[test]
    fn test_mark_delivered_only_from_sent() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t = task("sam");
        store.insert_tasks(&[t.clone()]).unwrap();

        assert!(store.mark_delivered(&t.task_id, Utc::now()).unwrap());
        assert!(!store.mark_delivered(&t.task_id, Utc::now()).unwrap());
        let loaded = store.get(&t.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Delivered);
        assert!(loaded.delivered_at.is_some());
    }

    #[test]
    fn test_save_transition_detects_conflict() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t = task("sam");
        store.insert_tasks(&[t.clone()]).unwrap();

        let mut done = t.clone();
        done.status = TaskStatus::Completed;
        store.save_transition(&done, TaskStatus::Sent).unwrap();

        let mut failed = t.clone();
        failed.status = TaskStatus::Failed;
        assert!(matches!(
            store.save_transition(&failed, TaskStatus::Sent),
            Err(Error::Conflict(_))
        ));

        let mut ghost = task("saber");
        ghost.status = TaskStatus::Completed;
        assert!(matches!(
            store.save_transition(&ghost, TaskStatus::Sent),
            Err(Error::UnknownTask(_))
        ));
    }

    #[test]
    fn test_rollup_counts_children() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let agents = vec!["sam".to_string(), "saber".to_string()];
        let parent = Task::broadcast_parent("sybil", agents.clone(), "Update", Priority::Normal, 2.0);
        let children: Vec<Task> = agents
            .iter()
            .map(|a| task(a).with_parent(Some(parent.task_id.clone())))
            .collect();
        let mut all = vec![parent.clone()];
        all.extend(children.iter().cloned());
        store.insert_tasks(&all).unwrap();

        let mut first = children[0].clone();
        first.status = TaskStatus::Completed;
        store.save_transition(&first, TaskStatus::Sent).unwrap();
        let meta = store.recompute_rollup(&parent.task_id, Utc::now()).unwrap();
        assert_eq!((meta.completed, meta.total), (1, 2));
        assert_eq!(meta.agents, agents);
        assert_eq!(
            store.get(&parent.task_id).unwrap().unwrap().status,
            TaskStatus::Sent
        );

        let mut second = children[1].clone();
        second.status = TaskStatus::Completed;
        store.save_transition(&second, TaskStatus::Sent).unwrap();
        store.recompute_rollup(&parent.task_id, Utc::now()).unwrap();
        let parent = store.get(&parent.task_id).unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Completed);
        assert_eq!(parent.completion_summary.as_deref(), Some("All 2 agents completed"));
        assert_eq!(parent.metadata.unwrap().completed, 2);
    }

    #[test]
    fn test_list_filters() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let open = task("sam");
        let mut old_done = task("sam");
        old_done.status = TaskStatus::Completed;
        old_done.created_at = Utc::now() - Duration::hours(48);
        let mut recent_done = task("saber");
        recent_done.status = TaskStatus::Failed;
        let parent = Task::broadcast_parent("sybil", vec![], "x", Priority::Normal, 2.0);
        store
            .insert_tasks(&[open.clone(), old_done, recent_done.clone(), parent])
            .unwrap();

        let open_only = store.list(&TaskQuery::default()).unwrap();
        assert_eq!(open_only.len(), 1);
        assert_eq!(open_only[0].task_id, open.task_id);

        let recent = store
            .list(&TaskQuery {
                terminal_since: Some(Utc::now() - Duration::hours(24)),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|t| t.task_id.clone()).collect();
        assert_eq!(ids, vec![recent_done.task_id.clone(), open.task_id.clone()]);

        let for_sam = store
            .list(&TaskQuery {
                agent: Some("sam".to_string()),
                include_broadcasts: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_sam.len(), 1);
    }
}
