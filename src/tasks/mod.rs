//! Task protocol - durable, trackable units of work on top of the relay.
//!
//! - Task records and the forward-only status lifecycle
//! - SQLite store with conditional status writes
//! - Service layer: send, claim, acknowledge, list and broadcast rollup

pub mod model;
pub mod service;
pub mod store;

pub use model::{AckOutcome, BroadcastMeta, Task, TaskStatus, TaskView, BROADCAST};
pub use service::{
    AckResult, AgentDispatch, BroadcastRollup, ListFilter, SendTaskRequest, SendTaskResult,
    TaskService,
};
pub use store::{SqliteTaskStore, TaskQuery, TaskStore};
