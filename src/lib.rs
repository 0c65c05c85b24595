//! A2A relay library root.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod tasks;
pub mod transport;
pub mod web;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use protocol::{ClientEvent, Message, MessageType, Priority, ServerEvent};
pub use relay::{RelayClient, RelayHub, SendRequest, SubmitReceipt, Submitter};
pub use tasks::{SqliteTaskStore, Task, TaskService, TaskStatus, TaskStore};
pub use transport::{spawn_endpoint, EndpointConfig, EndpointEvent, EndpointHandle};
pub use web::run_relay_server;
