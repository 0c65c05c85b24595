//! Agent-to-agent wire protocol.
//!
//! - Relayed messages with type and priority
//! - Transport events exchanged over the persistent connection

pub mod events;
pub mod types;

pub use events::{
    AgentStatusPayload, AgentSummary, ClientEvent, ErrorPayload, RegisterPayload,
    RegisteredPayload, SendPayload, SentPayload, ServerEvent,
};
pub use types::{Message, MessageType, Priority};
