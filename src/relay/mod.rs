//! Relay module - presence, delivery and message submission.
//!
//! - In-memory hub tracking online agents and offline queues
//! - One-shot submission requests and the `Submitter` seam
//! - HTTP client for callers without a live connection

pub mod client;
pub mod hub;
pub mod submit;

pub use client::RelayClient;
pub use hub::{
    reclaim_undelivered, AgentInfo, HubStats, InboxAck, Outbound, Registration, RelayHub,
    RouteOutcome,
};
pub use submit::{parse_content, SendRequest, SubmitReceipt, Submitter};
