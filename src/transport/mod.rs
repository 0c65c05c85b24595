//! Transport module - the agent side of the relay connection.

pub mod endpoint;

pub use endpoint::{spawn_endpoint, ws_url, EndpointConfig, EndpointEvent, EndpointHandle};
