//! # Switchboard Servers
//!
//! Connections to independently deployed tool servers, aggregated into one
//! tool list by [`ToolServerRegistry`].
//!
//! The registry only knows the [`ToolTransport`](switchboard_core::ToolTransport)
//! seam. [`HttpConnector`] supplies the JSON-RPC over HTTP implementation
//! used in production; tests plug in scripted transports.

pub mod connection;
pub mod http;
pub mod registry;

pub use connection::{
    ConnectionState, Connector, ServerStatus, ToolServerConnection, ToolServerEndpoint,
};
pub use http::{HttpConnector, HttpToolTransport};
pub use registry::{ConnectReport, DegradedServer, RetryPolicy, ToolServerRegistry};
