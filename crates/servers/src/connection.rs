//! Per-server connection state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::tool::{ServerInfo, ToolDescriptor, ToolSpec, ToolTransport};

/// Where a tool server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerEndpoint {
    pub server_id: String,
    pub url: String,
}

impl ToolServerEndpoint {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
        }
    }
}

/// Builds a fresh transport for an endpoint.
///
/// Every connect cycle asks for a new transport, so no protocol state
/// leaks from a failed connection into its replacement.
pub trait Connector: Send + Sync {
    fn transport(&self, endpoint: &ToolServerEndpoint) -> Arc<dyn ToolTransport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

/// A registry-owned connection to one tool server.
///
/// `tools` is non-empty only while `state == Ready`; leaving `Ready` evicts
/// the cached descriptors.
pub struct ToolServerConnection {
    endpoint: ToolServerEndpoint,
    transport: Arc<dyn ToolTransport>,
    state: ConnectionState,
    tools: Vec<ToolDescriptor>,
    server_info: Option<ServerInfo>,
    last_error: Option<String>,
    attempts: u32,
    connected_at: Option<DateTime<Utc>>,
}

impl ToolServerConnection {
    pub fn new(endpoint: ToolServerEndpoint, transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            endpoint,
            transport,
            state: ConnectionState::Disconnected,
            tools: Vec::new(),
            server_info: None,
            last_error: None,
            attempts: 0,
            connected_at: None,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.endpoint.server_id
    }

    pub fn endpoint(&self) -> &ToolServerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn transport(&self) -> Arc<dyn ToolTransport> {
        self.transport.clone()
    }

    /// Whether `transport` is the one this connection currently uses.
    pub fn uses_transport(&self, transport: &Arc<dyn ToolTransport>) -> bool {
        Arc::ptr_eq(&self.transport, transport)
    }

    /// Start a new connect cycle on a fresh transport.
    pub fn begin_connect(&mut self, transport: Arc<dyn ToolTransport>) {
        self.transport = transport;
        self.state = ConnectionState::Connecting;
        self.tools.clear();
        self.attempts = 0;
    }

    pub fn mark_ready(&mut self, info: ServerInfo, specs: Vec<ToolSpec>, attempts: u32) {
        let server_id = self.endpoint.server_id.clone();
        self.tools = specs
            .into_iter()
            .map(|spec| ToolDescriptor::from_spec(server_id.clone(), spec))
            .collect();
        self.server_info = Some(info);
        self.state = ConnectionState::Ready;
        self.last_error = None;
        self.attempts = attempts;
        self.connected_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, attempts: Option<u32>) {
        self.state = ConnectionState::Failed;
        self.tools.clear();
        self.last_error = Some(error.into());
        if let Some(attempts) = attempts {
            self.attempts = attempts;
        }
        self.connected_at = None;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.tools.clear();
        self.connected_at = None;
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.endpoint.server_id.clone(),
            url: self.endpoint.url.clone(),
            state: self.state,
            tool_count: self.tools.len(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            connected_at: self.connected_at,
            server_name: self.server_info.as_ref().map(|i| i.name.clone()),
        }
    }
}

impl fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("tools", &self.tools.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Snapshot of one connection, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub url: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}
