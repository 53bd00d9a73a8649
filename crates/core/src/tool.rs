//! Tool descriptors and the seams to remote tool servers.
//!
//! A tool server is an independently deployed process. The core only needs
//! three operations from it (handshake, list tools, call a tool), expressed
//! by [`ToolTransport`]. Anything that can forward a single call to the
//! owning server implements [`ToolInvoker`]; the inference collaborator
//! receives one so it can run tools mid-completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolServerError;

/// Separator between server id and tool name in a qualified tool name.
pub const QUALIFIED_SEPARATOR: &str = "__";

/// A tool as advertised by its server's tool list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of accepted arguments. Opaque to the core.
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A callable tool, tagged with the server that advertised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn from_spec(server_id: impl Into<String>, spec: ToolSpec) -> Self {
        Self {
            server_id: server_id.into(),
            name: spec.name,
            description: spec.description,
            schema: spec.input_schema,
        }
    }

    /// The namespaced name handed to the inference collaborator.
    /// Tool names may collide across servers; qualified names never do.
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.server_id, QUALIFIED_SEPARATOR, self.name)
    }
}

/// Split a qualified tool name back into `(server_id, tool_name)`.
///
/// Server ids never contain the separator (enforced by config validation),
/// so the first occurrence is the split point.
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    let (server, tool) = qualified.split_once(QUALIFIED_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Identity reported by a tool server during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

/// A request to execute a tool on a specific server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID (matches the model's tool_call.id when one exists)
    pub id: String,

    pub server_id: String,

    pub tool_name: String,

    pub arguments: serde_json::Value,
}

/// The result of a tool execution.
///
/// `success == false` means the tool ran and reported an error. A server
/// that could not be reached yields a [`ToolServerError`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,

    /// Text output handed back to the model.
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Request/response channel to one tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Connect and negotiate with the server.
    async fn handshake(&self) -> Result<ServerInfo, ToolServerError>;

    /// Fetch the full tool list.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError>;

    /// Invoke one tool.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolServerError>;

    /// Release any server-side state. Default: nothing to release.
    async fn close(&self) {}
}

/// Forwards a single tool call to the server that owns the tool.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolServerError>;
}
