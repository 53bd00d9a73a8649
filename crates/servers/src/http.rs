//! JSON-RPC 2.0 over HTTP tool-server transport.
//!
//! Speaks the streamable-HTTP flavour of the Model Context Protocol:
//! `initialize` then `notifications/initialized`, paginated `tools/list`,
//! and `tools/call`. Servers may answer with a plain JSON body or a
//! `text/event-stream` body; both are accepted. A session id handed out
//! by the server is echoed on every following request.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use switchboard_core::error::ToolServerError;
use switchboard_core::tool::{ServerInfo, ToolResult, ToolSpec, ToolTransport};

use crate::connection::{Connector, ToolServerEndpoint};

pub const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const MAX_TOOL_PAGES: usize = 64;

/// Creates [`HttpToolTransport`]s sharing one HTTP client.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Connector for HttpConnector {
    fn transport(&self, endpoint: &ToolServerEndpoint) -> Arc<dyn ToolTransport> {
        Arc::new(HttpToolTransport::new(endpoint, self.client.clone()))
    }
}

pub struct HttpToolTransport {
    server_id: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Value,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    protocol_version: Option<String>,
    #[serde(default)]
    server_info: WireServerInfo,
}

#[derive(Debug, Default, Deserialize)]
struct WireServerInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<WireTool>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default)]
    is_error: bool,
    structured_content: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl HttpToolTransport {
    pub fn new(endpoint: &ToolServerEndpoint, client: reqwest::Client) -> Self {
        Self {
            server_id: endpoint.server_id.clone(),
            url: endpoint.url.clone(),
            client,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_session_id(&self, id: Option<String>) {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn unreachable(&self, reason: impl Into<String>) -> ToolServerError {
        ToolServerError::ServerUnreachable {
            server_id: self.server_id.clone(),
            reason: reason.into(),
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> ToolServerError {
        ToolServerError::Protocol {
            server_id: self.server_id.clone(),
            reason: reason.into(),
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ToolServerError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session_id(Some(session.to_string()));
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(server_id = %self.server_id, status = status.as_u16(), body = %body, "Tool server returned error status");
            return Err(self.protocol(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(response)
    }

    /// Send a request and return its `result`, or the server's JSON-RPC
    /// error as the inner `Err`.
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, RpcError>, ToolServerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(server_id = %self.server_id, method, id, "JSON-RPC request");

        let response = self.post(&body).await?;
        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;

        let reply = if is_stream {
            parse_event_stream(&text, id)
                .ok_or_else(|| self.protocol(format!("no response to request {id} in event stream")))?
        } else {
            serde_json::from_str::<RpcResponse>(&text)
                .map_err(|e| self.protocol(format!("invalid JSON-RPC response: {e}")))?
        };

        if let Some(error) = reply.error {
            return Ok(Err(error));
        }
        reply
            .result
            .map(Ok)
            .ok_or_else(|| self.protocol("response has neither result nor error"))
    }

    async fn notify(&self, method: &str) -> Result<(), ToolServerError> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await.map(|_| ())
    }
}

/// Find the JSON-RPC response with `id` among the `data:` events of an SSE
/// body.
fn parse_event_stream(body: &str, id: u64) -> Option<RpcResponse> {
    let mut data = String::new();
    let mut events = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.is_empty() && !data.is_empty() {
            events.push(std::mem::take(&mut data));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events
        .iter()
        .filter_map(|e| serde_json::from_str::<RpcResponse>(e).ok())
        .find(|r| r.id.as_u64() == Some(id))
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn handshake(&self) -> Result<ServerInfo, ToolServerError> {
        self.set_session_id(None);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "switchboard",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let handshake_err = |reason: String| ToolServerError::Handshake {
            server_id: self.server_id.clone(),
            reason,
        };

        let result = self
            .request("initialize", params)
            .await?
            .map_err(|e| handshake_err(e.to_string()))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| handshake_err(format!("invalid initialize result: {e}")))?;

        self.notify("notifications/initialized").await?;

        debug!(
            server_id = %self.server_id,
            name = %init.server_info.name,
            protocol = ?init.protocol_version,
            "Tool server handshake complete"
        );
        Ok(ServerInfo {
            name: init.server_info.name,
            version: init.server_info.version,
            protocol_version: init.protocol_version,
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .request("tools/list", params)
                .await?
                .map_err(|e| self.protocol(e.to_string()))?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| self.protocol(format!("invalid tools/list result: {e}")))?;

            tools.extend(page.tools.into_iter().map(|t| ToolSpec {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t
                    .input_schema
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(self.protocol(format!("tools/list exceeded {MAX_TOOL_PAGES} pages")))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolServerError> {
        let reply = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        // The server answered; a JSON-RPC error here is the tool's failure.
        let result = match reply {
            Ok(result) => result,
            Err(e) => {
                return Ok(ToolResult {
                    success: false,
                    output: e.to_string(),
                    data: None,
                });
            }
        };

        let call: CallToolResult = serde_json::from_value(result)
            .map_err(|e| self.protocol(format!("invalid tools/call result: {e}")))?;
        let output = call
            .content
            .into_iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text),
                ContentItem::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolResult {
            success: !call.is_error,
            output,
            data: call.structured_content,
        })
    }

    async fn close(&self) {
        let Some(session) = self.session_id() else {
            return;
        };
        if let Err(e) = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            debug!(server_id = %self.server_id, error = %e, "Failed to close tool server session");
        }
        self.set_session_id(None);
    }
}
