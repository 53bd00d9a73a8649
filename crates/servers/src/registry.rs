//! Tool server registry: the aggregated view of tools across servers.
//!
//! Connections are keyed by server id. Each endpoint is connected by its
//! own spawned task, so one slow or dead server never holds up the rest.
//! A server that fails a call is marked failed and drops out of the
//! aggregated tool list until it is explicitly reconnected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use switchboard_core::error::ToolServerError;
use switchboard_core::event::{DomainEvent, EventBus};
use switchboard_core::tool::{
    ServerInfo, ToolDescriptor, ToolInvoker, ToolResult, ToolSpec, ToolTransport,
};

use crate::connection::{
    ConnectionState, Connector, ServerStatus, ToolServerConnection, ToolServerEndpoint,
};

/// How hard to try when connecting a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub retry_delay: Duration,
    /// Upper bound on one handshake + tool-list fetch.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// An endpoint that could not be connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedServer {
    pub server_id: String,
    pub error: String,
    pub attempts: u32,
}

/// Result of a connect cycle with at least one server ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectReport {
    /// Ready servers, including ones that were already connected.
    pub ready: Vec<String>,
    pub degraded: Vec<DegradedServer>,
}

impl ConnectReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

struct Connected {
    info: ServerInfo,
    tools: Vec<ToolSpec>,
    attempts: u32,
}

struct ConnectFailure {
    error: String,
    attempts: u32,
}

type SharedConnection = Arc<RwLock<ToolServerConnection>>;

pub struct ToolServerRegistry {
    connector: Arc<dyn Connector>,
    connections: RwLock<BTreeMap<String, SharedConnection>>,
    call_timeout: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl ToolServerRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(BTreeMap::new()),
            call_timeout: Duration::from_secs(30),
            event_bus: None,
        }
    }

    /// Bound every tool invocation by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Connect every endpoint that is not already ready.
    ///
    /// Endpoints are attempted concurrently, each retried independently.
    /// Fails with `NoServersAvailable` only if no endpoint ends up ready.
    pub async fn connect_all(
        &self,
        endpoints: &[ToolServerEndpoint],
        policy: RetryPolicy,
    ) -> Result<ConnectReport, ToolServerError> {
        let mut report = ConnectReport::default();
        let mut pending = Vec::new();

        for endpoint in endpoints {
            let conn = self.connection_for(endpoint).await;
            let mut guard = conn.write().await;
            if guard.is_ready() {
                debug!(server_id = %endpoint.server_id, "Reusing ready connection");
                report.ready.push(endpoint.server_id.clone());
                continue;
            }
            let transport = self.connector.transport(endpoint);
            guard.begin_connect(transport.clone());
            pending.push((endpoint.server_id.clone(), conn.clone(), transport));
        }

        let mut attempts = JoinSet::new();
        for (server_id, conn, transport) in pending {
            attempts.spawn(async move {
                let outcome = connect_with_retry(&server_id, transport.as_ref(), policy).await;
                (server_id, conn, transport, outcome)
            });
        }

        while let Some(joined) = attempts.join_next().await {
            let (server_id, conn, transport, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Connect task aborted");
                    continue;
                }
            };
            match self.apply_outcome(&server_id, &conn, &transport, outcome).await {
                Ok(()) => report.ready.push(server_id),
                Err(failure) => report.degraded.push(DegradedServer {
                    server_id,
                    error: failure.error,
                    attempts: failure.attempts,
                }),
            }
        }

        report.ready.sort();
        report.degraded.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        if report.ready.is_empty() {
            return Err(ToolServerError::NoServersAvailable {
                failures: report
                    .degraded
                    .into_iter()
                    .map(|d| (d.server_id, d.error))
                    .collect(),
            });
        }

        info!(
            ready = report.ready.len(),
            degraded = report.degraded.len(),
            "Tool servers connected"
        );
        Ok(report)
    }

    /// Reconnect one server on a fresh transport, whatever its state.
    pub async fn reconnect(
        &self,
        server_id: &str,
        policy: RetryPolicy,
    ) -> Result<ServerStatus, ToolServerError> {
        let conn = self.connection(server_id).await?;
        let (endpoint, transport) = {
            let mut guard = conn.write().await;
            let endpoint = guard.endpoint().clone();
            let transport = self.connector.transport(&endpoint);
            guard.begin_connect(transport.clone());
            (endpoint, transport)
        };

        let outcome = connect_with_retry(&endpoint.server_id, transport.as_ref(), policy).await;
        match self.apply_outcome(server_id, &conn, &transport, outcome).await {
            Ok(()) => Ok(conn.read().await.status()),
            Err(failure) => Err(ToolServerError::ServerUnreachable {
                server_id: server_id.to_string(),
                reason: failure.error,
            }),
        }
    }

    /// Descriptors from every ready server, ordered by server id.
    pub async fn aggregated_tools(&self) -> Vec<ToolDescriptor> {
        let connections: Vec<SharedConnection> =
            self.connections.read().await.values().cloned().collect();

        let mut tools = Vec::new();
        for conn in connections {
            let guard = conn.read().await;
            if guard.is_ready() {
                tools.extend(guard.tools().iter().cloned());
            }
        }
        tools
    }

    /// Forward one call to the server that owns the tool.
    ///
    /// A transport failure or timeout marks the server failed.
    pub async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolServerError> {
        let conn = self.connection(server_id).await?;
        let transport = {
            let guard = conn.read().await;
            if !guard.is_ready() {
                return Err(ToolServerError::ServerUnreachable {
                    server_id: server_id.to_string(),
                    reason: format!("server is {}", guard.state()),
                });
            }
            if !guard.has_tool(tool_name) {
                return Err(ToolServerError::ToolNotFound {
                    server_id: server_id.to_string(),
                    tool_name: tool_name.to_string(),
                });
            }
            guard.transport()
        };

        debug!(server_id, tool = tool_name, "Invoking tool");
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.call_timeout, transport.call_tool(tool_name, arguments))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ToolServerError::Timeout {
                    server_id: server_id.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                }),
            };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.publish(DomainEvent::ToolInvoked {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            success: matches!(&result, Ok(r) if r.success),
            duration_ms,
            timestamp: Utc::now(),
        });

        if let Err(e) = &result {
            let mut guard = conn.write().await;
            // A reconnect may have swapped the transport while we waited.
            if guard.uses_transport(&transport) && guard.is_ready() {
                warn!(server_id, tool = tool_name, error = %e, "Tool server failed; evicting its tools");
                guard.mark_failed(e.to_string(), None);
                self.publish(DomainEvent::ServerFailed {
                    server_id: server_id.to_string(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        result
    }

    /// Per-server status, ordered by server id.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let connections: Vec<SharedConnection> =
            self.connections.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(connections.len());
        for conn in connections {
            statuses.push(conn.read().await.status());
        }
        statuses
    }

    pub async fn state(&self, server_id: &str) -> Option<ConnectionState> {
        let conn = self.connections.read().await.get(server_id).cloned()?;
        let state = conn.read().await.state();
        Some(state)
    }

    /// Close every ready transport and mark all servers disconnected.
    pub async fn shutdown(&self) {
        let connections: Vec<SharedConnection> =
            self.connections.read().await.values().cloned().collect();
        for conn in connections {
            let mut guard = conn.write().await;
            if guard.is_ready() {
                let transport = guard.transport();
                if tokio::time::timeout(self.call_timeout, transport.close())
                    .await
                    .is_err()
                {
                    warn!(server_id = guard.server_id(), "Timed out closing tool server");
                }
            }
            guard.mark_disconnected();
        }
        info!("Tool server registry shut down");
    }

    async fn connection(&self, server_id: &str) -> Result<SharedConnection, ToolServerError> {
        self.connections
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| ToolServerError::UnknownServer(server_id.to_string()))
    }

    /// Existing connection for `endpoint`, replaced if its URL changed.
    ///
    /// The map lock is never held while waiting on a connection.
    async fn connection_for(&self, endpoint: &ToolServerEndpoint) -> SharedConnection {
        let seen = self
            .connections
            .read()
            .await
            .get(&endpoint.server_id)
            .cloned();
        if let Some(existing) = &seen {
            if existing.read().await.endpoint() == endpoint {
                return existing.clone();
            }
            info!(server_id = %endpoint.server_id, url = %endpoint.url, "Endpoint changed; replacing connection");
        }

        let conn = Arc::new(RwLock::new(ToolServerConnection::new(
            endpoint.clone(),
            self.connector.transport(endpoint),
        )));
        let mut connections = self.connections.write().await;
        match connections.get(&endpoint.server_id) {
            // Someone else replaced the entry since it was read.
            Some(current) if !seen.as_ref().is_some_and(|s| Arc::ptr_eq(s, current)) => {
                current.clone()
            }
            _ => {
                connections.insert(endpoint.server_id.clone(), conn.clone());
                conn
            }
        }
    }

    async fn apply_outcome(
        &self,
        server_id: &str,
        conn: &SharedConnection,
        transport: &Arc<dyn ToolTransport>,
        outcome: Result<Connected, ConnectFailure>,
    ) -> Result<(), ConnectFailure> {
        let mut guard = conn.write().await;
        if !guard.uses_transport(transport) {
            return Err(ConnectFailure {
                error: "superseded by a newer connect cycle".into(),
                attempts: 0,
            });
        }

        match outcome {
            Ok(connected) => {
                let tool_count = connected.tools.len();
                guard.mark_ready(connected.info, connected.tools, connected.attempts);
                info!(server_id, tool_count, attempts = connected.attempts, "Tool server ready");
                self.publish(DomainEvent::ServerConnected {
                    server_id: server_id.to_string(),
                    tool_count,
                    attempts: connected.attempts,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(failure) => {
                guard.mark_failed(failure.error.clone(), Some(failure.attempts));
                warn!(server_id, attempts = failure.attempts, error = %failure.error, "Tool server unavailable");
                self.publish(DomainEvent::ServerConnectFailed {
                    server_id: server_id.to_string(),
                    attempts: failure.attempts,
                    error: failure.error.clone(),
                    timestamp: Utc::now(),
                });
                Err(failure)
            }
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolServerRegistry {
    async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolServerError> {
        ToolServerRegistry::invoke(self, server_id, tool_name, arguments).await
    }
}

/// Handshake and fetch tools, retrying with a fixed delay.
async fn connect_with_retry(
    server_id: &str,
    transport: &dyn ToolTransport,
    policy: RetryPolicy,
) -> Result<Connected, ConnectFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match tokio::time::timeout(policy.attempt_timeout, discover(transport)).await {
            Ok(Ok((info, tools))) => {
                return Ok(Connected {
                    info,
                    tools,
                    attempts: attempt,
                });
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!(
                    "attempt timed out after {}ms",
                    policy.attempt_timeout.as_millis()
                )
            }
        }

        debug!(server_id, attempt, max_attempts, error = %last_error, "Connect attempt failed");
        if attempt < max_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    Err(ConnectFailure {
        error: last_error,
        attempts: max_attempts,
    })
}

async fn discover(
    transport: &dyn ToolTransport,
) -> Result<(ServerInfo, Vec<ToolSpec>), ToolServerError> {
    let info = transport.handshake().await?;
    let tools = transport.list_tools().await?;
    Ok((info, tools))
}
