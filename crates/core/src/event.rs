//! Domain event system: the optional telemetry sink.
//!
//! Events are published when something interesting happens in the system.
//! Nothing depends on a subscriber being present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Why a session left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Found past `expires_at` on access
    Lazy,
    /// Reaped by the background sweep
    Sweep,
}

/// Final status of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Completed,
    SessionRejected,
    InferenceFailed,
    Cancelled,
}

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionCreated {
        session_id: String,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    SessionExpired {
        session_id: String,
        reason: ExpiryReason,
        timestamp: DateTime<Utc>,
    },

    SessionDeleted {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool server completed its handshake and tool-list fetch.
    ServerConnected {
        server_id: String,
        tool_count: usize,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool server exhausted its connect retries.
    ServerConnectFailed {
        server_id: String,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A ready server failed a call and was marked failed.
    ServerFailed {
        server_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ToolInvoked {
        server_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    QueryCompleted {
        session_id: Option<String>,
        status: QueryStatus,
        turn_count: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Short stable name, used as the log target field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionExpired { .. } => "session_expired",
            Self::SessionDeleted { .. } => "session_deleted",
            Self::ServerConnected { .. } => "server_connected",
            Self::ServerConnectFailed { .. } => "server_connect_failed",
            Self::ServerFailed { .. } => "server_failed",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::QueryCompleted { .. } => "query_completed",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forward every event to `tracing` until the bus is dropped.
///
/// This is the default sink used by the gateway and CLI.
pub fn spawn_tracing_sink(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(event.as_ref()).unwrap_or_default();
                    tracing::debug!(kind = event.kind(), %payload, "domain event");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event sink lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
