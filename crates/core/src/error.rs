//! Error types for the Switchboard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; failures are always scoped
//! to a single session or a single tool server.

use thiserror::Error;

use crate::message::Role;

/// The top-level error type for all Switchboard operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Tool server errors ---
    #[error("Tool server error: {0}")]
    ToolServer(#[from] ToolServerError),

    // --- Inference errors ---
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    // --- Query errors ---
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// A turn could not be appended without breaking user/assistant alternation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Turn out of order: expected {expected:?}, got {found:?}")]
pub struct TurnOrderError {
    pub expected: Role,
    pub found: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Unknown id, or the session is past `expires_at`.
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session history rejected turn: {0}")]
    TurnOrder(#[from] TurnOrderError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolServerError {
    /// Every configured endpoint failed after exhausting its retries.
    #[error("No tool servers available ({} endpoint(s) failed)", failures.len())]
    NoServersAvailable { failures: Vec<(String, String)> },

    #[error("Tool server unreachable: {server_id}: {reason}")]
    ServerUnreachable { server_id: String, reason: String },

    #[error("Unknown tool server: {0}")]
    UnknownServer(String),

    #[error("Handshake with {server_id} failed: {reason}")]
    Handshake { server_id: String, reason: String },

    #[error("Protocol error from {server_id}: {reason}")]
    Protocol { server_id: String, reason: String },

    #[error("Tool server {server_id} timed out after {timeout_ms}ms")]
    Timeout { server_id: String, timeout_ms: u64 },

    #[error("Tool not found on {server_id}: {tool_name}")]
    ToolNotFound { server_id: String, tool_name: String },
}

impl ToolServerError {
    /// The server this error is recorded against, if it names one.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::ServerUnreachable { server_id, .. }
            | Self::Handshake { server_id, .. }
            | Self::Protocol { server_id, .. }
            | Self::Timeout { server_id, .. }
            | Self::ToolNotFound { server_id, .. } => Some(server_id),
            Self::UnknownServer(id) => Some(id),
            Self::NoServersAvailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Inference not configured: {0}")]
    NotConfigured(String),

    #[error("Inference timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Tool-call loop exceeded {0} rounds")]
    ToolRoundsExceeded(u32),
}

/// Query-level failures surfaced to the caller of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The supplied session id is absent or past expiry. Start a new session.
    #[error("Session expired or unknown: {0}")]
    SessionExpiredOrUnknown(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Query cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Session(SessionError),
}
