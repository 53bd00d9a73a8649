//! Session identifiers and conversation turns.
//!
//! These are the value objects that flow through the whole system:
//! a query arrives → it becomes a user turn → inference produces an
//! assistant turn → both land in the session's conversation window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied key/value data attached to a session. Never interpreted
/// by the core.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Opaque, collision-resistant session identifier (random 128-bit token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
}

impl Role {
    /// The role that must follow this one.
    pub fn next(self) -> Role {
        match self {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message within a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,

    pub content: String,

    /// Position within the session, strictly increasing and never reused,
    /// even after truncation.
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, sequence: u64) -> Self {
        Self {
            role,
            content: content.into(),
            sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>, sequence: u64) -> Self {
        Self::new(Role::User, content, sequence)
    }

    pub fn assistant(content: impl Into<String>, sequence: u64) -> Self {
        Self::new(Role::Assistant, content, sequence)
    }

    /// Rough token estimate (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_hex_tokens() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn role_alternates() {
        assert_eq!(Role::User.next(), Role::Assistant);
        assert_eq!(Role::Assistant.next(), Role::User);
    }

    #[test]
    fn turn_serializes_lowercase_role() {
        let turn = Turn::user("What's the weather?", 0);
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["sequence"], 0);

        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, "What's the weather?");
    }

    #[test]
    fn session_id_is_transparent_in_json() {
        let id = SessionId::from("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
    }
}
