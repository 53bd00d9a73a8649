//! # Switchboard Core
//!
//! Domain types, collaborator traits, and error definitions for the
//! Switchboard session and tool-server orchestrator. It pulls in no HTTP
//! or storage stack; it defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here (`Inference`,
//! `ToolTransport`, `ToolInvoker`, `Clock`). Implementations live in their
//! respective crates, which keeps the dependency graph pointing inward and
//! lets tests substitute scripted stand-ins.

pub mod clock;
pub mod error;
pub mod event;
pub mod inference;
pub mod message;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    Error, InferenceError, QueryError, Result, SessionError, ToolServerError, TurnOrderError,
};
pub use event::{DomainEvent, EventBus, ExpiryReason, QueryStatus};
pub use inference::{Inference, InferenceRequest, InferenceResponse, ToolInvocation, Usage};
pub use message::{Metadata, Role, SessionId, Turn};
pub use tool::{
    ServerInfo, ToolCall, ToolDescriptor, ToolInvoker, ToolResult, ToolSpec, ToolTransport,
    split_qualified_name,
};
