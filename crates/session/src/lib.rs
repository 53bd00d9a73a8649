//! # Switchboard Session
//!
//! Conversation windows, the session store, and the background sweep that
//! reaps expired sessions.

pub mod store;
pub mod sweeper;
pub mod window;

pub use store::{Resolution, Session, SessionLease, SessionStore, SessionSummary};
pub use sweeper::{SweeperHandle, spawn_sweeper};
pub use window::ConversationWindow;
