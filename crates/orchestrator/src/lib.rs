//! Query orchestration: the heart of Switchboard.
//!
//! Each query follows **Resolve → Gather → Infer → Commit**:
//!
//! 1. **Resolve** the caller's session, or create one when none is given
//! 2. **Gather** the tools currently offered by ready tool servers
//! 3. **Infer** the reply, letting the model call tools through the registry
//! 4. **Commit** the exchange to the session window and touch the session
//!
//! Queries on one session run one at a time; queries on different sessions
//! run in parallel.

pub mod query;
pub mod runtime;

pub use query::{QueryOrchestrator, QueryOutcome, QueryRequest, SessionView};
pub use runtime::Runtime;
