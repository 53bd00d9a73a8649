//! Inference collaborator implementations for Switchboard.
//!
//! Every provider is reached through the OpenAI-compatible chat completions
//! API; [`build_from_config`] picks the base URL and credentials.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatInference;
pub use router::{build_from_config, default_base_url};
