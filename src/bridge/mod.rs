//! Inference bridge: prompt events in, answers and fees out.

pub mod callback;
pub mod client;
pub mod directory;
pub mod handler;

pub use callback::Callback;
pub use client::AgentClient;
pub use directory::{DatabaseDirectory, EndpointDirectory};
pub use handler::{InferenceBridge, PromptCreatedEvent};

use crate::settlement::SettlementError;
use thiserror::Error;

/// Per-event failures. The bridge records these against the prompt and
/// moves on; they never hold back the cursor.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed prompt event: {0}")]
    MalformedEvent(String),

    #[error("malformed callback '{0}': expected <package>::<module>::<function>")]
    MalformedCallback(String),

    #[error("no inference endpoint for {0}")]
    NoEndpoint(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}
