//! Usage-metered fee calculation.
//!
//! A [`FeeStrategy`] turns `{prompt, completion, model}` into an amount of
//! ledger-native minor units. The [`FeeRegistry`] maps provider names to
//! strategies and tags every lookup that fell back to the default.

pub mod openai;
pub mod pricing;
pub mod registry;

pub use openai::{OpenAiStrategy, TiktokenCounter, TokenCounter, UnmeteredStrategy};
pub use pricing::{FeePolicy, ModelPrice};
pub use registry::{FeeQuote, FeeRegistry, StrategyLookup};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeeError {
    /// Model has no price entry. A configuration problem, not retried.
    #[error("no price table for model '{0}'")]
    UnknownModel(String),

    #[error("no tokenizer for model '{model}': {reason}")]
    Tokenizer { model: String, reason: String },

    #[error("fee amount does not fit in a u64")]
    Overflow,

    #[error("invalid fee policy: {0}")]
    InvalidPolicy(String),

    #[error("no fee strategy registered for default provider '{0}'")]
    UnknownDefault(String),
}

/// Resource usage of one inference. Consumed immediately, never stored.
#[derive(Debug, Clone, Copy)]
pub struct FeeUsage<'a> {
    pub prompt_text: &'a str,
    pub completion_text: &'a str,
    pub model: &'a str,
}

/// Result of metering one inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metered {
    /// Ledger-native minor units; zero means "no charge".
    pub amount: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One provider's pricing rule.
pub trait FeeStrategy: Send + Sync {
    /// Registry key, e.g. `openai`.
    fn name(&self) -> &str;

    fn calculate(&self, usage: &FeeUsage<'_>) -> Result<Metered, FeeError>;
}
