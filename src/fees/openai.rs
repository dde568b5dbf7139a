//! Token-metered OpenAI pricing and the unmetered strategy.

use crate::fees::pricing::{openai_price, FeePolicy};
use crate::fees::{FeeError, FeeStrategy, FeeUsage, Metered};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;

/// Counts tokens the way a given model's tokenizer would.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> Result<u64, FeeError>;
}

/// BPE tokenizers from `tiktoken-rs`, loaded once per model.
#[derive(Default)]
pub struct TiktokenCounter {
    cache: Mutex<HashMap<String, Arc<CoreBPE>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bpe(&self, model: &str) -> Result<Arc<CoreBPE>, FeeError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bpe) = cache.get(model) {
            return Ok(bpe.clone());
        }
        let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|e| FeeError::Tokenizer {
            model: model.to_string(),
            reason: e.to_string(),
        })?;
        let bpe = Arc::new(bpe);
        cache.insert(model.to_string(), bpe.clone());
        Ok(bpe)
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, model: &str, text: &str) -> Result<u64, FeeError> {
        if text.is_empty() {
            return Ok(0);
        }
        let bpe = self.bpe(model)?;
        Ok(bpe.encode_with_special_tokens(text).len() as u64)
    }
}

/// Per-token pricing for OpenAI-hosted models.
pub struct OpenAiStrategy {
    policy: FeePolicy,
    counter: Arc<dyn TokenCounter>,
}

impl OpenAiStrategy {
    pub fn new(policy: FeePolicy) -> Self {
        Self::with_counter(policy, Arc::new(TiktokenCounter::new()))
    }

    pub fn with_counter(policy: FeePolicy, counter: Arc<dyn TokenCounter>) -> Self {
        Self { policy, counter }
    }
}

impl FeeStrategy for OpenAiStrategy {
    fn name(&self) -> &str {
        "openai"
    }

    fn calculate(&self, usage: &FeeUsage<'_>) -> Result<Metered, FeeError> {
        // Price first: an unknown model is a config error even for empty text.
        let price = openai_price(usage.model)?;
        let prompt_tokens = self.counter.count(usage.model, usage.prompt_text)?;
        let completion_tokens = self.counter.count(usage.model, usage.completion_text)?;

        Ok(Metered {
            amount: self
                .policy
                .fee_for_tokens(price, prompt_tokens, completion_tokens)?,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// Self-hosted models: never charged.
#[derive(Debug, Clone)]
pub struct UnmeteredStrategy {
    name: String,
}

impl UnmeteredStrategy {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl FeeStrategy for UnmeteredStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn calculate(&self, _usage: &FeeUsage<'_>) -> Result<Metered, FeeError> {
        Ok(Metered::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per whitespace-separated word.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, _model: &str, text: &str) -> Result<u64, FeeError> {
            Ok(text.split_whitespace().count() as u64)
        }
    }

    fn words(n: usize) -> String {
        vec!["tok"; n].join(" ")
    }

    #[test]
    fn metered_fee_uses_token_counts() {
        let strategy =
            OpenAiStrategy::with_counter(FeePolicy::new(5.0, 3.0).unwrap(), Arc::new(WordCounter));
        let prompt = words(1000);
        let completion = words(500);

        let metered = strategy
            .calculate(&FeeUsage {
                prompt_text: &prompt,
                completion_text: &completion,
                model: "gpt-4o-mini",
            })
            .unwrap();

        assert_eq!(metered.prompt_tokens, 1000);
        assert_eq!(metered.completion_tokens, 500);
        assert_eq!(metered.amount, 157_500);
    }

    #[test]
    fn unknown_model_fails_before_tokenizing() {
        let strategy = OpenAiStrategy::new(FeePolicy::new(5.0, 3.0).unwrap());
        let err = strategy
            .calculate(&FeeUsage {
                prompt_text: "",
                completion_text: "",
                model: "llama-3",
            })
            .unwrap_err();
        assert_eq!(err, FeeError::UnknownModel("llama-3".into()));
    }

    #[test]
    fn tiktoken_counts_real_text() {
        let counter = TiktokenCounter::new();
        let n = counter
            .count("gpt-4o-mini", "The quick brown fox jumps over the lazy dog.")
            .unwrap();
        assert!((5..=15).contains(&n), "{n}");
        assert_eq!(counter.count("gpt-4o-mini", "").unwrap(), 0);
    }

    #[test]
    fn unmetered_is_free() {
        let strategy = UnmeteredStrategy::new("local");
        let metered = strategy
            .calculate(&FeeUsage {
                prompt_text: "hello",
                completion_text: "world",
                model: "anything",
            })
            .unwrap();
        assert_eq!(metered.amount, 0);
    }
}
