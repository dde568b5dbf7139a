//! Provider name → fee strategy.

use crate::fees::{
    FeeError, FeePolicy, FeeStrategy, FeeUsage, OpenAiStrategy, UnmeteredStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a provider lookup. Fallbacks are tagged so callers can warn
/// instead of silently mis-pricing.
pub enum StrategyLookup<'a> {
    Registered(&'a dyn FeeStrategy),
    UsingDefault {
        requested: String,
        strategy: &'a dyn FeeStrategy,
    },
}

impl<'a> StrategyLookup<'a> {
    pub fn strategy(&self) -> &'a dyn FeeStrategy {
        match self {
            Self::Registered(s) => *s,
            Self::UsingDefault { strategy, .. } => *strategy,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::UsingDefault { .. })
    }
}

/// Priced usage plus which strategy priced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuote {
    pub amount: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub strategy: String,
    /// Requested provider was unknown and the default was used.
    pub fallback: bool,
}

impl FeeQuote {
    pub fn is_free(&self) -> bool {
        self.amount == 0
    }
}

pub struct FeeRegistry {
    strategies: HashMap<String, Arc<dyn FeeStrategy>>,
    default_provider: String,
}

impl FeeRegistry {
    /// Registry whose fallback is `default`.
    pub fn new(default: Arc<dyn FeeStrategy>) -> Self {
        let default_provider = default.name().to_string();
        let mut strategies = HashMap::new();
        strategies.insert(default_provider.clone(), default);
        Self {
            strategies,
            default_provider,
        }
    }

    /// `openai` (token-metered) and `local` (unmetered), defaulting to
    /// `default_provider`.
    pub fn standard(policy: FeePolicy, default_provider: &str) -> Result<Self, FeeError> {
        let mut registry = Self::new(Arc::new(OpenAiStrategy::new(policy)));
        registry.register(Arc::new(UnmeteredStrategy::new("local")));
        registry.set_default(default_provider)?;
        Ok(registry)
    }

    pub fn register(&mut self, strategy: Arc<dyn FeeStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn set_default(&mut self, provider: &str) -> Result<(), FeeError> {
        if !self.strategies.contains_key(provider) {
            return Err(FeeError::UnknownDefault(provider.to_string()));
        }
        self.default_provider = provider.to_string();
        Ok(())
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn lookup(&self, provider: &str) -> StrategyLookup<'_> {
        if let Some(strategy) = self.strategies.get(provider) {
            return StrategyLookup::Registered(strategy.as_ref());
        }
        // The default is always present: `new` inserts it and `set_default`
        // only accepts registered names.
        let strategy = self.strategies[&self.default_provider].as_ref();
        StrategyLookup::UsingDefault {
            requested: provider.to_string(),
            strategy,
        }
    }

    pub fn quote(&self, provider: &str, usage: &FeeUsage<'_>) -> Result<FeeQuote, FeeError> {
        let lookup = self.lookup(provider);
        let strategy = lookup.strategy();
        let metered = strategy.calculate(usage)?;
        Ok(FeeQuote {
            amount: metered.amount,
            prompt_tokens: metered.prompt_tokens,
            completion_tokens: metered.completion_tokens,
            strategy: strategy.name().to_string(),
            fallback: lookup.is_fallback(),
        })
    }
}
