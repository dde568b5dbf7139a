//! Prompt-created events → inference → on-chain answer → metered fee.

use crate::bridge::{AgentClient, BridgeError, Callback, EndpointDirectory};
use crate::events::EventHandler;
use crate::fees::{FeeRegistry, FeeUsage};
use crate::identity::Wallet;
use crate::settlement::{FeeCollector, SettlementProtocol};
use crate::state::SharedDatabase;
use crate::types::{AgentRecord, ChargeKind, ChargeRecord, LedgerEvent, PromptRecord, PromptStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Payload of a prompt-created event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptCreatedEvent {
    #[serde(alias = "promptId", alias = "prompt_object_id", alias = "id")]
    pub prompt_id: String,
    #[serde(default, alias = "requester")]
    pub creator: String,
    #[serde(alias = "prompt", alias = "prompt_text", alias = "text")]
    pub question: String,
    #[serde(default)]
    pub callback: Option<String>,
    /// Agent address the prompt is addressed to, when the contract names one.
    #[serde(default)]
    pub agent: Option<String>,
}

impl PromptCreatedEvent {
    pub fn from_event(event: &LedgerEvent) -> Result<Self, BridgeError> {
        let mut parsed: Self = serde_json::from_value(event.parsed_json.clone())
            .map_err(|e| BridgeError::MalformedEvent(format!("{}: {e}", event.id)))?;

        if parsed.creator.is_empty() {
            parsed.creator = event.sender.clone();
        }
        if parsed.prompt_id.is_empty() || parsed.creator.is_empty() {
            return Err(BridgeError::MalformedEvent(format!(
                "{}: missing prompt id or requester",
                event.id
            )));
        }
        Ok(parsed)
    }

    /// Address used to find the answering agent.
    pub fn lookup_address(&self) -> &str {
        self.agent
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.creator)
    }
}

struct Metering {
    registry: Arc<FeeRegistry>,
    collector: Arc<FeeCollector>,
}

pub struct InferenceBridge {
    db: SharedDatabase,
    directory: Arc<dyn EndpointDirectory>,
    client: AgentClient,
    settlement: Arc<SettlementProtocol>,
    service: Wallet,
    metering: Option<Metering>,
}

impl InferenceBridge {
    /// `service` signs and pays for answer transactions.
    pub fn new(
        db: SharedDatabase,
        directory: Arc<dyn EndpointDirectory>,
        client: AgentClient,
        settlement: Arc<SettlementProtocol>,
        service: Wallet,
    ) -> Self {
        Self {
            db,
            directory,
            client,
            settlement,
            service,
            metering: None,
        }
    }

    /// Charge agents per inference, paid to `collector`.
    pub fn with_metering(mut self, registry: Arc<FeeRegistry>, collector: Arc<FeeCollector>) -> Self {
        self.metering = Some(Metering {
            registry,
            collector,
        });
        self
    }

    /// Process one event. Per-event failures are recorded and swallowed;
    /// only database errors propagate (and cause a batch replay).
    async fn handle_event(&self, event: &LedgerEvent) -> Result<()> {
        let prompt = match PromptCreatedEvent::from_event(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping event {}: {e}", event.id);
                return Ok(());
            }
        };

        {
            let db = self.db.lock().await;
            if let Some(existing) = db.get_prompt(&prompt.prompt_id)? {
                if existing.status == PromptStatus::Answered {
                    debug!("Prompt {} already answered, skipping replay", prompt.prompt_id);
                    return Ok(());
                }
            }
            db.upsert_prompt(&PromptRecord {
                object_id: prompt.prompt_id.clone(),
                creator: prompt.creator.clone(),
                prompt_text: prompt.question.clone(),
                timestamp: event_time(event),
                callback: prompt.callback.clone(),
                response: None,
                status: PromptStatus::Pending,
                attempts: 0,
                last_error: None,
            })?;
        }

        match self.answer(&prompt).await {
            Ok((agent, response)) => {
                self.db
                    .lock()
                    .await
                    .set_prompt_response(&prompt.prompt_id, &response)?;
                self.charge(&agent, &prompt.question, &response).await?;
            }
            Err(e) => {
                warn!("Prompt {} failed: {e}", prompt.prompt_id);
                self.db
                    .lock()
                    .await
                    .mark_prompt_failed(&prompt.prompt_id, &e.to_string())?;
            }
        }
        Ok(())
    }

    async fn answer(&self, prompt: &PromptCreatedEvent) -> Result<(AgentRecord, String), BridgeError> {
        let callback = Callback::parse(prompt.callback.as_deref())?;

        let address = prompt.lookup_address();
        let agent = self
            .directory
            .resolve(address)
            .await
            .map_err(|e| BridgeError::NoEndpoint(format!("{address} ({e:#})")))?
            .ok_or_else(|| BridgeError::NoEndpoint(address.to_string()))?;
        let endpoint = agent
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BridgeError::NoEndpoint(format!("agent {}", agent.id)))?;

        let response = self
            .client
            .ask(endpoint, &prompt.question, &prompt.creator)
            .await
            .map_err(|e| BridgeError::Inference(format!("{e:#}")))?;

        let operation = callback.operation(
            &prompt.prompt_id,
            &prompt.creator,
            &prompt.question,
            &response,
        );
        let receipt = self.settlement.execute_as(&self.service, operation).await?;
        info!(
            "Answered prompt {} via {} ({})",
            prompt.prompt_id, callback, receipt.digest
        );

        Ok((agent, response))
    }

    /// Usage-metered fee for one answered prompt. Failures to price or
    /// collect are logged and recorded, never retried here.
    async fn charge(&self, agent: &AgentRecord, question: &str, response: &str) -> Result<()> {
        let Some(metering) = &self.metering else {
            return Ok(());
        };
        if !agent.is_provisioned() {
            debug!("Agent {} is not provisioned, not metering", agent.id);
            return Ok(());
        }

        let quote = match metering.registry.quote(
            &agent.provider,
            &FeeUsage {
                prompt_text: question,
                completion_text: response,
                model: &agent.model,
            },
        ) {
            Ok(q) => q,
            Err(e) => {
                error!("Cannot price inference for agent {}: {e}", agent.id);
                return Ok(());
            }
        };

        if quote.fallback {
            warn!(
                "Unknown fee provider '{}' for agent {}, priced with '{}'",
                agent.provider, agent.id, quote.strategy
            );
        }
        if quote.is_free() {
            debug!("No charge for agent {}", agent.id);
            return Ok(());
        }

        let outcome = metering
            .collector
            .collect(&self.settlement, agent, quote.amount)
            .await;
        match &outcome {
            Ok(receipt) => info!(
                "Charged agent {} {} units ({} + {} tokens, {})",
                agent.id, quote.amount, quote.prompt_tokens, quote.completion_tokens, receipt.digest
            ),
            Err(e) => warn!("Inference fee for agent {} not collected: {e}", agent.id),
        }

        self.db
            .lock()
            .await
            .record_charge(&ChargeRecord::from_outcome(
                &agent.id,
                ChargeKind::Inference,
                quote.amount,
                &outcome,
            ))
            .context("Failed to record inference charge")?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for InferenceBridge {
    async fn handle(&self, events: &[LedgerEvent], event_type: &str) -> Result<()> {
        debug!("Bridging {} {} events", events.len(), event_type);
        for event in events {
            self.handle_event(event)
                .await
                .with_context(|| format!("Failed to handle event {}", event.id))?;
        }
        Ok(())
    }
}

fn event_time(event: &LedgerEvent) -> DateTime<Utc> {
    event
        .timestamp_ms
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
        .unwrap_or_else(Utc::now)
}
