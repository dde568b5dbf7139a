//! The fee-collection service: recipient of agent fees and their gas payer.

use crate::identity::Wallet;
use crate::settlement::{SettlementError, SettlementProtocol, SettlementReceipt};
use crate::types::{AgentRecord, ChargeKind, ChargeRecord};
use chrono::Utc;

pub struct FeeCollector {
    wallet: Wallet,
    recipient: String,
}

impl FeeCollector {
    /// `wallet` pays gas and signs deactivation messages; fees are sent to
    /// `recipient`.
    pub fn new(wallet: Wallet, recipient: &str) -> Self {
        Self {
            wallet,
            recipient: recipient.to_string(),
        }
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Withdraw `amount` from the agent's account, signed by the agent's
    /// held key and sponsored by the collector.
    pub async fn collect(
        &self,
        protocol: &SettlementProtocol,
        agent: &AgentRecord,
        amount: u64,
    ) -> Result<SettlementReceipt, SettlementError> {
        let (Some(key), Some(object_id)) = (agent.signing_key.as_deref(), agent.object_id.as_deref())
        else {
            return Err(SettlementError::InvalidRequest(format!(
                "agent {} is not provisioned",
                agent.id
            )));
        };
        let agent_wallet = Wallet::from_hex(key).map_err(|e| {
            SettlementError::InvalidRequest(format!("agent {} signing key: {e:#}", agent.id))
        })?;

        protocol
            .withdraw(&agent_wallet, object_id, amount, &self.recipient, &self.wallet)
            .await
    }
}

impl ChargeRecord {
    /// Audit row for one collection attempt.
    pub fn from_outcome(
        agent_id: &str,
        kind: ChargeKind,
        amount: u64,
        outcome: &Result<SettlementReceipt, SettlementError>,
    ) -> Self {
        let (digest, success, detail) = match outcome {
            Ok(receipt) => (Some(receipt.digest.clone()), true, String::new()),
            Err(SettlementError::ExecutionFailed { digest, error }) => {
                (Some(digest.clone()), false, error.clone())
            }
            Err(e) => (None, false, e.to_string()),
        };
        Self {
            id: ulid::Ulid::new().to_string(),
            agent_id: agent_id.to_string(),
            kind,
            amount,
            digest,
            success,
            detail,
            created_at: Utc::now(),
        }
    }
}
