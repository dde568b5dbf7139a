//! Shared types used across the gasbag runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Event log positions
// ---------------------------------------------------------------------------

/// Opaque, ordered pointer into a ledger event stream.
///
/// Only the ledger can order two positions; locally they are compared for
/// equality and otherwise passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPosition {
    pub tx_digest: String,
    #[serde(with = "string_u64")]
    pub event_seq: u64,
}

impl EventPosition {
    pub fn new(tx_digest: impl Into<String>, event_seq: u64) -> Self {
        Self {
            tx_digest: tx_digest.into(),
            event_seq,
        }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_digest, self.event_seq)
    }
}

/// A single event read from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub id: EventPosition,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub parsed_json: serde_json::Value,
    #[serde(default, with = "opt_string_u64")]
    pub timestamp_ms: Option<u64>,
}

/// One page of events returned by a cursor-paginated query.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub next_cursor: Option<EventPosition>,
    pub has_next_page: bool,
}

// ---------------------------------------------------------------------------
// Prompt records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    /// Observed on-chain, inference not finished yet.
    Pending,
    /// Response written back on-chain.
    Answered,
    /// Skipped after a per-event failure; kept for inspection.
    Failed,
}

impl fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Answered => write!(f, "answered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl PromptStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "answered" => Self::Answered,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Off-chain mirror of an on-chain prompt object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub object_id: String,
    pub creator: String,
    pub prompt_text: String,
    pub timestamp: DateTime<Utc>,
    pub callback: Option<String>,
    pub response: Option<String>,
    pub status: PromptStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl AgentStatus {
    pub fn parse(s: &str) -> Self {
        if s == "active" {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// A deployed agent as known to this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    /// Ledger address derived from `signing_key`.
    pub address: String,
    /// Wallet address of the user who deployed the agent.
    pub owner_address: String,
    /// On-ledger Agent Account object id (absent until provisioned).
    pub object_id: Option<String>,
    /// Admin capability object authorizing balance and config changes.
    pub admin_cap_id: Option<String>,
    /// Hex-encoded secp256k1 key held on the agent's behalf.
    #[serde(skip_serializing)]
    pub signing_key: Option<String>,
    /// Base URL of the agent's inference service.
    pub endpoint: Option<String>,
    pub provider: String,
    pub model: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Both the held key and the on-ledger object exist.
    pub fn is_provisioned(&self) -> bool {
        self.signing_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.object_id.as_deref().is_some_and(|o| !o.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Charges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    /// Usage-metered fee collected right after an inference.
    Inference,
    /// Flat fee collected by the recurring upkeep loop.
    Upkeep,
}

impl fmt::Display for ChargeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inference => write!(f, "inference"),
            Self::Upkeep => write!(f, "upkeep"),
        }
    }
}

/// Audit row for one attempted withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub id: String,
    pub agent_id: String,
    pub kind: ChargeKind,
    pub amount: u64,
    pub digest: Option<String>,
    pub success: bool,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// JSON-RPC encodes 64-bit integers as decimal strings.
pub(crate) mod string_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(d)? {
            Raw::Str(s) => s.parse().map_err(de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

pub(crate) mod opt_string_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        Ok(match Option::<Raw>::deserialize(d)? {
            Some(Raw::Str(s)) => s.parse().ok(),
            Some(Raw::Num(n)) => Some(n),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_position_accepts_string_and_numeric_seq() {
        let a: EventPosition =
            serde_json::from_str(r#"{"txDigest":"ABC","eventSeq":"3"}"#).unwrap();
        let b: EventPosition = serde_json::from_str(r#"{"txDigest":"ABC","eventSeq":3}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::json!({"txDigest": "ABC", "eventSeq": "3"})
        );
    }

    #[test]
    fn unprovisioned_agent_is_detected() {
        let mut agent = AgentRecord {
            id: "a1".into(),
            name: "alice".into(),
            address: "0x1".into(),
            owner_address: "0x2".into(),
            object_id: None,
            admin_cap_id: None,
            signing_key: Some("00".into()),
            endpoint: None,
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            status: AgentStatus::Active,
            created_at: Utc::now(),
        };
        assert!(!agent.is_provisioned());
        agent.object_id = Some("0xobj".into());
        assert!(agent.is_provisioned());
        agent.signing_key = Some(String::new());
        assert!(!agent.is_provisioned());
    }
}
