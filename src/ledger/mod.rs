//! Abstract ledger access: event queries, object reads, transaction execution.

pub mod memory;
pub mod rpc;
pub mod transaction;

pub use memory::InMemoryLedger;
pub use rpc::JsonRpcLedger;
pub use transaction::{MoveCall, ObjectRef, Operation, SignedTransaction, TransactionData};

use crate::types::{EventPage, EventPosition};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Fields of an on-ledger Agent Account object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAccount {
    pub object_id: String,
    pub version: u64,
    /// Native minor units available to pay for the agent's own writes.
    pub balance: u64,
    pub configuration: Vec<u8>,
    pub memory_pointer: Option<String>,
    pub admin_cap_id: Option<String>,
}

impl AgentAccount {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            object_id: self.object_id.clone(),
            version: self.version,
        }
    }
}

/// Outcome reported by the ledger for an executed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    /// An input object was already mutated past the referenced version.
    Conflict { error: String },
    Failure { error: String },
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub digest: String,
    pub status: ExecutionStatus,
    pub events: Vec<serde_json::Value>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Everything the core needs from a ledger node.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Events of `event_type` strictly after `after`, ascending.
    async fn query_events(
        &self,
        event_type: &str,
        after: Option<&EventPosition>,
        limit: usize,
    ) -> Result<EventPage>;

    /// Current fields and version of an Agent Account.
    async fn agent_account(&self, object_id: &str) -> Result<AgentAccount>;

    /// Submit a fully signed transaction and wait for local execution.
    async fn execute(&self, tx: &SignedTransaction) -> Result<ExecutionResult>;
}
