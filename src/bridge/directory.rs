//! Lookup of the agent that answers for a ledger address.

use crate::state::SharedDatabase;
use crate::types::{AgentRecord, AgentStatus};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Agent registered under `address` (its own or its owner's), if any.
    async fn resolve(&self, address: &str) -> Result<Option<AgentRecord>>;
}

/// Directory backed by the local `agents` table. Inactive agents are not
/// served.
pub struct DatabaseDirectory {
    db: SharedDatabase,
}

impl DatabaseDirectory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EndpointDirectory for DatabaseDirectory {
    async fn resolve(&self, address: &str) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .agent_by_address(address)?
            .filter(|a| a.status == AgentStatus::Active))
    }
}
