#![allow(dead_code)]

use chrono::Utc;
use gasbag::config::GasbagConfig;
use gasbag::identity::Wallet;
use gasbag::ledger::{AgentAccount, InMemoryLedger, Ledger};
use gasbag::runtime::Services;
use gasbag::state::Database;
use gasbag::types::{AgentRecord, AgentStatus};
use std::sync::Arc;

pub const FEES: &str = "0xfees";
pub const OWNER: &str = "0xowner";

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub services: Services,
}

pub fn config() -> GasbagConfig {
    GasbagConfig {
        package_id: "0xpkg".into(),
        service_key: Wallet::generate().private_key_hex(),
        fee_collector_key: Wallet::generate().private_key_hex(),
        fee_collector_address: FEES.into(),
        poll_interval_ms: 10,
        page_size: 2,
        upkeep_fee: 1_000,
        inference_timeout_secs: 2,
        cosign_timeout_secs: 1,
        ..GasbagConfig::default()
    }
}

pub fn harness(config: GasbagConfig) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let db = Database::open_memory().unwrap().into_shared();
    let services = Services::new(config, db, ledger.clone() as Arc<dyn Ledger>).unwrap();
    Harness { ledger, services }
}

impl Harness {
    /// Register an agent and, when `balance` is given, its on-ledger account.
    pub async fn agent(&self, id: &str, endpoint: Option<&str>, balance: Option<u64>) -> AgentRecord {
        let wallet = Wallet::generate();
        let object_id = format!("0xacct_{id}");
        if let Some(balance) = balance {
            self.ledger.insert_account(
                AgentAccount {
                    object_id: object_id.clone(),
                    version: 1,
                    balance,
                    configuration: vec![],
                    memory_pointer: None,
                    admin_cap_id: Some(format!("0xcap_{id}")),
                },
                &wallet.address,
            );
        }
        let provisioned = balance.is_some();
        let record = AgentRecord {
            id: id.into(),
            name: format!("agent-{id}"),
            address: wallet.address.clone(),
            owner_address: format!("{OWNER}{id}"),
            object_id: provisioned.then(|| object_id.clone()),
            admin_cap_id: provisioned.then(|| format!("0xcap_{id}")),
            signing_key: provisioned.then(|| wallet.private_key_hex()),
            endpoint: endpoint.map(str::to_string),
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            status: AgentStatus::Active,
            created_at: Utc::now(),
        };
        self.services.db.lock().await.insert_agent(&record).unwrap();
        record
    }

    pub fn balance(&self, agent: &AgentRecord) -> u64 {
        let object_id = agent.object_id.as_deref().unwrap();
        self.ledger.account(object_id).unwrap().balance
    }

    pub async fn status(&self, id: &str) -> AgentStatus {
        self.services
            .db
            .lock()
            .await
            .get_agent(id)
            .unwrap()
            .unwrap()
            .status
    }
}
