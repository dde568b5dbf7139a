//! Assembles the configured services shared by the CLI commands.

use crate::bridge::{AgentClient, DatabaseDirectory, InferenceBridge};
use crate::config::GasbagConfig;
use crate::events::{EventDispatcher, EventTracker};
use crate::fees::{FeePolicy, FeeRegistry};
use crate::identity::Wallet;
use crate::ledger::Ledger;
use crate::settlement::{CoSigner, FeeCollector, HttpSponsor, SettlementProtocol};
use crate::state::SharedDatabase;
use crate::types::EventPosition;
use crate::upkeep::{ContainerManager, UpkeepDaemon};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub struct Services {
    pub config: GasbagConfig,
    pub db: SharedDatabase,
    pub ledger: Arc<dyn Ledger>,
    pub settlement: Arc<SettlementProtocol>,
    /// Fixed signer for answer writes.
    pub service: Wallet,
    pub collector: Arc<FeeCollector>,
    pub fees: Arc<FeeRegistry>,
}

impl Services {
    /// Validate `config` and build every long-lived service on top of
    /// `ledger`. Configuration problems are fatal here.
    pub fn new(config: GasbagConfig, db: SharedDatabase, ledger: Arc<dyn Ledger>) -> Result<Self> {
        config.validate()?;

        let service = Wallet::from_hex(&config.service_key).context("Invalid service_key")?;
        let collector_wallet =
            Wallet::from_hex(&config.fee_collector_key).context("Invalid fee_collector_key")?;
        let collector = Arc::new(FeeCollector::new(
            collector_wallet,
            &config.fee_collector_address,
        ));

        let policy = FeePolicy::new(config.dev_fee_percent, config.usd_per_native)?;
        let fees = Arc::new(FeeRegistry::standard(policy, &config.default_fee_provider)?);

        let settlement = Arc::new(
            SettlementProtocol::new(ledger.clone(), &config.package_id, config.gas_budget)
                .with_cosign_timeout(config.cosign_timeout())
                .with_conflict_retries(config.conflict_retries),
        );

        info!(
            "Services ready (package {}, service signer {}, fee collector {})",
            config.package_id,
            service.address,
            collector.wallet().address
        );

        Ok(Self {
            config,
            db,
            ledger,
            settlement,
            service,
            collector,
            fees,
        })
    }

    /// Inference bridge answering prompts and metering fees.
    pub fn bridge(&self) -> Result<InferenceBridge> {
        let client = AgentClient::new(self.config.inference_timeout())?;
        Ok(InferenceBridge::new(
            self.db.clone(),
            Arc::new(DatabaseDirectory::new(self.db.clone())),
            client,
            self.settlement.clone(),
            self.service.clone(),
        )
        .with_metering(self.fees.clone(), self.collector.clone()))
    }

    /// Dispatcher tracking prompt-created events.
    pub fn dispatcher(&self) -> Result<EventDispatcher> {
        let mut dispatcher = EventDispatcher::new(
            self.ledger.clone(),
            self.db.clone(),
            self.config.page_size,
            self.config.poll_interval(),
        );
        let initial = self.config.initial_cursor.as_ref().map(EventPosition::from);
        dispatcher.track(
            EventTracker::new(self.config.prompt_event_type(), Arc::new(self.bridge()?))
                .starting_after(initial),
        )?;
        Ok(dispatcher)
    }

    pub fn upkeep(&self, containers: Arc<dyn ContainerManager>) -> Result<UpkeepDaemon> {
        UpkeepDaemon::new(
            self.db.clone(),
            self.settlement.clone(),
            self.collector.clone(),
            containers,
            &self.config.upkeep_schedule,
            self.config.upkeep_fee,
        )
    }

    /// Gas payer for operator-initiated settlements: the remote sponsor if
    /// one is configured, else the fee collector's own key.
    pub async fn gas_payer(&self) -> Result<Arc<dyn CoSigner>> {
        if self.config.sponsor_url.is_empty() {
            return Ok(Arc::new(self.collector.wallet().clone()));
        }
        let sponsor = HttpSponsor::discover(&self.config.sponsor_url).await?;
        Ok(Arc::new(sponsor))
    }
}
