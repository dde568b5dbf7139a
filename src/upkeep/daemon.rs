//! Cron-driven upkeep daemon that collects a flat fee from every active
//! agent and shuts down the ones that cannot pay.

use crate::settlement::{FeeCollector, SettlementProtocol};
use crate::state::SharedDatabase;
use crate::types::{AgentRecord, AgentStatus, ChargeKind, ChargeRecord};
use crate::upkeep::{ContainerManager, StopAuthorization};
use anyhow::{Context, Result};
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// KV key holding the time of the last completed tick.
pub const LAST_UPKEEP_KEY: &str = "last_upkeep";

/// What one tick did, by agent id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub charged: Vec<String>,
    /// Not provisioned yet.
    pub skipped: Vec<String>,
    /// Transient failure; retried next tick.
    pub deferred: Vec<String>,
    pub deactivated: Vec<String>,
}

/// Background upkeep daemon.
pub struct UpkeepDaemon {
    db: SharedDatabase,
    settlement: Arc<SettlementProtocol>,
    collector: Arc<FeeCollector>,
    containers: Arc<dyn ContainerManager>,
    schedule: Schedule,
    fee: u64,
}

impl UpkeepDaemon {
    pub fn new(
        db: SharedDatabase,
        settlement: Arc<SettlementProtocol>,
        collector: Arc<FeeCollector>,
        containers: Arc<dyn ContainerManager>,
        schedule: &str,
        fee: u64,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(schedule)
            .with_context(|| format!("Invalid upkeep schedule '{schedule}'"))?;
        Ok(Self {
            db,
            settlement,
            collector,
            containers,
            schedule,
            fee,
        })
    }

    /// Run the upkeep loop (call from a tokio::spawn).
    ///
    /// The loop exits cooperatively when `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Upkeep daemon started (fee {} per tick)", self.fee);

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("Upkeep schedule has no upcoming runs, stopping");
                return Ok(());
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!("Next upkeep tick at {next}");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.tick().await {
                        Ok(report) => info!(
                            "Upkeep tick: {} charged, {} skipped, {} deferred, {} deactivated",
                            report.charged.len(),
                            report.skipped.len(),
                            report.deferred.len(),
                            report.deactivated.len()
                        ),
                        Err(e) => error!("Upkeep tick failed: {e:#}"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Upkeep daemon shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Process one tick over all active agents, sequentially.
    ///
    /// Failures are isolated per agent, including database errors while
    /// recording one agent's outcome. Only failing to list agents aborts
    /// the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let agents = {
            let db = self.db.lock().await;
            db.list_active_agents()
                .context("Failed to list active agents")?
        };

        let mut report = TickReport::default();
        for agent in &agents {
            if !agent.is_provisioned() {
                debug!("Agent {} is not provisioned, skipping upkeep", agent.id);
                report.skipped.push(agent.id.clone());
                continue;
            }
            if self.fee == 0 {
                debug!("Upkeep fee is zero, nothing to collect from {}", agent.id);
                report.skipped.push(agent.id.clone());
                continue;
            }

            let outcome = self
                .collector
                .collect(&self.settlement, agent, self.fee)
                .await;

            {
                let db = self.db.lock().await;
                if let Err(e) = db.record_charge(&ChargeRecord::from_outcome(
                    &agent.id,
                    ChargeKind::Upkeep,
                    self.fee,
                    &outcome,
                )) {
                    error!("Failed to record upkeep charge for {}: {e:#}", agent.id);
                }
            }

            match outcome {
                Ok(receipt) => {
                    debug!("Collected upkeep from {} ({})", agent.id, receipt.digest);
                    report.charged.push(agent.id.clone());
                }
                Err(e) if e.is_retryable() => {
                    warn!("Upkeep for {} deferred: {e}", agent.id);
                    report.deferred.push(agent.id.clone());
                }
                Err(e) => {
                    warn!("Agent {} cannot pay upkeep: {e}", agent.id);
                    match self.deactivate(agent).await {
                        Ok(()) => report.deactivated.push(agent.id.clone()),
                        Err(e) => {
                            error!("Failed to deactivate {}: {e:#}", agent.id);
                            report.deferred.push(agent.id.clone());
                        }
                    }
                }
            }
        }

        {
            let db = self.db.lock().await;
            if let Err(e) = db.kv_set(LAST_UPKEEP_KEY, &Utc::now().to_rfc3339()) {
                error!("Failed to record upkeep time: {e:#}");
            }
        }
        Ok(report)
    }

    /// Stop the agent's container and mark it inactive so no further fees
    /// are attempted. The status change stands even if the stop request
    /// fails.
    async fn deactivate(&self, agent: &AgentRecord) -> Result<()> {
        match StopAuthorization::sign(&agent.id, self.collector.wallet()) {
            Ok(auth) => {
                if let Err(e) = self.containers.stop(&agent.id, &auth).await {
                    error!("Failed to stop container for {}: {e:#}", agent.id);
                }
            }
            Err(e) => error!("Cannot sign deactivation for {}: {e:#}", agent.id),
        }

        let db = self.db.lock().await;
        db.set_agent_status(&agent.id, AgentStatus::Inactive)
            .context("Failed to mark agent inactive")?;
        info!("Agent {} deactivated", agent.id);
        Ok(())
    }
}
