//! Runs one independent poller per tracked event type.

use crate::events::{EventPoller, EventTracker};
use crate::ledger::Ledger;
use crate::state::SharedDatabase;
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct EventDispatcher {
    ledger: Arc<dyn Ledger>,
    db: SharedDatabase,
    page_size: usize,
    interval: Duration,
    trackers: Vec<EventTracker>,
}

impl EventDispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, db: SharedDatabase, page_size: usize, interval: Duration) -> Self {
        Self {
            ledger,
            db,
            page_size,
            interval,
            trackers: Vec::new(),
        }
    }

    /// Register a tracker. Each event type has exactly one poller, which is
    /// the only writer of its cursor.
    pub fn track(&mut self, tracker: EventTracker) -> Result<()> {
        if self
            .trackers
            .iter()
            .any(|t| t.event_type == tracker.event_type)
        {
            bail!("Event type {} is already tracked", tracker.event_type);
        }
        self.trackers.push(tracker);
        Ok(())
    }

    pub fn event_types(&self) -> Vec<&str> {
        self.trackers.iter().map(|t| t.event_type.as_str()).collect()
    }

    fn poller(&self, tracker: EventTracker) -> EventPoller {
        EventPoller::new(
            tracker,
            self.ledger.clone(),
            self.db.clone(),
            self.page_size,
            self.interval,
        )
    }

    /// Spawn every poller; they stop when `cancel` fires.
    pub fn spawn(self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.trackers
            .iter()
            .cloned()
            .map(|tracker| {
                let event_type = tracker.event_type.clone();
                let poller = self.poller(tracker);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = poller.run(cancel).await {
                        error!(%event_type, "Event poller exited: {e:#}");
                    }
                })
            })
            .collect()
    }
}
