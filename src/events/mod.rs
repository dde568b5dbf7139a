//! Resumable ledger event polling.
//!
//! One [`EventPoller`] per tracked event type pages through the ledger's
//! event log, hands each batch to an [`EventHandler`], and persists the
//! cursor only after the handler succeeds. Delivery is at-least-once: a
//! crash between handling and saving replays the batch on restart.

pub mod dispatcher;
pub mod poller;

pub use dispatcher::EventDispatcher;
pub use poller::{EventPoller, PollOutcome, PollState};

use crate::types::{EventPosition, LedgerEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Consumer of one event type's batches.
///
/// An `Err` means "replay this whole batch later". Implementations must be
/// idempotent because replays are expected.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, events: &[LedgerEvent], event_type: &str) -> Result<()>;
}

/// An event type to follow and where to start when no cursor is stored.
#[derive(Clone)]
pub struct EventTracker {
    pub event_type: String,
    /// Skips history that predates the deployment.
    pub initial_cursor: Option<EventPosition>,
    pub handler: Arc<dyn EventHandler>,
}

impl EventTracker {
    pub fn new(event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            event_type: event_type.into(),
            initial_cursor: None,
            handler,
        }
    }

    pub fn starting_after(mut self, position: Option<EventPosition>) -> Self {
        self.initial_cursor = position;
        self
    }
}
