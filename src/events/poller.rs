//! Per-event-type polling state machine.

use crate::events::EventTracker;
use crate::ledger::Ledger;
use crate::state::SharedDatabase;
use crate::types::EventPosition;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Handling,
    Advancing,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::Handling => write!(f, "handling"),
            Self::Advancing => write!(f, "advancing"),
        }
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new after the current position.
    Idle,
    /// A batch was handled and the cursor saved.
    Advanced {
        cursor: EventPosition,
        handled: usize,
        has_more: bool,
    },
    /// The handler failed; the cursor did not move.
    HandlerFailed { error: String },
}

pub struct EventPoller {
    tracker: EventTracker,
    ledger: Arc<dyn Ledger>,
    db: SharedDatabase,
    page_size: usize,
    interval: Duration,
    position: Option<EventPosition>,
    resolved: bool,
    state: watch::Sender<PollState>,
}

impl EventPoller {
    pub fn new(
        tracker: EventTracker,
        ledger: Arc<dyn Ledger>,
        db: SharedDatabase,
        page_size: usize,
        interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            tracker,
            ledger,
            db,
            page_size: page_size.max(1),
            interval,
            position: None,
            resolved: false,
            state,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.tracker.event_type
    }

    /// Position the next query starts strictly after.
    pub fn position(&self) -> Option<&EventPosition> {
        self.position.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    fn transition(&self, next: PollState) {
        debug!(event_type = %self.tracker.event_type, "poller -> {next}");
        self.state.send_replace(next);
    }

    /// Stored cursor, else the tracker's initial position, else genesis.
    pub async fn resolve_start(&mut self) -> Result<Option<EventPosition>> {
        let stored = {
            let db = self.db.lock().await;
            db.cursor_get(&self.tracker.event_type)
                .context("Failed to read event cursor")?
        };

        self.position = stored.or_else(|| self.tracker.initial_cursor.clone());
        self.resolved = true;

        match &self.position {
            Some(pos) => info!(event_type = %self.tracker.event_type, "Resuming after {pos}"),
            None => info!(event_type = %self.tracker.event_type, "Starting from the beginning"),
        }
        Ok(self.position.clone())
    }

    /// Run one POLLING → HANDLING → ADVANCING cycle.
    ///
    /// `Err` is a transient ledger or database failure; the position is
    /// unchanged either way unless the outcome is `Advanced`.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        if !self.resolved {
            self.resolve_start().await?;
        }

        self.transition(PollState::Polling);
        let page = match self
            .ledger
            .query_events(&self.tracker.event_type, self.position.as_ref(), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.transition(PollState::Idle);
                return Err(e.context("Event query failed"));
            }
        };

        self.transition(PollState::Handling);
        let Some(last) = page.events.last() else {
            self.transition(PollState::Idle);
            return Ok(PollOutcome::Idle);
        };
        let cursor = last.id.clone();

        if let Err(e) = self
            .tracker
            .handler
            .handle(&page.events, &self.tracker.event_type)
            .await
        {
            self.transition(PollState::Idle);
            return Ok(PollOutcome::HandlerFailed {
                error: format!("{e:#}"),
            });
        }

        self.transition(PollState::Advancing);
        {
            let db = self.db.lock().await;
            if let Err(e) = db.cursor_set(&self.tracker.event_type, &cursor) {
                drop(db);
                self.transition(PollState::Idle);
                return Err(e.context("Failed to save event cursor"));
            }
        }
        self.position = Some(cursor.clone());

        Ok(PollOutcome::Advanced {
            cursor,
            handled: page.events.len(),
            has_more: page.has_next_page,
        })
    }

    /// Poll until cancelled. Drains back-to-back while the ledger reports
    /// more pages, otherwise waits one interval between cycles.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(event_type = %self.tracker.event_type, "Event poller started");
        if let Err(e) = self.resolve_start().await {
            error!(event_type = %self.tracker.event_type, "Cannot resolve start position: {e:#}");
            return Err(e);
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let drain = match self.poll_once().await {
                Ok(PollOutcome::Advanced {
                    cursor,
                    handled,
                    has_more,
                }) => {
                    debug!(
                        event_type = %self.tracker.event_type,
                        "Handled {handled} events, cursor now {cursor}"
                    );
                    has_more
                }
                Ok(PollOutcome::Idle) => false,
                Ok(PollOutcome::HandlerFailed { error }) => {
                    warn!(
                        event_type = %self.tracker.event_type,
                        "Handler failed, batch will be replayed: {error}"
                    );
                    false
                }
                Err(e) => {
                    warn!(event_type = %self.tracker.event_type, "Poll failed: {e:#}");
                    false
                }
            };

            if drain {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.transition(PollState::Idle);
        info!(event_type = %self.tracker.event_type, "Event poller shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHandler;
    use crate::ledger::InMemoryLedger;
    use crate::state::Database;
    use crate::types::LedgerEvent;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const TYPE: &str = "0xpkg::prompt::PromptCreated";

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<EventPosition>>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, events: &[LedgerEvent], _event_type: &str) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push(events.iter().map(|e| e.id.clone()).collect());
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    fn poller(ledger: &Arc<InMemoryLedger>, handler: Arc<Recorder>, page: usize) -> (EventPoller, SharedDatabase) {
        let db = Database::open_memory().unwrap().into_shared();
        let poller = EventPoller::new(
            EventTracker::new(TYPE, handler),
            ledger.clone(),
            db.clone(),
            page,
            Duration::from_millis(10),
        );
        (poller, db)
    }

    #[tokio::test]
    async fn initial_cursor_is_exclusive() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.push_event_at(EventPosition::new("ABC", 0), TYPE, serde_json::json!({}));
        ledger.push_event_at(EventPosition::new("ABC", 1), TYPE, serde_json::json!({}));

        let handler = Arc::new(Recorder::default());
        let db = Database::open_memory().unwrap().into_shared();
        let mut poller = EventPoller::new(
            EventTracker::new(TYPE, handler.clone())
                .starting_after(Some(EventPosition::new("ABC", 0))),
            ledger.clone(),
            db,
            10,
            Duration::from_millis(10),
        );

        poller.poll_once().await.unwrap();

        assert_eq!(ledger.queries()[0], Some(EventPosition::new("ABC", 0)));
        assert_eq!(
            handler.batches.lock().unwrap()[0],
            vec![EventPosition::new("ABC", 1)]
        );
    }

    #[tokio::test]
    async fn stored_cursor_wins_over_initial() {
        let ledger = Arc::new(InMemoryLedger::new());
        let first = ledger.push_event(TYPE, "0x1", serde_json::json!({}));
        let second = ledger.push_event(TYPE, "0x1", serde_json::json!({}));

        let db = Database::open_memory().unwrap().into_shared();
        db.lock().await.cursor_set(TYPE, &second).unwrap();

        let mut poller = EventPoller::new(
            EventTracker::new(TYPE, Arc::new(Recorder::default())).starting_after(Some(first)),
            ledger.clone(),
            db,
            10,
            Duration::from_millis(10),
        );
        assert_eq!(poller.resolve_start().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn cursor_advances_monotonically() {
        let ledger = Arc::new(InMemoryLedger::new());
        for _ in 0..5 {
            ledger.push_event(TYPE, "0x1", serde_json::json!({}));
        }
        let handler = Arc::new(Recorder::default());
        let (mut poller, db) = poller(&ledger, handler.clone(), 2);

        let mut seen = Vec::new();
        loop {
            match poller.poll_once().await.unwrap() {
                PollOutcome::Advanced { cursor, has_more, .. } => {
                    seen.push(cursor);
                    if !has_more {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let ids: Vec<String> = seen.iter().map(|p| p.tx_digest.clone()).collect();
        assert_eq!(ids, vec!["TX000002", "TX000004", "TX000005"]);
        assert_eq!(
            db.lock().await.cursor_get(TYPE).unwrap(),
            Some(EventPosition::new("TX000005", 0))
        );
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_batch_is_replayed_from_same_position() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.push_event(TYPE, "0x1", serde_json::json!({}));
        ledger.push_event(TYPE, "0x1", serde_json::json!({}));

        let handler = Arc::new(Recorder::default());
        handler.fail_first.store(1, Ordering::SeqCst);
        let (mut poller, db) = poller(&ledger, handler.clone(), 10);

        assert!(matches!(
            poller.poll_once().await.unwrap(),
            PollOutcome::HandlerFailed { .. }
        ));
        assert_eq!(db.lock().await.cursor_get(TYPE).unwrap(), None);

        assert!(matches!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Advanced { handled: 2, .. }
        ));

        let batches = handler.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], batches[1]);
        assert_eq!(ledger.queries(), vec![None, None]);
    }

    #[tokio::test]
    async fn ledger_error_keeps_position() {
        let ledger = Arc::new(InMemoryLedger::new());
        let pos = ledger.push_event(TYPE, "0x1", serde_json::json!({}));
        let handler = Arc::new(Recorder::default());
        let (mut poller, _db) = poller(&ledger, handler, 10);

        poller.poll_once().await.unwrap();
        ledger.fail_next_queries(1);
        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.position(), Some(&pos));
        assert_eq!(*poller.subscribe().borrow(), PollState::Idle);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.push_event(TYPE, "0x1", serde_json::json!({}));
        let handler = Arc::new(Recorder::default());
        let (poller, db) = poller(&ledger, handler.clone(), 10);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.batches.lock().unwrap().len(), 1);
        assert!(db.lock().await.cursor_get(TYPE).unwrap().is_some());
    }
}
