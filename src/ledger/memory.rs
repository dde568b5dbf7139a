//! Deterministic in-process ledger.
//!
//! Applies the same acceptance rules as the on-chain contracts: both roles
//! must sign identical bytes, the admin capability holder must authorize
//! balance and configuration changes, inputs must reference the current
//! object version, and a withdrawal may never exceed the balance.

use crate::identity::normalize_address;
use crate::ledger::transaction::{Operation, SignedTransaction, TransactionData};
use crate::ledger::{AgentAccount, ExecutionResult, ExecutionStatus, Ledger, ObjectRef};
use crate::types::{EventPage, EventPosition, LedgerEvent};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    events: Vec<LedgerEvent>,
    accounts: HashMap<String, StoredAccount>,
    executed: HashMap<String, ExecutionResult>,
    applied: Vec<TransactionData>,
    queries: Vec<Option<EventPosition>>,
    failing_queries: usize,
    transfers: HashMap<String, u64>,
    answers: HashMap<String, String>,
    next_tx: u64,
}

struct StoredAccount {
    account: AgentAccount,
    cap_owner: String,
}

/// In-memory [`Ledger`] implementation.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event in its own transaction and return its position.
    pub fn push_event(&self, event_type: &str, sender: &str, payload: serde_json::Value) -> EventPosition {
        let mut state = self.state();
        state.next_tx += 1;
        let id = EventPosition::new(format!("TX{:06}", state.next_tx), 0);
        let timestamp_ms = 1_700_000_000_000 + state.next_tx;
        state.events.push(LedgerEvent {
            id: id.clone(),
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            parsed_json: payload,
            timestamp_ms: Some(timestamp_ms),
        });
        id
    }

    /// Append an event at an explicit position.
    pub fn push_event_at(&self, id: EventPosition, event_type: &str, payload: serde_json::Value) {
        self.state().events.push(LedgerEvent {
            id,
            event_type: event_type.to_string(),
            sender: String::new(),
            parsed_json: payload,
            timestamp_ms: None,
        });
    }

    /// Create an Agent Account whose admin capability is held by `cap_owner`.
    pub fn insert_account(&self, account: AgentAccount, cap_owner: &str) {
        self.state().accounts.insert(
            account.object_id.clone(),
            StoredAccount {
                account,
                cap_owner: normalize_address(cap_owner),
            },
        );
    }

    pub fn account(&self, object_id: &str) -> Option<AgentAccount> {
        self.state()
            .accounts
            .get(object_id)
            .map(|s| s.account.clone())
    }

    /// Make the next `n` event queries fail as if the node were unreachable.
    pub fn fail_next_queries(&self, n: usize) {
        self.state().failing_queries = n;
    }

    /// `after` argument of every query, in order.
    pub fn queries(&self) -> Vec<Option<EventPosition>> {
        self.state().queries.clone()
    }

    /// Bodies of successfully applied transactions, in order.
    pub fn applied(&self) -> Vec<TransactionData> {
        self.state().applied.clone()
    }

    /// Total withdrawn to `recipient`.
    pub fn received_by(&self, recipient: &str) -> u64 {
        self.state()
            .transfers
            .get(&normalize_address(recipient))
            .copied()
            .unwrap_or(0)
    }

    /// Answer written into a prompt object.
    pub fn answer(&self, prompt: &str) -> Option<String> {
        self.state().answers.get(prompt).cloned()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn query_events(
        &self,
        event_type: &str,
        after: Option<&EventPosition>,
        limit: usize,
    ) -> Result<EventPage> {
        let mut state = self.state();
        state.queries.push(after.cloned());

        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            bail!("ledger node unavailable");
        }

        let start = match after {
            Some(pos) => match state.events.iter().position(|e| &e.id == pos) {
                Some(idx) => idx + 1,
                None => bail!("Unknown event cursor {pos}"),
            },
            None => 0,
        };

        let matching: Vec<&LedgerEvent> = state.events[start..]
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect();

        let events: Vec<LedgerEvent> = matching.iter().take(limit).map(|e| (*e).clone()).collect();
        let has_next_page = matching.len() > events.len();
        let next_cursor = events
            .last()
            .map(|e| e.id.clone())
            .or_else(|| after.cloned());

        Ok(EventPage {
            events,
            next_cursor,
            has_next_page,
        })
    }

    async fn agent_account(&self, object_id: &str) -> Result<AgentAccount> {
        match self.account(object_id) {
            Some(account) => Ok(account),
            None => bail!("Object {object_id} does not exist"),
        }
    }

    async fn execute(&self, tx: &SignedTransaction) -> Result<ExecutionResult> {
        // Invalid signatures are rejected before execution, like a real node.
        let data = tx.verify()?;
        let digest = tx.digest();

        let mut state = self.state();
        if let Some(previous) = state.executed.get(&digest) {
            return Ok(previous.clone());
        }

        let status = match apply(&mut state, &data) {
            Ok(()) => {
                state.applied.push(data.clone());
                ExecutionStatus::Success
            }
            Err(status) => status,
        };

        let result = ExecutionResult {
            digest: digest.clone(),
            status,
            events: Vec::new(),
        };
        state.executed.insert(digest, result.clone());
        Ok(result)
    }
}

fn apply(state: &mut State, data: &TransactionData) -> Result<(), ExecutionStatus> {
    let sender = normalize_address(&data.sender);

    match &data.operation {
        Operation::Withdraw {
            account,
            admin_cap,
            amount,
            recipient,
        } => {
            let stored = authorized(state, account, admin_cap, &sender)?;
            if *amount > stored.account.balance {
                return Err(failure(format!(
                    "EInsufficientBalance: requested {amount}, balance {}",
                    stored.account.balance
                )));
            }
            stored.account.balance -= amount;
            stored.account.version += 1;
            *state
                .transfers
                .entry(normalize_address(recipient))
                .or_default() += amount;
        }
        Operation::Deposit { account, amount } => {
            let stored = current(state, account)?;
            stored.account.balance = stored
                .account
                .balance
                .checked_add(*amount)
                .ok_or_else(|| failure("EBalanceOverflow".into()))?;
            stored.account.version += 1;
        }
        Operation::UpdateConfiguration {
            account,
            admin_cap,
            configuration,
        } => {
            let bytes = hex::decode(configuration)
                .map_err(|e| failure(format!("invalid configuration bytes: {e}")))?;
            let stored = authorized(state, account, admin_cap, &sender)?;
            stored.account.configuration = bytes;
            stored.account.version += 1;
        }
        Operation::UpdateMemoryPointer {
            account,
            admin_cap,
            memory_pointer,
        } => {
            let stored = authorized(state, account, admin_cap, &sender)?;
            stored.account.memory_pointer = memory_pointer.clone();
            stored.account.version += 1;
        }
        Operation::PopulateAnswer {
            prompt, response, ..
        } => {
            state.answers.insert(prompt.clone(), response.clone());
        }
        Operation::Call(_) => {}
    }
    Ok(())
}

fn current<'a>(state: &'a mut State, account: &ObjectRef) -> Result<&'a mut StoredAccount, ExecutionStatus> {
    let stored = state
        .accounts
        .get_mut(&account.object_id)
        .ok_or_else(|| failure(format!("object {} not found", account.object_id)))?;
    if stored.account.version != account.version {
        return Err(ExecutionStatus::Conflict {
            error: format!(
                "object {} is at version {}, transaction references {}",
                account.object_id, stored.account.version, account.version
            ),
        });
    }
    Ok(stored)
}

fn authorized<'a>(
    state: &'a mut State,
    account: &ObjectRef,
    admin_cap: &str,
    sender: &str,
) -> Result<&'a mut StoredAccount, ExecutionStatus> {
    let stored = current(state, account)?;
    if stored.account.admin_cap_id.as_deref() != Some(admin_cap) {
        return Err(failure(format!("ECapMismatch: {admin_cap}")));
    }
    if stored.cap_owner != sender {
        return Err(failure(format!("ENotCapOwner: {sender}")));
    }
    Ok(stored)
}

fn failure(error: String) -> ExecutionStatus {
    ExecutionStatus::Failure { error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_starts_strictly_after_cursor() {
        let ledger = InMemoryLedger::new();
        ledger.push_event_at(EventPosition::new("ABC", 0), "t", serde_json::json!({"n": 0}));
        ledger.push_event_at(EventPosition::new("ABC", 1), "t", serde_json::json!({"n": 1}));
        ledger.push_event_at(EventPosition::new("DEF", 0), "other", serde_json::json!({}));
        ledger.push_event_at(EventPosition::new("GHI", 0), "t", serde_json::json!({"n": 2}));

        let page = ledger
            .query_events("t", Some(&EventPosition::new("ABC", 0)), 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["ABC:1", "GHI:0"]);
        assert!(!page.has_next_page);
        assert_eq!(page.next_cursor, Some(EventPosition::new("GHI", 0)));
    }

    #[tokio::test]
    async fn query_pages_report_more() {
        let ledger = InMemoryLedger::new();
        for n in 0..5 {
            ledger.push_event("t", "0x1", serde_json::json!({ "n": n }));
        }
        let page = ledger.query_events("t", None, 2).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_next_page);
    }

    #[tokio::test]
    async fn empty_page_keeps_cursor() {
        let ledger = InMemoryLedger::new();
        let pos = ledger.push_event("t", "0x1", serde_json::json!({}));
        let page = ledger.query_events("t", Some(&pos), 10).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, Some(pos));
    }

    #[tokio::test]
    async fn unknown_cursor_is_an_error() {
        let ledger = InMemoryLedger::new();
        assert!(ledger
            .query_events("t", Some(&EventPosition::new("NOPE", 0)), 10)
            .await
            .is_err());
    }
}
