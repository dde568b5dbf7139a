//! Gasbag: ledger-driven inference bridge and agent fee settlement.
//!
//! Follows ledger events with resumable cursors, answers on-chain prompts
//! through off-chain agents, and settles agent fees with sponsored
//! two-signature transactions.

pub mod bridge;
pub mod config;
pub mod events;
pub mod fees;
pub mod identity;
pub mod ledger;
pub mod runtime;
pub mod settlement;
pub mod state;
pub mod types;
pub mod upkeep;
