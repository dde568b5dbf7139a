//! Persistent state: cursors, prompts, agents and charges in SQLite.

pub mod database;
pub mod schema;

pub use database::{Database, SharedDatabase, StoredCursor};
