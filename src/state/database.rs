//! SQLite database wrapper with WAL mode and migration support.

use crate::identity::normalize_address;
use crate::state::schema;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Handle shared between pollers, the upkeep daemon and CLI commands.
pub type SharedDatabase = Arc<tokio::sync::Mutex<Database>>;

/// The gasbag state database.
pub struct Database {
    conn: Connection,
}

/// A stored cursor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCursor {
    pub event_type: String,
    pub position: EventPosition,
    pub updated_at: String,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Run schema creation and migrations.
    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating database schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else if version < schema::SCHEMA_VERSION {
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Key-value store
    // -----------------------------------------------------------------------

    /// Get a value from the KV store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a value in the KV store (upsert).
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event cursors
    // -----------------------------------------------------------------------

    /// Last handled position for `event_type`, if any.
    pub fn cursor_get(&self, event_type: &str) -> Result<Option<EventPosition>> {
        let row = self
            .conn
            .query_row(
                "SELECT tx_digest, event_seq FROM event_cursors WHERE event_type = ?1",
                params![event_type],
                |row| Ok(EventPosition::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        Ok(row)
    }

    /// Record `position` as handled (upsert).
    pub fn cursor_set(&self, event_type: &str, position: &EventPosition) -> Result<()> {
        self.conn.execute(
            "INSERT INTO event_cursors (event_type, tx_digest, event_seq, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(event_type) DO UPDATE SET
                tx_digest = ?2, event_seq = ?3, updated_at = datetime('now')",
            params![event_type, position.tx_digest, position.event_seq as i64],
        )?;
        Ok(())
    }

    /// Operator reset. Returns whether a cursor existed.
    pub fn cursor_reset(&self, event_type: &str) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM event_cursors WHERE event_type = ?1",
            params![event_type],
        )?;
        Ok(n > 0)
    }

    pub fn list_cursors(&self) -> Result<Vec<StoredCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_type, tx_digest, event_seq, updated_at
             FROM event_cursors ORDER BY event_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredCursor {
                event_type: row.get(0)?,
                position: EventPosition::new(row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64),
                updated_at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -----------------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------------

    /// Create or refresh a prompt record. Replays overwrite the event-derived
    /// fields and keep any outcome already recorded.
    pub fn upsert_prompt(&self, prompt: &PromptRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO prompts (object_id, creator, prompt_text, timestamp, callback, response,
                                  status, attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
             ON CONFLICT(object_id) DO UPDATE SET
                creator = excluded.creator,
                prompt_text = excluded.prompt_text,
                timestamp = excluded.timestamp,
                callback = excluded.callback,
                response = COALESCE(excluded.response, prompts.response),
                updated_at = datetime('now')",
            params![
                prompt.object_id,
                prompt.creator,
                prompt.prompt_text,
                prompt.timestamp.to_rfc3339(),
                prompt.callback,
                prompt.response,
                prompt.status.to_string(),
                prompt.attempts,
                prompt.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn set_prompt_response(&self, object_id: &str, response: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE prompts SET response = ?2, status = 'answered', last_error = NULL,
                                updated_at = datetime('now')
             WHERE object_id = ?1",
            params![object_id, response],
        )?;
        Ok(())
    }

    /// Park a prompt after a per-event failure.
    pub fn mark_prompt_failed(&self, object_id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE prompts SET status = 'failed', attempts = attempts + 1, last_error = ?2,
                                updated_at = datetime('now')
             WHERE object_id = ?1",
            params![object_id, error],
        )?;
        Ok(())
    }

    pub fn get_prompt(&self, object_id: &str) -> Result<Option<PromptRecord>> {
        let prompt = self
            .conn
            .query_row(
                "SELECT object_id, creator, prompt_text, timestamp, callback, response,
                        status, attempts, last_error
                 FROM prompts WHERE object_id = ?1",
                params![object_id],
                prompt_from_row,
            )
            .optional()?;
        Ok(prompt)
    }

    pub fn prompts_with_status(&self, status: PromptStatus) -> Result<Vec<PromptRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT object_id, creator, prompt_text, timestamp, callback, response,
                    status, attempts, last_error
             FROM prompts WHERE status = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![status.to_string()], prompt_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn prompt_count(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Number of prompts per status.
    pub fn prompt_counts(&self) -> Result<Vec<(PromptStatus, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM prompts GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((PromptStatus::parse(&row.get::<_, String>(0)?), row.get(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn insert_agent(&self, agent: &AgentRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agents (id, name, address, owner_address, object_id, admin_cap_id,
                                 signing_key, endpoint, provider, model, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                agent.id,
                agent.name,
                normalize_address(&agent.address),
                normalize_address(&agent.owner_address),
                agent.object_id,
                agent.admin_cap_id,
                agent.signing_key,
                agent.endpoint,
                agent.provider,
                agent.model,
                agent.status.to_string(),
                agent.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to insert agent {}", agent.id))?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let agent = self
            .conn
            .query_row(
                &format!("{AGENT_COLUMNS} WHERE id = ?1"),
                params![id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    /// Agent whose own address or owner wallet is `address`, active first.
    pub fn agent_by_address(&self, address: &str) -> Result<Option<AgentRecord>> {
        let agent = self
            .conn
            .query_row(
                &format!(
                    "{AGENT_COLUMNS} WHERE address = ?1 OR owner_address = ?1
                     ORDER BY (status = 'active') DESC, address = ?1 DESC, created_at DESC
                     LIMIT 1"
                ),
                params![normalize_address(address)],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{AGENT_COLUMNS} ORDER BY created_at, id"))?;
        let rows = stmt.query_map([], agent_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_active_agents(&self) -> Result<Vec<AgentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{AGENT_COLUMNS} WHERE status = 'active' ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], agent_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Returns whether the agent exists.
    pub fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE agents SET status = ?2 WHERE id = ?1",
            params![id, status.to_string()],
        )?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Charges
    // -----------------------------------------------------------------------

    pub fn record_charge(&self, charge: &ChargeRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO charges (id, agent_id, kind, amount, digest, success, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                charge.id,
                charge.agent_id,
                charge.kind.to_string(),
                charge.amount as i64,
                charge.digest,
                charge.success as i32,
                charge.detail,
                charge.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_charges(&self, limit: u32) -> Result<Vec<ChargeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, kind, amount, digest, success, detail, created_at
             FROM charges ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], charge_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn charges_for_agent(&self, agent_id: &str) -> Result<Vec<ChargeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, kind, amount, digest, success, detail, created_at
             FROM charges WHERE agent_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![agent_id], charge_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const AGENT_COLUMNS: &str = "SELECT id, name, address, owner_address, object_id, admin_cap_id,
        signing_key, endpoint, provider, model, status, created_at FROM agents";

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<PromptRecord> {
    Ok(PromptRecord {
        object_id: row.get(0)?,
        creator: row.get(1)?,
        prompt_text: row.get(2)?,
        timestamp: timestamp(row, 3)?,
        callback: row.get(4)?,
        response: row.get(5)?,
        status: PromptStatus::parse(&row.get::<_, String>(6)?),
        attempts: row.get(7)?,
        last_error: row.get(8)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        owner_address: row.get(3)?,
        object_id: row.get(4)?,
        admin_cap_id: row.get(5)?,
        signing_key: row.get(6)?,
        endpoint: row.get(7)?,
        provider: row.get(8)?,
        model: row.get(9)?,
        status: AgentStatus::parse(&row.get::<_, String>(10)?),
        created_at: timestamp(row, 11)?,
    })
}

fn charge_from_row(row: &Row<'_>) -> rusqlite::Result<ChargeRecord> {
    Ok(ChargeRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: if row.get::<_, String>(2)? == "upkeep" {
            ChargeKind::Upkeep
        } else {
            ChargeKind::Inference
        },
        amount: row.get::<_, i64>(3)? as u64,
        digest: row.get(4)?,
        success: row.get::<_, i32>(5)? != 0,
        detail: row.get(6)?,
        created_at: timestamp(row, 7)?,
    })
}
