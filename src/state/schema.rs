//! Database schema definitions and migrations.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Full DDL for the gasbag state database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Key-value store for runtime markers
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Last handled position per event type
CREATE TABLE IF NOT EXISTS event_cursors (
    event_type TEXT PRIMARY KEY,
    tx_digest  TEXT NOT NULL,
    event_seq  INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Off-chain mirror of on-chain prompt objects
CREATE TABLE IF NOT EXISTS prompts (
    object_id   TEXT PRIMARY KEY,
    creator     TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    callback    TEXT,
    response    TEXT,
    status      TEXT NOT NULL DEFAULT 'pending',
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_prompts_status ON prompts(status);

-- Agents served by this process
CREATE TABLE IF NOT EXISTS agents (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    address       TEXT NOT NULL UNIQUE,
    owner_address TEXT NOT NULL,
    object_id     TEXT,
    admin_cap_id  TEXT,
    signing_key   TEXT,
    endpoint      TEXT,
    provider      TEXT NOT NULL DEFAULT 'openai',
    model         TEXT NOT NULL DEFAULT 'gpt-4o-mini',
    status        TEXT NOT NULL DEFAULT 'active',
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents(owner_address);

-- Every attempted fee withdrawal, metered or flat
CREATE TABLE IF NOT EXISTS charges (
    id         TEXT PRIMARY KEY,
    agent_id   TEXT NOT NULL,
    kind       TEXT NOT NULL,
    amount     INTEGER NOT NULL,
    digest     TEXT,
    success    INTEGER NOT NULL,
    detail     TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_charges_agent ON charges(agent_id);
"#;
