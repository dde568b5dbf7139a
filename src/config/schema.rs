//! Configuration schema for gasbag.toml.

use crate::types::EventPosition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Deployment misconfiguration. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ledger network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Localnet,
}

impl Network {
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            Self::Mainnet => "https://fullnode.mainnet.sui.io:443",
            Self::Testnet => "https://fullnode.testnet.sui.io:443",
            Self::Devnet => "https://fullnode.devnet.sui.io:443",
            Self::Localnet => "http://127.0.0.1:9000",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Devnet => write!(f, "devnet"),
            Self::Localnet => write!(f, "localnet"),
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "devnet" => Ok(Self::Devnet),
            "localnet" => Ok(Self::Localnet),
            other => Err(ConfigError::Invalid {
                field: "network",
                reason: format!("unknown network '{other}'"),
            }),
        }
    }
}

/// Starting point for a tracker that has no stored cursor yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialCursor {
    pub tx_digest: String,
    #[serde(default)]
    pub event_seq: u64,
}

impl From<&InitialCursor> for EventPosition {
    fn from(c: &InitialCursor) -> Self {
        EventPosition::new(c.tx_digest.clone(), c.event_seq)
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GasbagConfig {
    /// Ledger network selector.
    pub network: Network,

    /// Explicit RPC URL; empty means the network default.
    pub rpc_url: String,

    /// Package that defines the agent and prompt contracts.
    pub package_id: String,

    /// `module::EventName` of the prompt-created event inside `package_id`.
    pub prompt_event: String,

    /// Skip pre-deployment history on first run.
    pub initial_cursor: Option<InitialCursor>,

    /// Delay between polls when no events are pending.
    pub poll_interval_ms: u64,

    /// Maximum events per query.
    pub page_size: usize,

    /// Path to SQLite database.
    pub db_path: String,

    /// Log level (debug, info, warn, error).
    pub log_level: String,

    /// Hex private key of the fixed service signer used for answer writes.
    pub service_key: String,

    /// Address receiving inference and upkeep fees.
    pub fee_collector_address: String,

    /// Hex private key of the fee collection service (gas payer, stop signer).
    pub fee_collector_key: String,

    /// Remote sponsor service; empty means the fee collector sponsors locally.
    pub sponsor_url: String,

    /// Container lifecycle manager base URL.
    pub container_manager_url: String,

    /// Developer fee added on top of provider cost, in percent.
    pub dev_fee_percent: f64,

    /// USD value of one whole native currency unit.
    pub usd_per_native: f64,

    /// Provider used when an agent names an unregistered one.
    pub default_fee_provider: String,

    /// Cron expression (with seconds) for the upkeep loop.
    pub upkeep_schedule: String,

    /// Flat fee per upkeep tick, in native minor units.
    pub upkeep_fee: u64,

    /// Gas budget attached to every transaction.
    pub gas_budget: u64,

    /// Seconds to wait for an agent's inference endpoint.
    pub inference_timeout_secs: u64,

    /// Seconds to wait for a co-signature before abandoning a settlement.
    pub cosign_timeout_secs: u64,

    /// Rebuild-and-resubmit attempts on stale object versions.
    pub conflict_retries: u32,
}

impl Default for GasbagConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            rpc_url: String::new(),
            package_id: String::new(),
            prompt_event: "prompt::PromptCreated".into(),
            initial_cursor: None,
            poll_interval_ms: 1_000,
            page_size: 50,
            db_path: "~/.gasbag/state.db".into(),
            log_level: "info".into(),
            service_key: String::new(),
            fee_collector_address: String::new(),
            fee_collector_key: String::new(),
            sponsor_url: String::new(),
            container_manager_url: "http://127.0.0.1:3001".into(),
            dev_fee_percent: 5.0,
            usd_per_native: 3.0,
            default_fee_provider: "openai".into(),
            upkeep_schedule: "0 0 * * * *".into(),
            upkeep_fee: 10_000_000,
            gas_budget: 50_000_000,
            inference_timeout_secs: 60,
            cosign_timeout_secs: 30,
            conflict_retries: 3,
        }
    }
}

impl GasbagConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    /// Resolved database path.
    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }

    pub fn effective_rpc_url(&self) -> &str {
        if self.rpc_url.is_empty() {
            self.network.default_rpc_url()
        } else {
            &self.rpc_url
        }
    }

    /// Fully qualified event type of prompt-created events.
    pub fn prompt_event_type(&self) -> String {
        format!("{}::{}", self.package_id, self.prompt_event)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn cosign_timeout(&self) -> Duration {
        Duration::from_secs(self.cosign_timeout_secs)
    }

    /// Apply `GASBAG_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GASBAG_NETWORK") {
            self.network = v.parse()?;
        }
        if let Some(v) = get("GASBAG_RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = get("GASBAG_PACKAGE_ID") {
            self.package_id = v;
        }
        if let Some(v) = get("GASBAG_INITIAL_CURSOR_TX") {
            let event_seq = match get("GASBAG_INITIAL_CURSOR_SEQ") {
                Some(seq) => parse_field("GASBAG_INITIAL_CURSOR_SEQ", &seq)?,
                None => 0,
            };
            self.initial_cursor = Some(InitialCursor {
                tx_digest: v,
                event_seq,
            });
        }
        if let Some(v) = get("GASBAG_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_field("GASBAG_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("GASBAG_SERVICE_KEY") {
            self.service_key = v;
        }
        if let Some(v) = get("GASBAG_FEE_COLLECTOR_ADDRESS") {
            self.fee_collector_address = v;
        }
        if let Some(v) = get("GASBAG_FEE_COLLECTOR_KEY") {
            self.fee_collector_key = v;
        }
        if let Some(v) = get("GASBAG_SPONSOR_URL") {
            self.sponsor_url = v;
        }
        if let Some(v) = get("GASBAG_CONTAINER_MANAGER_URL") {
            self.container_manager_url = v;
        }
        if let Some(v) = get("GASBAG_DEV_FEE_PERCENT") {
            self.dev_fee_percent = parse_field("GASBAG_DEV_FEE_PERCENT", &v)?;
        }
        if let Some(v) = get("GASBAG_USD_PER_NATIVE") {
            self.usd_per_native = parse_field("GASBAG_USD_PER_NATIVE", &v)?;
        }
        Ok(())
    }

    /// Check everything the `run` command needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.package_id.is_empty() {
            return Err(ConfigError::Missing("package_id"));
        }
        if self.service_key.is_empty() {
            return Err(ConfigError::Missing("service_key"));
        }
        if self.fee_collector_address.is_empty() {
            return Err(ConfigError::Missing("fee_collector_address"));
        }
        if self.fee_collector_key.is_empty() {
            return Err(ConfigError::Missing("fee_collector_key"));
        }
        if !(self.dev_fee_percent >= 0.0 && self.dev_fee_percent.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "dev_fee_percent",
                reason: "must be a non-negative number".into(),
            });
        }
        if !(self.usd_per_native > 0.0 && self.usd_per_native.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "usd_per_native",
                reason: "must be greater than zero".into(),
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: "must be at least 1".into(),
            });
        }
        if let Err(e) = cron::Schedule::from_str(&self.upkeep_schedule) {
            return Err(ConfigError::Invalid {
                field: "upkeep_schedule",
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_field<T: FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}
