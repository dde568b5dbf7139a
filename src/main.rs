//! Gasbag: ledger-driven inference bridge and agent fee settlement.
//!
//! Usage:
//!   gasbag run                      Start pollers and the upkeep daemon
//!   gasbag status                   Show cursors, agents, prompts and charges
//!   gasbag cursor reset <type>      Forget the stored cursor for an event type
//!   gasbag agent register|list|...  Manage the agent directory
//!   gasbag quote                    Price an inference with the fee registry
//!   gasbag withdraw                 Sponsored withdrawal from an agent balance
//!   gasbag settle prepare|submit    Two-step settlement with an external co-signer

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gasbag::config::{self, GasbagConfig};
use gasbag::fees::{FeePolicy, FeeRegistry, FeeUsage};
use gasbag::identity::{normalize_address, Wallet};
use gasbag::ledger::{JsonRpcLedger, Ledger, SignedTransaction};
use gasbag::runtime::Services;
use gasbag::settlement::{AccountAction, SettlementProtocol};
use gasbag::state::Database;
use gasbag::types::{AgentRecord, AgentStatus, ChargeRecord, PromptStatus};
use gasbag::upkeep::{daemon::LAST_UPKEEP_KEY, ContainerManager, HttpContainerManager, StopAuthorization};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gasbag")]
#[command(version = "0.1.0")]
#[command(about = "Inference bridge and fee settlement for ledger-hosted agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to gasbag home directory.
    #[arg(long, default_value = "~/.gasbag")]
    home: String,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start event pollers and the upkeep daemon.
    Run,

    /// Show cursors, agents, prompts and recent charges.
    Status,

    /// Inspect or reset event cursors.
    Cursor {
        #[command(subcommand)]
        command: CursorCommand,
    },

    /// Manage the agent directory.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Price an inference without charging anyone.
    Quote {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        completion: String,
    },

    /// Withdraw from an agent's balance with a sponsored transaction.
    Withdraw {
        /// Agent id.
        #[arg(long)]
        agent: String,
        /// Amount in native minor units.
        #[arg(long)]
        amount: u64,
        /// Recipient address (defaults to the fee collector).
        #[arg(long)]
        recipient: Option<String>,
    },

    /// Two-step settlement for an external gas payer.
    Settle {
        #[command(subcommand)]
        command: SettleCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CursorCommand {
    /// List stored cursors.
    List,
    /// Forget the stored cursor; the next run resumes from the initial cursor.
    Reset { event_type: String },
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Register an agent and generate its signing key.
    Register(RegisterArgs),
    /// List known agents.
    List,
    /// Mark an agent active and start its container.
    Activate { id: String },
    /// Stop an agent's container and mark it inactive.
    Deactivate { id: String },
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    /// Wallet address of the deploying user.
    #[arg(long)]
    owner: String,
    /// Base URL of the agent's inference service.
    #[arg(long)]
    endpoint: Option<String>,
    /// On-ledger Agent Account object id.
    #[arg(long)]
    object_id: Option<String>,
    /// Admin capability object id.
    #[arg(long)]
    admin_cap: Option<String>,
    #[arg(long, default_value = "openai")]
    provider: String,
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,
}

#[derive(Subcommand, Debug)]
enum SettleCommand {
    /// Build and sign as the agent; print bytes for the gas payer.
    Prepare {
        #[arg(long)]
        agent: String,
        /// Address of the external gas payer.
        #[arg(long)]
        gas_owner: String,
        #[command(subcommand)]
        action: ActionCommand,
    },
    /// Submit transaction bytes with both signatures.
    Submit {
        #[arg(long)]
        tx_bytes: String,
        /// Repeat once per signature.
        #[arg(long = "signature", required = true)]
        signatures: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ActionCommand {
    Withdraw {
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        recipient: String,
    },
    Deposit {
        #[arg(long)]
        amount: u64,
    },
    /// Replace the agent configuration (hex-encoded bytes).
    Configure {
        #[arg(long)]
        hex: String,
    },
    /// Set or clear the memory pointer.
    MemoryPointer {
        #[arg(long)]
        pointer: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let home_dir = PathBuf::from(shellexpand::tilde(&cli.home).into_owned());

    match cli.command {
        Commands::Run => cmd_run(&home_dir).await,
        Commands::Status => cmd_status(&home_dir).await,
        Commands::Cursor { command } => cmd_cursor(&home_dir, command).await,
        Commands::Agent { command } => cmd_agent(&home_dir, command).await,
        Commands::Quote {
            provider,
            model,
            prompt,
            completion,
        } => cmd_quote(&home_dir, &provider, &model, &prompt, &completion),
        Commands::Withdraw {
            agent,
            amount,
            recipient,
        } => cmd_withdraw(&home_dir, &agent, amount, recipient).await,
        Commands::Settle { command } => cmd_settle(&home_dir, command).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_run(home_dir: &Path) -> Result<()> {
    let (config, db) = bootstrap(home_dir)?;
    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(config.effective_rpc_url()));
    let containers: Arc<dyn ContainerManager> =
        Arc::new(HttpContainerManager::new(&config.container_manager_url));

    println!(
        "{} Starting gasbag on {} ({})",
        ">>>".green().bold(),
        config.network,
        config.effective_rpc_url(),
    );

    let services = Services::new(config, db.into_shared(), ledger)?;
    let dispatcher = services.dispatcher()?;
    let upkeep = services.upkeep(containers)?;

    for event_type in dispatcher.event_types() {
        info!("Tracking {event_type}");
    }

    let cancel = CancellationToken::new();
    let mut handles = dispatcher.spawn(&cancel);

    let upkeep_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = upkeep.run(upkeep_cancel).await {
            error!("Upkeep daemon error: {e:#}");
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n{} Shutting down gracefully...", "<<<".red().bold());
    cancel.cancel();

    let shutdown_timeout = tokio::time::Duration::from_secs(10);
    let joined = tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Task join error: {e}");
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("Shutdown timed out; abandoning remaining tasks");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn cmd_status(home_dir: &Path) -> Result<()> {
    let (config, db) = bootstrap(home_dir)?;

    let cursors = db.list_cursors()?;
    let agents = db.list_agents()?;
    let prompt_counts = db.prompt_counts()?;
    let charges = db.recent_charges(10)?;
    let last_upkeep = db.kv_get(LAST_UPKEEP_KEY)?.unwrap_or_else(|| "never".into());

    let active = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Active)
        .count();

    println!();
    println!("{}", "=== Gasbag Status ===".bold());
    println!();
    println!("  {}:", "Ledger".bold());
    println!("    Network:  {}", config.network);
    println!("    RPC:      {}", config.effective_rpc_url());
    println!("    Package:  {}", or_unset(&config.package_id));
    println!();
    println!("  {}:", "Cursors".bold());
    if cursors.is_empty() {
        println!("    {}", "none stored".dimmed());
    }
    for cursor in &cursors {
        println!(
            "    {}  {}  ({})",
            cursor.event_type,
            cursor.position,
            cursor.updated_at
        );
    }
    println!();
    println!("  {}:", "Agents".bold());
    println!("    Active:   {} / {}", active, agents.len());
    println!();
    println!("  {}:", "Prompts".bold());
    for (status, count) in &prompt_counts {
        println!("    {:<9} {}", colorize_prompt(*status), count);
    }
    println!();
    println!("  {}:", "Charges".bold());
    println!("    Last upkeep: {}", last_upkeep);
    for charge in &charges {
        println!("    {}", format_charge(charge));
    }
    println!();

    Ok(())
}

async fn cmd_cursor(home_dir: &Path, command: CursorCommand) -> Result<()> {
    let (_config, db) = bootstrap(home_dir)?;
    match command {
        CursorCommand::List => {
            for cursor in db.list_cursors()? {
                println!("{}  {}", cursor.event_type, cursor.position);
            }
        }
        CursorCommand::Reset { event_type } => {
            if db.cursor_reset(&event_type)? {
                println!("Cursor for {} reset.", event_type);
            } else {
                println!("No cursor stored for {}.", event_type);
            }
        }
    }
    Ok(())
}

async fn cmd_agent(home_dir: &Path, command: AgentCommand) -> Result<()> {
    let (config, db) = bootstrap(home_dir)?;
    match command {
        AgentCommand::Register(args) => {
            let wallet = Wallet::generate();
            let agent = AgentRecord {
                id: ulid::Ulid::new().to_string(),
                name: args.name,
                address: wallet.address.clone(),
                owner_address: normalize_address(&args.owner),
                object_id: args.object_id,
                admin_cap_id: args.admin_cap,
                signing_key: Some(wallet.private_key_hex()),
                endpoint: args.endpoint,
                provider: args.provider,
                model: args.model,
                status: AgentStatus::Active,
                created_at: Utc::now(),
            };
            db.insert_agent(&agent)?;
            println!(
                "{} Registered agent {} ({})",
                ">>>".green().bold(),
                agent.id,
                agent.address
            );
        }
        AgentCommand::List => {
            for agent in db.list_agents()? {
                let status = match agent.status {
                    AgentStatus::Active => "active".green(),
                    AgentStatus::Inactive => "inactive".red(),
                };
                println!(
                    "{}  {:<16} {:<8} {}  {}/{}{}",
                    agent.id,
                    agent.name,
                    status,
                    agent.address,
                    agent.provider,
                    agent.model,
                    if agent.is_provisioned() { "" } else { "  (unprovisioned)" },
                );
            }
        }
        AgentCommand::Activate { id } => {
            if db.get_agent(&id)?.is_none() {
                bail!("Unknown agent {id}");
            }
            HttpContainerManager::new(&config.container_manager_url)
                .start(&id)
                .await?;
            db.set_agent_status(&id, AgentStatus::Active)?;
            println!("Agent {} activated.", id);
        }
        AgentCommand::Deactivate { id } => {
            if db.get_agent(&id)?.is_none() {
                bail!("Unknown agent {id}");
            }
            let signer = Wallet::from_hex(&config.fee_collector_key)
                .context("fee_collector_key is required to sign a stop request")?;
            let auth = StopAuthorization::sign(&id, &signer)?;
            HttpContainerManager::new(&config.container_manager_url)
                .stop(&id, &auth)
                .await?;
            db.set_agent_status(&id, AgentStatus::Inactive)?;
            println!("Agent {} deactivated.", id);
        }
    }
    Ok(())
}

fn cmd_quote(home_dir: &Path, provider: &str, model: &str, prompt: &str, completion: &str) -> Result<()> {
    let config = load_home_config(home_dir)?;
    let policy = FeePolicy::new(config.dev_fee_percent, config.usd_per_native)?;
    let registry = FeeRegistry::standard(policy, &config.default_fee_provider)?;

    let quote = registry.quote(
        provider,
        &FeeUsage {
            prompt_text: prompt,
            completion_text: completion,
            model,
        },
    )?;

    if quote.fallback {
        println!(
            "{} provider '{}' is not registered; priced with '{}'",
            "Warning:".yellow().bold(),
            provider,
            quote.strategy
        );
    }
    println!("  Strategy:    {}", quote.strategy);
    println!("  Tokens:      {} in / {} out", quote.prompt_tokens, quote.completion_tokens);
    println!("  Fee:         {} minor units", quote.amount);
    Ok(())
}

async fn cmd_withdraw(home_dir: &Path, agent_id: &str, amount: u64, recipient: Option<String>) -> Result<()> {
    let (config, db) = bootstrap(home_dir)?;
    let agent = db
        .get_agent(agent_id)?
        .with_context(|| format!("Unknown agent {agent_id}"))?;
    let (agent_wallet, account_id) = agent_signer(&agent)?;

    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(config.effective_rpc_url()));
    let services = Services::new(config, db.into_shared(), ledger)?;
    let recipient = recipient.unwrap_or_else(|| services.collector.recipient().to_string());
    let gas_payer = services.gas_payer().await?;

    let receipt = services
        .settlement
        .withdraw(&agent_wallet, &account_id, amount, &recipient, gas_payer.as_ref())
        .await?;

    println!(
        "{} Withdrew {} from {} to {} ({})",
        ">>>".green().bold(),
        amount,
        agent.id,
        recipient,
        receipt.digest
    );
    Ok(())
}

async fn cmd_settle(home_dir: &Path, command: SettleCommand) -> Result<()> {
    let (config, db) = bootstrap(home_dir)?;
    if config.package_id.is_empty() {
        bail!(config::ConfigError::Missing("package_id"));
    }
    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(config.effective_rpc_url()));
    let protocol = SettlementProtocol::new(ledger, &config.package_id, config.gas_budget);

    match command {
        SettleCommand::Prepare {
            agent,
            gas_owner,
            action,
        } => {
            let agent = db
                .get_agent(&agent)?
                .with_context(|| format!("Unknown agent {agent}"))?;
            let (agent_wallet, account_id) = agent_signer(&agent)?;
            let action = match action {
                ActionCommand::Withdraw { amount, recipient } => {
                    AccountAction::Withdraw { amount, recipient }
                }
                ActionCommand::Deposit { amount } => AccountAction::Deposit { amount },
                ActionCommand::Configure { hex: encoded } => AccountAction::Configure {
                    configuration: hex::decode(encoded.trim_start_matches("0x"))
                        .context("Configuration is not valid hex")?,
                },
                ActionCommand::MemoryPointer { pointer } => AccountAction::SetMemoryPointer {
                    memory_pointer: pointer,
                },
            };

            let presigned = protocol
                .prepare(&agent_wallet, &account_id, &action, &normalize_address(&gas_owner))
                .await?;
            let out = serde_json::json!({
                "txBytes": presigned.tx_bytes_base64(),
                "senderSignature": presigned.sender_signature,
                "digest": presigned.digest(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        SettleCommand::Submit {
            tx_bytes,
            signatures,
        } => {
            let tx = SignedTransaction::from_base64(&tx_bytes, signatures)?;
            let receipt = protocol.submit(&tx).await?;
            println!("{} Submitted {}", ">>>".green().bold(), receipt.digest);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_home_config(home_dir: &Path) -> Result<GasbagConfig> {
    let config_path = home_dir.join("gasbag.toml");

    if !config_path.exists() {
        eprintln!(
            "{} No config found at {:?}. Create gasbag.toml first.",
            "Error:".red().bold(),
            config_path
        );
        std::process::exit(1);
    }

    config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

/// Bootstrap the runtime: load config and open the database.
fn bootstrap(home_dir: &Path) -> Result<(GasbagConfig, Database)> {
    if !home_dir.exists() {
        std::fs::create_dir_all(home_dir).with_context(|| {
            format!("Failed to create home directory: {}", home_dir.display())
        })?;
    }

    let cfg = load_home_config(home_dir)?;

    let db_path = cfg.resolved_db_path();
    let db_path = Path::new(&db_path);
    if let Some(parent) = db_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let db = Database::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    Ok((cfg, db))
}

fn agent_signer(agent: &AgentRecord) -> Result<(Wallet, String)> {
    let (Some(key), Some(object_id)) = (agent.signing_key.as_deref(), agent.object_id.clone()) else {
        bail!("Agent {} is not provisioned", agent.id);
    };
    let wallet = Wallet::from_hex(key).with_context(|| format!("Agent {} has an invalid key", agent.id))?;
    Ok((wallet, object_id))
}

fn or_unset(value: &str) -> String {
    if value.is_empty() {
        "unset".dimmed().to_string()
    } else {
        value.to_string()
    }
}

fn colorize_prompt(status: PromptStatus) -> String {
    let label = status.to_string();
    match status {
        PromptStatus::Answered => label.green().to_string(),
        PromptStatus::Pending => label.yellow().to_string(),
        PromptStatus::Failed => label.red().to_string(),
    }
}

fn format_charge(charge: &ChargeRecord) -> String {
    let outcome = if charge.success {
        "ok".green()
    } else {
        "failed".red()
    };
    format!(
        "{}  {:<9} {:<26} {:>14}  {}",
        charge.created_at.format("%Y-%m-%d %H:%M"),
        charge.kind.to_string(),
        charge.agent_id,
        charge.amount,
        outcome
    )
}
