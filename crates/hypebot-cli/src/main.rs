//! Hypebot CLI
//!
//! Entry point wiring the reply engine, background schedulers, and the
//! Telegram transport together

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hypebot_config::Config;
use hypebot_content::{ContentPaths, ContentStore};
use hypebot_engine::ReplyEngine;
use hypebot_ipc::OUTBOUND_CAPACITY;
use hypebot_scheduler::{IdleSweeper, SlotDispatcher};
use hypebot_state::StateStore;
use hypebot_telegram::TelegramAdapter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

const CONFIG_TEMPLATE: &str = r#"# Hypebot configuration

[core]
# data_dir = "/home/user/.hypebot"
# log_level = "info"

[engine]
idle_minutes = 5
keyword_prob = 1.0
mention_prob = 0.90
general_prob = 0.75
cooldown_secs = 10

[content]
keywords_file = "keywords.json"
idle_file = "idle_messages.json"
general_file = "general_replies.json"
scheduled_file = "scheduled_messages.json"

[[slots]]
name = "morning"
hour = 9
minute = 0
utc_offset = "+00:00"

[[slots]]
name = "noon"
hour = 12
minute = 0

[[slots]]
name = "night"
hour = 21
minute = 0

[telegram]
bot_token = "YOUR_BOT_TOKEN"
# poll_timeout_secs = 60
# client_recreate_interval_secs = 600
# allowed_chats = [-1001234567890]
"#;

#[derive(Parser)]
#[command(name = "hypebot")]
#[command(about = "Telegram group hype bot with idle nudges and scheduled broadcasts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Run,

    /// Write a starter config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Run => run(&config_path, &cli.log_level).await,
        Commands::InitConfig { force } => init_config(&config_path, force),
    }
}

async fn run(config_path: &Path, cli_log_level: &str) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("cannot load config from {}", config_path.display()))?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    let log_level = config.core.log_level.as_deref().unwrap_or(cli_log_level);
    let _logging_guard = logging::init_logging(&data_dir.join("logs"), log_level)?;

    info!(config = %config_path.display(), data_dir = %data_dir.display(), "hypebot starting");

    let state = Arc::new(StateStore::load(data_dir.join("state.json")));
    let content = Arc::new(ContentStore::load(ContentPaths {
        keywords: data_dir.join(&config.content.keywords_file),
        idle: data_dir.join(&config.content.idle_file),
        general: data_dir.join(&config.content.general_file),
        scheduled: data_dir.join(&config.content.scheduled_file),
    }));
    let engine = Arc::new(ReplyEngine::new(
        config.engine.clone(),
        content,
        Arc::clone(&state),
    ));

    let telegram_cfg = config
        .telegram
        .as_ref()
        .context("config has no [telegram] section, nothing to run")?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let adapter = Arc::new(TelegramAdapter::new(
        telegram_cfg,
        data_dir.clone(),
        Arc::clone(&engine),
        outbound_tx.clone(),
    ));

    let sweeper = IdleSweeper::new(Arc::clone(&engine), outbound_tx.clone());
    tokio::spawn(sweeper.run());

    let dispatcher = SlotDispatcher::new(Arc::clone(&engine), &config.slots, outbound_tx)?;
    tokio::spawn(dispatcher.run());

    {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.run_outbound_handler(outbound_rx).await });
    }
    {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            if let Err(e) = adapter.poll().await {
                error!("telegram polling stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    if let Err(e) = state.persist() {
        error!("final state persist failed: {}", e);
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("cannot write {}", path.display()))?;
    println!("Wrote starter config to {}", path.display());
    println!("Edit telegram.bot_token, then run: hypebot run");
    Ok(())
}
