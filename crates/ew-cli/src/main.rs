//! event-wallet CLI
//!
//! Operator tool for the event-wallet protocol client:
//! - key generation and configuration management
//! - node connection status
//! - channel listing, opening and balance queries

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ew_cli::commands;
use ew_cli::node::load_wallet_config;
use ew_core::{Address, EventWalletId};

#[derive(Parser)]
#[command(name = "event-wallet")]
#[command(author, version, about = "Signed protocol client for event wallets")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "EVENT_WALLET_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the wallet and session signing keys
    Keygen {
        /// Replace existing keys
        #[arg(long)]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Connect to the node and show the connection summary
    Status,

    /// List channels known to the node
    Channels {
        /// Channel owner (default: this wallet)
        #[arg(long)]
        owner: Option<Address>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Open the payment channel for an event wallet
    Open {
        /// Event wallet id
        id: String,
        /// Channel owner (default: this wallet)
        #[arg(long)]
        owner: Option<Address>,
    },

    /// Show ledger balances for an event wallet's channel
    Balance {
        /// Event wallet id
        id: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the effective configuration
    Show,
    /// Print one configuration value
    Get {
        /// Dotted key, e.g. reconnect.max_attempts
        key: String,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config_path = cli.config.as_ref();

    let result = match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_init(config_path, force),
            ConfigAction::Show => commands::config_show(config_path),
            ConfigAction::Get { key } => commands::config_get(config_path, &key),
            ConfigAction::Path => commands::config_path(config_path),
        },
        Commands::Keygen { force } => {
            commands::keygen_command(&load_wallet_config(config_path)?, force)
        }
        Commands::Status => commands::status_command(load_wallet_config(config_path)?).await,
        Commands::Channels { owner, json } => {
            commands::channels_command(load_wallet_config(config_path)?, owner, json).await
        }
        Commands::Open { id, owner } => {
            let config = load_wallet_config(config_path)?;
            commands::open_command(config, EventWalletId::new(id), owner).await
        }
        Commands::Balance { id, json } => {
            let config = load_wallet_config(config_path)?;
            commands::balance_command(config, EventWalletId::new(id), json).await
        }
    };

    if let Err(e) = &result {
        tracing::debug!("Command failed: {:?}", e);
    }
    result
}
