//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod bridges;
mod config_cmd;
mod connect;
mod transport;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use onionlink::config::{load_settings_with_options, LoadOptions};
use onionlink::Transport;

use connect::ConnectArgs;

#[derive(Parser)]
#[command(name = "onionlink")]
#[command(about = "Tor client supervisor with pluggable transport fallback")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config file and environment)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check the raw arguments before parsing, so logging can be set up first.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Launch tor and stay connected until Ctrl-C
    Connect(ConnectArgs),

    /// Show or change the stored transport
    Transport {
        #[command(subcommand)]
        command: Option<TransportCommands>,
    },

    /// Manage custom obfs4 bridge lines
    Bridges {
        #[command(subcommand)]
        command: Option<BridgeCommands>,
    },

    /// Print the effective settings as TOML
    Config,
}

#[derive(Subcommand)]
enum TransportCommands {
    /// Show the stored transport
    Show,
    /// Store a new transport
    Set {
        #[arg(value_enum)]
        transport: Transport,
    },
}

#[derive(Subcommand)]
enum BridgeCommands {
    /// List custom bridge lines
    List,
    /// Append a bridge line
    Add {
        /// Full bridge line, e.g. "obfs4 192.0.2.1:443 FINGERPRINT cert=... iat-mode=0"
        line: String,
    },
    /// Remove every custom bridge line
    Clear,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data_dir: cli.data_dir,
    };
    let (settings, config) = load_settings_with_options(options).await;

    match cli.command {
        Commands::Connect(args) => connect::cmd_connect(&settings, args).await,
        Commands::Transport { command } => match command.unwrap_or(TransportCommands::Show) {
            TransportCommands::Show => transport::cmd_transport_show(&settings),
            TransportCommands::Set { transport } => {
                transport::cmd_transport_set(&settings, transport)
            }
        },
        Commands::Bridges { command } => match command.unwrap_or(BridgeCommands::List) {
            BridgeCommands::List => bridges::cmd_bridges_list(&settings),
            BridgeCommands::Add { line } => bridges::cmd_bridges_add(&settings, &line),
            BridgeCommands::Clear => bridges::cmd_bridges_clear(&settings),
        },
        Commands::Config => config_cmd::cmd_config_show(&settings, &config),
    }
}
