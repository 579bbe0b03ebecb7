//! Operator CLI for the CRI resource manager
//!
//! Pushes configuration and adjustments to a running instance, resets
//! cached state of a stopped one and reports daemon health.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, push, reset};
use std::path::PathBuf;

/// CRI resource manager CLI
#[derive(Parser)]
#[command(name = "resmgr-ctl")]
#[command(author, version, about = "Control the CRI resource manager", long_about = None)]
pub struct Cli {
    /// Configuration endpoint URL
    #[arg(long, env = "RESMGR_CONFIG_URL")]
    pub config_url: Option<String>,

    /// Health and metrics endpoint URL
    #[arg(long, env = "RESMGR_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push configuration to a running resource manager
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Push adjustments to a running resource manager
    #[command(subcommand)]
    Adjustment(AdjustmentCommands),

    /// Reset cached state; refused while the resource manager runs
    Reset {
        /// What to reset
        #[arg(value_enum)]
        target: reset::ResetTarget,

        /// Relay socket of the resource manager
        #[arg(long, env = "RESMGR_RELAY_SOCKET")]
        relay_socket: Option<PathBuf>,

        /// Cache directory of the resource manager
        #[arg(long, env = "RESMGR_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },

    /// Show daemon health and readiness
    Health,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Push a YAML or JSON configuration file
    Push {
        /// Configuration file
        file: PathBuf,

        /// Node the configuration is meant for
        #[arg(long, env = "NODE_NAME")]
        node: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AdjustmentCommands {
    /// Push a YAML or JSON adjustment file
    Push {
        /// Adjustment file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;

    let ok = match cli.command {
        Commands::Config(ConfigCommands::Push { file, node }) => {
            let client = client::ApiClient::new(&settings.config_url(cli.config_url))?;
            push::push_config(&client, &file, &settings.node_name(node), cli.format).await?
        }
        Commands::Adjustment(AdjustmentCommands::Push { file }) => {
            let client = client::ApiClient::new(&settings.config_url(cli.config_url))?;
            push::push_adjustment(&client, &file, cli.format).await?
        }
        Commands::Reset {
            target,
            relay_socket,
            cache_dir,
        } => {
            let code = reset::reset(
                target,
                settings.relay_socket(relay_socket),
                settings.cache_dir(cache_dir),
            )
            .await;
            std::process::exit(code);
        }
        Commands::Health => {
            let client = client::ApiClient::new(&settings.api_url(cli.api_url))?;
            health::show_health(&client, cli.format).await?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
