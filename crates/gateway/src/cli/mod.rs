//! Command-line interface.

pub mod chat;
pub mod init;

use clap::{Parser, Subcommand};

use pa_domain::config::Config;
use pa_domain::Result;

/// personal-agent — a single-node agent runtime.
#[derive(Debug, Parser)]
#[command(name = "agent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Interactive chat against a running server.
    Chat {
        /// Channel to open or resume (defaults to a fresh CLI channel).
        #[arg(long)]
        channel: Option<String>,
    },
    /// Check the server's health endpoint.
    Status,
    /// Write a template agent.yaml in the current directory.
    Init {
        /// Overwrite an existing agent.yaml.
        #[arg(long)]
        force: bool,
    },
}

/// Load configuration from `PA_CONFIG_PATH` (default `agent.yaml`).
/// Shared by every subcommand so the logic lives in one place.
pub fn load_config() -> Result<(Config, String)> {
    Config::load_from_env()
}

/// Base URL of the local server for client-side commands.
pub fn server_base_url(config: &Config) -> String {
    format!("http://{}:{}", config.server.host, config.server.port)
}

/// `agent status` — GET /health and print the response.
pub async fn status(config: &Config) -> anyhow::Result<()> {
    let url = format!("{}/health", server_base_url(config));
    let body = reqwest::get(&url).await?.text().await?;
    println!("{body}");
    Ok(())
}
