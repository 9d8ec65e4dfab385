mod auth;
mod config;
mod error;
mod piwik_client;
mod service;
mod types;
mod validation;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{ClientConfig, Credentials};
use crate::piwik_client::PiwikClient;
use crate::service::PiwikService;

#[derive(Parser, Debug)]
#[command(
    name = "mcp-piwik-pro",
    about = "MCP server for the Piwik PRO Analytics Suite API",
    long_about = "MCP server exposing Piwik PRO websites, analytics queries and annotations as tools.\n\n\
                  Authenticates with an API client (client credentials) created in\n\
                  Piwik PRO under Menu > Profile > API credentials.",
    version
)]
struct Args {
    /// Piwik PRO API client ID
    #[arg(long, env = "PIWIK_CLIENT_ID")]
    client_id: String,

    /// Piwik PRO API client secret
    #[arg(long, env = "PIWIK_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Account domain (e.g., acme.piwik.pro); https is assumed when no scheme is given
    #[arg(short, long, env = "PIWIK_DOMAIN")]
    domain: String,

    /// Timeout in seconds for each request to Piwik PRO
    #[arg(
        long,
        env = "PIWIK_TIMEOUT_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr (NEVER stdout for stdio transport!)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    info!("Starting MCP Piwik PRO server");

    let credentials = Credentials::new(args.client_id, args.client_secret, args.domain);
    debug!("Using credentials: {:?}", credentials);

    let config = ClientConfig::new(credentials, Duration::from_secs(args.timeout_secs))
        .context("Invalid Piwik PRO configuration")?;
    info!("Base URL: {}", config.base_url);

    let client = PiwikClient::new(config).context("Failed to create Piwik PRO client")?;
    let service = PiwikService::new(client);

    // Start the stdio transport
    info!("Starting stdio transport...");
    let server = service
        .serve(stdio())
        .await
        .context("Failed to start MCP server")?;

    // Wait for the server to complete
    server.waiting().await?;

    info!("MCP server stopped");
    Ok(())
}
