//! WhatsApp CRM gateway - backend for a CRM dashboard that talks to WhatsApp
//! through self-hosted Evolution API servers and the Meta Cloud API.
//!
//! Evolution endpoints differ between releases, so every read goes through a
//! versioned endpoint catalog with linear fallback. Media URLs from WhatsApp
//! are encrypted or short-lived; they are re-hosted on Cloudinary when it is
//! configured and proxied through this server otherwise.

mod cli;
mod config;
mod credentials;
mod error;
mod evolution;
mod media;
mod meta;
mod storage;
mod web;
mod webhook;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Args;
use config::Config;
use storage::CrmStore;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    init_logging(args.verbose);

    let config = Config::from_args(&args)?;
    info!("Using data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;
    let store = CrmStore::new(&config.data_dir).context("Failed to open CRM store")?;

    match &config.evolution {
        Some(evolution) => info!(
            "Default Evolution instance '{}' at {} (version: {})",
            evolution.instance_id,
            evolution.api_url,
            evolution
                .api_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "auto".to_string())
        ),
        None => warn!("No default Evolution API configured; users need a server assignment"),
    }
    if !args.cloudinary_enabled() {
        info!("Cloudinary not configured, media will be served through the proxy");
    }
    if config.meta.is_none() {
        info!("Meta Cloud API not configured");
    }

    let state = AppState::new(&config, store)?;
    web::start_server(state, &config.host, config.port).await
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
