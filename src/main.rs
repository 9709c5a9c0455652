//! modelrelay — a model-aware HTTP reverse proxy in front of a fleet of
//! local OpenAI-dialect inference subprocesses.
//!
//! Walking `$XDG_CONFIG_HOME`, parsing `argv`, and generating a config
//! template are external collaborators' jobs (spec.md §1 Non-goals); this
//! binary's only integration point is reading a single JSON document named
//! by `MODELRELAY_CONFIG` (or, absent that, an empty default configuration
//! with no models — the server still answers `/health` and admin routes).

mod admin;
mod config;
mod error;
mod group;
mod handlers;
mod logmon;
mod manager;
mod metrics;
#[cfg(feature = "peer-proxy")]
mod peer;
mod process;
mod resolver;
mod server;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use manager::ProxyManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_ENV_VAR: &str = "MODELRELAY_CONFIG";
const LISTEN_ADDR_ENV_VAR: &str = "MODELRELAY_LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

fn load_config() -> anyhow::Result<config::Config> {
    let file = match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {path} as JSON"))?
        }
        Err(_) => config::file::FileConfig::default(),
    };
    config::Config::try_from_file(file).context("validating configuration")
}

fn init_tracing(log_level: &str) {
    let default_filter = format!("modelrelay={log_level},tower=info,axum=info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.log_level);

    let addr: SocketAddr = std::env::var(LISTEN_ADDR_ENV_VAR)
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .context("parsing listen address")?;

    tracing::info!(
        models = config.models.len(),
        groups = config.groups.len(),
        %addr,
        "starting modelrelay"
    );

    let manager = Arc::new(ProxyManager::new(config));

    server::start(manager, addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
