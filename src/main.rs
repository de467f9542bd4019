//! crypto-relay
//!
//! Hosts the resilience gateway: shared store, background event listener,
//! cache sweeper and the admin API.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                     CRYPTO RELAY                      │
//!                    │                                                       │
//!   caller ─────────▶│  ┌────────┐   ┌─────────┐   ┌───────┐   ┌──────────┐  │
//!                    │  │ cache  │──▶│ breaker │──▶│ quota │──▶│   pool   │──┼──▶ upstream
//!   caller ◀─────────│  └────────┘   └─────────┘   └───────┘   └──────────┘  │    (coingecko,
//!                    │       │             │            │                    │     llm, ...)
//!                    │       └─────────────┴────────────┘                    │
//!                    │                     │                                 │
//!                    │              ┌──────────────┐     ┌───────────────┐   │
//!                    │              │ shared store │────▶│ event listener│   │
//!                    │              │  + pub/sub   │     └───────────────┘   │
//!                    │              └──────────────┘                         │
//!                    │  admin API ── observability ── lifecycle              │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use crypto_relay::admin::{self, AdminState};
use crypto_relay::clock::{Clock, SystemClock};
use crypto_relay::config::{load_config, RelayConfig};
use crypto_relay::gateway::{Gateway, HttpUpstream};
use crypto_relay::lifecycle::{signals, tasks, Shutdown};
use crypto_relay::observability::{logging, metrics};
use crypto_relay::store::MemoryStore;

const DEFAULT_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

#[derive(Parser)]
#[command(name = "crypto-relay", version, about = "Resilience gateway for market and LLM APIs")]
struct Args {
    /// Path to a TOML config file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!("crypto-relay v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        services = config.services.len(),
        failure_threshold = config.breaker.failure_threshold,
        pool_limit = config.pool.limit,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let upstream = Arc::new(HttpUpstream::from_env(&config.services));
    let gateway = Arc::new(Gateway::from_config(&config, store, clock, upstream)?);

    let shutdown = Shutdown::new();
    let mut background = vec![
        tasks::spawn_event_listener(gateway.clone(), shutdown.subscribe()),
        tasks::spawn_expiry_sweeper(
            gateway.clone(),
            Duration::from_secs(config.cache.sweep_interval_secs),
            shutdown.subscribe(),
        ),
    ];

    if config.admin.enabled {
        if config.admin.api_key == DEFAULT_ADMIN_KEY {
            tracing::warn!("Admin API is using the default key; set admin.api_key");
        }
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(gateway.clone(), &config.admin.api_key);
        let admin_shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, admin_shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    signals::wait_for_shutdown_signal().await;
    tracing::info!("Shutting down");
    shutdown.trigger();

    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
