//! Background tasks.
//!
//! # Responsibilities
//! - Apply breaker events and cache invalidations from other instances
//! - Periodically reclaim expired local cache entries and shared-store keys

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::gateway::Gateway;
use crate::store::{StoreMessage, BREAKER_CHANNEL, CACHE_CHANNEL};

/// Route one bus message to the component that owns its channel.
pub fn dispatch(gateway: &Gateway, message: &StoreMessage) {
    match message.channel.as_str() {
        BREAKER_CHANNEL => gateway.breaker().handle_message(&message.payload),
        CACHE_CHANNEL => gateway.cache().handle_message(&message.payload),
        other => tracing::trace!(channel = %other, "Ignoring message on unknown channel"),
    }
}

/// Follow the store bus until shutdown.
pub fn spawn_event_listener(
    gateway: Arc<Gateway>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut bus = gateway.store().subscribe();
    tokio::spawn(async move {
        tracing::info!("Event listener starting");
        loop {
            tokio::select! {
                received = bus.recv() => match received {
                    Ok(message) => dispatch(&gateway, &message),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event listener lagged; local views may be stale");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Store bus closed");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Event listener received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}

/// Reclaim expired local cache entries and expired shared-store keys
/// (old quota windows, stale cache entries). Returns the total removed.
pub async fn sweep_expired(gateway: &Gateway) -> usize {
    let local = gateway.cache().sweep_expired();
    let shared = match gateway.store().purge_expired().await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to purge expired store keys");
            0
        }
    };
    if shared > 0 {
        tracing::debug!(removed = shared, "Purged expired store keys");
    }
    local + shared
}

/// Run `sweep_expired` every `interval` until shutdown.
pub fn spawn_expiry_sweeper(
    gateway: Arc<Gateway>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Expiry sweeper starting");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_expired(&gateway).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Expiry sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}
