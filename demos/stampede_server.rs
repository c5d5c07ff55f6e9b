//! Serves the resolve endpoint over a simulated slow backing store.
//!
//! ```text
//! cargo run --example stampede_server -- [config.json]
//! curl 'http://127.0.0.1:8080/open_api/data/cache_through_test?id=42'
//! ```
//!
//! Fire a burst of concurrent requests at one id and watch the logs: one
//! `lookup` line, the rest resolved from the cache or the fallback window.

use std::sync::Arc;
use std::time::Duration;

use dogpile::{BackingStoreError, MissCoordinator, Server, StampedeConfig, api};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stand-in for a database round trip.
const LOOKUP_LATENCY: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dogpile=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StampedeConfig::from_path(path)?,
        None => StampedeConfig::default(),
    };

    let coordinator = Arc::new(MissCoordinator::from_config(&config, |id: i64| async move {
        info!(id, "lookup");
        tokio::time::sleep(LOOKUP_LATENCY).await;
        if id < 0 {
            return Err(BackingStoreError::new(format!("no row for id {id}")));
        }
        Ok(())
    })?);

    let server = Server::bind(&config.server.bind).await?;
    info!(address = %server.local_addr(), "try GET /open_api/data/cache_through_test?id=42");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let handler_coordinator = Arc::clone(&coordinator);
    server
        .run_until(
            move |req| {
                let coordinator = Arc::clone(&handler_coordinator);
                async move { api::handle(&coordinator, req).await }
            },
            shutdown,
        )
        .await?;

    coordinator.gate().close();
    info!(stats = ?coordinator.stats(), cache = ?coordinator.cache().stats(), "stopped");
    Ok(())
}
