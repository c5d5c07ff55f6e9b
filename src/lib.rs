//! # dogpile
//!
//! Cache-stampede protection for expensive lookups.
//!
//! When many tasks miss the cache for the same key at once, only the one
//! that wins a short, timeout-bounded gate runs the lookup. The rest wait a
//! bounded number of bounded intervals for its write, and only act on their
//! own if that window runs out.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dogpile::{BackingStoreError, MissCoordinator, Server, StampedeConfig, api};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StampedeConfig::default();
//!     let coordinator = Arc::new(MissCoordinator::from_config(&config, |_id: i64| async {
//!         // Query the database here.
//!         Ok::<_, BackingStoreError>(())
//!     })?);
//!
//!     let server = Server::bind(&config.server.bind).await?;
//!     server
//!         .run(move |req| {
//!             let coordinator = Arc::clone(&coordinator);
//!             async move { api::handle(&coordinator, req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

// ── Protocol ──────────────────────────────────────────────────────────────────
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod gate;

// ── HTTP front ────────────────────────────────────────────────────────────────
pub mod api;
pub mod http;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheStats, Clock, ManualClock, SystemClock, TtlCache};
pub use config::{ConfigError, StampedeConfig};
pub use coordinator::{
    BackingStoreError, CoordinatorStats, Lookup, MissCoordinator, Outcome, ResolveError,
};
pub use gate::{CoalescingGate, GateError, GatePermit, ReleaseWatch};
pub use server::{Server, ServerError};
