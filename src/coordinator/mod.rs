//! Miss coordination: decides which caller runs the expensive lookup.
//!
//! [`MissCoordinator::resolve`] walks a small state machine per request:
//!
//! ```text
//! CHECK ──hit──────────────────────────────────────────────▶ DONE (CacheHit)
//!   │ miss
//!   ▼
//! ACQUIRE ──permit──▶ FAST_PATH ──re-check hit──▶ DONE (Coalesced)
//!   │                     └──lookup, write──────▶ DONE (Fetched)
//!   │ timeout / interrupted
//!   ▼
//! FALLBACK ──hit within retries──▶ DONE (FallbackHit)
//!   └──window exhausted: lookup, write──▶ DONE (FallbackFetched)
//! ```
//!
//! Only one caller per gate shard is ever in `FAST_PATH`. Callers that miss
//! the gate wait a bounded number of bounded intervals for the holder's
//! write to show up, then do the lookup themselves. Duplicate lookups on that
//! last step are accepted in exchange for never waiting without bound.
//!
//! A failed lookup never writes the cache, so a transient backing-store
//! error cannot leave a false "done" marker behind.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Clock, SystemClock, TtlCache};
use crate::config::{ConfigError, StampedeConfig};
use crate::gate::{CoalescingGate, GateError};

/// Error reported by a [`Lookup`] implementation.
#[derive(Debug, Error)]
#[error("backing store lookup failed: {source}")]
pub struct BackingStoreError {
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl BackingStoreError {
    /// Wraps any error (or message) raised by the backing store.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Errors returned by [`MissCoordinator::resolve`].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup for key {key} failed")]
    BackingStore {
        key: i64,
        #[source]
        source: BackingStoreError,
    },
}

/// The expensive operation run on a cache miss.
///
/// Implemented for any `Fn(i64) -> impl Future<Output = Result<(), BackingStoreError>>`,
/// so an async closure is usually all a caller needs:
///
/// ```
/// use dogpile::coordinator::{BackingStoreError, Lookup};
///
/// fn assert_lookup<L: Lookup>(_: &L) {}
///
/// let lookup = |key: i64| async move {
///     if key < 0 {
///         return Err(BackingStoreError::new("negative ids are not stored"));
///     }
///     Ok(())
/// };
/// assert_lookup(&lookup);
/// ```
pub trait Lookup: Send + Sync + 'static {
    /// Performs the lookup for `key`.
    fn lookup(&self, key: i64) -> impl Future<Output = Result<(), BackingStoreError>> + Send;
}

impl<F, Fut> Lookup for F
where
    F: Fn(i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BackingStoreError>> + Send,
{
    fn lookup(&self, key: i64) -> impl Future<Output = Result<(), BackingStoreError>> + Send {
        self(key)
    }
}

/// How a successful [`MissCoordinator::resolve`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "path")]
pub enum Outcome {
    /// The first cache check hit.
    CacheHit,
    /// The caller won the gate but another caller had already written the key.
    Coalesced,
    /// The caller won the gate and ran the lookup.
    Fetched,
    /// The caller lost the gate and saw the key appear during its retry window.
    /// `attempt` counts the waits that ended before the successful check.
    FallbackHit { attempt: u32 },
    /// The caller lost the gate, its retry window ran out, and it ran the lookup itself.
    FallbackFetched,
}

impl Outcome {
    /// Returns `true` if this call ran the lookup.
    pub fn fetched(self) -> bool {
        matches!(self, Self::Fetched | Self::FallbackFetched)
    }
}

/// Counters describing how requests have been resolved so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Calls answered by the first cache check.
    pub cache_hits: u64,
    /// Calls that won the gate and found the key already written.
    pub coalesced: u64,
    /// Successful lookups run by the gate holder.
    pub fetched: u64,
    /// Calls that lost the gate and saw the key written in time.
    pub fallback_hits: u64,
    /// Successful lookups run after the retry window ran out.
    pub fallback_fetched: u64,
    /// Lookups that returned an error.
    pub lookup_failures: u64,
    /// Gate acquisitions or fallback waits cut short by a closed gate.
    pub interrupted_waits: u64,
}

impl CoordinatorStats {
    /// Total lookups started, successful or not.
    pub fn lookups(&self) -> u64 {
        self.fetched + self.fallback_fetched + self.lookup_failures
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    fetched: AtomicU64,
    fallback_hits: AtomicU64,
    fallback_fetched: AtomicU64,
    lookup_failures: AtomicU64,
    interrupted_waits: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::CacheHit => &self.cache_hits,
            Outcome::Coalesced => &self.coalesced,
            Outcome::Fetched => &self.fetched,
            Outcome::FallbackHit { .. } => &self.fallback_hits,
            Outcome::FallbackFetched => &self.fallback_fetched,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            fallback_fetched: self.fallback_fetched.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            interrupted_waits: self.interrupted_waits.load(Ordering::Relaxed),
        }
    }
}

/// Coordinates cache misses so concurrent callers share one lookup where possible.
///
/// Create one per process and share it behind an [`Arc`].
///
/// # Examples
///
/// ```
/// use dogpile::config::StampedeConfig;
/// use dogpile::coordinator::{BackingStoreError, MissCoordinator, Outcome};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let coordinator = MissCoordinator::from_config(&StampedeConfig::default(), |_key: i64| async {
///     Ok::<_, BackingStoreError>(())
/// })?;
///
/// assert_eq!(coordinator.resolve(42).await?, Outcome::Fetched);
/// assert_eq!(coordinator.resolve(42).await?, Outcome::CacheHit);
/// # Ok(())
/// # }
/// ```
pub struct MissCoordinator<L> {
    cache: TtlCache<i64, bool>,
    gate: CoalescingGate,
    lookup: L,
    gate_timeout: Duration,
    fallback_retries: u32,
    fallback_delay: Duration,
    counters: Counters,
}

impl<L: Lookup> MissCoordinator<L> {
    /// Builds a coordinator from configuration, reading time from [`SystemClock`].
    pub fn from_config(config: &StampedeConfig, lookup: L) -> Result<Self, ConfigError> {
        Self::with_clock(config, lookup, Arc::new(SystemClock))
    }

    /// Builds a coordinator whose cache reads time from `clock`.
    pub fn with_clock(
        config: &StampedeConfig,
        lookup: L,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = TtlCache::with_clock(config.cache.capacity()?, config.cache.ttl(), clock);
        let gate = CoalescingGate::new(config.gate.shards()?);

        Ok(Self {
            cache,
            gate,
            lookup,
            gate_timeout: config.gate.timeout(),
            fallback_retries: config.fallback.retries,
            fallback_delay: config.fallback.delay(),
            counters: Counters::default(),
        })
    }

    /// Ensures a lookup for `key` has completed, running it at most once
    /// under low contention.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::BackingStore`] if this caller ran the lookup
    /// and it failed. Nothing is written to the cache in that case.
    pub async fn resolve(&self, key: i64) -> Result<Outcome, ResolveError> {
        let outcome = self.run(key).await;
        if let Ok(resolved) = &outcome {
            self.counters.record(*resolved);
        }
        outcome
    }

    async fn run(&self, key: i64) -> Result<Outcome, ResolveError> {
        if self.cache.get(&key).is_some() {
            debug!(key, "cache hit");
            return Ok(Outcome::CacheHit);
        }

        match self.gate.try_acquire(&key, self.gate_timeout).await {
            Ok(permit) => {
                debug!(key, "acquired gate");

                // Another holder may have written the key between our first
                // check and the acquisition.
                if self.cache.get(&key).is_some() {
                    debug!(key, "key written while acquiring gate");
                    permit.release();
                    return Ok(Outcome::Coalesced);
                }

                self.fetch_and_store(key).await?;
                permit.release();
                debug!(key, "fast path write done");
                Ok(Outcome::Fetched)
            }
            Err(GateError::Timeout(_)) => {
                debug!(key, "gate busy, falling back");
                self.fallback(key).await
            }
            Err(GateError::Interrupted) => {
                warn!(key, "gate acquisition interrupted, falling back");
                self.counters.interrupted_waits.fetch_add(1, Ordering::Relaxed);
                self.fallback(key).await
            }
        }
    }

    async fn fallback(&self, key: i64) -> Result<Outcome, ResolveError> {
        let mut attempt = 0;
        while attempt < self.fallback_retries {
            // Armed before the check so a release right after it still wakes us.
            let released = self.gate.watch_release(&key);
            if self.cache.get(&key).is_some() {
                debug!(key, attempt, "key written during fallback wait");
                return Ok(Outcome::FallbackHit { attempt });
            }

            let waited = released.wait(self.fallback_delay).await;
            attempt += 1;
            if let Err(GateError::Interrupted) = waited {
                warn!(key, attempt, "fallback wait interrupted");
                self.counters.interrupted_waits.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        if self.cache.get(&key).is_some() {
            debug!(key, attempt, "key written during fallback wait");
            return Ok(Outcome::FallbackHit { attempt });
        }

        self.fetch_and_store(key).await?;
        debug!(key, "fallback write done");
        Ok(Outcome::FallbackFetched)
    }

    async fn fetch_and_store(&self, key: i64) -> Result<(), ResolveError> {
        if let Err(source) = self.lookup.lookup(key).await {
            warn!(key, error = %source, "lookup failed, cache left untouched");
            self.counters.lookup_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ResolveError::BackingStore { key, source });
        }
        self.cache.put(key, true);
        Ok(())
    }

    /// Returns the marker cache.
    pub fn cache(&self) -> &TtlCache<i64, bool> {
        &self.cache
    }

    /// Returns the gate guarding the fast path.
    pub fn gate(&self) -> &CoalescingGate {
        &self.gate
    }

    /// Returns a snapshot of the resolution counters.
    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }
}
