//! Key-sharded exclusive gate with timeout-bounded acquisition.
//!
//! A [`CoalescingGate`] is a fixed array of single-permit shards. A key maps
//! to one shard by hash, so callers working on unrelated keys rarely contend
//! while callers on the same key always do. With one shard the gate is a
//! single global lock.
//!
//! Ownership is scoped: a [`GatePermit`] releases its shard when dropped,
//! whether the holder returns normally, propagates an error, or panics.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, SemaphorePermit, futures::Notified};
use tracing::debug;

/// Reasons a gate operation did not complete.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The shard stayed held for the whole acquisition window.
    #[error("gate not acquired within {0:?}")]
    Timeout(Duration),

    /// The gate was closed while the caller was waiting on it.
    #[error("wait on gate was interrupted")]
    Interrupted,
}

struct Shard {
    permits: Semaphore,
    released: Notify,
}

/// A set of exclusive locks indexed by key hash.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
/// use std::time::Duration;
/// use dogpile::gate::{CoalescingGate, GateError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let gate = CoalescingGate::new(NonZeroUsize::new(1).unwrap());
///
/// let permit = gate.try_acquire(&42_i64, Duration::from_millis(1)).await.unwrap();
/// assert!(matches!(
///     gate.try_acquire(&42_i64, Duration::from_millis(1)).await,
///     Err(GateError::Timeout(_))
/// ));
///
/// permit.release();
/// assert!(gate.try_acquire(&42_i64, Duration::from_millis(1)).await.is_ok());
/// # }
/// ```
pub struct CoalescingGate {
    shards: Box<[Shard]>,
}

impl CoalescingGate {
    /// Creates a gate with `shards` independent locks.
    pub fn new(shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| Shard {
                permits: Semaphore::new(1),
                released: Notify::new(),
            })
            .collect();
        Self { shards }
    }

    /// Returns the number of independent locks.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the shard index `key` maps to.
    pub fn shard_index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard<K: Hash + ?Sized>(&self, key: &K) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Attempts to take exclusive ownership of `key`'s shard, waiting at most
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// - [`GateError::Timeout`] if another holder kept the shard for the whole window.
    /// - [`GateError::Interrupted`] if the gate is or becomes closed.
    pub async fn try_acquire<K: Hash + ?Sized>(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<GatePermit<'_>, GateError> {
        let shard = self.shard(key);

        match tokio::time::timeout(timeout, shard.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(GatePermit {
                permit: Some(permit),
                released: &shard.released,
            }),
            Ok(Err(_closed)) => Err(GateError::Interrupted),
            Err(_elapsed) => Err(GateError::Timeout(timeout)),
        }
    }

    /// Registers interest in the next release of `key`'s shard.
    ///
    /// The returned watch is armed immediately, so a release that happens
    /// after this call and before [`ReleaseWatch::wait`] is not missed.
    pub fn watch_release<K: Hash + ?Sized>(&self, key: &K) -> ReleaseWatch<'_> {
        let shard = self.shard(key);
        let mut notified = Box::pin(shard.released.notified());
        notified.as_mut().enable();
        ReleaseWatch {
            notified,
            permits: &shard.permits,
        }
    }

    /// Waits until the holder of `key`'s shard releases it, or `max_wait`
    /// elapses, whichever comes first.
    ///
    /// Returning `Ok` says nothing about what the holder did; callers re-check
    /// whatever state they are waiting on.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Interrupted`] if the gate is or becomes closed.
    pub async fn wait_for_release<K: Hash + ?Sized>(
        &self,
        key: &K,
        max_wait: Duration,
    ) -> Result<(), GateError> {
        self.watch_release(key).wait(max_wait).await
    }

    /// Closes every shard. Pending and future acquisitions and waits fail
    /// with [`GateError::Interrupted`]; existing permits stay valid until dropped.
    pub fn close(&self) {
        debug!(shards = self.shards.len(), "closing gate");
        for shard in self.shards.iter() {
            shard.permits.close();
            shard.released.notify_waiters();
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shards.iter().all(|shard| shard.permits.is_closed())
    }
}

/// An armed wait for the next release of one gate shard.
///
/// Created by [`CoalescingGate::watch_release`].
#[must_use = "a watch does nothing unless waited on"]
pub struct ReleaseWatch<'a> {
    notified: Pin<Box<Notified<'a>>>,
    permits: &'a Semaphore,
}

impl ReleaseWatch<'_> {
    /// Waits for the release this watch was armed for, at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Interrupted`] if the gate is or becomes closed.
    pub async fn wait(mut self, max_wait: Duration) -> Result<(), GateError> {
        if self.permits.is_closed() {
            return Err(GateError::Interrupted);
        }

        let _ = tokio::time::timeout(max_wait, self.notified.as_mut()).await;

        if self.permits.is_closed() {
            Err(GateError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Exclusive ownership of one gate shard.
///
/// Dropping the permit releases the shard and wakes every armed
/// [`ReleaseWatch`] on it.
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct GatePermit<'a> {
    permit: Option<SemaphorePermit<'a>>,
    released: &'a Notify,
}

impl GatePermit<'_> {
    /// Releases the shard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}
