//! Per-worker in-flight limiter.
//!
//! A [`Limiter`] caps how many receive→action→acknowledge pipelines one worker
//! has outstanding at once. It does not limit message rate. Each receive
//! attempt takes one [`Permit`]; the permit goes back when the pipeline
//! completes, successfully or not.

use sluice_core::config::UNBOUNDED_RECEIVE_LIMIT;
use sluice_core::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limiter capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// No cap
    Unbounded,
    /// At most this many outstanding permits
    Bounded(usize),
}

impl Limit {
    /// Interpret a configured receive limit, `-1` meaning unbounded.
    ///
    /// # Errors
    /// Returns a configuration error for zero or any other negative value.
    pub fn from_receive_limit(limit: i64) -> Result<Self> {
        if limit == UNBOUNDED_RECEIVE_LIMIT {
            return Ok(Self::Unbounded);
        }
        usize::try_from(limit)
            .ok()
            .filter(|n| *n > 0)
            .map(Self::Bounded)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "receive limit must be -1 or a positive integer, got {limit}"
                ))
            })
    }
}

#[derive(Debug, Default)]
struct Counters {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting limiter owned by one worker.
#[derive(Debug)]
pub struct Limiter {
    limit: Limit,
    semaphore: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

impl Limiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(limit: Limit) -> Self {
        let semaphore = match limit {
            Limit::Unbounded => None,
            Limit::Bounded(n) => Some(Arc::new(Semaphore::new(n))),
        };
        Self { limit, semaphore, counters: Arc::default() }
    }

    /// Configured capacity.
    #[must_use]
    pub const fn limit(&self) -> Limit {
        self.limit
    }

    /// Wait for a permit. Returns immediately when unbounded.
    ///
    /// # Errors
    /// Returns an internal error once the limiter is closed.
    pub async fn acquire(&self) -> Result<Permit> {
        let inner = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::internal("limiter is closed"))?,
            ),
            None => None,
        };

        let outstanding = self.counters.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(outstanding, Ordering::AcqRel);
        Ok(Permit { _inner: inner, counters: Arc::clone(&self.counters) })
    }

    /// Permits acquired and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    /// Highest outstanding count observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    /// Fail pending and future acquires. Outstanding permits stay valid.
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }
}

/// One outstanding pipeline. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    _inner: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Permit {
    /// Release explicitly.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_from_receive_limit() {
        assert_eq!(Limit::from_receive_limit(-1).unwrap(), Limit::Unbounded);
        assert_eq!(Limit::from_receive_limit(8).unwrap(), Limit::Bounded(8));
        assert!(Limit::from_receive_limit(0).is_err());
        assert!(Limit::from_receive_limit(-5).is_err());
    }

    #[tokio::test]
    async fn test_unbounded_never_blocks() {
        let limiter = Limiter::new(Limit::Unbounded);
        let permits: Vec<_> =
            futures::future::try_join_all((0..1000).map(|_| limiter.acquire())).await.unwrap();
        assert_eq!(limiter.outstanding(), 1000);
        drop(permits);
        assert_eq!(limiter.outstanding(), 0);
        assert_eq!(limiter.peak(), 1000);
    }

    #[tokio::test]
    async fn test_bounded_blocks_at_capacity() {
        let limiter = Limiter::new(Limit::Bounded(2));
        let first = limiter.acquire().await.unwrap();
        let _second = limiter.acquire().await.unwrap();

        let mut blocked = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(blocked.poll());

        first.release();
        assert!(blocked.is_woken());
        let third = tokio_test::assert_ready_ok!(blocked.poll());
        assert_eq!(limiter.outstanding(), 2);
        drop(third);
        assert_eq!(limiter.peak(), 2);
    }

    #[tokio::test]
    async fn test_bounded_never_exceeds_capacity_under_contention() {
        let limiter = Arc::new(Limiter::new(Limit::Bounded(3)));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let permit = limiter.acquire().await.unwrap();
                    assert!(limiter.outstanding() <= 3);
                    tokio::task::yield_now().await;
                    drop(permit);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(limiter.peak() <= 3);
        assert_eq!(limiter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_acquire() {
        let limiter = Limiter::new(Limit::Bounded(1));
        let held = limiter.acquire().await.unwrap();
        limiter.close();
        assert!(limiter.acquire().await.is_err());
        drop(held);
        assert_eq!(limiter.outstanding(), 0);
    }
}
