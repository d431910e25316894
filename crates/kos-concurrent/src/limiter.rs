use kos_core::{KosError, LimiterSettings, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acquired_total: AtomicU64,
    rejected_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub available: usize,
    pub peak_in_flight: usize,
    pub acquired_total: u64,
    pub rejected_total: u64,
}

/// Bounds in-flight calls to a downstream service and sheds load past a wait timeout.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
    counters: Arc<Counters>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, default_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_settings(settings: &LimiterSettings) -> Self {
        Self::new(
            settings.effective_max_concurrent(),
            settings.acquire_timeout(),
        )
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Waits up to `timeout` for a slot. `None` means no permit is held.
    pub async fn acquire_slot(&self, timeout: Duration) -> Option<SlotGuard> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => {
                let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                self.counters.acquired_total.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .peak_in_flight
                    .fetch_max(now, Ordering::Relaxed);
                debug!(in_flight = now, "concurrency slot acquired");
                Some(SlotGuard {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                })
            }
            Ok(Err(_closed)) => {
                warn!("concurrency limiter is closed");
                self.counters.rejected_total.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(_elapsed) => {
                self.counters.rejected_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "no concurrency slot within {:?} ({} in flight)",
                    timeout,
                    self.in_flight()
                );
                None
            }
        }
    }

    /// Non-waiting variant of [`acquire_slot`](Self::acquire_slot).
    pub fn try_acquire_slot(&self) -> Option<SlotGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.acquired_total.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_in_flight
            .fetch_max(now, Ordering::Relaxed);
        Some(SlotGuard {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Runs `fut` while holding a slot; the slot is released on every exit path.
    pub async fn run<F, T>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire_slot(timeout).await.ok_or_else(|| {
            KosError::Overloaded(format!(
                "all {} slots busy for {:?}",
                self.max_concurrent, timeout
            ))
        })?;
        Ok(fut.await)
    }

    /// [`run`](Self::run) with the configured wait timeout.
    pub async fn run_default<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.run(self.default_timeout, fut).await
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            max_concurrent: self.max_concurrent,
            in_flight: self.in_flight(),
            available: self.available(),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::Relaxed),
            acquired_total: self.counters.acquired_total.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::from_settings(&LimiterSettings::default())
    }
}

/// A held concurrency slot. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
