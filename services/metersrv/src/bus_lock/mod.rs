//! Cross-process bus arbitration
//!
//! Several acquisition processes can share one RS-485 line. Only one of them
//! may talk on it at a time, so every cycle takes a [`BusGuard`] from a
//! [`BusLock`] before touching the transport and drops it right after the
//! last register read.
//!
//! Two interchangeable backends are available:
//! - [`SemaphoreBackend`]: a POSIX named semaphore shared host-wide (unix).
//! - [`MarkerBackend`]: presence marker files in a shared scratch directory.
//!   Exclusion is only probabilistic, see its docs.
//!
//! When a holder dies or hangs, waiters time out. With `reclaim_stale` set,
//! the timed-out waiter resets the backend and takes the bus anyway. This
//! favours availability: a holder that later resumes and releases a reset
//! lock can overlap with the new holder.

mod marker;
#[cfg(unix)]
mod semaphore;

pub use marker::{default_marker_dir, MarkerBackend};
#[cfg(unix)]
pub use semaphore::SemaphoreBackend;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{BusLockConfig, LockBackendKind};
use crate::error::BusLockError;

/// One host-wide lock implementation
///
/// All calls are non-blocking; [`BusLock`] does the waiting.
pub trait LockBackend: Send + Sync {
    /// Well-known name shared by cooperating processes
    fn name(&self) -> &str;

    /// Single attempt; `Ok(true)` when the caller now holds the bus
    fn try_acquire(&self, identity: &str) -> Result<bool, BusLockError>;

    /// Give the bus back
    fn release(&self, identity: &str) -> Result<(), BusLockError>;

    /// Reset the lock after the current holder stopped responding
    fn recover(&self, identity: &str) -> Result<(), BusLockError>;

    /// Withdraw from waiting after a timeout
    fn abandon(&self, _identity: &str) -> Result<(), BusLockError> {
        Ok(())
    }
}

/// Proof of exclusive bus ownership
///
/// Released exactly once, explicitly through [`BusGuard::release`] or on drop.
pub struct BusGuard {
    backend: Arc<dyn LockBackend>,
    identity: String,
    acquired_at: DateTime<Utc>,
    acquired_instant: Instant,
    recovered: bool,
    released: bool,
}

impl BusGuard {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// The bus was taken over from a stale holder
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_instant.elapsed()
    }

    /// Release the bus; later calls are no-ops
    pub fn release(&mut self) -> Result<(), BusLockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        debug!(
            "Bus '{}' released by {} after {:?}",
            self.backend.name(),
            self.identity,
            self.held_for()
        );
        self.backend.release(&self.identity)
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release bus '{}': {}", self.backend.name(), e);
        }
    }
}

impl std::fmt::Debug for BusGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusGuard")
            .field("lock", &self.backend.name())
            .field("identity", &self.identity)
            .field("acquired_at", &self.acquired_at)
            .field("recovered", &self.recovered)
            .field("released", &self.released)
            .finish()
    }
}

/// Bounded-wait bus lock over a backend
#[derive(Clone)]
pub struct BusLock {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
    reclaim_stale: bool,
}

impl BusLock {
    pub fn new(backend: Arc<dyn LockBackend>, poll_interval: Duration, reclaim_stale: bool) -> Self {
        Self {
            backend,
            poll_interval,
            reclaim_stale,
        }
    }

    /// Build the configured backend
    pub fn from_config(config: &BusLockConfig) -> Result<Self, BusLockError> {
        let backend: Arc<dyn LockBackend> = match config.backend {
            LockBackendKind::Marker => {
                Arc::new(MarkerBackend::new(config.marker_dir(), config.marker_prefix())?)
            },
            #[cfg(unix)]
            LockBackendKind::Semaphore => Arc::new(SemaphoreBackend::open(&config.name)?),
            #[cfg(not(unix))]
            LockBackendKind::Semaphore => {
                return Err(BusLockError::Unsupported(
                    "named semaphores need a unix host, use the marker backend".to_string(),
                ))
            },
        };
        Ok(Self::new(backend, config.poll_interval, config.reclaim_stale))
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Wait up to `timeout` for the bus
    ///
    /// On expiry with `reclaim_stale` the backend is reset and one final
    /// attempt is made; the resulting guard is flagged `recovered`.
    pub async fn acquire(&self, identity: &str, timeout: Duration) -> Result<BusGuard, BusLockError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.attempt(identity)? {
                return Ok(self.guard(identity, false));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let poll = self.poll_interval.min(deadline - now);
            tokio::time::sleep(poll).await;
        }

        if self.reclaim_stale {
            warn!(
                "Bus '{}' still held after {:?}, reclaiming from stale holder",
                self.backend.name(),
                timeout
            );
            self.backend.recover(identity)?;
            if self.attempt(identity)? {
                return Ok(self.guard(identity, true));
            }
        }

        if let Err(e) = self.backend.abandon(identity) {
            warn!("Failed to withdraw from bus '{}': {}", self.backend.name(), e);
        }
        Err(BusLockError::BusTimeout {
            name: self.backend.name().to_string(),
            waited: started.elapsed(),
        })
    }

    /// One non-blocking attempt
    ///
    /// A marker backend keeps its queue position after a miss, so a
    /// following [`acquire`](Self::acquire) continues the same wait.
    pub fn try_acquire(&self, identity: &str) -> Result<Option<BusGuard>, BusLockError> {
        Ok(self
            .attempt(identity)?
            .then(|| self.guard(identity, false)))
    }

    fn attempt(&self, identity: &str) -> Result<bool, BusLockError> {
        self.backend.try_acquire(identity).inspect_err(|_| {
            if let Err(e) = self.backend.abandon(identity) {
                warn!("Failed to withdraw from bus '{}': {}", self.backend.name(), e);
            }
        })
    }

    fn guard(&self, identity: &str, recovered: bool) -> BusGuard {
        debug!("Bus '{}' acquired by {}", self.backend.name(), identity);
        BusGuard {
            backend: Arc::clone(&self.backend),
            identity: identity.to_string(),
            acquired_at: Utc::now(),
            acquired_instant: Instant::now(),
            recovered,
            released: false,
        }
    }
}

impl std::fmt::Debug for BusLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusLock")
            .field("name", &self.backend.name())
            .field("poll_interval", &self.poll_interval)
            .field("reclaim_stale", &self.reclaim_stale)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    /// Single-slot in-process backend
    #[derive(Default)]
    struct SlotBackend {
        holder: Mutex<Option<String>>,
        releases: Mutex<Vec<String>>,
        recoveries: Mutex<usize>,
    }

    impl LockBackend for SlotBackend {
        fn name(&self) -> &str {
            "slot"
        }

        fn try_acquire(&self, identity: &str) -> Result<bool, BusLockError> {
            let mut holder = self.holder.lock();
            if holder.is_none() {
                *holder = Some(identity.to_string());
                return Ok(true);
            }
            Ok(false)
        }

        fn release(&self, identity: &str) -> Result<(), BusLockError> {
            self.releases.lock().push(identity.to_string());
            *self.holder.lock() = None;
            Ok(())
        }

        fn recover(&self, _identity: &str) -> Result<(), BusLockError> {
            *self.recoveries.lock() += 1;
            *self.holder.lock() = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(10), false);

        let mut guard = lock.acquire("a", Duration::from_millis(50)).await.unwrap();
        assert!(!guard.recovered());
        guard.release().unwrap();
        guard.release().unwrap();
        drop(guard);

        assert_eq!(*backend.releases.lock(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(10), false);

        {
            let _guard = lock.acquire("a", Duration::from_millis(50)).await.unwrap();
            assert_eq!(backend.holder.lock().as_deref(), Some("a"));
        }
        assert!(backend.holder.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reclaim() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(500), false);
        let _held = lock.acquire("a", Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let err = lock.acquire("b", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BusLockError::BusTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(*backend.recoveries.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_reclaimed_after_timeout() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(500), true);

        // holder "dies" without releasing
        std::mem::forget(lock.acquire("dead", Duration::from_secs(1)).await.unwrap());

        let started = Instant::now();
        let guard = lock.acquire("alive", Duration::from_secs(2)).await.unwrap();
        assert!(guard.recovered());
        assert_eq!(guard.identity(), "alive");
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(1));
        assert_eq!(*backend.recoveries.lock(), 1);
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_wait() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(10), false);

        let held = lock.try_acquire("a").unwrap().unwrap();
        assert!(lock.try_acquire("b").unwrap().is_none());
        drop(held);
        assert_eq!(lock.try_acquire("b").unwrap().unwrap().identity(), "b");
    }

    /// Backend whose directory is gone: every call fails
    struct Broken;

    impl LockBackend for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn try_acquire(&self, _identity: &str) -> Result<bool, BusLockError> {
            Err(BusLockError::Unsupported("scratch directory missing".into()))
        }
        fn release(&self, _identity: &str) -> Result<(), BusLockError> {
            Ok(())
        }
        fn recover(&self, _identity: &str) -> Result<(), BusLockError> {
            Ok(())
        }
        fn abandon(&self, _identity: &str) -> Result<(), BusLockError> {
            Err(BusLockError::Unsupported("marker already gone".into()))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_withdraw_is_logged_not_returned() {
        let lock = BusLock::new(Arc::new(Broken), Duration::from_millis(10), false);

        let err = lock.try_acquire("a").unwrap_err();
        assert!(err.to_string().contains("scratch directory missing"));
        assert!(logs_contain("Failed to withdraw from bus 'broken'"));
        assert!(logs_contain("marker already gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_bus_after_release() {
        let backend = Arc::new(SlotBackend::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(100), false);
        let mut first = lock.acquire("a", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("b", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        first.release().unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.identity(), "b");
        assert!(!second.recovered());
    }
}
