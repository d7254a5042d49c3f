//! File Descriptor Limiter
//!
//! A block flush opens two files per column plus a few per segment. With
//! many streams flushing at once that can exceed the process descriptor
//! limit, so every flush first reserves its descriptors here.
//!
//! ## Algorithm
//!
//! The limiter is a counting semaphore over `max_open_fds` permits. A caller
//! asks for `n` permits at once; when they are not available it sleeps and
//! retries, doubling the wait each time up to [`MAX_BACKOFF`]. After the
//! last retry the flush fails with [`Error::FdQuotaExhausted`] and the
//! block stays in memory for the next attempt.
//!
//! ## Usage
//!
//! ```ignore
//! let limiter = FdLimiter::new(config.max_open_fds);
//! let _fds = limiter.try_acquire_with_backoff(2 * num_cols + 2, FD_ACQUIRE_RETRIES, &segkey)?;
//! // permits go back when `_fds` drops
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct FdLimiter {
    available: Mutex<usize>,
    capacity: usize,
    initial_backoff: Duration,
}

impl FdLimiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_backoff(capacity, INITIAL_BACKOFF)
    }

    pub fn with_backoff(capacity: usize, initial_backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(capacity),
            capacity,
            initial_backoff,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Take `n` permits if they are free right now.
    pub fn try_acquire(self: &Arc<Self>, n: usize) -> Option<FdPermit> {
        let mut available = self.available.lock();
        if *available < n {
            return None;
        }
        *available -= n;
        Some(FdPermit {
            limiter: Arc::clone(self),
            count: n,
        })
    }

    /// Take `n` permits, sleeping between up to `retries` further attempts.
    ///
    /// Requests larger than the whole capacity can never succeed and fail
    /// without waiting.
    pub fn try_acquire_with_backoff(
        self: &Arc<Self>,
        n: usize,
        retries: u32,
        owner: &str,
    ) -> Result<FdPermit> {
        if n > self.capacity {
            tracing::error!(owner = %owner, requested = n, capacity = self.capacity, "Descriptor request exceeds limiter capacity");
            return Err(Error::FdQuotaExhausted {
                requested: n,
                retries: 0,
            });
        }

        let mut backoff = self.initial_backoff;
        for attempt in 0..=retries {
            if let Some(permit) = self.try_acquire(n) {
                return Ok(permit);
            }
            if attempt == retries {
                break;
            }
            tracing::debug!(owner = %owner, requested = n, attempt, "Descriptor quota busy, backing off");
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        tracing::error!(owner = %owner, requested = n, retries, "Descriptor quota exhausted");
        Err(Error::FdQuotaExhausted {
            requested: n,
            retries,
        })
    }

    fn release(&self, n: usize) {
        let mut available = self.available.lock();
        *available = (*available + n).min(self.capacity);
    }
}

/// Permits held until drop.
#[derive(Debug)]
pub struct FdPermit {
    limiter: Arc<FdLimiter>,
    count: usize,
}

impl FdPermit {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for FdPermit {
    fn drop(&mut self) {
        self.limiter.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits_return_on_drop() {
        let limiter = FdLimiter::new(10);
        let a = limiter.try_acquire(6).unwrap();
        assert_eq!(limiter.available(), 4);
        assert!(limiter.try_acquire(5).is_none());

        drop(a);
        assert_eq!(limiter.available(), 10);
        assert_eq!(limiter.try_acquire(10).unwrap().count(), 10);
    }

    #[test]
    fn test_backoff_gives_up() {
        let limiter = FdLimiter::with_backoff(4, Duration::from_millis(1));
        let _held = limiter.try_acquire(3).unwrap();

        let err = limiter.try_acquire_with_backoff(2, 3, "seg-1").unwrap_err();
        assert!(matches!(
            err,
            Error::FdQuotaExhausted {
                requested: 2,
                retries: 3
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backoff_succeeds_after_release() {
        let limiter = FdLimiter::with_backoff(4, Duration::from_millis(5));
        let held = limiter.try_acquire(4).unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || limiter.try_acquire_with_backoff(4, 50, "seg-2").map(|p| p.count()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 4);
        assert_eq!(limiter.available(), 4);
    }

    #[test]
    fn test_oversized_request_fails_fast() {
        let limiter = FdLimiter::new(2);
        assert!(limiter.try_acquire_with_backoff(3, 10, "seg-3").is_err());
        assert_eq!(limiter.available(), 2);
    }
}
