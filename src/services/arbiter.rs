//! Serial link arbitration
//!
//! Two flows contend for one transceiver: the background node poller and
//! sporadic command handlers. A single async mutex gives mutual exclusion;
//! a separate pause count lets a command handler preempt the poller at its
//! next checkpoint before queueing on the mutex. The flag lives outside
//! the mutex and is readable without contending for it.
//!
//! Both sides acquire with a deadline; indefinite blocking is not possible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Grace period a command handler gives the poller to observe the pause
/// flag before contending for the permit.
pub const PAUSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
#[error("serial port busy")]
pub struct SerialBusy;

#[derive(Default)]
pub struct Arbiter {
    mutex: Mutex<()>,
    pause: AtomicUsize,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the pause signal. The poller treats a non-zero count as
    /// "stand down"; the guard lowers it on drop, so the signal clears on
    /// every exit path including early returns.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pause.fetch_add(1, Ordering::SeqCst);
        PauseGuard { arbiter: self }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst) > 0
    }

    /// Acquire exclusive access to the serial link within `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<SerialPermit<'_>, SerialBusy> {
        match tokio::time::timeout(timeout, self.mutex.lock()).await {
            Ok(guard) => Ok(SerialPermit { _guard: guard }),
            Err(_) => Err(SerialBusy),
        }
    }
}

/// Raised pause signal; lowers the count when dropped.
pub struct PauseGuard<'a> {
    arbiter: &'a Arbiter,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.arbiter.pause.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive serial access token; releases the mutex when dropped.
#[derive(Debug)]
pub struct SerialPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_permit_is_exclusive() {
        let arbiter = Arbiter::new();

        let permit = arbiter.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(arbiter.acquire(Duration::from_millis(50)).await.is_err());

        drop(permit);
        assert!(arbiter.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_timeout_reports_busy() {
        let arbiter = Arbiter::new();
        let _permit = arbiter.acquire(Duration::from_millis(50)).await.unwrap();

        let err = arbiter.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.to_string(), "serial port busy");
    }

    #[tokio::test]
    async fn test_pause_latches_and_clears_on_drop() {
        let arbiter = Arbiter::new();
        assert!(!arbiter.is_paused());

        {
            let _guard = arbiter.pause();
            assert!(arbiter.is_paused());
        }
        assert!(!arbiter.is_paused());
    }

    #[tokio::test]
    async fn test_pause_clears_on_early_return() {
        let arbiter = Arbiter::new();

        fn bail_out(arbiter: &Arbiter) -> Result<(), SerialBusy> {
            let _guard = arbiter.pause();
            Err(SerialBusy)
        }

        assert!(bail_out(&arbiter).is_err());
        assert!(!arbiter.is_paused());
    }

    #[tokio::test]
    async fn test_nested_pause_scopes() {
        let arbiter = Arbiter::new();

        let outer = arbiter.pause();
        let inner = arbiter.pause();
        drop(inner);
        // The outer scope still expects the poller to stand down
        assert!(arbiter.is_paused());
        drop(outer);
        assert!(!arbiter.is_paused());
    }

    #[tokio::test]
    async fn test_no_two_holders_overlap() {
        let arbiter = Arc::new(Arbiter::new());
        let in_flight = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let arbiter = arbiter.clone();
            let in_flight = in_flight.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = arbiter.acquire(Duration::from_secs(5)).await.unwrap();
                assert!(!in_flight.swap(true, Ordering::SeqCst), "overlapping holders");
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.store(false, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}
