//! Pausable run deadline.
//!
//! The deadline is a budget of wall-clock time, not a fixed instant: while a
//! run is suspended on an interrupt the clock is paused, so suspended time
//! never counts against the budget.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

struct Inner {
    remaining: Duration,
    /// When the clock was last armed; `None` while paused.
    armed_at: Option<Instant>,
}

/// A pausable countdown shared between the executor and the run context.
pub struct DeadlineClock {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DeadlineClock {
    /// Create an armed clock with the given budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                remaining: budget,
                armed_at: Some(Instant::now()),
            }),
            notify: Notify::new(),
        }
    }

    /// Stop the countdown, banking the unspent budget.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("deadline lock");
        if let Some(armed_at) = inner.armed_at.take() {
            inner.remaining = inner.remaining.saturating_sub(armed_at.elapsed());
        }
        self.notify.notify_waiters();
    }

    /// Restart the countdown from the banked budget.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("deadline lock");
        if inner.armed_at.is_none() {
            inner.armed_at = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    /// Budget still available.
    pub fn remaining(&self) -> Duration {
        let inner = self.inner.lock().expect("deadline lock");
        match inner.armed_at {
            Some(armed_at) => inner.remaining.saturating_sub(armed_at.elapsed()),
            None => inner.remaining,
        }
    }

    /// Resolve when the budget runs out. Pausing defers resolution
    /// indefinitely; resuming re-arms it.
    pub async fn expired(&self) {
        loop {
            let (paused, remaining) = {
                let inner = self.inner.lock().expect("deadline lock");
                match inner.armed_at {
                    Some(armed_at) => (false, inner.remaining.saturating_sub(armed_at.elapsed())),
                    None => (true, inner.remaining),
                }
            };
            if !paused && remaining.is_zero() {
                return;
            }
            if paused {
                self.notify.notified().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = self.notify.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_expires_after_budget() {
        let clock = DeadlineClock::new(Duration::from_millis(30));
        let start = Instant::now();
        clock.expired().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_paused_time_does_not_count() {
        let clock = Arc::new(DeadlineClock::new(Duration::from_millis(50)));
        let waiter = clock.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            waiter.expired().await;
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.pause();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(clock.remaining() >= Duration::from_millis(25));
        clock.resume();

        let elapsed = handle.await.unwrap();
        // 20ms armed + 100ms paused + ~30ms armed remainder.
        assert!(elapsed >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_remaining_decreases_only_while_armed() {
        let clock = DeadlineClock::new(Duration::from_millis(100));
        clock.pause();
        let before = clock.remaining();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(before, clock.remaining());
    }
}
