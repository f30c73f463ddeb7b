//! Outbound gateway command throttle
//!
//! A fixed-size window per shard. The cap is a client-side heuristic rather
//! than a value the server hands us, so it is configurable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Default soft cap of non-heartbeat commands per window
pub const DEFAULT_COMMAND_LIMIT: u32 = 120;

/// Length of one throttle window
pub const COMMAND_WINDOW: Duration = Duration::from_secs(60);

/// Per-shard command window
///
/// Callers queue on a fair mutex, so once the window resets they proceed in
/// the order they arrived. Heartbeats never go through here.
#[derive(Debug)]
pub struct CommandThrottle {
    limit: u32,
    window: Duration,
    used: AtomicU32,
    turn: Mutex<()>,
    epoch: watch::Sender<u64>,
}

impl CommandThrottle {
    pub fn new(limit: u32) -> Self {
        Self::with_window(limit, COMMAND_WINDOW)
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            limit: limit.max(1),
            window,
            used: AtomicU32::new(0),
            turn: Mutex::new(()),
            epoch,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Commands still available in the current window
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// Take one slot, suspending until the next window if the cap is hit.
    /// Returns whether the caller had to wait for a window reset.
    pub async fn acquire(&self) -> bool {
        let mut waited = false;
        let _turn = self.turn.lock().await;
        let mut epoch = self.epoch.subscribe();

        while !self.try_take() {
            waited = true;
            debug!(limit = self.limit, "Gateway command cap reached, waiting for window reset");
            // the sender lives in self, so this only errors if self is gone
            if epoch.changed().await.is_err() {
                break;
            }
        }
        waited
    }

    /// Start a new window and wake queued callers
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
    }

    /// Window clock: resets the counter every `window` until cancelled.
    pub async fn run_clock(&self) {
        loop {
            tokio::time::sleep(self.window).await;
            self.reset();
        }
    }

    fn try_take(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }
}

impl Default for CommandThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_acquire_within_cap_is_immediate() {
        let throttle = CommandThrottle::new(3);
        for _ in 0..3 {
            let mut acquire = task::spawn(throttle.acquire());
            assert!(!assert_ready!(acquire.poll()));
        }
        assert_eq!(throttle.remaining(), 0);

        let mut blocked = task::spawn(throttle.acquire());
        assert_pending!(blocked.poll());

        throttle.reset();
        assert!(blocked.is_woken());
        assert!(assert_ready!(blocked.poll()), "waiting caller reports it was throttled");
        assert_eq!(throttle.remaining(), 2);
    }

    #[tokio::test]
    async fn waiters_resume_in_call_order_after_reset() {
        let throttle = Arc::new(CommandThrottle::new(2));
        throttle.acquire().await;
        throttle.acquire().await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 1..=3 {
            let throttle = Arc::clone(&throttle);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                throttle.acquire().await;
                order.lock().unwrap().push(id);
            }));
            tokio::task::yield_now().await;
        }

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(order.lock().unwrap().is_empty());

        throttle.reset();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert!(!handles[2].is_finished());

        throttle.reset();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_opens_next_window() {
        let throttle = Arc::new(CommandThrottle::new(1));
        let clock = tokio::spawn({
            let throttle = Arc::clone(&throttle);
            async move { throttle.run_clock().await }
        });

        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() >= COMMAND_WINDOW);

        clock.abort();
    }
}
