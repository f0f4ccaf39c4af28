//! Bounded polling.
//!
//! Every wait in the worker (review, CI, mergeability, main branch) is a
//! [`Poller`]: sleep `interval` between checks and give up once `timeout`
//! has elapsed. Sleeps are plain tokio timers so dropping the worker future
//! cancels them.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Poller {
    started: Instant,
    timeout: Duration,
    interval: Duration,
    checks: u32,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            interval,
            checks: 0,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Completed checks so far.
    pub fn checks(&self) -> u32 {
        self.checks
    }

    /// Restart the window, e.g. after pushing a fix.
    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.checks = 0;
    }

    /// Sleep until the next check. Returns false once the window is spent,
    /// without sleeping past it.
    pub async fn wait(&mut self) -> bool {
        self.checks += 1;
        let remaining = self.timeout.saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(self.interval.min(remaining)).await;
        !self.expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stops_after_timeout() {
        let mut poller = Poller::new(Duration::from_secs(10), Duration::from_secs(3));
        let mut rounds = 0;
        while poller.wait().await {
            rounds += 1;
            assert!(rounds < 10, "poller never expired");
        }
        assert!(poller.expired());
        assert!(poller.elapsed() <= Duration::from_secs(10));
        assert_eq!(rounds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_never_sleeps() {
        let mut poller = Poller::new(Duration::ZERO, Duration::from_secs(60));
        assert!(!poller.wait().await);
        assert_eq!(poller.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reopens_the_window() {
        let mut poller = Poller::new(Duration::from_secs(2), Duration::from_secs(1));
        while poller.wait().await {}
        assert!(poller.expired());
        poller.reset();
        assert!(!poller.expired());
        assert_eq!(poller.checks(), 0);
    }
}
