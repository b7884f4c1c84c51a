//! Fixed-rate send throttle.
//!
//! No token bucket and no burst allowance: consecutive sends are always at
//! least `ceil(1000 / rate)` milliseconds apart, which is a hard ceiling on
//! provider-facing throughput.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Minimum spacing between two sends for a target rate in emails per second.
///
/// A rate of zero is treated as one email per second.
pub fn delay_millis(target_per_second: u32) -> u64 {
    let rate = u64::from(target_per_second.max(1));
    1000_u64.div_ceil(rate)
}

/// Spaces consecutive sends within one batch.
#[derive(Debug)]
pub struct RateThrottle {
    delay: Duration,
    last_send: Option<Instant>,
}

impl RateThrottle {
    pub fn new(target_per_second: u32) -> Self {
        Self {
            delay: Duration::from_millis(delay_millis(target_per_second)),
            last_send: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until the next send is allowed, then mark it as taken.
    ///
    /// The first call never waits.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_send {
            sleep_until(last + self.delay).await;
        }
        self.last_send = Some(Instant::now());
    }

    /// Forget the previous send, e.g. at a batch boundary.
    pub fn reset(&mut self) {
        self.last_send = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_millis_rounds_up() {
        assert_eq!(delay_millis(14), 72); // 71.43 → 72
        assert_eq!(delay_millis(10), 100);
        assert_eq!(delay_millis(1), 1000);
        assert_eq!(delay_millis(3), 334);
        assert_eq!(delay_millis(2000), 1);
    }

    #[test]
    fn test_zero_rate_falls_back_to_one_per_second() {
        assert_eq!(delay_millis(0), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_acquires_are_spaced() {
        let mut throttle = RateThrottle::new(14);
        let mut stamps = Vec::new();

        for _ in 0..5 {
            throttle.acquire().await;
            stamps.push(Instant::now());
        }

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(72));
        }
        assert!(stamps[4] - stamps[0] >= Duration::from_millis(4 * 72));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_does_not_wait() {
        let mut throttle = RateThrottle::new(1);
        let start = Instant::now();
        throttle.acquire().await;
        assert_eq!(Instant::now() - start, Duration::ZERO);

        throttle.reset();
        let start = Instant::now();
        throttle.acquire().await;
        assert_eq!(Instant::now() - start, Duration::ZERO);
    }
}
