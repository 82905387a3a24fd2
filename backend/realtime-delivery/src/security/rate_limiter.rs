use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Sends left in the current primary window
    pub remaining: usize,
    pub time_until_reset: Duration,
    pub burst_remaining: usize,
    pub sent_in_window: usize,
}

#[derive(Debug)]
struct RateWindow {
    history: Vec<Instant>,
    last_reset: Instant,
}

impl RateWindow {
    /// Reset the fixed primary window once it has fully elapsed, and drop
    /// timestamps that no longer count toward either window.
    fn roll(&mut self, now: Instant, config: &RateLimitConfig) {
        if now.duration_since(self.last_reset) >= config.window {
            self.last_reset = now;
        }
        let last_reset = self.last_reset;
        self.history
            .retain(|&at| at >= last_reset || now.duration_since(at) < config.burst_window);
    }

    fn primary_count(&self) -> usize {
        self.history.iter().filter(|&&at| at >= self.last_reset).count()
    }

    fn burst_count(&self, now: Instant, burst_window: Duration) -> usize {
        self.history
            .iter()
            .filter(|&&at| now.duration_since(at) < burst_window)
            .count()
    }
}

/// A send slot taken by `RateLimiter::try_acquire`. Dropping it without
/// `commit` gives the slot back.
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    limiter: &'a RateLimiter,
    at: Instant,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.release(self.at);
        }
    }
}

/// Outbound send cadence for one user session.
///
/// The primary window has a fixed origin and resets wholesale; the burst
/// window slides over the send history.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<RateWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(RateWindow {
                history: Vec::new(),
                last_reset: Instant::now(),
            }),
        }
    }

    pub fn can_send_message(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, &self.config);
        window.primary_count() < self.config.limit
            && window.burst_count(now, self.config.burst_window) < self.config.burst_limit
    }

    pub fn record_message(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, &self.config);
        window.history.push(now);
    }

    /// Check and record under one lock, so concurrent senders cannot both
    /// take the last slot. `None` when either window is full.
    pub fn try_acquire(&self) -> Option<Reservation<'_>> {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, &self.config);
        if window.primary_count() >= self.config.limit
            || window.burst_count(now, self.config.burst_window) >= self.config.burst_limit
        {
            return None;
        }
        window.history.push(now);
        Some(Reservation {
            limiter: self,
            at: now,
            committed: false,
        })
    }

    fn release(&self, at: Instant) {
        let mut window = self.window.lock();
        if let Some(index) = window.history.iter().rposition(|&sent| sent == at) {
            window.history.remove(index);
        }
    }

    /// How long until `can_send_message` could turn true again
    pub fn retry_after(&self) -> Duration {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, &self.config);

        let mut wait = Duration::ZERO;
        if window.primary_count() >= self.config.limit {
            let elapsed = now.duration_since(window.last_reset);
            wait = wait.max(self.config.window.saturating_sub(elapsed));
        }

        let burst_window = self.config.burst_window;
        let mut in_burst: Vec<Instant> = window
            .history
            .iter()
            .copied()
            .filter(|&at| now.duration_since(at) < burst_window)
            .collect();
        match self.config.burst_limit {
            // Nothing ever fits; report a full burst window
            0 => wait = wait.max(burst_window),
            burst_limit if in_burst.len() >= burst_limit => {
                in_burst.sort();
                // The oldest send that must age out before one more fits
                let blocking = in_burst[in_burst.len() - burst_limit];
                wait = wait.max(burst_window.saturating_sub(now.duration_since(blocking)));
            }
            _ => {}
        }
        wait
    }

    pub fn get_stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, &self.config);

        let sent_in_window = window.primary_count();
        let burst = window.burst_count(now, self.config.burst_window);
        RateLimitStats {
            remaining: self.config.limit.saturating_sub(sent_in_window),
            time_until_reset: self
                .config
                .window
                .saturating_sub(now.duration_since(window.last_reset)),
            burst_remaining: self.config.burst_limit.saturating_sub(burst),
            sent_in_window,
        }
    }

    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.history.clear();
        window.last_reset = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: usize, window_secs: u64, burst_limit: usize, burst_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            limit,
            window: Duration::from_secs(window_secs),
            burst_limit,
            burst_window: Duration::from_secs(burst_secs),
        })
    }

    fn send(limiter: &RateLimiter) -> bool {
        if limiter.can_send_message() {
            limiter.record_message();
            true
        } else {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_window_blocks_sixth_send() {
        let limiter = limiter(5, 60, 100, 10);
        for _ in 0..5 {
            assert!(send(&limiter));
        }
        assert!(!limiter.can_send_message());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.can_send_message());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_send_message());
        assert_eq!(limiter.get_stats().remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_exhausts_before_primary() {
        let limiter = limiter(30, 60, 3, 10);
        for _ in 0..3 {
            assert!(send(&limiter));
        }
        assert!(!limiter.can_send_message());

        let stats = limiter.get_stats();
        assert_eq!(stats.remaining, 27);
        assert_eq!(stats.burst_remaining, 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.can_send_message());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_window_slides() {
        let limiter = limiter(30, 60, 2, 10);
        assert!(send(&limiter));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(send(&limiter));
        assert!(!limiter.can_send_message());
        assert_eq!(limiter.retry_after(), Duration::from_secs(4));

        // Only the first send has aged out
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(send(&limiter));
        assert!(!limiter.can_send_message());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_allows_boundary_burst() {
        let limiter = limiter(3, 60, 100, 1);
        tokio::time::advance(Duration::from_secs(59)).await;
        for _ in 0..3 {
            assert!(send(&limiter));
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..3 {
            assert!(send(&limiter));
        }
        assert_eq!(limiter.get_stats().sent_in_window, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_is_released_unless_committed() {
        let limiter = limiter(1, 60, 10, 10);

        let first = limiter.try_acquire().expect("slot available");
        assert!(limiter.try_acquire().is_none());
        drop(first);
        assert_eq!(limiter.get_stats().sent_in_window, 0);

        limiter.try_acquire().expect("slot released").commit();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.get_stats().sent_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_burst_limit_never_sends() {
        let limiter = limiter(5, 60, 0, 10);
        assert!(!limiter.can_send_message());
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.retry_after(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_reset() {
        let limiter = limiter(5, 60, 3, 10);
        send(&limiter);
        tokio::time::advance(Duration::from_secs(15)).await;

        let stats = limiter.get_stats();
        assert_eq!(stats.sent_in_window, 1);
        assert_eq!(stats.remaining, 4);
        assert_eq!(stats.burst_remaining, 3);
        assert_eq!(stats.time_until_reset, Duration::from_secs(45));
        assert_eq!(limiter.retry_after(), Duration::ZERO);

        limiter.reset();
        assert_eq!(limiter.get_stats().sent_in_window, 0);
        assert_eq!(limiter.get_stats().time_until_reset, Duration::from_secs(60));
    }
}
