//! Fixed-window request counter
//!
//! Windows start lazily on the first request for a key. Bursts across a
//! window boundary can reach twice the limit; this is not a sliding window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Result of a limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the current window resets
    pub retry_after: Duration,
}

#[derive(Default)]
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key`
    pub async fn check_limit(&self, key: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let entry = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if now >= w.reset_at {
                    *w = Window {
                        count: 0,
                        reset_at: now + window,
                    };
                }
            })
            .or_insert(Window {
                count: 0,
                reset_at: now + window,
            });

        let retry_after = entry.reset_at.saturating_duration_since(now);
        if entry.count >= max_requests {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: max_requests - entry.count,
            retry_after,
        }
    }

    /// Drop windows that have already reset. Returns the number removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        before - windows.len()
    }

    pub async fn reset(&self, key: &str) {
        self.windows.lock().await.remove(key);
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_allows_then_denies_then_resets() {
        let limiter = FixedWindowLimiter::new();
        let window = Duration::from_millis(1000);

        let first = limiter.check_limit("k", 2, window).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(limiter.check_limit("k", 2, window).await.allowed);

        let third = limiter.check_limit("k", 2, window).await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(third.retry_after <= window);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.check_limit("k", 2, window).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = FixedWindowLimiter::new();
        let window = Duration::from_secs(1);

        assert!(limiter.check_limit("a", 1, window).await.allowed);
        assert!(!limiter.check_limit("a", 1, window).await.allowed);
        assert!(limiter.check_limit("b", 1, window).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_expired_windows() {
        let limiter = FixedWindowLimiter::new();
        limiter.check_limit("short", 5, Duration::from_secs(1)).await;
        limiter.check_limit("long", 5, Duration::from_secs(60)).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.cleanup().await, 1);
        assert_eq!(limiter.tracked_keys().await, 1);
    }
}
