use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);
const SWEEP_PERIOD: Duration = Duration::from_secs(300);
const IDLE_EVICT: Duration = Duration::from_secs(120);

/// 按 token 维度的滑动窗口限流器，窗口只在内存里，重启即清零。
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<i64, Arc<Mutex<Vec<Instant>>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, token_id: i64) -> Arc<Mutex<Vec<Instant>>> {
        if let Some(window) = self.windows.read().expect("window map lock").get(&token_id) {
            return Arc::clone(window);
        }

        // Re-check under the exclusive lock so two first requests for the
        // same token do not allocate two windows.
        let mut map = self.windows.write().expect("window map lock");
        Arc::clone(
            map.entry(token_id)
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
        )
    }

    /// Admit or reject one request. Prunes timestamps older than the window,
    /// rejects without recording when the count is at the limit, appends and
    /// admits otherwise. A non-positive limit exempts the token.
    pub fn check(&self, token_id: i64, limit: i64) -> bool {
        if limit <= 0 {
            return true;
        }

        let window = self.window(token_id);
        let mut stamps = window.lock().expect("window lock");

        let now = Instant::now();
        stamps.retain(|ts| now.duration_since(*ts) < WINDOW);

        if stamps.len() as i64 >= limit {
            return false;
        }
        stamps.push(now);
        true
    }

    pub fn sweep(&self) {
        self.sweep_idle(IDLE_EVICT);
    }

    fn sweep_idle(&self, idle: Duration) {
        let mut map = self.windows.write().expect("window map lock");
        let before = map.len();
        map.retain(|_, window| {
            let stamps = window.lock().expect("window lock");
            match stamps.last() {
                Some(last) => last.elapsed() < idle,
                None => false,
            }
        });
        if map.len() < before {
            debug!(evicted = before - map.len(), "swept idle rate-limit windows");
        }
    }

    /// Evict idle windows every 5 minutes so abandoned tokens do not pin
    /// memory forever.
    pub fn spawn_sweeper(self: Arc<Self>) {
        let limiter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check(1, 3));
        }
        assert!(!limiter.check(1, 3));
        // The rejected attempt must not consume a slot either.
        assert!(!limiter.check(1, 3));
    }

    #[test]
    fn windows_are_per_token() {
        let limiter = RateLimiter::new();
        assert!(limiter.check(1, 1));
        assert!(!limiter.check(1, 1));
        assert!(limiter.check(2, 1));
    }

    #[test]
    fn non_positive_limit_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..500 {
            assert!(limiter.check(7, 0));
            assert!(limiter.check(8, -1));
        }
        // Exempt tokens never allocate a window.
        assert!(limiter.windows.read().unwrap().is_empty());
    }

    #[test]
    fn sweep_drops_idle_windows_only() {
        let limiter = RateLimiter::new();
        assert!(limiter.check(1, 10));

        limiter.sweep_idle(Duration::from_secs(60));
        assert_eq!(limiter.windows.read().unwrap().len(), 1);

        limiter.sweep_idle(Duration::ZERO);
        assert!(limiter.windows.read().unwrap().is_empty());
    }
}
