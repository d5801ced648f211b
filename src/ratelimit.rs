//! Per-client-IP rate limiting for the polled internal endpoints.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Interval between eviction passes over stale entries.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Enforces a minimum interval between requests per IP.
pub struct RateLimiter {
    last_seen: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    /// Returns true if this IP may proceed; admission stamps the entry.
    pub fn allow(&self, ip: &str) -> bool {
        let mut last_seen = self.last_seen.lock();
        let now = Instant::now();
        match last_seen.get(ip) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_seen.insert(ip.to_string(), now);
                true
            }
        }
    }

    /// Removes IPs whose last admission is older than twice the interval.
    pub fn evict_stale(&self) {
        let mut last_seen = self.last_seen.lock();
        let cutoff = 2 * self.min_interval;
        last_seen.retain(|_, last| last.elapsed() < cutoff);
    }

    /// Spawns the periodic eviction task; it exits on shutdown.
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => self.evict_stale(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_seen.lock().len()
    }
}
