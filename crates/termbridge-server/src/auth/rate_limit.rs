//! Sliding-window throttle for authentication attempts.
//!
//! Keeps per-key attempt timestamps that age out of a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with a per-key attempt budget inside a window.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → list of attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;

        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Drop keys whose attempts have all aged out.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;

        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Authentication throttle keyed by remote IP.
#[derive(Debug)]
pub struct AuthThrottle {
    limiter: RateLimiter,
}

impl AuthThrottle {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            limiter: RateLimiter::new(max_attempts, window_secs),
        }
    }

    /// Check if an auth attempt from the given IP is allowed.
    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.limiter.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.limiter.gc();
    }

    /// Number of addresses with attempts inside the window.
    pub fn tracked_ips(&self) -> usize {
        self.limiter.tracked_keys()
    }
}
