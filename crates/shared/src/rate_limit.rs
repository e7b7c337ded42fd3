//! Sliding-window rate limiter for queue admission
//!
//! Tracks join attempts per visitor fingerprint (a stable hash of peer IP and
//! normalized name) over a rolling window. Entries outside the window are
//! pruned on every hit so memory stays bounded by the number of distinct
//! fingerprints seen within one window.

use std::collections::HashMap;
use std::sync::Mutex;
use time::{Duration, OffsetDateTime};

/// Rate limiter tuning
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Rolling window length
    pub window: Duration,
    /// Maximum hits allowed per fingerprint within the window
    pub max_hits: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(10),
            max_hits: 3,
        }
    }
}

/// Sliding-window counter keyed by fingerprint
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Vec<OffsetDateTime>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `fingerprint` and report whether it is allowed.
    ///
    /// A rejected hit is still recorded: hammering the endpoint does not
    /// shorten the wait.
    pub fn check(&self, fingerprint: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        let cutoff = now - self.config.window;

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another thread panicked mid-update;
            // the map contents are still plain timestamps, keep going.
            Err(poisoned) => poisoned.into_inner(),
        };

        // Drop fingerprints whose every hit has aged out
        buckets.retain(|_, hits| hits.iter().any(|t| *t > cutoff));

        let hits = buckets.entry(fingerprint.to_string()).or_default();
        hits.retain(|t| *t > cutoff);
        hits.push(now);

        hits.len() <= self.config.max_hits as usize
    }

    /// Number of fingerprints currently tracked (for diagnostics)
    pub fn tracked_fingerprints(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
