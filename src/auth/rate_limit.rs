use std::sync::Arc;
use chrono::Utc;
use dashmap::DashMap;

pub const SECONDS_PER_HOUR: i64 = 3600;

/// Outcome of one rate-limit probe; carries everything the response
/// headers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,

    /// Unix seconds at the start of the next hour bucket.
    pub reset_at: i64
}

/// In-process per-key hourly counters, keyed by (api_key_id, hour bucket).
/// Counters reset on restart; acceptable for a single-node gateway.
#[derive(Clone, Default)]
pub struct HourlyRateLimiter {
    counters: Arc<DashMap<(String, i64), u32>>
}

impl HourlyRateLimiter {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DashMap::new())
        }
    }

    pub fn check_and_increment(&self, api_key_id: &str, limit: u32) -> RateLimitDecision {
        self.check_at(api_key_id, limit, Utc::now().timestamp())
    }

    /// The entry guard holds the shard lock, making read-check-increment
    /// one atomic step.
    fn check_at(&self, api_key_id: &str, limit: u32, now_secs: i64) -> RateLimitDecision {
        let bucket = now_secs.div_euclid(SECONDS_PER_HOUR);
        let reset_at = (bucket + 1) * SECONDS_PER_HOUR;

        let mut entry = self.counters
            .entry((api_key_id.to_string(), bucket))
            .or_insert(0);

        if *entry >= limit {
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at
            };
        }

        *entry += 1;
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - *entry,
            reset_at
        }
    }

    /// Drop buckets older than the current hour. Called periodically so the
    /// map does not grow one entry per key per hour forever.
    pub fn sweep_stale(&self) {
        let current_bucket = Utc::now().timestamp().div_euclid(SECONDS_PER_HOUR);
        self.counters.retain(|(_, bucket), _| *bucket >= current_bucket);
    }
}
