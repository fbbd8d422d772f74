//! Token-bucket rate limiting keyed by resource name.
//!
//! Buckets are created lazily on first use with the capacity and refill rate
//! configured for the resource (or the default class), and refilled lazily
//! on every access. One mutex guards the whole table, so the
//! refill-check-take sequence is atomic per call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use toolgate_config::{BucketConfig, RateLimitConfig};
use toolgate_core::GateError;

/// Absorbs float error from `Duration` round trips.
const EPSILON: f64 = 1e-9;

/// Bucket table size that triggers a prune.
pub const MAX_BUCKETS: usize = 10_000;

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(class: BucketConfig, now: Instant) -> Self {
        Self {
            capacity: class.capacity,
            tokens: class.capacity,
            refill_per_second: class.refill_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.refill_per_second + EPSILON >= self.capacity
    }

    fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens + EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    fn wait_time(&self, cost: f64) -> Duration {
        if self.tokens + EPSILON >= cost {
            return Duration::ZERO;
        }
        if cost > self.capacity || self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((cost - self.tokens) / self.refill_per_second).unwrap_or(Duration::MAX)
    }

    fn reconfigure(&mut self, class: BucketConfig) {
        self.capacity = class.capacity;
        self.refill_per_second = class.refill_per_second;
        self.tokens = self.tokens.min(self.capacity);
    }
}

struct Inner {
    config: RateLimitConfig,
    buckets: HashMap<String, TokenBucket>,
}

impl Inner {
    fn bucket(&mut self, key: &str, now: Instant) -> &mut TokenBucket {
        if !self.buckets.contains_key(key) && self.buckets.len() >= MAX_BUCKETS {
            self.prune(now);
        }
        let class = self.config.bucket_for(key);
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(class, now));
        bucket.refill(now);
        bucket
    }

    /// Drop buckets that have refilled to capacity; a fresh bucket would be
    /// identical. If that frees nothing, drop the least recently used one.
    fn prune(&mut self, now: Instant) {
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        if self.buckets.len() >= MAX_BUCKETS
            && let Some(stale) = self
                .buckets
                .iter()
                .min_by_key(|(_, bucket)| bucket.last_refill)
                .map(|(key, _)| key.clone())
        {
            self.buckets.remove(&stale);
        }
    }
}

/// Shared token-bucket admission control.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("RateLimiter")
            .field("buckets", &inner.buckets.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                buckets: HashMap::new(),
            }),
        }
    }

    /// Take `cost` tokens from `key`'s bucket if it has them.
    pub fn allow(&self, key: &str, cost: f64) -> bool {
        self.allow_at(key, cost, Instant::now())
    }

    pub fn allow_at(&self, key: &str, cost: f64, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bucket(key, now).try_take(cost)
    }

    /// How long until `cost` tokens are available. Zero if they already are;
    /// `Duration::MAX` if they never will be.
    pub fn time_until_allowed(&self, key: &str, cost: f64) -> Duration {
        self.time_until_allowed_at(key, cost, Instant::now())
    }

    pub fn time_until_allowed_at(&self, key: &str, cost: f64, now: Instant) -> Duration {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bucket(key, now).wait_time(cost)
    }

    /// Take tokens or report how long to wait, under one lock.
    pub fn try_acquire(&self, key: &str, cost: f64) -> Result<(), GateError> {
        self.try_acquire_at(key, cost, Instant::now())
    }

    pub fn try_acquire_at(&self, key: &str, cost: f64, now: Instant) -> Result<(), GateError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = inner.bucket(key, now);
        if bucket.try_take(cost) {
            Ok(())
        } else {
            Err(GateError::RateLimited {
                resource: key.to_string(),
                retry_after: bucket.wait_time(cost),
            })
        }
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens currently in `key`'s bucket, if it exists (without refilling).
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.buckets.get(key).map(|b| b.tokens)
    }

    /// Apply new bucket classes. Existing buckets keep their tokens, clamped
    /// to the new capacity.
    pub fn reconfigure(&self, config: RateLimitConfig) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (key, bucket) in inner.buckets.iter_mut() {
            bucket.reconfigure(config.bucket_for(key));
        }
        inner.config = config;
    }
}
