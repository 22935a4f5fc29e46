//! # Rate Limiting
//!
//! Per-service token buckets, one bucket per `service + client IP` pair.
//!
//! A bucket holds up to `burst` tokens (default: `requests`) and refills at
//! `requests / window` tokens per second. Each admitted request takes one token.
//! When the bucket is empty the caller is told how long until the next token.
//!
//! Buckets live in a `DashMap` so different clients never contend on one lock.
//! Idle buckets are dropped by [`RateLimiter::cleanup_idle`].

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::RateLimitPolicy;

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    /// `Retry-After` value in whole seconds, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after
            .map(|d| d.as_secs_f64().ceil().max(1.0) as u64)
            .unwrap_or(1)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Rate limiting metrics
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
}

/// Snapshot of rate limiting metrics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub tracked_buckets: usize,
}

/// In-memory token bucket limiter shared by all services
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token for `client` on `service`
    pub fn check(&self, service: &str, client: &str, policy: &RateLimitPolicy) -> RateLimitResult {
        self.check_at(service, client, policy, Instant::now())
    }

    pub fn check_at(
        &self,
        service: &str,
        client: &str,
        policy: &RateLimitPolicy,
        now: Instant,
    ) -> RateLimitResult {
        let capacity = policy.burst.unwrap_or(policy.requests).max(1) as f64;
        let refill_per_sec = policy.requests as f64 / policy.window.as_secs_f64().max(f64::EPSILON);

        let key = format!("{}:{}", service, client);
        let mut bucket = self.buckets.entry(key).or_insert_with(|| TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        let result = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitResult {
                allowed: true,
                remaining: bucket.tokens as u32,
                retry_after: None,
            }
        } else {
            let missing = 1.0 - bucket.tokens;
            RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after: Some(Duration::from_secs_f64(missing / refill_per_sec)),
            }
        };
        drop(bucket);

        if result.allowed {
            self.metrics.requests_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.requests_denied.fetch_add(1, Ordering::Relaxed);
            counter!("rate_limit_denied_total", "service" => service.to_string()).increment(1);
            debug!(service = %service, client = %client, "Rate limit exceeded");
        }
        result
    }

    /// Drop buckets untouched for longer than `idle`
    pub fn cleanup_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle);
        before.saturating_sub(self.buckets.len())
    }

    /// Run [`cleanup_idle`](Self::cleanup_idle) every `interval` until cancelled
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.cleanup_idle(idle);
                        if removed > 0 {
                            debug!(removed, "Dropped idle rate limit buckets");
                        }
                    }
                }
            }
        })
    }

    pub fn get_metrics(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            requests_allowed: self.metrics.requests_allowed.load(Ordering::Relaxed),
            requests_denied: self.metrics.requests_denied.load(Ordering::Relaxed),
            tracked_buckets: self.buckets.len(),
        }
    }
}
