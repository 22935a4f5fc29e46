//! # Response Cache
//!
//! Short-TTL cache for successful GET responses on routes marked cacheable.
//!
//! The key is the request path plus query string. Entries are never invalidated
//! proactively; staleness is bounded by TTL alone. A background sweeper removes
//! expired entries, and when the cache is full an insert first purges expired
//! entries and is skipped if there is still no room.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::types::GatewayResponse;

#[derive(Debug, Clone)]
struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics for `/services` style reporting and tests
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired_cleanups: u64,
    pub skipped_inserts: u64,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_cleanups: AtomicU64,
    skipped_inserts: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
            skipped_inserts: AtomicU64::new(0),
        }
    }

    /// Cache key for a path and optional query string
    pub fn key(path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<GatewayResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<GatewayResponse> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| {
                GatewayResponse::new(entry.status, entry.headers.clone(), entry.body.clone())
            });

        match hit {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_hits_total").increment(1);
                Some(response)
            }
            None => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Store a 2xx response; other statuses are ignored
    pub fn insert(&self, key: String, response: &GatewayResponse, ttl: Duration) {
        self.insert_at(key, response, ttl, Instant::now())
    }

    pub fn insert_at(&self, key: String, response: &GatewayResponse, ttl: Duration, now: Instant) {
        if !response.status.is_success() || ttl.is_zero() {
            return;
        }

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.purge_expired_at(now);
            if self.entries.len() >= self.max_entries {
                self.skipped_inserts.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Response cache full, skipping insert");
                return;
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
                expires_at: now + ttl,
            },
        );
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expired_cleanups
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.purge_expired();
                    }
                }
            }
            debug!("Response cache sweeper stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
            skipped_inserts: self.skipped_inserts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, body: &'static str) -> GatewayResponse {
        GatewayResponse::new(status, HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_hit_within_ttl_returns_identical_body() {
        let cache = ResponseCache::new(10);
        let now = Instant::now();
        let key = ResponseCache::key("/api/catalog/items", Some("page=1"));
        assert_eq!(key, "/api/catalog/items?page=1");

        cache.insert_at(key.clone(), &response(StatusCode::OK, "[1,2,3]"), Duration::from_secs(5), now);

        let hit = cache.get_at(&key, now + Duration::from_secs(4)).unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"[1,2,3]"));
        assert_eq!(hit.status, StatusCode::OK);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ResponseCache::new(10);
        let now = Instant::now();
        cache.insert_at("/a".to_string(), &response(StatusCode::OK, "x"), Duration::from_secs(5), now);

        assert!(cache.get_at("/a", now + Duration::from_secs(5)).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_non_success_is_not_cached() {
        let cache = ResponseCache::new(10);
        cache.insert("/a".to_string(), &response(StatusCode::NOT_FOUND, "no"), Duration::from_secs(5));
        cache.insert("/b".to_string(), &response(StatusCode::BAD_GATEWAY, "no"), Duration::from_secs(5));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_full_cache_purges_expired_then_skips() {
        let cache = ResponseCache::new(2);
        let now = Instant::now();
        let ok = response(StatusCode::OK, "x");

        cache.insert_at("/short".to_string(), &ok, Duration::from_secs(1), now);
        cache.insert_at("/long".to_string(), &ok, Duration::from_secs(60), now);

        let later = now + Duration::from_secs(2);
        cache.insert_at("/new".to_string(), &ok, Duration::from_secs(60), later);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("/new", later).is_some());

        cache.insert_at("/skipped".to_string(), &ok, Duration::from_secs(60), later);
        assert!(cache.get_at("/skipped", later).is_none());
        assert_eq!(cache.stats().skipped_inserts, 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let cache = Arc::new(ResponseCache::new(10));
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), shutdown.clone());

        cache.insert("/a".to_string(), &response(StatusCode::OK, "x"), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
