//! Bounded TTL cache in front of an embedding generator.
//!
//! # Invariants
//! - Entries are keyed by `(model, text)`; a model switch never serves stale
//!   vectors.
//! - An entry older than the TTL is never served.
//! - At most `max_capacity` entries survive housekeeping.
//! - Generator failures are never cached.

use super::{EmbeddingError, EmbeddingGenerator};
use crate::config::EngineConfig;
use log::info;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingCacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub ttl: Duration,
    pub max_capacity: u64,
}

pub struct CachedEmbeddingGenerator<G> {
    inner: G,
    ttl: Duration,
    max_capacity: u64,
    cache: Cache<(String, String), Vec<f32>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<G: EmbeddingGenerator> CachedEmbeddingGenerator<G> {
    pub fn new(inner: G, ttl: Duration, max_capacity: u64) -> Self {
        info!(
            "event=embedding_cache_init module=oracle status=ok model={} ttl_secs={} max_capacity={max_capacity}",
            inner.model(),
            ttl.as_secs()
        );
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self {
            inner,
            ttl,
            max_capacity,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Builds the cache from the `embedding_cache_*` settings.
    pub fn from_config(inner: G, config: &EngineConfig) -> Self {
        Self::new(
            inner,
            config.embedding_cache_ttl(),
            config.embedding_cache_capacity,
        )
    }

    /// Counters after pending evictions have been applied.
    pub fn stats(&self) -> EmbeddingCacheStats {
        self.cache.run_pending_tasks();
        EmbeddingCacheStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl: self.ttl,
            max_capacity: self.max_capacity,
        }
    }

    /// Evicts expired entries and returns how many entries remain.
    pub fn cleanup_expired(&self) -> u64 {
        self.cache.run_pending_tasks();
        let remaining = self.cache.entry_count();
        info!("event=embedding_cache_cleanup module=oracle status=ok remaining={remaining}");
        remaining
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        info!("event=embedding_cache_clear module=oracle status=ok");
    }
}

impl<G: EmbeddingGenerator> EmbeddingGenerator for CachedEmbeddingGenerator<G> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = (self.inner.model().to_string(), text.to_string());
        if let Some(vector) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = self.inner.embed(text)?;
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }
}
