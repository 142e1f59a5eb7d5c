//! Bounded TTL cache of ranked result sets.
//!
//! Keys are [`QuerySignature`]s; values are shared, immutable result sets.
//! Capacity is bounded by entry count with least-recently-used eviction, and
//! every entry carries its own time-to-live. A disabled cache never stores
//! anything, so callers see identical answers either way.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::models::{RankedResult, SearchFilters};

/// Normalized identity of a query: whitespace-collapsed text, canonical
/// filters, live flag and requested result count.
///
/// Text case is kept, since embedding models are case-sensitive and the
/// engine embeds [`QuerySignature::text`] itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    text: String,
    filters: SearchFilters,
    include_live: bool,
    top_k: usize,
}

impl QuerySignature {
    pub fn new(text: &str, filters: &SearchFilters, include_live: bool, top_k: usize) -> Self {
        Self {
            text: text
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
            filters: filters.canonical(),
            include_live,
            top_k,
        }
    }

    /// The whitespace-collapsed query text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Clone)]
struct CachedEntry {
    results: Arc<Vec<RankedResult>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<QuerySignature, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &QuerySignature,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &QuerySignature,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Hit/miss counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub entries: u64,
}

pub struct ResultCache {
    inner: Option<Cache<QuerySignature, CachedEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(PerEntryTtl)
            .build();
        tracing::debug!(max_entries, ttl_secs = default_ttl.as_secs(), "result cache initialized");
        Self {
            inner: Some(inner),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
        }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            default_ttl: Duration::ZERO,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, signature: &QuerySignature) -> Option<Arc<Vec<RankedResult>>> {
        let inner = self.inner.as_ref()?;
        match inner.get(signature) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.results)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `results` under `signature` for `ttl`. A zero TTL stores nothing.
    pub fn put(&self, signature: QuerySignature, results: Arc<Vec<RankedResult>>, ttl: Duration) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if ttl.is_zero() {
            return;
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);
        inner.insert(signature, CachedEntry { results, ttl });
    }

    pub fn invalidate(&self, signature: &QuerySignature) {
        if let Some(inner) = self.inner.as_ref() {
            inner.invalidate(signature);
        }
    }

    pub fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.invalidate_all();
            inner.run_pending_tasks();
        }
    }

    /// Apply pending evictions and expirations now.
    pub fn run_pending_tasks(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.run_pending_tasks();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            entries: self.inner.as_ref().map_or(0, |c| c.entry_count()),
        }
    }
}
