//! Content-addressed response cache.
//!
//! Keys are SHA-256 fingerprints over the normalized query text, the sorted
//! capability tags and the knowledge index version, so bumping the index
//! version invalidates every older entry implicitly. Only post-filtered,
//! delivered answers are ever stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::types::{CapabilityTag, MergedAnswer};

/// Time-to-live per capability, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_qa_ttl")]
    pub qa_secs: u64,
    #[serde(default = "default_drug_ttl")]
    pub drug_info_secs: u64,
    #[serde(default = "default_document_ttl")]
    pub document_secs: u64,
    #[serde(default = "default_image_ttl")]
    pub image_secs: u64,
}

fn default_qa_ttl() -> u64 {
    3600
}
fn default_drug_ttl() -> u64 {
    604_800
}
fn default_document_ttl() -> u64 {
    1800
}
fn default_image_ttl() -> u64 {
    1800
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            qa_secs: default_qa_ttl(),
            drug_info_secs: default_drug_ttl(),
            document_secs: default_document_ttl(),
            image_secs: default_image_ttl(),
        }
    }
}

impl TtlConfig {
    pub fn for_capability(&self, tag: CapabilityTag) -> Duration {
        Duration::from_secs(match tag {
            CapabilityTag::Qa => self.qa_secs,
            CapabilityTag::DrugInfo => self.drug_info_secs,
            CapabilityTag::Document => self.document_secs,
            CapabilityTag::Image => self.image_secs,
        })
    }

    /// TTL for an answer spanning `tags`: the shortest of them.
    pub fn for_tags(&self, tags: &[CapabilityTag]) -> Duration {
        tags.iter()
            .map(|t| self.for_capability(*t))
            .min()
            .unwrap_or_else(|| self.for_capability(CapabilityTag::Qa))
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Capacity bound. Expired entries go first, then the oldest.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: TtlConfig::default(),
            max_entries: default_max_entries(),
        }
    }
}

/// A stored answer.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub answer: MergedAnswer,
    pub tags: Vec<CapabilityTag>,
    pub index_version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    hit_count: AtomicU64,
}

impl CacheEntry {
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheMetrics {
    /// Compute the hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lowercase, collapse whitespace, trim surrounding punctuation.
pub fn normalize_query(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

/// Cache key for a query routed to `tags` against index `version`.
pub fn fingerprint(query_text: &str, tags: &[CapabilityTag], version: u64) -> String {
    fingerprint_scoped(query_text, tags, version, None)
}

/// Like [`fingerprint`], with an extra scope for answers built from one
/// user's own documents.
pub fn fingerprint_scoped(
    query_text: &str,
    tags: &[CapabilityTag],
    version: u64,
    scope: Option<&str>,
) -> String {
    let mut sorted = tags.to_vec();
    sorted.sort();
    sorted.dedup();
    let tag_list = sorted
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query_text).as_bytes());
    hasher.update([0x1f]);
    hasher.update(tag_list.as_bytes());
    hasher.update([0x1f]);
    hasher.update(version.to_le_bytes());
    if let Some(scope) = scope {
        hasher.update([0x1f]);
        hasher.update(scope.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Read-mostly answer cache. Concurrent writes to one key are last-writer-wins.
pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<MergedAnswer> {
        self.get_at(key, Utc::now())
    }

    /// Look up `key` as of `now`. Expired entries count as misses.
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<MergedAnswer> {
        if !self.config.enabled {
            return None;
        }
        let found = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
            .filter(|entry| !entry.is_expired_at(now));

        match found {
            Some(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.answer.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an answer. Returns false when caching is disabled.
    pub fn put(
        &self,
        key: String,
        answer: MergedAnswer,
        tags: &[CapabilityTag],
        index_version: u64,
    ) -> bool {
        self.put_at(key, answer, tags, index_version, Utc::now())
    }

    pub fn put_at(
        &self,
        key: String,
        answer: MergedAnswer,
        tags: &[CapabilityTag],
        index_version: u64,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let ttl = self.config.ttl.for_tags(tags);
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            answer,
            tags: tags.to_vec(),
            index_version,
            created_at: now,
            expires_at,
            hit_count: AtomicU64::new(0),
        });

        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        entries.insert(key, entry);
        self.writes.fetch_add(1, Ordering::Relaxed);

        if entries.len() > self.config.max_entries {
            let evicted = Self::enforce_capacity(&mut entries, self.config.max_entries, now);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Response cache over capacity");
        }
        true
    }

    fn enforce_capacity(
        entries: &mut HashMap<String, Arc<CacheEntry>>,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        if entries.len() > max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = entries
                .values()
                .map(|e| (e.created_at, e.key.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
        before - entries.len()
    }

    /// Inspect an entry without counting a hit.
    pub fn entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    /// Drop entries expired as of `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.remove_where(|e| e.is_expired_at(now))
    }

    /// Drop entries built against an index version older than `current_version`.
    pub fn purge_stale(&self, current_version: u64) -> usize {
        self.remove_where(|e| e.index_version < current_version)
    }

    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| !predicate(e));
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
