//! Answer cache — generated answers keyed by query + result set.
//!
//! The key hashes `(normalized_query, sorted result document ids)`, so the
//! same question over a changed matching set is a different entry. The sync
//! coordinator is the only writer of invalidation events. A cache hit is a
//! pure lookup; a miss is the only path that pays LLM cost.

pub mod sqlite;

pub use sqlite::SqliteAnswerCache;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(String),
}

/// Derive the cache key. Document ids are sorted internally, so callers
/// do not need to care about result ordering.
pub fn answer_cache_key(normalized_query: &str, document_ids: &[Uuid]) -> String {
    let mut ids: Vec<String> = document_ids.iter().map(|id| id.to_string()).collect();
    ids.sort();

    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update(b"\n");
    for id in &ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub cache_key: String,
    pub query: String,
    pub answer_text: String,
    pub model_version: Option<String>,
    pub document_ids: Vec<Uuid>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl CachedAnswer {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Explicit cache interface with invalidation hooks; injected as a
/// dependency, never a process-wide singleton.
pub trait AnswerCache: Send + Sync {
    /// Valid (non-expired, non-invalidated) entry for the key, if any.
    fn get(&self, cache_key: &str) -> Result<Option<CachedAnswer>, CacheError>;

    fn put(&self, answer: CachedAnswer) -> Result<(), CacheError>;

    /// Drop every entry whose result set includes any of the documents.
    /// Returns the number of entries invalidated.
    fn invalidate_documents(&self, document_ids: &[Uuid]) -> Result<usize, CacheError>;

    /// Remove expired entries. Returns the number removed.
    fn purge_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError>;
}

/// Guarded in-memory cache for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryAnswerCache {
    entries: Mutex<HashMap<String, CachedAnswer>>,
}

impl MemoryAnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedAnswer>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AnswerCache for MemoryAnswerCache {
    fn get(&self, cache_key: &str) -> Result<Option<CachedAnswer>, CacheError> {
        let now = chrono::Utc::now().naive_utc();
        let entries = self.lock();
        Ok(entries
            .get(cache_key)
            .filter(|a| !a.is_expired(now))
            .cloned())
    }

    fn put(&self, answer: CachedAnswer) -> Result<(), CacheError> {
        self.lock().insert(answer.cache_key.clone(), answer);
        Ok(())
    }

    fn invalidate_documents(&self, document_ids: &[Uuid]) -> Result<usize, CacheError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, a| !a.document_ids.iter().any(|id| document_ids.contains(id)));
        Ok(before - entries.len())
    }

    fn purge_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, a| !a.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn answer(doc_ids: Vec<Uuid>, ttl_secs: i64) -> CachedAnswer {
        let now = chrono::Utc::now().naive_utc();
        CachedAnswer {
            cache_key: answer_cache_key("total for active invoices", &doc_ids),
            query: "total for active invoices".into(),
            answer_text: "The total is $12,500.".into(),
            model_version: Some("answer-70b".into()),
            document_ids: doc_ids,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn key_ignores_document_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            answer_cache_key("q", &[a, b]),
            answer_cache_key("q", &[b, a])
        );
    }

    #[test]
    fn key_changes_with_result_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(answer_cache_key("q", &[a]), answer_cache_key("q", &[a, b]));
        assert_ne!(answer_cache_key("q", &[a]), answer_cache_key("other", &[a]));
    }

    #[test]
    fn hit_after_put() {
        let cache = MemoryAnswerCache::new();
        let a = answer(vec![Uuid::new_v4()], 3600);
        let key = a.cache_key.clone();
        cache.put(a).unwrap();
        assert!(cache.get(&key).unwrap().is_some());
    }

    #[test]
    fn expired_entry_misses() {
        let cache = MemoryAnswerCache::new();
        let a = answer(vec![Uuid::new_v4()], -1);
        let key = a.cache_key.clone();
        cache.put(a).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn invalidation_by_document() {
        let cache = MemoryAnswerCache::new();
        let shared = Uuid::new_v4();
        let a = answer(vec![shared, Uuid::new_v4()], 3600);
        let b = answer(vec![Uuid::new_v4()], 3600);
        let key_a = a.cache_key.clone();
        let key_b = b.cache_key.clone();
        cache.put(a).unwrap();
        cache.put(b).unwrap();

        let invalidated = cache.invalidate_documents(&[shared]).unwrap();
        assert_eq!(invalidated, 1);
        assert!(cache.get(&key_a).unwrap().is_none());
        assert!(cache.get(&key_b).unwrap().is_some());
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = MemoryAnswerCache::new();
        cache.put(answer(vec![Uuid::new_v4()], -1)).unwrap();
        cache.put(answer(vec![Uuid::new_v4()], 3600)).unwrap();

        let now = chrono::Utc::now().naive_utc();
        assert_eq!(cache.purge_expired(now).unwrap(), 1);
    }
}
