//! Query routing — classification, direct execution vs LLM refinement,
//! and schema validation of externally-proposed field names.

pub mod classify;
pub mod router;
pub mod types;

pub use classify::{classify, normalize_query};
pub use router::QueryRouter;
pub use types::{QueryIntent, QueryPlan, RouteState};

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::CacheError;
use crate::db::DatabaseError;
use crate::llm::ProviderError;

#[derive(Error, Debug)]
pub enum QueryError {
    /// An externally-proposed field name is not in any template schema.
    /// Not retried: the query or schema needs fixing, not the call.
    #[error("Unknown field in query: {field}")]
    SchemaValidation { field: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Backend call timed out after {seconds}s")]
    BackendTimeout { seconds: u64 },

    #[error("No answer generator configured")]
    NoAnswerProvider,
}

/// Guarded cache of refined plans, keyed by normalized query.
///
/// Only plans that went through the LLM refiner are worth keeping — the
/// keyword classifier is cheap to re-run. Safe under concurrent access;
/// injected into the router, never a process-wide singleton.
#[derive(Default)]
pub struct PlanCache {
    entries: Mutex<HashMap<String, QueryPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, normalized_query: &str) -> Option<QueryPlan> {
        self.lock().get(normalized_query).cloned()
    }

    pub fn put(&self, plan: &QueryPlan) {
        if plan.used_llm_refine {
            self.lock()
                .insert(plan.normalized_query.clone(), plan.clone());
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueryPlan>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Predicate;

    fn plan(query: &str, refined: bool) -> QueryPlan {
        QueryPlan {
            raw_query: query.into(),
            normalized_query: query.into(),
            intent: QueryIntent::Filter,
            target_fields: vec![],
            predicate: Predicate::default(),
            aggregation: None,
            parse_confidence: 0.9,
            used_llm_refine: refined,
            not_extracted: false,
            state: RouteState::DirectExecute,
        }
    }

    #[test]
    fn caches_refined_plans_only() {
        let cache = PlanCache::new();
        cache.put(&plan("cheap classified query", false));
        cache.put(&plan("expensive refined query", true));

        assert!(cache.get("cheap classified query").is_none());
        assert!(cache.get("expensive refined query").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = PlanCache::new();
        cache.put(&plan("q", true));
        cache.clear();
        assert!(cache.get("q").is_none());
    }
}
