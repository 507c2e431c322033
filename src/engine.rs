//! Top-level engine — the staged search-then-answer pipeline.
//!
//! Stages: route (classify, optionally refine) -> execute (search +
//! aggregation pushdown) -> answer (cache lookup, then generation on miss).
//! Every external call carries a timeout from the config; the only path
//! that pays LLM cost is a cache miss with a generator configured.

use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::{AggregationEngine, AggregationResult};
use crate::backend::{BackendError, SearchPage, SearchQuery, StorageBackend};
use crate::cache::{answer_cache_key, AnswerCache, CachedAnswer};
use crate::config::EngineConfig;
use crate::ingest::{ingest_document, IngestError, IngestRequest, IngestSummary};
use crate::llm::{
    with_retries, AnswerEvidence, AnswerGenerator, ProviderError, QueryRefiner, RetryPolicy,
    StructuredQuery,
};
use crate::models::SchemaStore;
use crate::query::router::validate_field_names;
use crate::query::{PlanCache, QueryError, QueryIntent, QueryPlan, QueryRouter, RouteState};
use crate::sync::{
    reconcile, FieldCorrection, ReconcileReport, SyncCoordinator, SyncError, VerifyOutcome,
};

/// Result of executing a plan against the backend.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    /// Every matching document, unpaged — the answer-cache key and
    /// aggregation evidence depend on the complete set.
    pub document_ids: Vec<Uuid>,
    pub aggregation: Option<AggregationResult>,
    /// First listing page for UI consumption on filter queries.
    pub listing: Option<SearchPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAnswer {
    pub text: String,
    pub cache_hit: bool,
    pub plan: QueryPlan,
    pub document_ids: Vec<Uuid>,
    pub aggregation: Option<AggregationResult>,
}

pub struct Engine<'a, B, R, G>
where
    B: StorageBackend,
    R: QueryRefiner,
    G: AnswerGenerator,
{
    conn: &'a Connection,
    backend: &'a B,
    schemas: &'a dyn SchemaStore,
    cache: &'a dyn AnswerCache,
    refiner: Option<&'a R>,
    answerer: Option<&'a G>,
    config: &'a EngineConfig,
    plan_cache: PlanCache,
}

impl<'a, B, R, G> Engine<'a, B, R, G>
where
    B: StorageBackend,
    R: QueryRefiner,
    G: AnswerGenerator,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: &'a Connection,
        backend: &'a B,
        schemas: &'a dyn SchemaStore,
        cache: &'a dyn AnswerCache,
        refiner: Option<&'a R>,
        answerer: Option<&'a G>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            conn,
            backend,
            schemas,
            cache,
            refiner,
            answerer,
            config,
            plan_cache: PlanCache::new(),
        }
    }

    /// Ingest one document from the external extraction step.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        ingest_document(self.conn, self.backend, self.schemas, self.config, request).await
    }

    /// Answer a natural-language query end to end.
    pub async fn answer(&self, raw_query: &str) -> Result<EngineAnswer, QueryError> {
        let router =
            QueryRouter::new(self.schemas, self.config).with_plan_cache(&self.plan_cache);
        let plan = router.route(raw_query, self.refiner).await;
        self.answer_plan(plan, raw_query).await
    }

    /// Execute an externally-built structured query under strict validation:
    /// any unknown field name rejects the whole query.
    pub async fn answer_structured(
        &self,
        raw_query: &str,
        structured: StructuredQuery,
    ) -> Result<EngineAnswer, QueryError> {
        validate_field_names(self.schemas, &structured)?;
        let router = QueryRouter::new(self.schemas, self.config);
        let plan = router.plan_structured(raw_query, structured);
        self.answer_plan(plan, raw_query).await
    }

    async fn answer_plan(
        &self,
        mut plan: QueryPlan,
        raw_query: &str,
    ) -> Result<EngineAnswer, QueryError> {
        if plan.not_extracted {
            plan.state = RouteState::Answered;
            return Ok(EngineAnswer {
                text: "This information is not extracted from these documents, so there is \
                       nothing to search or aggregate."
                    .into(),
                cache_hit: false,
                plan,
                document_ids: vec![],
                aggregation: None,
            });
        }

        let execution = self.execute_plan(&plan).await?;
        plan.state = RouteState::Executed;

        let cache_key = answer_cache_key(&plan.normalized_query, &execution.document_ids);
        if let Some(hit) = self.cache.get(&cache_key)? {
            plan.state = RouteState::Answered;
            tracing::debug!(key = %cache_key, "Answer served from cache");
            return Ok(EngineAnswer {
                text: hit.answer_text,
                cache_hit: true,
                plan,
                document_ids: execution.document_ids,
                aggregation: execution.aggregation,
            });
        }

        let text = match self.answerer {
            Some(answerer) => {
                let generated = self
                    .generate_answer(answerer, raw_query, &execution)
                    .await?;
                let now = chrono::Utc::now().naive_utc();
                self.cache.put(CachedAnswer {
                    cache_key,
                    query: plan.normalized_query.clone(),
                    answer_text: generated.answer_text.clone(),
                    model_version: generated.model_version,
                    document_ids: execution.document_ids.clone(),
                    created_at: now,
                    expires_at: now + chrono::Duration::seconds(self.config.cache_ttl_secs as i64),
                })?;
                generated.answer_text
            }
            None => summarize_execution(&plan, &execution),
        };

        plan.state = RouteState::Answered;
        Ok(EngineAnswer {
            text,
            cache_hit: false,
            plan,
            document_ids: execution.document_ids,
            aggregation: execution.aggregation,
        })
    }

    /// Execute the plan's predicate and aggregation against the backend.
    pub async fn execute_plan(&self, plan: &QueryPlan) -> Result<QueryExecution, QueryError> {
        let document_ids = self
            .backend_call(self.backend.search_ids(&plan.predicate))
            .await?;

        let aggregation = match &plan.aggregation {
            Some(spec) => {
                let engine = AggregationEngine::new(self.backend);
                Some(
                    self.backend_call(engine.aggregate(&plan.predicate, spec))
                        .await?,
                )
            }
            None => None,
        };

        let listing = if plan.intent == QueryIntent::Filter {
            Some(
                self.backend_call(self.backend.search(&SearchQuery {
                    predicate: plan.predicate.clone(),
                    rank_fields: plan.target_fields.clone(),
                    page: 0,
                    page_size: self.config.search_page_size,
                }))
                .await?,
            )
        } else {
            None
        };

        Ok(QueryExecution { document_ids, aggregation, listing })
    }

    /// Apply human corrections: store, projection, cache, in that order.
    pub async fn verify_batch(
        &self,
        corrections: Vec<FieldCorrection>,
    ) -> Result<VerifyOutcome, SyncError> {
        SyncCoordinator::new(self.conn, self.backend, self.schemas, self.cache)
            .verify_batch(corrections)
            .await
    }

    /// Run one reconciliation pass inline (the background job calls the
    /// same function on its own thread).
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        reconcile(self.conn, self.backend, self.schemas).await
    }

    async fn backend_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, QueryError> {
        let seconds = self.config.backend_deadline_secs;
        match tokio::time::timeout(Duration::from_secs(seconds), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueryError::BackendTimeout { seconds }),
        }
    }

    async fn generate_answer(
        &self,
        answerer: &G,
        raw_query: &str,
        execution: &QueryExecution,
    ) -> Result<crate::llm::GeneratedAnswer, QueryError> {
        let evidence = AnswerEvidence {
            document_ids: execution.document_ids.clone(),
            aggregation: execution.aggregation.clone(),
        };
        let policy = RetryPolicy::new(
            self.config.provider_retry_attempts,
            self.config.provider_retry_base_ms,
        );
        let seconds = self.config.answer_deadline_secs;
        match tokio::time::timeout(
            Duration::from_secs(seconds),
            with_retries(policy, || answerer.generate_answer(raw_query, &evidence)),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueryError::Provider(ProviderError::Timeout { seconds })),
        }
    }
}

/// Deterministic answer text when no generator is configured. Aggregation
/// numbers come straight from the pushdown result — never recomputed from
/// a listing page.
fn summarize_execution(plan: &QueryPlan, execution: &QueryExecution) -> String {
    match &execution.aggregation {
        Some(AggregationResult::Number(Some(n))) => {
            format!("Result over {} matching documents: {n}", execution.document_ids.len())
        }
        Some(AggregationResult::Number(None)) => format!(
            "No values present for this aggregation across {} matching documents.",
            execution.document_ids.len()
        ),
        Some(AggregationResult::Count(n)) => format!("{n} documents match."),
        Some(AggregationResult::Buckets(buckets)) => {
            let parts: Vec<String> = buckets
                .iter()
                .map(|b| match b.value {
                    Some(v) => format!("{}: {v} ({} docs)", b.key, b.doc_count),
                    None => format!("{}: {} docs", b.key, b.doc_count),
                })
                .collect();
            parts.join("; ")
        }
        None => format!(
            "{} documents match \"{}\".",
            execution.document_ids.len(),
            plan.normalized_query
        ),
    }
}
