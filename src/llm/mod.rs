//! LLM refinement/answer provider seam.
//!
//! The engine never builds prompts and never trusts provider output
//! blindly: refined queries come back as structured data whose field names
//! the router validates against the template schema before execution.

pub mod http;

pub use http::HttpLlmProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::aggregation::AggregationResult;
use crate::models::{SchemaStore, TemplateSchema};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Cannot reach provider at {0}")]
    Connection(String),

    #[error("Provider call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to parse provider response: {0}")]
    ResponseParsing(String),
}

impl ProviderError {
    /// Transient failures are worth retrying; malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::ResponseParsing(_) => false,
        }
    }
}

/// Schema summary handed to the refinement provider so it proposes real
/// field names. Whatever comes back is still validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContext {
    pub templates: Vec<TemplateSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub template_id: String,
    pub field_names: Vec<String>,
    pub canonical_terms: Vec<String>,
}

impl SchemaContext {
    pub fn from_store(store: &dyn SchemaStore) -> Self {
        Self {
            templates: store.templates().iter().map(summarize_template).collect(),
        }
    }
}

fn summarize_template(schema: &TemplateSchema) -> TemplateSummary {
    TemplateSummary {
        template_id: schema.template_id.clone(),
        field_names: schema.fields.iter().map(|f| f.name.clone()).collect(),
        canonical_terms: schema.canonical_map.keys().cloned().collect(),
    }
}

/// One filter condition proposed by the provider. Field names are raw
/// strings here on purpose — nothing is resolved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinedClause {
    pub field: String,
    pub op: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinedAggregation {
    pub kind: String,
    pub field: Option<String>,
    pub group_field: Option<String>,
    pub interval: Option<String>,
    pub percentile: Option<f64>,
}

/// Structured query proposed by the refinement provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub intent: String,
    pub target_fields: Vec<String>,
    pub clauses: Vec<RefinedClause>,
    pub aggregation: Option<RefinedAggregation>,
    pub full_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinedQuery {
    pub structured_query: StructuredQuery,
    pub confidence: f32,
    pub explanation: Option<String>,
}

/// Evidence handed to the answer generator: the complete matching set plus
/// the aggregation result when one was computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerEvidence {
    pub document_ids: Vec<Uuid>,
    pub aggregation: Option<AggregationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    pub answer_text: String,
    pub model_version: Option<String>,
}

#[async_trait]
pub trait QueryRefiner: Send + Sync {
    async fn refine_query(
        &self,
        query: &str,
        context: &SchemaContext,
    ) -> Result<RefinedQuery, ProviderError>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(
        &self,
        query: &str,
        evidence: &AnswerEvidence,
    ) -> Result<GeneratedAnswer, ProviderError>;
}

/// Retry policy for transient provider failures: bounded attempts with
/// exponential backoff and jitter. Validation-class errors never retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }
}

/// Run `op` under the retry policy. Non-transient errors return
/// immediately; transient ones back off and retry up to the limit.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let backoff = policy.base_delay * 2u32.saturating_pow(attempt);
                let jitter_ms = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..=policy.base_delay.as_millis() as u64)
                };
                let delay = backoff + Duration::from_millis(jitter_ms);
                tracing::debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Provider call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Mock refiner for testing — returns a configurable structured query.
pub struct MockRefiner {
    pub response: StructuredQuery,
    pub confidence: f32,
}

impl MockRefiner {
    pub fn new(response: StructuredQuery) -> Self {
        Self { response, confidence: 0.9 }
    }
}

#[async_trait]
impl QueryRefiner for MockRefiner {
    async fn refine_query(
        &self,
        _query: &str,
        _context: &SchemaContext,
    ) -> Result<RefinedQuery, ProviderError> {
        Ok(RefinedQuery {
            structured_query: self.response.clone(),
            confidence: self.confidence,
            explanation: None,
        })
    }
}

/// Mock answer generator for testing — echoes a canned answer.
pub struct MockAnswerer {
    pub answer: String,
}

impl MockAnswerer {
    pub fn new(answer: &str) -> Self {
        Self { answer: answer.to_string() }
    }
}

#[async_trait]
impl AnswerGenerator for MockAnswerer {
    async fn generate_answer(
        &self,
        _query: &str,
        _evidence: &AnswerEvidence,
    ) -> Result<GeneratedAnswer, ProviderError> {
        Ok(GeneratedAnswer {
            answer_text: self.answer.clone(),
            model_version: Some("mock-v1".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Connection("localhost".into()).is_transient());
        assert!(ProviderError::Timeout { seconds: 30 }.is_transient());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!ProviderError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!ProviderError::ResponseParsing("bad json".into()).is_transient());
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(RetryPolicy::new(3, 1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Connection("test".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(RetryPolicy::new(5, 1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::ResponseParsing("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(RetryPolicy::new(3, 1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Timeout { seconds: 1 }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn schema_context_lists_fields_and_terms() {
        use crate::models::{FieldDef, FieldKind, StaticSchemaStore};
        use std::collections::BTreeMap;

        let mut canonical = BTreeMap::new();
        canonical.insert("amount".to_string(), vec!["invoice_total".to_string()]);
        let store = StaticSchemaStore::new(vec![TemplateSchema {
            template_id: "invoice".into(),
            fields: vec![FieldDef {
                name: "invoice_total".into(),
                kind: FieldKind::Number,
                search_hints: vec![],
            }],
            canonical_map: canonical,
            not_extracted_terms: vec![],
        }]);

        let context = SchemaContext::from_store(&store);
        assert_eq!(context.templates.len(), 1);
        assert_eq!(context.templates[0].field_names, vec!["invoice_total"]);
        assert_eq!(context.templates[0].canonical_terms, vec!["amount"]);
    }
}
