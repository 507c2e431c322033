//! Query router — direct execution vs LLM refinement.
//!
//! Decision rule: confident filter/simple-aggregation plans execute
//! directly against the backend (no provider cost). Everything else goes to
//! the refinement provider under a hard deadline; on timeout or provider
//! failure the router falls back to the best-available classification
//! instead of hanging the request. Field names proposed by the provider are
//! validated against the schema — unknown names are dropped to full-text,
//! never executed blindly.

use std::time::Duration;

use chrono::NaiveDate;

use super::classify::classify;
use super::types::{QueryIntent, QueryPlan, RouteState};
use super::QueryError;
use crate::aggregation::{AggSpec, CalendarInterval};
use crate::backend::{FilterClause, FilterOp, Predicate};
use crate::config::EngineConfig;
use crate::llm::{
    with_retries, QueryRefiner, RefinedClause, RefinedQuery, RetryPolicy, SchemaContext,
    StructuredQuery,
};
use crate::models::{FieldKind, FieldValue, SchemaStore, TemplateSchema};

pub struct QueryRouter<'a> {
    schemas: &'a dyn SchemaStore,
    config: &'a EngineConfig,
    plan_cache: Option<&'a super::PlanCache>,
}

impl<'a> QueryRouter<'a> {
    pub fn new(schemas: &'a dyn SchemaStore, config: &'a EngineConfig) -> Self {
        Self { schemas, config, plan_cache: None }
    }

    /// Reuse refined plans for repeated queries instead of paying the
    /// provider again.
    pub fn with_plan_cache(mut self, cache: &'a super::PlanCache) -> Self {
        self.plan_cache = Some(cache);
        self
    }

    /// Route a raw query to an executable plan. Never fails: refinement
    /// problems degrade to the classified plan, and unparseable queries
    /// degrade to full-text search.
    pub async fn route<R: QueryRefiner>(
        &self,
        raw_query: &str,
        refiner: Option<&R>,
    ) -> QueryPlan {
        let templates = self.schemas.templates();
        let mut plan = classify(raw_query, &templates);
        plan.state = RouteState::IntentClassified;

        if self.executes_directly(&plan) {
            plan.state = RouteState::DirectExecute;
            tracing::debug!(
                intent = plan.intent.as_str(),
                confidence = plan.parse_confidence,
                "Query executes directly"
            );
            return plan;
        }

        if let Some(cached) = self
            .plan_cache
            .and_then(|c| c.get(&plan.normalized_query))
        {
            tracing::debug!("Refined plan served from plan cache");
            return cached;
        }

        let Some(refiner) = refiner else {
            tracing::debug!("No refiner configured; falling back to direct execution");
            plan.state = RouteState::DirectExecute;
            return plan;
        };

        plan.state = RouteState::LlmRefine;
        let context = SchemaContext::from_store(self.schemas);
        let policy = RetryPolicy::new(
            self.config.provider_retry_attempts,
            self.config.provider_retry_base_ms,
        );
        let deadline = Duration::from_secs(self.config.llm_deadline_secs);

        let refined = tokio::time::timeout(
            deadline,
            with_retries(policy, || refiner.refine_query(raw_query, &context)),
        )
        .await;

        match refined {
            Ok(Ok(refined)) => {
                let plan = self.merge_refined(plan, refined, &templates);
                tracing::debug!(confidence = plan.parse_confidence, "Query refined by provider");
                if let Some(cache) = self.plan_cache {
                    cache.put(&plan);
                }
                plan
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Refinement failed; falling back to direct execution");
                plan.state = RouteState::DirectExecute;
                plan
            }
            Err(_) => {
                tracing::warn!(
                    deadline_secs = self.config.llm_deadline_secs,
                    "Refinement deadline exceeded; falling back to direct execution"
                );
                plan.state = RouteState::DirectExecute;
                plan
            }
        }
    }

    /// Build an executable plan from an externally-supplied structured
    /// query. Field names must already be validated by the caller
    /// (`validate_field_names`); resolution still goes through the same
    /// canonical machinery as refined queries.
    pub fn plan_structured(&self, raw_query: &str, structured: StructuredQuery) -> QueryPlan {
        let templates = self.schemas.templates();
        let mut plan = classify(raw_query, &templates);
        plan.state = RouteState::IntentClassified;
        plan = self.merge_refined(
            plan,
            RefinedQuery {
                structured_query: structured,
                confidence: 1.0,
                explanation: None,
            },
            &templates,
        );
        plan.used_llm_refine = false;
        plan
    }

    fn executes_directly(&self, plan: &QueryPlan) -> bool {
        if plan.not_extracted {
            return true;
        }
        if plan.parse_confidence < self.config.direct_execute_threshold {
            return false;
        }
        match plan.intent {
            QueryIntent::Filter => true,
            QueryIntent::Aggregation | QueryIntent::Hybrid => plan.has_simple_aggregation(),
        }
    }

    /// Fold the provider's structured query into the plan, validating every
    /// proposed field name. Unknown names are remapped through canonical
    /// aliases when possible, otherwise dropped to the full-text term.
    fn merge_refined(
        &self,
        mut plan: QueryPlan,
        refined: RefinedQuery,
        templates: &[TemplateSchema],
    ) -> QueryPlan {
        let sq = refined.structured_query;
        let mut downgraded_terms: Vec<String> = Vec::new();

        let mut clauses = Vec::new();
        for clause in &sq.clauses {
            match self.validate_clause(clause, templates) {
                Some(valid) => clauses.push(valid),
                None => {
                    tracing::warn!(
                        field = %clause.field,
                        "Provider proposed unknown field; downgrading to full-text"
                    );
                    downgraded_terms.push(clause.field.clone());
                    if let Some(text) = clause.value.as_str() {
                        downgraded_terms.push(text.to_string());
                    }
                }
            }
        }

        let mut target_fields = Vec::new();
        for name in &sq.target_fields {
            let resolved = resolve_across(templates, name);
            if resolved.is_empty() {
                tracing::warn!(field = %name, "Provider proposed unknown target field; ignored");
                downgraded_terms.push(name.clone());
            } else {
                target_fields.extend(resolved);
            }
        }
        target_fields.sort();
        target_fields.dedup();

        let aggregation = sq
            .aggregation
            .as_ref()
            .and_then(|agg| self.validate_aggregation(agg, templates));

        let full_text = match (&sq.full_text, downgraded_terms.is_empty()) {
            (Some(text), true) => Some(text.clone()),
            (Some(text), false) => {
                Some(format!("{text} {}", downgraded_terms.join(" ")))
            }
            (None, false) => Some(downgraded_terms.join(" ")),
            (None, true) => None,
        };

        // Keep the classifier's plan when validation stripped the
        // refinement down to nothing
        if clauses.is_empty() && aggregation.is_none() && target_fields.is_empty() {
            if let Some(text) = full_text {
                plan.predicate.full_text = match plan.predicate.full_text.take() {
                    Some(existing) => Some(format!("{existing} {text}")),
                    None => Some(text),
                };
            }
            plan.used_llm_refine = true;
            plan.state = RouteState::DirectExecute;
            return plan;
        }

        let intent = match (&aggregation, clauses.is_empty() && full_text.is_none()) {
            (Some(_), true) => QueryIntent::Aggregation,
            (Some(_), false) => QueryIntent::Hybrid,
            (None, _) => QueryIntent::Filter,
        };

        plan.intent = intent;
        plan.target_fields = target_fields;
        plan.predicate = Predicate { clauses, full_text };
        plan.aggregation = aggregation;
        plan.parse_confidence = refined.confidence.clamp(0.0, 1.0);
        plan.used_llm_refine = true;
        plan.state = RouteState::DirectExecute;
        plan
    }

    fn validate_clause(
        &self,
        clause: &RefinedClause,
        templates: &[TemplateSchema],
    ) -> Option<FilterClause> {
        let fields = resolve_across(templates, &clause.field);
        if fields.is_empty() {
            return None;
        }

        let op = parse_op(&clause.op)?;
        let kind = templates
            .iter()
            .find_map(|t| t.field(&fields[0]).map(|f| f.kind))
            .unwrap_or(FieldKind::Text);
        let value = json_value_to_field(&clause.value, kind)?;
        Some(FilterClause { fields, op, value })
    }

    fn validate_aggregation(
        &self,
        agg: &crate::llm::RefinedAggregation,
        templates: &[TemplateSchema],
    ) -> Option<AggSpec> {
        let field = agg.field.as_deref().map(|f| {
            let resolved = resolve_across(templates, f);
            resolved.first().cloned()
        });
        let field = match field {
            Some(None) => {
                tracing::warn!(field = ?agg.field, "Provider proposed unknown aggregation field; ignored");
                return None;
            }
            Some(Some(f)) => Some(f),
            None => None,
        };

        match agg.kind.as_str() {
            "count" => Some(AggSpec::Count),
            "sum" => Some(AggSpec::Sum { field: field? }),
            "avg" | "average" => Some(AggSpec::Avg { field: field? }),
            "min" => Some(AggSpec::Min { field: field? }),
            "max" => Some(AggSpec::Max { field: field? }),
            "percentile" => Some(AggSpec::Percentile {
                field: field?,
                percentile: agg.percentile?,
            }),
            "terms" | "group_by" if agg.group_field.is_some() || field.is_some() => {
                let group = match &agg.group_field {
                    Some(g) => resolve_across(templates, g).first().cloned()?,
                    None => field.clone()?,
                };
                Some(AggSpec::Terms { field: group })
            }
            "date_histogram" => {
                let interval = match agg.interval.as_deref() {
                    Some("day") => CalendarInterval::Day,
                    Some("week") => CalendarInterval::Week,
                    Some("month") | None => CalendarInterval::Month,
                    Some("year") => CalendarInterval::Year,
                    Some(other) => {
                        tracing::warn!(interval = other, "Unknown histogram interval; ignored");
                        return None;
                    }
                };
                Some(AggSpec::DateHistogram { field: field?, interval })
            }
            other => {
                tracing::warn!(kind = other, "Unknown aggregation kind from provider; ignored");
                None
            }
        }
    }
}

/// Strict validation for callers executing an externally-built structured
/// query: every field must exist, or the whole query is rejected.
pub fn validate_field_names(
    schemas: &dyn SchemaStore,
    query: &StructuredQuery,
) -> Result<(), QueryError> {
    let templates = schemas.templates();
    let all_names = query
        .target_fields
        .iter()
        .chain(query.clauses.iter().map(|c| &c.field))
        .chain(query.aggregation.iter().filter_map(|a| a.field.as_ref()))
        .chain(query.aggregation.iter().filter_map(|a| a.group_field.as_ref()));

    for name in all_names {
        if resolve_across(&templates, name).is_empty() {
            return Err(QueryError::SchemaValidation { field: name.clone() });
        }
    }
    Ok(())
}

fn resolve_across(templates: &[TemplateSchema], term: &str) -> Vec<String> {
    let mut fields: Vec<String> = templates.iter().flat_map(|t| t.resolve_term(term)).collect();
    fields.sort();
    fields.dedup();
    fields
}

fn parse_op(op: &str) -> Option<FilterOp> {
    Some(match op {
        "eq" | "=" | "==" => FilterOp::Eq,
        "ne" | "!=" => FilterOp::Ne,
        "gt" | ">" => FilterOp::Gt,
        "gte" | ">=" => FilterOp::Gte,
        "lt" | "<" => FilterOp::Lt,
        "lte" | "<=" => FilterOp::Lte,
        "contains" => FilterOp::Contains,
        _ => return None,
    })
}

fn json_value_to_field(value: &serde_json::Value, kind: FieldKind) -> Option<FieldValue> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
        serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        serde_json::Value::String(s) => Some(match kind {
            FieldKind::Number => crate::models::parse_amount(s).map(FieldValue::Number)?,
            FieldKind::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(FieldValue::Date)
                .unwrap_or_else(|_| FieldValue::Text(s.clone())),
            _ => FieldValue::Text(s.clone()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockRefiner, RefinedAggregation};
    use crate::models::{FieldDef, StaticSchemaStore};
    use std::collections::BTreeMap;

    fn store() -> StaticSchemaStore {
        let mut canonical = BTreeMap::new();
        canonical.insert(
            "amount".to_string(),
            vec!["invoice_total".to_string()],
        );
        StaticSchemaStore::new(vec![TemplateSchema {
            template_id: "invoice".into(),
            fields: vec![
                FieldDef {
                    name: "invoice_total".into(),
                    kind: FieldKind::Number,
                    search_hints: vec!["total".into()],
                },
                FieldDef {
                    name: "status".into(),
                    kind: FieldKind::Text,
                    search_hints: vec![],
                },
            ],
            canonical_map: canonical,
            not_extracted_terms: vec![],
        }])
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[tokio::test]
    async fn confident_query_skips_refiner() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        // A refiner that would change everything — must not be consulted
        let refiner = MockRefiner::new(StructuredQuery {
            intent: "filter".into(),
            target_fields: vec!["status".into()],
            clauses: vec![],
            aggregation: None,
            full_text: Some("should not appear".into()),
        });

        let plan = router
            .route("sum of invoice_total where status=paid", Some(&refiner))
            .await;
        assert!(!plan.used_llm_refine);
        assert_eq!(plan.state, RouteState::DirectExecute);
        assert_eq!(plan.aggregation, Some(AggSpec::Sum { field: "invoice_total".into() }));
    }

    #[tokio::test]
    async fn vague_query_uses_refiner() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        let refiner = MockRefiner::new(StructuredQuery {
            intent: "filter".into(),
            target_fields: vec!["invoice_total".into()],
            clauses: vec![RefinedClause {
                field: "status".into(),
                op: "eq".into(),
                value: serde_json::json!("overdue"),
            }],
            aggregation: None,
            full_text: None,
        });

        let plan = router.route("which ones are late again", Some(&refiner)).await;
        assert!(plan.used_llm_refine);
        assert_eq!(plan.predicate.clauses.len(), 1);
        assert_eq!(plan.predicate.clauses[0].fields, vec!["status"]);
    }

    #[tokio::test]
    async fn unknown_provider_field_downgrades_to_full_text() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        // Scenario: provider invents "amount_total"; the schema has
        // invoice_total. The clause must not execute blindly.
        let refiner = MockRefiner::new(StructuredQuery {
            intent: "filter".into(),
            target_fields: vec![],
            clauses: vec![RefinedClause {
                field: "amount_total".into(),
                op: "gt".into(),
                value: serde_json::json!(100),
            }],
            aggregation: None,
            full_text: None,
        });

        let plan = router.route("big invoices maybe", Some(&refiner)).await;
        assert!(plan.used_llm_refine);
        assert!(plan.predicate.clauses.is_empty());
        let full_text = plan.predicate.full_text.expect("downgraded to full-text");
        assert!(full_text.contains("amount_total"));
    }

    #[tokio::test]
    async fn canonical_remap_rescues_known_category() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        // "amount" is a canonical category, so the clause survives remapped
        let refiner = MockRefiner::new(StructuredQuery {
            intent: "filter".into(),
            target_fields: vec![],
            clauses: vec![RefinedClause {
                field: "amount".into(),
                op: "gte".into(),
                value: serde_json::json!(250),
            }],
            aggregation: None,
            full_text: None,
        });

        let plan = router.route("only the really big ones", Some(&refiner)).await;
        assert_eq!(plan.predicate.clauses.len(), 1);
        assert_eq!(plan.predicate.clauses[0].fields, vec!["invoice_total"]);
        assert_eq!(plan.predicate.clauses[0].op, FilterOp::Gte);
    }

    #[tokio::test]
    async fn no_refiner_falls_back_to_direct() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        let plan = router
            .route::<MockRefiner>("something vague about vendors", None)
            .await;
        assert_eq!(plan.state, RouteState::DirectExecute);
        assert!(!plan.used_llm_refine);
        assert!(plan.predicate.full_text.is_some());
    }

    #[tokio::test]
    async fn refiner_timeout_falls_back() {
        struct SlowRefiner;

        #[async_trait::async_trait]
        impl QueryRefiner for SlowRefiner {
            async fn refine_query(
                &self,
                _query: &str,
                _context: &SchemaContext,
            ) -> Result<RefinedQuery, crate::llm::ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let store = store();
        let mut config = config();
        config.llm_deadline_secs = 0; // elapse immediately
        let router = QueryRouter::new(&store, &config);

        let plan = router.route("something vague", Some(&SlowRefiner)).await;
        assert_eq!(plan.state, RouteState::DirectExecute);
        assert!(!plan.used_llm_refine);
    }

    #[tokio::test]
    async fn refined_aggregation_is_validated() {
        let store = store();
        let config = config();
        let router = QueryRouter::new(&store, &config);

        let refiner = MockRefiner::new(StructuredQuery {
            intent: "aggregation".into(),
            target_fields: vec![],
            clauses: vec![],
            aggregation: Some(RefinedAggregation {
                kind: "sum".into(),
                field: Some("made_up_field".into()),
                group_field: None,
                interval: None,
                percentile: None,
            }),
            full_text: Some("totals".into()),
        });

        let plan = router.route("gimme the totals please", Some(&refiner)).await;
        // Unknown aggregation field rejected; plan degrades, result is not garbage
        assert!(plan.aggregation.is_none() || plan.aggregation == Some(AggSpec::Count));
    }

    #[tokio::test]
    async fn plan_cache_skips_repeat_refinement() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingRefiner {
            calls: AtomicU32,
        }

        #[async_trait::async_trait]
        impl QueryRefiner for CountingRefiner {
            async fn refine_query(
                &self,
                _query: &str,
                _context: &SchemaContext,
            ) -> Result<RefinedQuery, crate::llm::ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(RefinedQuery {
                    structured_query: StructuredQuery {
                        intent: "filter".into(),
                        target_fields: vec!["invoice_total".into()],
                        clauses: vec![],
                        aggregation: None,
                        full_text: None,
                    },
                    confidence: 0.9,
                    explanation: None,
                })
            }
        }

        let store = store();
        let config = config();
        let plan_cache = super::super::PlanCache::new();
        let router = QueryRouter::new(&store, &config).with_plan_cache(&plan_cache);
        let refiner = CountingRefiner { calls: AtomicU32::new(0) };

        let first = router.route("something vague about money", Some(&refiner)).await;
        let second = router.route("something vague about money", Some(&refiner)).await;

        assert_eq!(refiner.calls.load(Ordering::SeqCst), 1);
        assert!(first.used_llm_refine);
        assert!(second.used_llm_refine);
        assert_eq!(first.target_fields, second.target_fields);
    }

    #[test]
    fn strict_validation_rejects_unknown_names() {
        let store = store();
        let query = StructuredQuery {
            intent: "filter".into(),
            target_fields: vec!["amount_total".into()],
            clauses: vec![],
            aggregation: None,
            full_text: None,
        };
        let err = validate_field_names(&store, &query).unwrap_err();
        assert!(matches!(err, QueryError::SchemaValidation { field } if field == "amount_total"));
    }

    #[test]
    fn strict_validation_accepts_canonical_terms() {
        let store = store();
        let query = StructuredQuery {
            intent: "filter".into(),
            target_fields: vec!["amount".into()],
            clauses: vec![],
            aggregation: None,
            full_text: None,
        };
        assert!(validate_field_names(&store, &query).is_ok());
    }
}
