use serde::{Deserialize, Serialize};

use crate::aggregation::AggSpec;
use crate::backend::Predicate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Filter,
    Aggregation,
    Hybrid,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Aggregation => "aggregation",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Router state machine:
/// Received -> IntentClassified -> {DirectExecute | LlmRefine} -> Executed -> Answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Received,
    IntentClassified,
    DirectExecute,
    LlmRefine,
    Executed,
    Answered,
}

/// Transient execution plan for one query. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub raw_query: String,
    pub normalized_query: String,
    pub intent: QueryIntent,
    /// Concrete fields the query is about, after canonical/hint resolution.
    pub target_fields: Vec<String>,
    pub predicate: Predicate,
    pub aggregation: Option<AggSpec>,
    pub parse_confidence: f32,
    pub used_llm_refine: bool,
    /// The query asks about a concept the template explicitly does not
    /// extract; answerable without touching the backend.
    pub not_extracted: bool,
    pub state: RouteState,
}

impl QueryPlan {
    /// Aggregations the backend can push down without refinement help.
    /// Nested group-then-aggregate goes through the refine path.
    pub fn has_simple_aggregation(&self) -> bool {
        match &self.aggregation {
            None => false,
            Some(AggSpec::GroupBy { .. }) => false,
            Some(_) => true,
        }
    }
}
