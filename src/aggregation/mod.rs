//! Aggregation engine — pushdown-only computation over complete matching
//! sets.
//!
//! Every aggregation executes inside the storage backend's native facility
//! over all documents satisfying the predicate. Nothing here ever iterates a
//! page-limited listing; a combination the backend cannot push down is an
//! explicit `PushdownUnsupported` error, not an approximation.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Predicate, StorageBackend};

/// Calendar bucketing for date histograms. Buckets follow the UTC calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarInterval {
    Day,
    Week,
    Month,
    Year,
}

impl CalendarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// What to compute over the matching set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggSpec {
    Sum { field: String },
    Avg { field: String },
    Count,
    Min { field: String },
    Max { field: String },
    /// Nearest-rank percentile over values sorted ascending.
    Percentile { field: String, percentile: f64 },
    /// Group documents by a field's text value.
    Terms { field: String },
    DateHistogram { field: String, interval: CalendarInterval },
    /// Group by one field, compute a metric per group.
    GroupBy { group_field: String, inner: Box<AggSpec> },
}

impl AggSpec {
    /// True for the single-number metrics that may appear inside a GroupBy.
    pub fn is_metric(&self) -> bool {
        matches!(
            self,
            Self::Sum { .. }
                | Self::Avg { .. }
                | Self::Count
                | Self::Min { .. }
                | Self::Max { .. }
        )
    }

    /// Short name for logs and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Sum { .. } => "sum",
            Self::Avg { .. } => "avg",
            Self::Count => "count",
            Self::Min { .. } => "min",
            Self::Max { .. } => "max",
            Self::Percentile { .. } => "percentile",
            Self::Terms { .. } => "terms",
            Self::DateHistogram { .. } => "date_histogram",
            Self::GroupBy { .. } => "group_by",
        }
    }
}

/// One bucket of a terms / date-histogram / group-by result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggBucket {
    pub key: String,
    pub doc_count: u64,
    /// Inner metric value for group-then-aggregate; None for plain buckets.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AggregationResult {
    Number(Option<f64>),
    Count(u64),
    Buckets(Vec<AggBucket>),
}

/// Validates specs and delegates to the backend's native aggregation.
pub struct AggregationEngine<'a, B: StorageBackend> {
    backend: &'a B,
}

impl<'a, B: StorageBackend> AggregationEngine<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    pub async fn aggregate(
        &self,
        predicate: &Predicate,
        spec: &AggSpec,
    ) -> Result<AggregationResult, BackendError> {
        validate_spec(spec)?;
        let result = self.backend.aggregate(predicate, spec).await?;
        tracing::debug!(kind = spec.kind_name(), "Aggregation pushed down");
        Ok(result)
    }
}

/// Reject malformed specs before they reach any backend.
pub fn validate_spec(spec: &AggSpec) -> Result<(), BackendError> {
    match spec {
        AggSpec::Percentile { percentile, .. } => {
            if !(0.0..=100.0).contains(percentile) {
                return Err(BackendError::PushdownUnsupported {
                    reason: format!("percentile {percentile} outside [0, 100]"),
                });
            }
            Ok(())
        }
        AggSpec::GroupBy { inner, .. } => {
            if !inner.is_metric() {
                return Err(BackendError::PushdownUnsupported {
                    reason: format!(
                        "group_by supports metric inner aggregations only, got {}",
                        inner.kind_name()
                    ),
                });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
