//! Storage/search backend capability interface.
//!
//! The engine is written against this trait so the concrete backend is
//! swappable; the in-tree implementation is SQLite with FTS5. Listings are
//! paginated; `search_ids` and `aggregate` always cover the complete
//! matching set.

pub mod sqlite;

pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::aggregation::{AggSpec, AggregationResult};
use crate::db::DatabaseError;
use crate::models::{FieldValue, SearchIndexEntry};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Aggregation cannot be pushed down: {reason}")]
    PushdownUnsupported { reason: String },

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),
}

/// Comparison operator in a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
        }
    }
}

/// One filter condition. `fields` is an OR set: the clause matches when any
/// of the listed fields satisfies the comparison — canonical terms expanding
/// to several concrete fields search all of them, never just one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub fields: Vec<String>,
    pub op: FilterOp,
    pub value: FieldValue,
}

/// Conjunction of clauses plus an optional full-text term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<FilterClause>,
    pub full_text: Option<String>,
}

impl Predicate {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.full_text.is_none()
    }
}

/// A paginated listing request. Ranking fields drive per-field-confidence
/// scoring of hits.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub predicate: Predicate,
    pub rank_fields: Vec<String>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: Uuid,
    /// Highest confidence among the matched rank fields.
    pub score: f32,
}

/// One page of a listing. `total` counts the full matching set even though
/// `hits` holds only this page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace the projection of one document.
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), BackendError>;

    async fn get(&self, document_id: &Uuid) -> Result<Option<SearchIndexEntry>, BackendError>;

    async fn remove(&self, document_id: &Uuid) -> Result<(), BackendError>;

    /// Paginated listing for UI consumption.
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, BackendError>;

    /// Every document id matching the predicate, unpaged. Feeds answer-cache
    /// keys and aggregation evidence.
    async fn search_ids(&self, predicate: &Predicate) -> Result<Vec<Uuid>, BackendError>;

    /// Native aggregation over the complete matching set.
    async fn aggregate(
        &self,
        predicate: &Predicate,
        spec: &AggSpec,
    ) -> Result<AggregationResult, BackendError>;
}
