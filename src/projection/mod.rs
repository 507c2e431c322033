//! Search projection — the derived, query-optimized view of a document.
//!
//! `project()` is a pure function of the document's current fields and its
//! template schema; the indexer's only side effect is writing the result
//! through the storage backend. Reconciliation is therefore always
//! "re-project N documents", never diff/patch logic.

use std::collections::BTreeMap;

use rusqlite::Connection;
use uuid::Uuid;

use crate::backend::{BackendError, StorageBackend};
use crate::db::repository::{get_document, latest_fields_for_document};
use crate::db::DatabaseError;
use crate::models::{
    ExtractedField, SchemaStore, SearchIndexEntry, TemplateSchema, PROJECTION_VERSION,
};

/// Fields below this confidence are surfaced in
/// `low_confidence_field_names` for query-side ranking.
const LOW_CONFIDENCE_CUTOFF: f32 = 0.6;

/// Build the search projection of one document.
///
/// Pure and idempotent: unchanged input produces a byte-identical entry.
/// Every map is a BTreeMap and every list is sorted, so the serialized form
/// is stable across runs.
pub fn project(
    document_id: Uuid,
    schema: &TemplateSchema,
    fields: &[ExtractedField],
) -> SearchIndexEntry {
    let mut field_values = BTreeMap::new();
    let mut confidence_scores = BTreeMap::new();
    let mut low_confidence = Vec::new();
    let mut full_text_parts = Vec::new();
    let mut unverified = 0usize;

    let mut sorted: Vec<&ExtractedField> = fields.iter().collect();
    sorted.sort_by(|a, b| a.field_name.cmp(&b.field_name));

    for field in &sorted {
        field_values.insert(field.field_name.clone(), field.current_value().clone());
        confidence_scores.insert(field.field_name.clone(), field.confidence);
        if field.confidence < LOW_CONFIDENCE_CUTOFF && !field.verified {
            low_confidence.push(field.field_name.clone());
        }
        if !field.verified {
            unverified += 1;
        }
        full_text_parts.push(format!(
            "{}: {}",
            field.field_name,
            field.current_value().display_text()
        ));
    }

    // Canonical terms that resolve to at least one field present here
    let mut alias_fields = BTreeMap::new();
    for term in schema.canonical_map.keys() {
        let present: Vec<String> = schema
            .expand_canonical(term)
            .into_iter()
            .filter(|name| field_values.contains_key(name))
            .collect();
        if !present.is_empty() {
            alias_fields.insert(term.clone(), present);
        }
    }

    let confidences: Vec<f32> = sorted.iter().map(|f| f.confidence).collect();
    let (min_confidence, max_confidence, avg_confidence) = summarize(&confidences);

    SearchIndexEntry {
        document_id,
        template_id: schema.template_id.clone(),
        field_values,
        confidence_scores,
        low_confidence_field_names: low_confidence,
        alias_fields,
        full_text: full_text_parts.join("\n"),
        min_confidence,
        max_confidence,
        avg_confidence,
        unverified_field_count: unverified,
        projection_version: PROJECTION_VERSION,
    }
}

fn summarize(confidences: &[f32]) -> (f32, f32, f32) {
    if confidences.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let min = confidences.iter().copied().fold(f32::INFINITY, f32::min);
    let max = confidences.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let avg = confidences.iter().sum::<f32>() / confidences.len() as f32;
    (min, max, avg)
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),
}

/// Writes projections into the search backend.
pub struct Indexer<'a, B: StorageBackend> {
    backend: &'a B,
    schemas: &'a dyn SchemaStore,
}

impl<'a, B: StorageBackend> Indexer<'a, B> {
    pub fn new(backend: &'a B, schemas: &'a dyn SchemaStore) -> Self {
        Self { backend, schemas }
    }

    /// Re-project one document from its authoritative state and upsert the
    /// result. Safe to call any number of times.
    pub async fn reproject(
        &self,
        conn: &Connection,
        document_id: &Uuid,
    ) -> Result<SearchIndexEntry, ProjectionError> {
        let doc = get_document(conn, document_id)?
            .ok_or(ProjectionError::DocumentNotFound(*document_id))?;
        let schema = self
            .schemas
            .template(&doc.template_id)
            .ok_or_else(|| ProjectionError::UnknownTemplate(doc.template_id.clone()))?;
        let fields = latest_fields_for_document(conn, document_id)?;

        let entry = project(*document_id, &schema, &fields);
        self.backend.upsert(&entry).await?;
        Ok(entry)
    }
}
