use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::field_value::FieldValue;

/// Schema version of the projection format. Bump when the shape changes so
/// reconciliation re-projects entries written by older code.
pub const PROJECTION_VERSION: u32 = 1;

/// Denormalized, query-optimized view of one document.
///
/// Fully derived from the document's ExtractedFields and its TemplateSchema;
/// regenerable at any time, never hand-edited. Every collection is ordered
/// (BTreeMap / sorted Vec) so projecting unchanged input is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexEntry {
    pub document_id: Uuid,
    pub template_id: String,
    /// Current value per field (human correction wins over extraction).
    pub field_values: BTreeMap<String, FieldValue>,
    pub confidence_scores: BTreeMap<String, f32>,
    pub low_confidence_field_names: Vec<String>,
    /// Canonical term -> concrete fields present on this document.
    pub alias_fields: BTreeMap<String, Vec<String>>,
    /// Flattened text for full-text fallback search.
    pub full_text: String,
    pub min_confidence: f32,
    pub max_confidence: f32,
    pub avg_confidence: f32,
    pub unverified_field_count: usize,
    pub projection_version: u32,
}

impl SearchIndexEntry {
    /// Canonical serialized form; equality of these bytes is the idempotence
    /// check used by tests and reconciliation.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("index entry serializes")
    }
}
