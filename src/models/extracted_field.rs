use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::block::BoundingBox;
use super::enums::ExtractionMethod;
use super::field_value::FieldValue;

/// Where an extracted value came from in the source document.
///
/// Absence of a citation is a valid state (`ExtractedField.citation == None`);
/// a citation is never fabricated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_page: u32,
    pub source_bbox: Option<BoundingBox>,
    /// Literal substring of a block belonging to the same document.
    pub source_text: String,
    pub context_before: String,
    pub context_after: String,
    /// True when the value appears verbatim; false for a normalized match.
    pub is_exact_match: bool,
}

/// Authoritative record of one machine-extracted field value.
///
/// Created by ingestion, mutated only by verification. Never deleted —
/// a re-extraction supersedes it with a newer record for the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedField {
    pub id: Uuid,
    pub document_id: Uuid,
    pub field_name: String,
    pub value: FieldValue,
    pub confidence: f32,
    pub needs_verification: bool,
    pub verified: bool,
    pub verified_value: Option<FieldValue>,
    pub verified_at: Option<NaiveDateTime>,
    pub citation: Option<Citation>,
    pub extraction_method: ExtractionMethod,
    pub created_at: NaiveDateTime,
}

impl ExtractedField {
    /// The value downstream consumers should use: the human correction when
    /// one exists, the extracted value otherwise.
    pub fn current_value(&self) -> &FieldValue {
        if self.verified {
            self.verified_value.as_ref().unwrap_or(&self.value)
        } else {
            &self.value
        }
    }

    /// Whether this field still needs a human look, given the configured
    /// confidence threshold.
    pub fn compute_needs_verification(confidence: f32, verified: bool, threshold: f32) -> bool {
        !verified && confidence < threshold
    }
}
