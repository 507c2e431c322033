use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::VerificationAction;
use super::field_value::FieldValue;

/// One human verification decision. Append-only: corrections create new
/// records, history is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub field_id: Uuid,
    pub document_id: Uuid,
    pub original_value: FieldValue,
    pub corrected_value: Option<FieldValue>,
    pub action: VerificationAction,
    pub verifier: String,
    pub created_at: NaiveDateTime,
}
