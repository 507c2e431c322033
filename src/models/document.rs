use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document registered with the engine by the external extraction step.
///
/// The engine stores no file content — only the template binding and the
/// extracted state hanging off this id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub template_id: String,
    pub source_name: Option<String>,
    pub ingested_at: NaiveDateTime,
}
