use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box of a text region in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Coordinate-wise comparison with a small tolerance; parse providers
    /// round differently between runs.
    pub fn approx_eq(&self, other: &BoundingBox) -> bool {
        const EPS: f32 = 0.5;
        (self.x - other.x).abs() < EPS
            && (self.y - other.y).abs() < EPS
            && (self.width - other.width).abs() < EPS
            && (self.height - other.height).abs() < EPS
    }
}

/// A raw parse chunk from the parse provider.
///
/// Immutable once created from a parse result; consumed only by the
/// citation resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBlock {
    /// Provider-assigned block id, opaque to the engine.
    pub id: String,
    pub document_id: Uuid,
    pub page: u32,
    pub text_content: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

/// Page + bounding box supplied by the extraction step alongside a value,
/// when it already knows where the value came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceHint {
    pub page: u32,
    pub bbox: BoundingBox,
}
