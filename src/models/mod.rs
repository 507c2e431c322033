pub mod block;
pub mod document;
pub mod enums;
pub mod extracted_field;
pub mod field_value;
pub mod index_entry;
pub mod schema;
pub mod verification;

pub use block::{BoundingBox, DocumentBlock, SourceHint};
pub use document::Document;
pub use enums::{ExtractionMethod, FieldKind, VerificationAction};
pub use extracted_field::{Citation, ExtractedField};
pub use field_value::{parse_amount, FieldValue};
pub use index_entry::{SearchIndexEntry, PROJECTION_VERSION};
pub use schema::{FieldDef, SchemaStore, StaticSchemaStore, TemplateSchema};
pub use verification::VerificationRecord;
