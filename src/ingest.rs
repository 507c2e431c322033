//! Ingestion — the entry point the external extraction step calls.
//!
//! Stores the raw parse blocks, resolves a citation for every extracted
//! field, flags low-confidence fields for verification, and projects the
//! document into the search backend.

use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::citation::resolve_citation;
use crate::config::EngineConfig;
use crate::db::repository::{insert_blocks, insert_document, insert_field};
use crate::db::DatabaseError;
use crate::models::{
    BoundingBox, Document, DocumentBlock, ExtractedField, ExtractionMethod, FieldValue,
    SchemaStore, SourceHint,
};
use crate::projection::{Indexer, ProjectionError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),
}

/// One parse chunk as delivered by the parse provider.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub id: String,
    pub page: u32,
    pub text: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

/// One extracted value as delivered by the extraction step.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub field_name: String,
    pub value: FieldValue,
    pub confidence: f32,
    pub method: ExtractionMethod,
    /// Location the extraction step already knows, if any.
    pub source_hint: Option<SourceHint>,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub document_id: Uuid,
    pub template_id: String,
    pub source_name: Option<String>,
    pub blocks: Vec<ParsedBlock>,
    pub fields: Vec<NewExtraction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub fields_stored: usize,
    pub fields_cited: usize,
    pub fields_needing_verification: usize,
}

/// Ingest one document: blocks, fields with citations, projection.
pub async fn ingest_document<B: crate::backend::StorageBackend>(
    conn: &Connection,
    backend: &B,
    schemas: &dyn SchemaStore,
    config: &EngineConfig,
    request: IngestRequest,
) -> Result<IngestSummary, IngestError> {
    if schemas.template(&request.template_id).is_none() {
        return Err(IngestError::UnknownTemplate(request.template_id));
    }

    let now = chrono::Utc::now().naive_utc();
    insert_document(
        conn,
        &Document {
            id: request.document_id,
            template_id: request.template_id.clone(),
            source_name: request.source_name.clone(),
            ingested_at: now,
        },
    )?;

    let blocks: Vec<DocumentBlock> = request
        .blocks
        .iter()
        .map(|b| DocumentBlock {
            id: b.id.clone(),
            document_id: request.document_id,
            page: b.page,
            text_content: b.text.clone(),
            confidence: b.confidence,
            bbox: b.bbox,
        })
        .collect();
    insert_blocks(conn, &blocks)?;

    let mut summary = IngestSummary {
        fields_stored: 0,
        fields_cited: 0,
        fields_needing_verification: 0,
    };

    for extraction in &request.fields {
        let citation = resolve_citation(
            &extraction.value,
            extraction.source_hint.as_ref(),
            &blocks,
            config.context_window_chars,
        );
        if citation.is_some() {
            summary.fields_cited += 1;
        }

        let needs_verification = ExtractedField::compute_needs_verification(
            extraction.confidence,
            false,
            config.verification_threshold,
        );
        if needs_verification {
            summary.fields_needing_verification += 1;
        }

        insert_field(
            conn,
            &ExtractedField {
                id: Uuid::new_v4(),
                document_id: request.document_id,
                field_name: extraction.field_name.clone(),
                value: extraction.value.clone(),
                confidence: extraction.confidence,
                needs_verification,
                verified: false,
                verified_value: None,
                verified_at: None,
                citation,
                extraction_method: extraction.method,
                created_at: now,
            },
        )?;
        summary.fields_stored += 1;
    }

    Indexer::new(backend, schemas)
        .reproject(conn, &request.document_id)
        .await?;

    tracing::info!(
        document_id = %request.document_id,
        fields = summary.fields_stored,
        cited = summary.fields_cited,
        needs_verification = summary.fields_needing_verification,
        "Document ingested"
    );
    Ok(summary)
}
