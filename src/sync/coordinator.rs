//! Applies human corrections across store, projection, and cache.

use rusqlite::Connection;
use uuid::Uuid;

use super::SyncError;
use crate::backend::StorageBackend;
use crate::cache::AnswerCache;
use crate::db::repository::{
    append_verification_record, apply_verification, get_field,
};
use crate::models::{FieldValue, SchemaStore, VerificationAction, VerificationRecord};
use crate::projection::Indexer;

/// One correction from a human verifier.
#[derive(Debug, Clone)]
pub struct FieldCorrection {
    pub field_id: Uuid,
    pub action: VerificationAction,
    /// Replacement value; None confirms or strikes the extracted value
    /// depending on the action.
    pub corrected_value: Option<FieldValue>,
    pub verifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub fields_verified: usize,
    pub documents_reprojected: usize,
    pub cache_entries_invalidated: usize,
}

pub struct SyncCoordinator<'a, B: StorageBackend> {
    conn: &'a Connection,
    backend: &'a B,
    schemas: &'a dyn SchemaStore,
    cache: &'a dyn AnswerCache,
}

impl<'a, B: StorageBackend> SyncCoordinator<'a, B> {
    pub fn new(
        conn: &'a Connection,
        backend: &'a B,
        schemas: &'a dyn SchemaStore,
        cache: &'a dyn AnswerCache,
    ) -> Self {
        Self { conn, backend, schemas, cache }
    }

    /// Verify a single field. Equivalent to a batch of one.
    pub async fn verify_field(&self, correction: FieldCorrection) -> Result<VerifyOutcome, SyncError> {
        self.verify_batch(vec![correction]).await
    }

    /// Apply a batch of corrections as one coordinated operation.
    ///
    /// Corrections are grouped by document and applied in receipt order
    /// within each document. Every affected document is re-projected exactly
    /// once, and the cache is invalidated once at the end — not per field.
    pub async fn verify_batch(
        &self,
        corrections: Vec<FieldCorrection>,
    ) -> Result<VerifyOutcome, SyncError> {
        // Group by document, preserving receipt order both across groups
        // and within each group.
        let mut by_document: Vec<(Uuid, Vec<FieldCorrection>)> = Vec::new();
        for correction in corrections {
            let field = get_field(self.conn, &correction.field_id)?
                .ok_or(SyncError::FieldNotFound(correction.field_id))?;
            match by_document.iter_mut().find(|(id, _)| *id == field.document_id) {
                Some((_, group)) => group.push(correction),
                None => by_document.push((field.document_id, vec![correction])),
            }
        }

        let mut fields_verified = 0usize;
        let indexer = Indexer::new(self.backend, self.schemas);

        for (document_id, group) in &by_document {
            for correction in group {
                self.apply_one(*document_id, correction)?;
                fields_verified += 1;
            }
            // One re-projection per document regardless of field count
            indexer.reproject(self.conn, document_id).await?;
        }

        let document_ids: Vec<Uuid> = by_document.iter().map(|(id, _)| *id).collect();
        let cache_entries_invalidated = self.cache.invalidate_documents(&document_ids)?;

        tracing::info!(
            fields = fields_verified,
            documents = document_ids.len(),
            cache_invalidated = cache_entries_invalidated,
            "Verification batch applied"
        );

        Ok(VerifyOutcome {
            fields_verified,
            documents_reprojected: document_ids.len(),
            cache_entries_invalidated,
        })
    }

    fn apply_one(&self, document_id: Uuid, correction: &FieldCorrection) -> Result<(), SyncError> {
        let field = get_field(self.conn, &correction.field_id)?
            .ok_or(SyncError::FieldNotFound(correction.field_id))?;
        let now = chrono::Utc::now().naive_utc();

        // Audit trail first: the record is the source of truth for history
        append_verification_record(
            self.conn,
            &VerificationRecord {
                id: Uuid::new_v4(),
                field_id: field.id,
                document_id,
                original_value: field.value.clone(),
                corrected_value: correction.corrected_value.clone(),
                action: correction.action,
                verifier: correction.verifier.clone(),
                created_at: now,
            },
        )?;

        apply_verification(self.conn, &field.id, correction.corrected_value.as_ref(), now)?;
        Ok(())
    }
}
