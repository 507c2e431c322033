//! Out-of-band reconciliation — compares verified fields in the
//! authoritative store against the projection and re-projects on mismatch.
//!
//! Faults are expected to be rare; each one signals a lost update and is
//! logged for monitoring. Healing is always "re-project the document",
//! never a partial patch.

use rusqlite::Connection;

use super::SyncError;
use crate::backend::StorageBackend;
use crate::db::repository::{
    list_documents_with_verified_fields, list_verified_fields_for_document,
};
use crate::models::SchemaStore;
use crate::projection::Indexer;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub documents_checked: usize,
    pub faults_found: usize,
    pub documents_reprojected: usize,
}

/// One reconciliation pass over every document carrying verified fields.
pub async fn reconcile<B: StorageBackend>(
    conn: &Connection,
    backend: &B,
    schemas: &dyn SchemaStore,
) -> Result<ReconcileReport, SyncError> {
    let mut report = ReconcileReport::default();
    let indexer = Indexer::new(backend, schemas);

    for document_id in list_documents_with_verified_fields(conn)? {
        report.documents_checked += 1;

        let verified = list_verified_fields_for_document(conn, &document_id)?;
        let entry = backend.get(&document_id).await?;

        let drifted = match &entry {
            None => true,
            Some(entry) => verified.iter().any(|field| {
                entry.field_values.get(&field.field_name) != Some(field.current_value())
            }),
        };

        if drifted {
            report.faults_found += 1;
            tracing::warn!(
                document_id = %document_id,
                missing_entry = entry.is_none(),
                "Consistency fault: projection does not match verified fields"
            );
            indexer.reproject(conn, &document_id).await?;
            report.documents_reprojected += 1;
        }
    }

    tracing::info!(
        checked = report.documents_checked,
        faults = report.faults_found,
        "Reconciliation pass complete"
    );
    Ok(report)
}
