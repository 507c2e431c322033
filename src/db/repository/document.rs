use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::sqlite::DATETIME_FORMAT;
use crate::db::DatabaseError;
use crate::models::Document;

/// Register a document. The engine stores no file content.
pub fn insert_document(conn: &Connection, doc: &Document) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO documents (id, template_id, source_name, ingested_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            doc.id.to_string(),
            doc.template_id,
            doc.source_name,
            doc.ingested_at.format(DATETIME_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, template_id, source_name, ingested_at FROM documents WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id.to_string()], row_to_document)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn list_document_ids(conn: &Connection) -> Result<Vec<Uuid>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY ingested_at, id")?;
    let ids = stmt
        .query_map([], |row| {
            let s: String = row.get(0)?;
            parse_uuid(0, &s)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Documents that carry at least one verified field — the reconciliation
/// job's working set.
pub fn list_documents_with_verified_fields(
    conn: &Connection,
) -> Result<Vec<Uuid>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT document_id FROM extracted_fields
         WHERE verified = 1 ORDER BY document_id",
    )?;
    let ids = stmt
        .query_map([], |row| {
            let s: String = row.get(0)?;
            parse_uuid(0, &s)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn row_to_document(row: &rusqlite::Row) -> Result<Document, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let ingested_str: String = row.get(3)?;
    Ok(Document {
        id: parse_uuid(0, &id_str)?,
        template_id: row.get(1)?,
        source_name: row.get(2)?,
        ingested_at: NaiveDateTime::parse_from_str(&ingested_str, DATETIME_FORMAT)
            .unwrap_or_default(),
    })
}
