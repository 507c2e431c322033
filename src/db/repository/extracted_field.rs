use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{from_json, parse_uuid, to_json};
use crate::db::sqlite::DATETIME_FORMAT;
use crate::db::DatabaseError;
use crate::models::{BoundingBox, Citation, ExtractedField, FieldValue};

const FIELD_COLUMNS: &str =
    "id, document_id, field_name, value_json, confidence, needs_verification,
     verified, verified_value_json, verified_at, source_page,
     source_bbox_x, source_bbox_y, source_bbox_w, source_bbox_h,
     source_text, context_before, context_after, is_exact_match,
     extraction_method, created_at";

pub fn insert_field(conn: &Connection, field: &ExtractedField) -> Result<(), DatabaseError> {
    let citation = field.citation.as_ref();
    let bbox = citation.and_then(|c| c.source_bbox);
    conn.execute(
        "INSERT INTO extracted_fields
         (id, document_id, field_name, value_json, confidence, needs_verification,
          verified, verified_value_json, verified_at, source_page,
          source_bbox_x, source_bbox_y, source_bbox_w, source_bbox_h,
          source_text, context_before, context_after, is_exact_match,
          extraction_method, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                 ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            field.id.to_string(),
            field.document_id.to_string(),
            field.field_name,
            to_json(&field.value)?,
            field.confidence,
            field.needs_verification,
            field.verified,
            field
                .verified_value
                .as_ref()
                .map(|v| to_json(v))
                .transpose()?,
            field
                .verified_at
                .map(|dt| dt.format(DATETIME_FORMAT).to_string()),
            citation.map(|c| c.source_page),
            bbox.map(|b| b.x),
            bbox.map(|b| b.y),
            bbox.map(|b| b.width),
            bbox.map(|b| b.height),
            citation.map(|c| c.source_text.as_str()),
            citation.map(|c| c.context_before.as_str()),
            citation.map(|c| c.context_after.as_str()),
            citation.map(|c| c.is_exact_match),
            field.extraction_method.as_str(),
            field.created_at.format(DATETIME_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_field(conn: &Connection, id: &Uuid) -> Result<Option<ExtractedField>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM extracted_fields WHERE id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![id.to_string()], row_to_field)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// The current extraction state of a document: the newest record per field
/// name. Superseded records stay in the table but are not returned here.
pub fn latest_fields_for_document(
    conn: &Connection,
    document_id: &Uuid,
) -> Result<Vec<ExtractedField>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM extracted_fields ef
         WHERE ef.document_id = ?1
           AND ef.rowid = (SELECT MAX(e2.rowid) FROM extracted_fields e2
                           WHERE e2.document_id = ef.document_id
                             AND e2.field_name = ef.field_name)
         ORDER BY ef.field_name"
    ))?;
    let fields = stmt
        .query_map(params![document_id.to_string()], row_to_field)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fields)
}

/// Fields below the confidence threshold that no human has looked at yet.
pub fn list_fields_needing_verification(
    conn: &Connection,
) -> Result<Vec<ExtractedField>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM extracted_fields
         WHERE needs_verification = 1
         ORDER BY document_id, field_name"
    ))?;
    let fields = stmt.query_map([], row_to_field)?.collect::<Result<Vec<_>, _>>()?;
    Ok(fields)
}

/// Verified fields of one document, for reconciliation comparison.
pub fn list_verified_fields_for_document(
    conn: &Connection,
    document_id: &Uuid,
) -> Result<Vec<ExtractedField>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM extracted_fields
         WHERE document_id = ?1 AND verified = 1
         ORDER BY field_name"
    ))?;
    let fields = stmt
        .query_map(params![document_id.to_string()], row_to_field)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fields)
}

/// Apply a human verification decision to a field.
pub fn apply_verification(
    conn: &Connection,
    field_id: &Uuid,
    verified_value: Option<&FieldValue>,
    verified_at: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE extracted_fields
         SET verified = 1,
             needs_verification = 0,
             verified_value_json = ?2,
             verified_at = ?3
         WHERE id = ?1",
        params![
            field_id.to_string(),
            verified_value.map(to_json).transpose()?,
            verified_at.format(DATETIME_FORMAT).to_string(),
        ],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "extracted_field".into(),
            id: field_id.to_string(),
        });
    }
    Ok(())
}

fn row_to_field(row: &rusqlite::Row) -> Result<ExtractedField, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let doc_str: String = row.get(1)?;
    let value_json: String = row.get(3)?;
    let verified_value_json: Option<String> = row.get(7)?;
    let verified_at_str: Option<String> = row.get(8)?;
    let method_str: String = row.get(18)?;
    let created_str: String = row.get(19)?;

    let citation = match (row.get::<_, Option<u32>>(9)?, row.get::<_, Option<String>>(14)?) {
        (Some(source_page), Some(source_text)) => {
            let source_bbox = match (
                row.get::<_, Option<f32>>(10)?,
                row.get::<_, Option<f32>>(11)?,
                row.get::<_, Option<f32>>(12)?,
                row.get::<_, Option<f32>>(13)?,
            ) {
                (Some(x), Some(y), Some(width), Some(height)) => {
                    Some(BoundingBox { x, y, width, height })
                }
                _ => None,
            };
            Some(Citation {
                source_page,
                source_bbox,
                source_text,
                context_before: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
                context_after: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
                is_exact_match: row.get::<_, Option<bool>>(17)?.unwrap_or(false),
            })
        }
        _ => None,
    };

    Ok(ExtractedField {
        id: parse_uuid(0, &id_str)?,
        document_id: parse_uuid(1, &doc_str)?,
        field_name: row.get(2)?,
        value: from_json(3, &value_json)?,
        confidence: row.get(4)?,
        needs_verification: row.get(5)?,
        verified: row.get(6)?,
        verified_value: verified_value_json
            .as_deref()
            .map(|s| from_json(7, s))
            .transpose()?,
        verified_at: verified_at_str
            .and_then(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).ok()),
        citation,
        extraction_method: method_str.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                18,
                rusqlite::types::Type::Text,
                format!("unknown extraction method: {method_str}").into(),
            )
        })?,
        created_at: NaiveDateTime::parse_from_str(&created_str, DATETIME_FORMAT)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::insert_document;
    use crate::db::sqlite::open_memory_database;
    use crate::models::{Document, ExtractionMethod};

    fn seeded_document(conn: &Connection) -> Uuid {
        let doc = Document {
            id: Uuid::new_v4(),
            template_id: "invoice".into(),
            source_name: None,
            ingested_at: chrono::Utc::now().naive_utc(),
        };
        insert_document(conn, &doc).unwrap();
        doc.id
    }

    fn make_field(document_id: Uuid, name: &str, confidence: f32) -> ExtractedField {
        ExtractedField {
            id: Uuid::new_v4(),
            document_id,
            field_name: name.into(),
            value: FieldValue::Text("$100".into()),
            confidence,
            needs_verification: confidence < 0.6,
            verified: false,
            verified_value: None,
            verified_at: None,
            citation: None,
            extraction_method: ExtractionMethod::LlmExtraction,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn insert_and_retrieve_with_citation() {
        let conn = open_memory_database().unwrap();
        let doc_id = seeded_document(&conn);
        let mut field = make_field(doc_id, "invoice_total", 0.9);
        field.citation = Some(Citation {
            source_page: 2,
            source_bbox: Some(BoundingBox { x: 1.0, y: 2.0, width: 3.0, height: 4.0 }),
            source_text: "$100".into(),
            context_before: "Total due: ".into(),
            context_after: " by March 31".into(),
            is_exact_match: true,
        });
        insert_field(&conn, &field).unwrap();

        let fetched = get_field(&conn, &field.id).unwrap().unwrap();
        let citation = fetched.citation.unwrap();
        assert_eq!(citation.source_page, 2);
        assert_eq!(citation.source_text, "$100");
        assert!(citation.is_exact_match);
        assert!(citation.source_bbox.is_some());
    }

    #[test]
    fn latest_wins_when_superseded() {
        let conn = open_memory_database().unwrap();
        let doc_id = seeded_document(&conn);
        insert_field(&conn, &make_field(doc_id, "invoice_total", 0.4)).unwrap();

        let mut newer = make_field(doc_id, "invoice_total", 0.9);
        newer.value = FieldValue::Text("$250".into());
        insert_field(&conn, &newer).unwrap();

        let fields = latest_fields_for_document(&conn, &doc_id).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, FieldValue::Text("$250".into()));
    }

    #[test]
    fn needs_verification_listing() {
        let conn = open_memory_database().unwrap();
        let doc_id = seeded_document(&conn);
        insert_field(&conn, &make_field(doc_id, "invoice_total", 0.5)).unwrap();
        insert_field(&conn, &make_field(doc_id, "vendor_name", 0.95)).unwrap();

        let pending = list_fields_needing_verification(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field_name, "invoice_total");
    }

    #[test]
    fn verification_updates_state() {
        let conn = open_memory_database().unwrap();
        let doc_id = seeded_document(&conn);
        let field = make_field(doc_id, "invoice_total", 0.5);
        insert_field(&conn, &field).unwrap();

        let corrected = FieldValue::Text("$150".into());
        apply_verification(&conn, &field.id, Some(&corrected), chrono::Utc::now().naive_utc())
            .unwrap();

        let fetched = get_field(&conn, &field.id).unwrap().unwrap();
        assert!(fetched.verified);
        assert!(!fetched.needs_verification);
        assert_eq!(fetched.current_value(), &corrected);
    }

    #[test]
    fn verifying_missing_field_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = apply_verification(&conn, &Uuid::new_v4(), None, chrono::Utc::now().naive_utc())
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
