use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{from_json, parse_uuid, to_json};
use crate::db::sqlite::DATETIME_FORMAT;
use crate::db::DatabaseError;
use crate::models::VerificationRecord;

/// Append one verification decision to the audit trail.
///
/// The table carries triggers that abort UPDATE and DELETE, so history
/// cannot be rewritten from any code path.
pub fn append_verification_record(
    conn: &Connection,
    record: &VerificationRecord,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO verification_records
         (id, field_id, document_id, original_value_json, corrected_value_json,
          action, verifier, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id.to_string(),
            record.field_id.to_string(),
            record.document_id.to_string(),
            to_json(&record.original_value)?,
            record
                .corrected_value
                .as_ref()
                .map(to_json)
                .transpose()?,
            record.action.as_str(),
            record.verifier,
            record.created_at.format(DATETIME_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

/// Audit history for one field, oldest first.
pub fn list_records_for_field(
    conn: &Connection,
    field_id: &Uuid,
) -> Result<Vec<VerificationRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, field_id, document_id, original_value_json, corrected_value_json,
                action, verifier, created_at
         FROM verification_records WHERE field_id = ?1
         ORDER BY created_at, rowid",
    )?;
    let records = stmt
        .query_map(params![field_id.to_string()], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn has_verification_record(
    conn: &Connection,
    field_id: &Uuid,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM verification_records WHERE field_id = ?1",
        params![field_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn row_to_record(row: &rusqlite::Row) -> Result<VerificationRecord, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let field_str: String = row.get(1)?;
    let doc_str: String = row.get(2)?;
    let original_json: String = row.get(3)?;
    let corrected_json: Option<String> = row.get(4)?;
    let action_str: String = row.get(5)?;
    let created_str: String = row.get(7)?;

    Ok(VerificationRecord {
        id: parse_uuid(0, &id_str)?,
        field_id: parse_uuid(1, &field_str)?,
        document_id: parse_uuid(2, &doc_str)?,
        original_value: from_json(3, &original_json)?,
        corrected_value: corrected_json
            .as_deref()
            .map(|s| from_json(4, s))
            .transpose()?,
        action: action_str.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown verification action: {action_str}").into(),
            )
        })?,
        verifier: row.get(6)?,
        created_at: NaiveDateTime::parse_from_str(&created_str, DATETIME_FORMAT)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{insert_document, insert_field};
    use crate::db::sqlite::open_memory_database;
    use crate::models::{
        Document, ExtractedField, ExtractionMethod, FieldValue, VerificationAction,
    };

    fn seeded_field(conn: &Connection) -> (Uuid, Uuid) {
        let doc = Document {
            id: Uuid::new_v4(),
            template_id: "invoice".into(),
            source_name: None,
            ingested_at: chrono::Utc::now().naive_utc(),
        };
        insert_document(conn, &doc).unwrap();

        let field = ExtractedField {
            id: Uuid::new_v4(),
            document_id: doc.id,
            field_name: "invoice_total".into(),
            value: FieldValue::Text("$100".into()),
            confidence: 0.5,
            needs_verification: true,
            verified: false,
            verified_value: None,
            verified_at: None,
            citation: None,
            extraction_method: ExtractionMethod::LlmExtraction,
            created_at: chrono::Utc::now().naive_utc(),
        };
        insert_field(conn, &field).unwrap();
        (doc.id, field.id)
    }

    fn make_record(document_id: Uuid, field_id: Uuid) -> VerificationRecord {
        VerificationRecord {
            id: Uuid::new_v4(),
            field_id,
            document_id,
            original_value: FieldValue::Text("$100".into()),
            corrected_value: Some(FieldValue::Text("$150".into())),
            action: VerificationAction::Incorrect,
            verifier: "reviewer@example.com".into(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn append_and_list() {
        let conn = open_memory_database().unwrap();
        let (doc_id, field_id) = seeded_field(&conn);
        append_verification_record(&conn, &make_record(doc_id, field_id)).unwrap();

        let records = list_records_for_field(&conn, &field_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_value, FieldValue::Text("$100".into()));
        assert_eq!(
            records[0].corrected_value,
            Some(FieldValue::Text("$150".into()))
        );
        assert!(has_verification_record(&conn, &field_id).unwrap());
    }

    #[test]
    fn history_is_append_only() {
        let conn = open_memory_database().unwrap();
        let (doc_id, field_id) = seeded_field(&conn);
        let record = make_record(doc_id, field_id);
        append_verification_record(&conn, &record).unwrap();

        let update = conn.execute(
            "UPDATE verification_records SET verifier = 'tamper' WHERE id = ?1",
            params![record.id.to_string()],
        );
        assert!(update.is_err(), "UPDATE must be rejected by trigger");

        let delete = conn.execute(
            "DELETE FROM verification_records WHERE id = ?1",
            params![record.id.to_string()],
        );
        assert!(delete.is_err(), "DELETE must be rejected by trigger");
    }

    #[test]
    fn corrections_accumulate_as_new_records() {
        let conn = open_memory_database().unwrap();
        let (doc_id, field_id) = seeded_field(&conn);
        append_verification_record(&conn, &make_record(doc_id, field_id)).unwrap();

        let mut second = make_record(doc_id, field_id);
        second.corrected_value = Some(FieldValue::Text("$175".into()));
        append_verification_record(&conn, &second).unwrap();

        assert_eq!(list_records_for_field(&conn, &field_id).unwrap().len(), 2);
    }
}
