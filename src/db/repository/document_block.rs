use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::{BoundingBox, DocumentBlock};

/// Store the raw parse chunks for a document. Blocks are immutable once
/// written; re-parsing a document is a new document id.
pub fn insert_blocks(conn: &Connection, blocks: &[DocumentBlock]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO document_blocks
         (id, document_id, page, text_content, confidence, bbox_x, bbox_y, bbox_w, bbox_h)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for block in blocks {
        stmt.execute(params![
            block.id,
            block.document_id.to_string(),
            block.page,
            block.text_content,
            block.confidence,
            block.bbox.map(|b| b.x),
            block.bbox.map(|b| b.y),
            block.bbox.map(|b| b.width),
            block.bbox.map(|b| b.height),
        ])?;
    }
    Ok(())
}

/// All blocks of a document in page order.
pub fn get_blocks_for_document(
    conn: &Connection,
    document_id: &Uuid,
) -> Result<Vec<DocumentBlock>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, page, text_content, confidence,
                bbox_x, bbox_y, bbox_w, bbox_h
         FROM document_blocks WHERE document_id = ?1
         ORDER BY page, id",
    )?;
    let blocks = stmt
        .query_map(params![document_id.to_string()], row_to_block)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(blocks)
}

fn row_to_block(row: &rusqlite::Row) -> Result<DocumentBlock, rusqlite::Error> {
    let doc_str: String = row.get(1)?;
    let bbox = match (
        row.get::<_, Option<f32>>(5)?,
        row.get::<_, Option<f32>>(6)?,
        row.get::<_, Option<f32>>(7)?,
        row.get::<_, Option<f32>>(8)?,
    ) {
        (Some(x), Some(y), Some(width), Some(height)) => {
            Some(BoundingBox { x, y, width, height })
        }
        _ => None,
    };
    Ok(DocumentBlock {
        id: row.get(0)?,
        document_id: parse_uuid(1, &doc_str)?,
        page: row.get(2)?,
        text_content: row.get(3)?,
        confidence: row.get(4)?,
        bbox,
    })
}
