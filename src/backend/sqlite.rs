//! SQLite implementation of the storage/search backend.
//!
//! The projection lives in its own database: `index_entries` holds the
//! serialized entry, `index_fields` holds one typed row per field for
//! predicate evaluation and aggregation pushdown, and `index_fts` is the
//! FTS5 full-text fallback. All aggregation SQL runs over the complete
//! matching set — there is no LIMIT anywhere near an aggregate.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use uuid::Uuid;

use super::{
    BackendError, FilterClause, FilterOp, Predicate, SearchHit, SearchPage, SearchQuery,
    StorageBackend,
};
use crate::aggregation::{AggBucket, AggSpec, AggregationResult, CalendarInterval};
use crate::db::DatabaseError;
use crate::models::{FieldValue, SearchIndexEntry};

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open a file-backed projection database, creating the schema if absent.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open(path).map_err(DatabaseError::from)?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory projection (for testing).
    pub fn in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::from)?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn init_schema(conn: &Connection) -> Result<(), BackendError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;

         CREATE TABLE IF NOT EXISTS index_entries (
             document_id TEXT PRIMARY KEY,
             template_id TEXT NOT NULL,
             entry_json TEXT NOT NULL,
             min_confidence REAL NOT NULL,
             unverified_count INTEGER NOT NULL
         );

         CREATE TABLE IF NOT EXISTS index_fields (
             document_id TEXT NOT NULL,
             field_name TEXT NOT NULL,
             value_kind TEXT NOT NULL,
             value_text TEXT,
             value_num REAL,
             value_date TEXT,
             value_bool INTEGER,
             confidence REAL NOT NULL,
             PRIMARY KEY (document_id, field_name)
         );

         CREATE INDEX IF NOT EXISTS idx_index_fields_name
             ON index_fields(field_name, value_num);

         CREATE VIRTUAL TABLE IF NOT EXISTS index_fts
             USING fts5(document_id UNINDEXED, full_text);",
    )
    .map_err(DatabaseError::from)?;
    Ok(())
}

/// SQL fragment plus its positional parameters, appended in lockstep so
/// placeholder order always matches parameter order.
#[derive(Default)]
struct SqlBuilder {
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    fn bind(&mut self, value: Value) {
        self.sql.push('?');
        self.params.push(value);
    }

    fn bind_list(&mut self, values: impl IntoIterator<Item = Value>) {
        let mut first = true;
        for v in values {
            if !first {
                self.sql.push_str(", ");
            }
            first = false;
            self.bind(v);
        }
    }
}

/// Append `WHERE ...` for the predicate. Every clause becomes an EXISTS
/// subquery over `index_fields`; the OR field set is an IN list.
fn append_predicate(builder: &mut SqlBuilder, predicate: &Predicate) -> Result<(), BackendError> {
    builder.push(" WHERE 1=1");

    for clause in &predicate.clauses {
        append_clause(builder, clause)?;
    }

    if let Some(term) = &predicate.full_text {
        let sanitized = sanitize_fts_query(term);
        if !sanitized.is_empty() {
            builder.push(
                " AND e.document_id IN (SELECT document_id FROM index_fts WHERE index_fts MATCH ",
            );
            builder.bind(Value::Text(sanitized));
            builder.push(")");
        }
    }

    Ok(())
}

fn append_clause(builder: &mut SqlBuilder, clause: &FilterClause) -> Result<(), BackendError> {
    if clause.fields.is_empty() {
        return Err(BackendError::InvalidPredicate(
            "filter clause with no target fields".into(),
        ));
    }

    builder.push(" AND EXISTS (SELECT 1 FROM index_fields f WHERE f.document_id = e.document_id AND f.field_name IN (");
    builder.bind_list(clause.fields.iter().map(|f| Value::Text(f.clone())));
    builder.push(") AND ");
    append_comparison(builder, clause)?;
    builder.push(")");
    Ok(())
}

fn append_comparison(builder: &mut SqlBuilder, clause: &FilterClause) -> Result<(), BackendError> {
    let op = clause.op;
    match &clause.value {
        FieldValue::Number(n) => {
            builder.push("f.value_num ");
            builder.push(sql_cmp(op)?);
            builder.push(" ");
            builder.bind(Value::Real(*n));
        }
        FieldValue::Date(d) => {
            builder.push("f.value_date ");
            builder.push(sql_cmp(op)?);
            builder.push(" ");
            builder.bind(Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        FieldValue::Boolean(b) => {
            let cmp = match op {
                FilterOp::Eq => "=",
                FilterOp::Ne => "!=",
                _ => {
                    return Err(BackendError::InvalidPredicate(format!(
                        "operator {} not applicable to boolean",
                        op.as_str()
                    )))
                }
            };
            builder.push("f.value_bool ");
            builder.push(cmp);
            builder.push(" ");
            builder.bind(Value::Integer(i64::from(*b)));
        }
        FieldValue::Text(s) => match op {
            FilterOp::Eq => {
                builder.push("lower(f.value_text) = lower(");
                builder.bind(Value::Text(s.clone()));
                builder.push(")");
            }
            FilterOp::Ne => {
                builder.push("lower(f.value_text) != lower(");
                builder.bind(Value::Text(s.clone()));
                builder.push(")");
            }
            FilterOp::Contains => {
                builder.push("instr(lower(f.value_text), lower(");
                builder.bind(Value::Text(s.clone()));
                builder.push(")) > 0");
            }
            _ => {
                return Err(BackendError::InvalidPredicate(format!(
                    "ordering comparison {} on text value",
                    op.as_str()
                )))
            }
        },
        other => {
            return Err(BackendError::InvalidPredicate(format!(
                "unsupported filter value kind: {}",
                other.kind()
            )))
        }
    }
    Ok(())
}

fn sql_cmp(op: FilterOp) -> Result<&'static str, BackendError> {
    Ok(match op {
        FilterOp::Eq => "=",
        FilterOp::Ne => "!=",
        FilterOp::Gt => ">",
        FilterOp::Gte => ">=",
        FilterOp::Lt => "<",
        FilterOp::Lte => "<=",
        FilterOp::Contains => {
            return Err(BackendError::InvalidPredicate(
                "contains is only applicable to text values".into(),
            ))
        }
    })
}

/// Sanitize a search query for FTS5.
/// Escapes special characters and wraps terms for prefix matching.
fn sanitize_fts_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '\'')
        .collect();

    cleaned
        .split_whitespace()
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\"*"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn date_bucket_format(interval: CalendarInterval) -> &'static str {
    match interval {
        CalendarInterval::Day => "%Y-%m-%d",
        CalendarInterval::Week => "%Y-W%W",
        CalendarInterval::Month => "%Y-%m",
        CalendarInterval::Year => "%Y",
    }
}

fn metric_expr(spec: &AggSpec) -> Result<(&'static str, Option<&str>), BackendError> {
    Ok(match spec {
        AggSpec::Sum { field } => ("SUM(m.value_num)", Some(field)),
        AggSpec::Avg { field } => ("AVG(m.value_num)", Some(field)),
        AggSpec::Min { field } => ("MIN(m.value_num)", Some(field)),
        AggSpec::Max { field } => ("MAX(m.value_num)", Some(field)),
        AggSpec::Count => ("COUNT(*)", None),
        other => {
            return Err(BackendError::PushdownUnsupported {
                reason: format!("{} is not a metric aggregation", other.kind_name()),
            })
        }
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), BackendError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let doc_id = entry.document_id.to_string();

        tx.execute("DELETE FROM index_entries WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;
        tx.execute("DELETE FROM index_fields WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;
        tx.execute("DELETE FROM index_fts WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;

        let entry_json = serde_json::to_string(entry)
            .map_err(|e| BackendError::Database(DatabaseError::Corrupt(e.to_string())))?;
        tx.execute(
            "INSERT INTO index_entries
             (document_id, template_id, entry_json, min_confidence, unverified_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                doc_id,
                entry.template_id,
                entry_json,
                entry.min_confidence,
                entry.unverified_field_count as i64,
            ],
        )
        .map_err(DatabaseError::from)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO index_fields
                     (document_id, field_name, value_kind, value_text, value_num,
                      value_date, value_bool, confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(DatabaseError::from)?;
            for (name, value) in &entry.field_values {
                let confidence = entry.confidence_scores.get(name).copied().unwrap_or(0.0);
                stmt.execute(params![
                    doc_id,
                    name,
                    value.kind(),
                    value.display_text(),
                    value.as_number(),
                    value.as_date().map(|d| d.format("%Y-%m-%d").to_string()),
                    match value {
                        FieldValue::Boolean(b) => Some(i64::from(*b)),
                        _ => None,
                    },
                    confidence,
                ])
                .map_err(DatabaseError::from)?;
            }
        }

        tx.execute(
            "INSERT INTO index_fts (document_id, full_text) VALUES (?1, ?2)",
            params![doc_id, entry.full_text],
        )
        .map_err(DatabaseError::from)?;

        tx.commit().map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn get(&self, document_id: &Uuid) -> Result<Option<SearchIndexEntry>, BackendError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT entry_json FROM index_entries WHERE document_id = ?1")
            .map_err(DatabaseError::from)?;
        let mut rows = stmt
            .query_map(params![document_id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(DatabaseError::from)?;
        match rows.next() {
            Some(json) => {
                let json = json.map_err(DatabaseError::from)?;
                let entry = serde_json::from_str(&json)
                    .map_err(|e| BackendError::Database(DatabaseError::Corrupt(e.to_string())))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, document_id: &Uuid) -> Result<(), BackendError> {
        let conn = self.lock();
        let doc_id = document_id.to_string();
        conn.execute("DELETE FROM index_entries WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;
        conn.execute("DELETE FROM index_fields WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;
        conn.execute("DELETE FROM index_fts WHERE document_id = ?1", params![doc_id])
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, BackendError> {
        let conn = self.lock();

        // Count over the full matching set first; the page is a window, the
        // total never is.
        let mut count = SqlBuilder::default();
        count.push("SELECT COUNT(*) FROM index_entries e");
        append_predicate(&mut count, &query.predicate)?;
        let total: u64 = conn
            .query_row(&count.sql, params_from_iter(count.params.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .map_err(DatabaseError::from)? as u64;

        let mut builder = SqlBuilder::default();
        builder.push("SELECT e.document_id, ");
        if query.rank_fields.is_empty() {
            builder.push("e.min_confidence AS score");
        } else {
            builder.push(
                "COALESCE((SELECT MAX(r.confidence) FROM index_fields r \
                 WHERE r.document_id = e.document_id AND r.field_name IN (",
            );
            builder.bind_list(query.rank_fields.iter().map(|f| Value::Text(f.clone())));
            builder.push(")), 0.0) AS score");
        }
        builder.push(" FROM index_entries e");
        append_predicate(&mut builder, &query.predicate)?;
        builder.push(" ORDER BY score DESC, e.document_id");
        builder.push(&format!(
            " LIMIT {} OFFSET {}",
            query.page_size,
            query.page.saturating_mul(query.page_size)
        ));

        let mut stmt = conn.prepare(&builder.sql).map_err(DatabaseError::from)?;
        let hits = stmt
            .query_map(params_from_iter(builder.params.iter()), |row| {
                let id: String = row.get(0)?;
                let score: f64 = row.get(1)?;
                Ok((id, score))
            })
            .map_err(DatabaseError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)?;

        let hits = hits
            .into_iter()
            .map(|(id, score)| {
                Ok(SearchHit {
                    document_id: Uuid::parse_str(&id)
                        .map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
                    score: score as f32,
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;

        Ok(SearchPage {
            hits,
            total,
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn search_ids(&self, predicate: &Predicate) -> Result<Vec<Uuid>, BackendError> {
        let conn = self.lock();
        let mut builder = SqlBuilder::default();
        builder.push("SELECT e.document_id FROM index_entries e");
        append_predicate(&mut builder, predicate)?;
        builder.push(" ORDER BY e.document_id");

        let mut stmt = conn.prepare(&builder.sql).map_err(DatabaseError::from)?;
        let ids = stmt
            .query_map(params_from_iter(builder.params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(DatabaseError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)?;

        ids.into_iter()
            .map(|id| {
                Uuid::parse_str(&id)
                    .map_err(|e| BackendError::Database(DatabaseError::Corrupt(e.to_string())))
            })
            .collect()
    }

    async fn aggregate(
        &self,
        predicate: &Predicate,
        spec: &AggSpec,
    ) -> Result<AggregationResult, BackendError> {
        let conn = self.lock();
        match spec {
            AggSpec::Count => {
                let mut builder = SqlBuilder::default();
                builder.push("SELECT COUNT(*) FROM index_entries e");
                append_predicate(&mut builder, predicate)?;
                let count: i64 = conn
                    .query_row(&builder.sql, params_from_iter(builder.params.iter()), |row| {
                        row.get(0)
                    })
                    .map_err(DatabaseError::from)?;
                Ok(AggregationResult::Count(count as u64))
            }

            AggSpec::Sum { .. } | AggSpec::Avg { .. } | AggSpec::Min { .. } | AggSpec::Max { .. } => {
                let (expr, field) = metric_expr(spec)?;
                let field = field.unwrap_or_default();
                let mut builder = SqlBuilder::default();
                builder.push(&format!(
                    "SELECT {expr} FROM index_entries e \
                     JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = "
                ));
                builder.bind(Value::Text(field.to_string()));
                append_predicate(&mut builder, predicate)?;
                builder.push(" AND m.value_num IS NOT NULL");
                let value: Option<f64> = conn
                    .query_row(&builder.sql, params_from_iter(builder.params.iter()), |row| {
                        row.get(0)
                    })
                    .map_err(DatabaseError::from)?;
                Ok(AggregationResult::Number(value))
            }

            AggSpec::Percentile { field, percentile } => {
                let mut count = SqlBuilder::default();
                count.push(
                    "SELECT COUNT(*) FROM index_entries e \
                     JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = ",
                );
                count.bind(Value::Text(field.clone()));
                append_predicate(&mut count, predicate)?;
                count.push(" AND m.value_num IS NOT NULL");
                let n: i64 = conn
                    .query_row(&count.sql, params_from_iter(count.params.iter()), |row| {
                        row.get(0)
                    })
                    .map_err(DatabaseError::from)?;
                if n == 0 {
                    return Ok(AggregationResult::Number(None));
                }

                // Nearest-rank over values sorted ascending
                let rank = ((percentile / 100.0) * n as f64).ceil().max(1.0) as i64;
                let mut builder = SqlBuilder::default();
                builder.push(
                    "SELECT m.value_num FROM index_entries e \
                     JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = ",
                );
                builder.bind(Value::Text(field.clone()));
                append_predicate(&mut builder, predicate)?;
                builder.push(" AND m.value_num IS NOT NULL ORDER BY m.value_num");
                builder.push(&format!(" LIMIT 1 OFFSET {}", rank - 1));
                let value: f64 = conn
                    .query_row(&builder.sql, params_from_iter(builder.params.iter()), |row| {
                        row.get(0)
                    })
                    .map_err(DatabaseError::from)?;
                Ok(AggregationResult::Number(Some(value)))
            }

            AggSpec::Terms { field } => {
                let mut builder = SqlBuilder::default();
                builder.push(
                    "SELECT COALESCE(m.value_text, ''), COUNT(*) FROM index_entries e \
                     JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = ",
                );
                builder.bind(Value::Text(field.clone()));
                append_predicate(&mut builder, predicate)?;
                builder.push(" GROUP BY m.value_text ORDER BY COUNT(*) DESC, m.value_text");
                let buckets = collect_buckets(&conn, &builder)?;
                Ok(AggregationResult::Buckets(buckets))
            }

            AggSpec::DateHistogram { field, interval } => {
                let fmt = date_bucket_format(*interval);
                let mut builder = SqlBuilder::default();
                builder.push(&format!(
                    "SELECT strftime('{fmt}', m.value_date), COUNT(*) FROM index_entries e \
                     JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = "
                ));
                builder.bind(Value::Text(field.clone()));
                append_predicate(&mut builder, predicate)?;
                builder.push(" AND m.value_date IS NOT NULL GROUP BY 1 ORDER BY 1");
                let buckets = collect_buckets(&conn, &builder)?;
                Ok(AggregationResult::Buckets(buckets))
            }

            AggSpec::GroupBy { group_field, inner } => {
                let (expr, metric_field) = metric_expr(inner)?;
                let mut builder = SqlBuilder::default();
                builder.push(&format!(
                    "SELECT COALESCE(g.value_text, ''), COUNT(*), {expr} \
                     FROM index_entries e \
                     JOIN index_fields g ON g.document_id = e.document_id AND g.field_name = "
                ));
                builder.bind(Value::Text(group_field.clone()));
                if let Some(metric_field) = metric_field {
                    builder.push(
                        " LEFT JOIN index_fields m ON m.document_id = e.document_id AND m.field_name = ",
                    );
                    builder.bind(Value::Text(metric_field.to_string()));
                }
                append_predicate(&mut builder, predicate)?;
                builder.push(" GROUP BY g.value_text ORDER BY g.value_text");

                let mut stmt = conn.prepare(&builder.sql).map_err(DatabaseError::from)?;
                let buckets = stmt
                    .query_map(params_from_iter(builder.params.iter()), |row| {
                        Ok(AggBucket {
                            key: row.get(0)?,
                            doc_count: row.get::<_, i64>(1)? as u64,
                            value: row.get::<_, Option<f64>>(2)?,
                        })
                    })
                    .map_err(DatabaseError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(DatabaseError::from)?;
                Ok(AggregationResult::Buckets(buckets))
            }
        }
    }
}

fn collect_buckets(
    conn: &Connection,
    builder: &SqlBuilder,
) -> Result<Vec<AggBucket>, BackendError> {
    let mut stmt = conn.prepare(&builder.sql).map_err(DatabaseError::from)?;
    let buckets = stmt
        .query_map(params_from_iter(builder.params.iter()), |row| {
            Ok(AggBucket {
                key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                doc_count: row.get::<_, i64>(1)? as u64,
                value: None,
            })
        })
        .map_err(DatabaseError::from)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?;
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn entry(doc_id: Uuid, fields: &[(&str, FieldValue, f32)]) -> SearchIndexEntry {
        let mut field_values = BTreeMap::new();
        let mut confidence_scores = BTreeMap::new();
        let mut full_text = Vec::new();
        for (name, value, confidence) in fields {
            field_values.insert(name.to_string(), value.clone());
            confidence_scores.insert(name.to_string(), *confidence);
            full_text.push(format!("{name}: {}", value.display_text()));
        }
        let confidences: Vec<f32> = fields.iter().map(|(_, _, c)| *c).collect();
        let min = confidences.iter().copied().fold(f32::INFINITY, f32::min);
        SearchIndexEntry {
            document_id: doc_id,
            template_id: "invoice".into(),
            field_values,
            confidence_scores,
            low_confidence_field_names: vec![],
            alias_fields: BTreeMap::new(),
            full_text: full_text.join("\n"),
            min_confidence: if min.is_finite() { min } else { 0.0 },
            max_confidence: 1.0,
            avg_confidence: 0.8,
            unverified_field_count: 0,
            projection_version: 1,
        }
    }

    fn active_predicate() -> Predicate {
        Predicate {
            clauses: vec![FilterClause {
                fields: vec!["status".into()],
                op: FilterOp::Eq,
                value: FieldValue::Text("active".into()),
            }],
            full_text: None,
        }
    }

    async fn seeded_backend(n: usize) -> (SqliteBackend, f64) {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut expected_sum = 0.0;
        for i in 0..n {
            let status = if i % 5 == 0 { "archived" } else { "active" };
            let total = (i as f64) * 10.0 + 5.0;
            if status == "active" {
                expected_sum += total;
            }
            let date = NaiveDate::from_ymd_opt(2024, (i % 12) as u32 + 1, 15).unwrap();
            backend
                .upsert(&entry(
                    Uuid::new_v4(),
                    &[
                        ("status", FieldValue::Text(status.into()), 0.9),
                        ("invoice_total", FieldValue::Number(total), 0.8),
                        ("invoice_date", FieldValue::Date(date), 0.7),
                        ("vendor_name", FieldValue::Text(format!("Vendor {}", i % 3)), 0.95),
                    ],
                ))
                .await
                .unwrap();
        }
        (backend, expected_sum)
    }

    #[tokio::test]
    async fn upsert_get_round_trip() {
        let backend = SqliteBackend::in_memory().unwrap();
        let doc_id = Uuid::new_v4();
        let e = entry(doc_id, &[("invoice_total", FieldValue::Number(100.0), 0.9)]);
        backend.upsert(&e).await.unwrap();

        let fetched = backend.get(&doc_id).await.unwrap().unwrap();
        assert_eq!(fetched, e);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_replace() {
        let backend = SqliteBackend::in_memory().unwrap();
        let doc_id = Uuid::new_v4();
        backend
            .upsert(&entry(doc_id, &[("invoice_total", FieldValue::Number(100.0), 0.9)]))
            .await
            .unwrap();
        backend
            .upsert(&entry(doc_id, &[("invoice_total", FieldValue::Number(150.0), 0.9)]))
            .await
            .unwrap();

        let fetched = backend.get(&doc_id).await.unwrap().unwrap();
        assert_eq!(
            fetched.field_values["invoice_total"],
            FieldValue::Number(150.0)
        );

        let ids = backend.search_ids(&Predicate::default()).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_everything() {
        let backend = SqliteBackend::in_memory().unwrap();
        let doc_id = Uuid::new_v4();
        backend
            .upsert(&entry(doc_id, &[("invoice_total", FieldValue::Number(1.0), 0.9)]))
            .await
            .unwrap();
        backend.remove(&doc_id).await.unwrap();
        assert!(backend.get(&doc_id).await.unwrap().is_none());
        assert!(backend.search_ids(&Predicate::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregation_covers_full_set_despite_paging() {
        // 500 documents match; a listing page holds only 20. The sum must
        // cover all matches.
        let (backend, expected_sum) = seeded_backend(625).await;

        let page = backend
            .search(&SearchQuery {
                predicate: active_predicate(),
                rank_fields: vec![],
                page: 0,
                page_size: 20,
            })
            .await
            .unwrap();
        assert_eq!(page.hits.len(), 20);
        assert_eq!(page.total, 500);

        let result = backend
            .aggregate(&active_predicate(), &AggSpec::Sum { field: "invoice_total".into() })
            .await
            .unwrap();
        match result {
            AggregationResult::Number(Some(sum)) => {
                assert!((sum - expected_sum).abs() < 1e-6, "sum {sum} != {expected_sum}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn count_matches_search_ids() {
        let (backend, _) = seeded_backend(50).await;
        let ids = backend.search_ids(&active_predicate()).await.unwrap();
        let count = backend
            .aggregate(&active_predicate(), &AggSpec::Count)
            .await
            .unwrap();
        assert_eq!(count, AggregationResult::Count(ids.len() as u64));
    }

    #[tokio::test]
    async fn numeric_range_predicate() {
        let (backend, _) = seeded_backend(20).await;
        let predicate = Predicate {
            clauses: vec![FilterClause {
                fields: vec!["invoice_total".into()],
                op: FilterOp::Gte,
                value: FieldValue::Number(100.0),
            }],
            full_text: None,
        };
        let ids = backend.search_ids(&predicate).await.unwrap();
        // totals are 5, 15, ..., 195; >= 100 leaves 105..195
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn min_max_avg_percentile() {
        let (backend, _) = seeded_backend(20).await;
        let p = Predicate::default();
        let field = "invoice_total".to_string();

        let min = backend.aggregate(&p, &AggSpec::Min { field: field.clone() }).await.unwrap();
        assert_eq!(min, AggregationResult::Number(Some(5.0)));

        let max = backend.aggregate(&p, &AggSpec::Max { field: field.clone() }).await.unwrap();
        assert_eq!(max, AggregationResult::Number(Some(195.0)));

        let median = backend
            .aggregate(&p, &AggSpec::Percentile { field: field.clone(), percentile: 50.0 })
            .await
            .unwrap();
        // nearest-rank: rank 10 of 20 ascending values = 95.0
        assert_eq!(median, AggregationResult::Number(Some(95.0)));
    }

    #[tokio::test]
    async fn percentile_of_empty_set_is_none() {
        let backend = SqliteBackend::in_memory().unwrap();
        let result = backend
            .aggregate(
                &Predicate::default(),
                &AggSpec::Percentile { field: "invoice_total".into(), percentile: 95.0 },
            )
            .await
            .unwrap();
        assert_eq!(result, AggregationResult::Number(None));
    }

    #[tokio::test]
    async fn terms_buckets_group_by_text() {
        let (backend, _) = seeded_backend(30).await;
        let result = backend
            .aggregate(&Predicate::default(), &AggSpec::Terms { field: "vendor_name".into() })
            .await
            .unwrap();
        match result {
            AggregationResult::Buckets(buckets) => {
                assert_eq!(buckets.len(), 3);
                let total: u64 = buckets.iter().map(|b| b.doc_count).sum();
                assert_eq!(total, 30);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn date_histogram_monthly_buckets() {
        let (backend, _) = seeded_backend(24).await;
        let result = backend
            .aggregate(
                &Predicate::default(),
                &AggSpec::DateHistogram {
                    field: "invoice_date".into(),
                    interval: CalendarInterval::Month,
                },
            )
            .await
            .unwrap();
        match result {
            AggregationResult::Buckets(buckets) => {
                assert_eq!(buckets.len(), 12);
                assert!(buckets[0].key.starts_with("2024-"));
                let total: u64 = buckets.iter().map(|b| b.doc_count).sum();
                assert_eq!(total, 24);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn group_by_with_inner_sum() {
        let (backend, expected_active_sum) = seeded_backend(25).await;
        let result = backend
            .aggregate(
                &Predicate::default(),
                &AggSpec::GroupBy {
                    group_field: "status".into(),
                    inner: Box::new(AggSpec::Sum { field: "invoice_total".into() }),
                },
            )
            .await
            .unwrap();
        match result {
            AggregationResult::Buckets(buckets) => {
                let active = buckets.iter().find(|b| b.key == "active").unwrap();
                assert_eq!(active.value, Some(expected_active_sum));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_text_search_matches_values() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .upsert(&entry(
                Uuid::new_v4(),
                &[("vendor_name", FieldValue::Text("Acme Corporation".into()), 0.9)],
            ))
            .await
            .unwrap();
        backend
            .upsert(&entry(
                Uuid::new_v4(),
                &[("vendor_name", FieldValue::Text("Globex".into()), 0.9)],
            ))
            .await
            .unwrap();

        let predicate = Predicate {
            clauses: vec![],
            full_text: Some("acme".into()),
        };
        let ids = backend.search_ids(&predicate).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn or_semantics_across_canonical_fields() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .upsert(&entry(
                Uuid::new_v4(),
                &[("invoice_total", FieldValue::Number(500.0), 0.9)],
            ))
            .await
            .unwrap();
        backend
            .upsert(&entry(
                Uuid::new_v4(),
                &[("payment_amount", FieldValue::Number(700.0), 0.7)],
            ))
            .await
            .unwrap();

        // "amount" expands to both concrete fields; both documents match
        let predicate = Predicate {
            clauses: vec![FilterClause {
                fields: vec!["invoice_total".into(), "payment_amount".into()],
                op: FilterOp::Gt,
                value: FieldValue::Number(100.0),
            }],
            full_text: None,
        };
        let ids = backend.search_ids(&predicate).await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn ranking_uses_per_field_confidence() {
        let backend = SqliteBackend::in_memory().unwrap();
        let high = Uuid::new_v4();
        let low = Uuid::new_v4();
        backend
            .upsert(&entry(high, &[("invoice_total", FieldValue::Number(500.0), 0.95)]))
            .await
            .unwrap();
        backend
            .upsert(&entry(low, &[("payment_amount", FieldValue::Number(700.0), 0.4)]))
            .await
            .unwrap();

        let page = backend
            .search(&SearchQuery {
                predicate: Predicate {
                    clauses: vec![FilterClause {
                        fields: vec!["invoice_total".into(), "payment_amount".into()],
                        op: FilterOp::Gt,
                        value: FieldValue::Number(100.0),
                    }],
                    full_text: None,
                },
                rank_fields: vec!["invoice_total".into(), "payment_amount".into()],
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();

        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.hits[0].document_id, high);
        assert!(page.hits[0].score > page.hits[1].score);
    }

    #[tokio::test]
    async fn text_ordering_comparison_is_invalid() {
        let backend = SqliteBackend::in_memory().unwrap();
        let predicate = Predicate {
            clauses: vec![FilterClause {
                fields: vec!["vendor_name".into()],
                op: FilterOp::Gt,
                value: FieldValue::Text("Acme".into()),
            }],
            full_text: None,
        };
        let err = backend.search_ids(&predicate).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPredicate(_)));
    }

    #[tokio::test]
    async fn empty_clause_fields_rejected() {
        let backend = SqliteBackend::in_memory().unwrap();
        let predicate = Predicate {
            clauses: vec![FilterClause {
                fields: vec![],
                op: FilterOp::Eq,
                value: FieldValue::Text("x".into()),
            }],
            full_text: None,
        };
        assert!(backend.search_ids(&predicate).await.is_err());
    }
}
