//! SQLite-backed answer cache, sharing the authoritative store's database.
//!
//! Invalidation is a tombstone (`invalidated_at`), so "was this answer
//! served from cache or regenerated" stays answerable after the fact.

use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{AnswerCache, CacheError, CachedAnswer};
use crate::db::sqlite::DATETIME_FORMAT;

pub struct SqliteAnswerCache {
    conn: Mutex<Connection>,
}

impl SqliteAnswerCache {
    /// Wrap a connection whose database carries the answer_cache tables
    /// (created by the store migrations).
    pub fn new(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn storage_err<E: std::fmt::Display>(e: E) -> CacheError {
    CacheError::Storage(e.to_string())
}

impl AnswerCache for SqliteAnswerCache {
    fn get(&self, cache_key: &str) -> Result<Option<CachedAnswer>, CacheError> {
        let now = chrono::Utc::now().naive_utc();
        let conn = self.lock();

        let mut stmt = conn
            .prepare(
                "SELECT cache_key, query, answer_text, model_version, created_at, expires_at
                 FROM answer_cache
                 WHERE cache_key = ?1 AND invalidated_at IS NULL AND expires_at > ?2",
            )
            .map_err(storage_err)?;
        let mut rows = stmt
            .query_map(
                params![cache_key, now.format(DATETIME_FORMAT).to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map_err(storage_err)?;

        let row = match rows.next() {
            Some(row) => row.map_err(storage_err)?,
            None => return Ok(None),
        };

        let mut doc_stmt = conn
            .prepare(
                "SELECT document_id FROM answer_cache_documents
                 WHERE cache_key = ?1 ORDER BY document_id",
            )
            .map_err(storage_err)?;
        let document_ids = doc_stmt
            .query_map(params![cache_key], |r| r.get::<_, String>(0))
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?
            .into_iter()
            .map(|s| Uuid::parse_str(&s).map_err(storage_err))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(CachedAnswer {
            cache_key: row.0,
            query: row.1,
            answer_text: row.2,
            model_version: row.3,
            document_ids,
            created_at: NaiveDateTime::parse_from_str(&row.4, DATETIME_FORMAT)
                .unwrap_or_default(),
            expires_at: NaiveDateTime::parse_from_str(&row.5, DATETIME_FORMAT)
                .unwrap_or_default(),
        }))
    }

    fn put(&self, answer: CachedAnswer) -> Result<(), CacheError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(storage_err)?;

        tx.execute(
            "INSERT INTO answer_cache
             (cache_key, query, answer_text, model_version, created_at, expires_at, invalidated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
             ON CONFLICT(cache_key) DO UPDATE SET
               answer_text = excluded.answer_text,
               model_version = excluded.model_version,
               created_at = excluded.created_at,
               expires_at = excluded.expires_at,
               invalidated_at = NULL",
            params![
                answer.cache_key,
                answer.query,
                answer.answer_text,
                answer.model_version,
                answer.created_at.format(DATETIME_FORMAT).to_string(),
                answer.expires_at.format(DATETIME_FORMAT).to_string(),
            ],
        )
        .map_err(storage_err)?;

        tx.execute(
            "DELETE FROM answer_cache_documents WHERE cache_key = ?1",
            params![answer.cache_key],
        )
        .map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO answer_cache_documents (cache_key, document_id)
                     VALUES (?1, ?2)",
                )
                .map_err(storage_err)?;
            for id in &answer.document_ids {
                stmt.execute(params![answer.cache_key, id.to_string()])
                    .map_err(storage_err)?;
            }
        }

        tx.commit().map_err(storage_err)
    }

    fn invalidate_documents(&self, document_ids: &[Uuid]) -> Result<usize, CacheError> {
        if document_ids.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().naive_utc();
        let conn = self.lock();

        let placeholders = (1..=document_ids.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE answer_cache SET invalidated_at = ?1
             WHERE invalidated_at IS NULL
               AND cache_key IN (SELECT DISTINCT cache_key FROM answer_cache_documents
                                 WHERE document_id IN ({placeholders}))"
        );

        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(now.format(DATETIME_FORMAT).to_string())];
        values.extend(
            document_ids
                .iter()
                .map(|id| rusqlite::types::Value::Text(id.to_string())),
        );

        let affected = conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))
            .map_err(storage_err)?;
        Ok(affected)
    }

    fn purge_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "DELETE FROM answer_cache WHERE expires_at <= ?1",
                params![now.format(DATETIME_FORMAT).to_string()],
            )
            .map_err(storage_err)?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::answer_cache_key;
    use crate::db::sqlite::open_memory_database;
    use chrono::Duration;

    fn cache() -> SqliteAnswerCache {
        SqliteAnswerCache::new(open_memory_database().unwrap())
    }

    fn answer(doc_ids: Vec<Uuid>, ttl_secs: i64) -> CachedAnswer {
        let now = chrono::Utc::now().naive_utc();
        CachedAnswer {
            cache_key: answer_cache_key("sum of invoices", &doc_ids),
            query: "sum of invoices".into(),
            answer_text: "The sum is $500.".into(),
            model_version: Some("answer-70b".into()),
            document_ids: doc_ids,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn put_then_get_round_trips_documents() {
        let cache = cache();
        let docs = vec![Uuid::new_v4(), Uuid::new_v4()];
        let a = answer(docs.clone(), 3600);
        let key = a.cache_key.clone();
        cache.put(a).unwrap();

        let fetched = cache.get(&key).unwrap().unwrap();
        assert_eq!(fetched.answer_text, "The sum is $500.");
        assert_eq!(fetched.document_ids.len(), 2);
        for id in docs {
            assert!(fetched.document_ids.contains(&id));
        }
    }

    #[test]
    fn expired_entries_are_invisible() {
        let cache = cache();
        let a = answer(vec![Uuid::new_v4()], -5);
        let key = a.cache_key.clone();
        cache.put(a).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn invalidation_tombstones_matching_entries() {
        let cache = cache();
        let shared = Uuid::new_v4();
        let a = answer(vec![shared], 3600);
        let b = answer(vec![Uuid::new_v4()], 3600);
        let key_a = a.cache_key.clone();
        let key_b = b.cache_key.clone();
        cache.put(a).unwrap();
        cache.put(b).unwrap();

        assert_eq!(cache.invalidate_documents(&[shared]).unwrap(), 1);
        assert!(cache.get(&key_a).unwrap().is_none());
        assert!(cache.get(&key_b).unwrap().is_some());
    }

    #[test]
    fn reput_clears_tombstone() {
        let cache = cache();
        let doc = Uuid::new_v4();
        let a = answer(vec![doc], 3600);
        let key = a.cache_key.clone();
        cache.put(a.clone()).unwrap();
        cache.invalidate_documents(&[doc]).unwrap();
        assert!(cache.get(&key).unwrap().is_none());

        cache.put(a).unwrap();
        assert!(cache.get(&key).unwrap().is_some());
    }

    #[test]
    fn purge_deletes_expired_rows() {
        let cache = cache();
        cache.put(answer(vec![Uuid::new_v4()], -5)).unwrap();
        cache.put(answer(vec![Uuid::new_v4()], 3600)).unwrap();
        let purged = cache.purge_expired(chrono::Utc::now().naive_utc()).unwrap();
        assert_eq!(purged, 1);
    }
}
