//! SQLite backend for the primary whisper store
//!
//! One row per whisper in `whispers`, with tags duplicated into
//! `whisper_tags` for indexed tag filtering. Full-text search uses an
//! external-content FTS5 table kept in step by triggers; it is declared by
//! `ensure_indexes`, not at open.

use super::sqlite::{text_to_timestamp, timestamp_to_text, with_connection};
use super::traits::{OpenStore, PrimaryStore, StorageError, StorageResult, UpsertOutcome};
use crate::model::{normalize_tags, Whisper, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SELECT_WHISPER: &str = "SELECT w.id, w.source_path, w.raw_text, w.created_at, w.updated_at,
        w.tags_json, w.embedding, w.tokens, w.revision
     FROM whispers w";

/// Encode a float vector as little-endian f32 bytes.
fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Quote every term so user input is never parsed as FTS5 syntax.
/// Terms are OR-ed; bm25 ranks documents matching more of them higher.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Raw column values of one `whispers` row
struct WhisperRow {
    id: String,
    source_path: String,
    raw_text: String,
    created_at: String,
    updated_at: String,
    tags_json: String,
    embedding: Option<Vec<u8>>,
    tokens: Option<i64>,
    revision: i64,
}

impl WhisperRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_path: row.get(1)?,
            raw_text: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            tags_json: row.get(5)?,
            embedding: row.get(6)?,
            tokens: row.get(7)?,
            revision: row.get(8)?,
        })
    }

    fn into_whisper(self) -> StorageResult<Whisper> {
        let tags: BTreeSet<String> = serde_json::from_str(&self.tags_json)?;
        Ok(Whisper {
            id: WhisperId::from_stored(self.id),
            source_path: self.source_path,
            raw_text: self.raw_text,
            created_at: text_to_timestamp(&self.created_at)?,
            updated_at: text_to_timestamp(&self.updated_at)?,
            tags,
            embedding: self.embedding.as_deref().map(blob_to_vec),
            tokens: self.tokens.and_then(|t| u32::try_from(t).ok()),
            revision: u64::try_from(self.revision).unwrap_or(0),
        })
    }
}

/// SQLite-backed primary whisper store
///
/// Thread-safe via an internal mutex on the connection. Each trait method
/// runs in a single transaction on the blocking pool.
pub struct SqliteWhisperStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWhisperStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS whispers (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL UNIQUE,
                raw_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                embedding BLOB,
                tokens INTEGER,
                revision INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS whisper_tags (
                whisper_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (whisper_id, tag),
                FOREIGN KEY (whisper_id) REFERENCES whispers(id) ON DELETE CASCADE
            );

            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn ensure_indexes_sync(conn: &Connection) -> StorageResult<()> {
        let fts_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = 'whispers_fts'",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);

        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_whispers_created_at ON whispers(created_at);
            CREATE INDEX IF NOT EXISTS idx_whisper_tags_tag ON whisper_tags(tag);

            CREATE VIRTUAL TABLE IF NOT EXISTS whispers_fts
                USING fts5(raw_text, content='whispers');

            CREATE TRIGGER IF NOT EXISTS whispers_fts_ai AFTER INSERT ON whispers BEGIN
                INSERT INTO whispers_fts(rowid, raw_text) VALUES (new.rowid, new.raw_text);
            END;
            CREATE TRIGGER IF NOT EXISTS whispers_fts_ad AFTER DELETE ON whispers BEGIN
                INSERT INTO whispers_fts(whispers_fts, rowid, raw_text)
                    VALUES ('delete', old.rowid, old.raw_text);
            END;
            CREATE TRIGGER IF NOT EXISTS whispers_fts_au AFTER UPDATE OF raw_text ON whispers BEGIN
                INSERT INTO whispers_fts(whispers_fts, rowid, raw_text)
                    VALUES ('delete', old.rowid, old.raw_text);
                INSERT INTO whispers_fts(rowid, raw_text) VALUES (new.rowid, new.raw_text);
            END;
            "#,
        )?;

        // Rows written before the text index existed
        if !fts_exists {
            conn.execute("INSERT INTO whispers_fts(whispers_fts) VALUES ('rebuild')", [])?;
        }
        Ok(())
    }

    fn load_by_id(conn: &Connection, id: &str) -> StorageResult<Option<Whisper>> {
        let sql = format!("{} WHERE w.id = ?1", SELECT_WHISPER);
        conn.query_row(&sql, params![id], WhisperRow::read)
            .optional()?
            .map(WhisperRow::into_whisper)
            .transpose()
    }

    fn load_by_source_path(conn: &Connection, source_path: &str) -> StorageResult<Option<Whisper>> {
        let sql = format!("{} WHERE w.source_path = ?1", SELECT_WHISPER);
        conn.query_row(&sql, params![source_path], WhisperRow::read)
            .optional()?
            .map(WhisperRow::into_whisper)
            .transpose()
    }

    fn replace_tag_rows(conn: &Connection, id: &str, tags: &BTreeSet<String>) -> StorageResult<()> {
        conn.execute("DELETE FROM whisper_tags WHERE whisper_id = ?1", params![id])?;
        let mut stmt = conn.prepare("INSERT INTO whisper_tags (whisper_id, tag) VALUES (?1, ?2)")?;
        for tag in tags {
            stmt.execute(params![id, tag])?;
        }
        Ok(())
    }

    fn upsert_sync(conn: &mut Connection, draft: &WhisperDraft) -> StorageResult<UpsertOutcome> {
        let tags = draft.normalized_tags();
        let tags_json = serde_json::to_string(&tags)?;
        let embedding = draft.embedding.as_deref().map(vec_to_blob);
        let tokens = draft.tokens.map(i64::from);
        let now = Utc::now();

        let tx = conn.transaction()?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, tags_json FROM whispers WHERE source_path = ?1",
                params![draft.source_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (id, previous_tags) = match existing {
            Some((id, previous_json)) => {
                let previous: BTreeSet<String> = serde_json::from_str(&previous_json)?;
                // An upsert never clears a stored embedding
                tx.execute(
                    r#"
                    UPDATE whispers SET
                        raw_text = ?2,
                        updated_at = ?3,
                        tags_json = ?4,
                        embedding = COALESCE(?5, embedding),
                        tokens = ?6,
                        revision = revision + 1
                    WHERE id = ?1
                    "#,
                    params![id, draft.raw_text, timestamp_to_text(&now), tags_json, embedding, tokens],
                )?;
                (id, Some(previous))
            }
            None => {
                let id = WhisperId::mint().as_str().to_string();
                let created_at = draft.created_at.unwrap_or(now);
                tx.execute(
                    r#"
                    INSERT INTO whispers
                        (id, source_path, raw_text, created_at, updated_at, tags_json, embedding, tokens, revision)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
                    "#,
                    params![
                        id,
                        draft.source_path,
                        draft.raw_text,
                        timestamp_to_text(&created_at),
                        timestamp_to_text(&now),
                        tags_json,
                        embedding,
                        tokens,
                    ],
                )?;
                (id, None)
            }
        };

        Self::replace_tag_rows(&tx, &id, &tags)?;
        let whisper = Self::load_by_id(&tx, &id)?
            .ok_or_else(|| StorageError::NodeNotFound(id.clone()))?;
        tx.commit()?;

        Ok(UpsertOutcome {
            whisper,
            previous_tags,
        })
    }

    fn update_sync(
        conn: &mut Connection,
        id: &str,
        patch: &WhisperPatch,
    ) -> StorageResult<Option<Whisper>> {
        let tx = conn.transaction()?;
        if Self::load_by_id(&tx, id)?.is_none() {
            return Ok(None);
        }
        if patch.is_empty() {
            return Self::load_by_id(&tx, id);
        }

        if let Some(tags) = &patch.tags {
            let tags = normalize_tags(tags);
            tx.execute(
                "UPDATE whispers SET tags_json = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(&tags)?],
            )?;
            Self::replace_tag_rows(&tx, id, &tags)?;
        }
        if let Some(embedding) = &patch.embedding {
            tx.execute(
                "UPDATE whispers SET embedding = ?2 WHERE id = ?1",
                params![id, vec_to_blob(embedding)],
            )?;
        }
        if let Some(tokens) = patch.tokens {
            tx.execute(
                "UPDATE whispers SET tokens = ?2 WHERE id = ?1",
                params![id, i64::from(tokens)],
            )?;
        }
        tx.execute(
            "UPDATE whispers SET revision = revision + 1, updated_at = ?2 WHERE id = ?1",
            params![id, timestamp_to_text(&Utc::now())],
        )?;

        let updated = Self::load_by_id(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn find_sync(conn: &Connection, filter: &WhisperFilter) -> StorageResult<Vec<Whisper>> {
        let mut sql = format!("{} WHERE 1 = 1", SELECT_WHISPER);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref tag) = filter.tag {
            params_vec.push(Box::new(tag.clone()));
            sql.push_str(&format!(
                " AND w.id IN (SELECT whisper_id FROM whisper_tags WHERE tag = ?{})",
                params_vec.len()
            ));
        }
        if let Some(after) = filter.created_after {
            params_vec.push(Box::new(timestamp_to_text(&after)));
            sql.push_str(&format!(" AND w.created_at >= ?{}", params_vec.len()));
        }
        if let Some(before) = filter.created_before {
            params_vec.push(Box::new(timestamp_to_text(&before)));
            sql.push_str(&format!(" AND w.created_at < ?{}", params_vec.len()));
        }
        sql.push_str(" ORDER BY w.created_at DESC, w.rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), WhisperRow::read)?;

        let mut whispers = Vec::new();
        for row in rows {
            whispers.push(row?.into_whisper()?);
        }
        Ok(whispers)
    }

    fn search_sync(conn: &Connection, query: &str, limit: usize) -> StorageResult<Vec<Whisper>> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{} JOIN whispers_fts ON whispers_fts.rowid = w.rowid
             WHERE whispers_fts MATCH ?1
             ORDER BY bm25(whispers_fts)
             LIMIT ?2",
            SELECT_WHISPER
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![match_expr, limit], WhisperRow::read)?;

        let mut whispers = Vec::new();
        for row in rows {
            whispers.push(row?.into_whisper()?);
        }
        Ok(whispers)
    }
}

impl OpenStore for SqliteWhisperStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

#[async_trait]
impl PrimaryStore for SqliteWhisperStore {
    async fn ensure_indexes(&self) -> StorageResult<()> {
        with_connection(&self.conn, |conn| Self::ensure_indexes_sync(conn)).await
    }

    async fn upsert_by_source_path(&self, draft: &WhisperDraft) -> StorageResult<UpsertOutcome> {
        let draft = draft.clone();
        with_connection(&self.conn, move |conn| Self::upsert_sync(conn, &draft)).await
    }

    async fn find_by_id(&self, id: &WhisperId) -> StorageResult<Option<Whisper>> {
        let id = id.as_str().to_string();
        with_connection(&self.conn, move |conn| Self::load_by_id(conn, &id)).await
    }

    async fn find_by_source_path(&self, source_path: &str) -> StorageResult<Option<Whisper>> {
        let source_path = source_path.to_string();
        with_connection(&self.conn, move |conn| {
            Self::load_by_source_path(conn, &source_path)
        })
        .await
    }

    async fn find(&self, filter: &WhisperFilter) -> StorageResult<Vec<Whisper>> {
        let filter = filter.clone();
        with_connection(&self.conn, move |conn| Self::find_sync(conn, &filter)).await
    }

    async fn search_text(&self, query: &str, limit: usize) -> StorageResult<Vec<Whisper>> {
        let query = query.to_string();
        with_connection(&self.conn, move |conn| Self::search_sync(conn, &query, limit)).await
    }

    async fn update_fields(
        &self,
        id: &WhisperId,
        patch: &WhisperPatch,
    ) -> StorageResult<Option<Whisper>> {
        let id = id.as_str().to_string();
        let patch = patch.clone();
        with_connection(&self.conn, move |conn| Self::update_sync(conn, &id, &patch)).await
    }

    async fn delete(&self, id: &WhisperId) -> StorageResult<bool> {
        let id = id.as_str().to_string();
        with_connection(&self.conn, move |conn| {
            let rows = conn.execute("DELETE FROM whispers WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
        .await
    }
}
