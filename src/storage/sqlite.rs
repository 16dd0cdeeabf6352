//! SQLite backend for the relationship mirror
//!
//! Nodes, edges, and tombstones live in three tables, every row scoped by
//! partition name. A batch runs inside one transaction on the store's
//! connection, so guards and tombstone checks see the same state the
//! writes are applied to.

use super::traits::{MirrorStore, OpenStore, StorageError, StorageResult};
use crate::graph::{
    BatchOutcome, MirrorBatch, MirrorEdge, MirrorNode, MirrorOp, NodeRef, Partition, Properties,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Run `f` against the connection on the blocking thread pool.
pub(crate) async fn with_connection<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&mut guard)
    })
    .await?
}

/// RFC 3339 with fixed precision, so stored timestamps sort as text.
pub(crate) fn timestamp_to_text(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn text_to_timestamp(text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(e.to_string()))
}

/// SQLite-backed graph mirror
///
/// Thread-safe via an internal mutex on the connection. Several partitions
/// may share a database file; each store instance only sees its own.
pub struct SqliteGraphStore {
    conn: Arc<Mutex<Connection>>,
    partition: Partition,
}

impl SqliteGraphStore {
    /// Scope this store to a different partition.
    pub fn with_partition(mut self, partition: impl Into<Partition>) -> Self {
        self.partition = partition.into();
        self
    }

    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                partition_name TEXT NOT NULL,
                label TEXT NOT NULL,
                node_key TEXT NOT NULL,
                properties_json TEXT NOT NULL,
                PRIMARY KEY (partition_name, label, node_key)
            );

            CREATE TABLE IF NOT EXISTS edges (
                partition_name TEXT NOT NULL,
                from_label TEXT NOT NULL,
                from_key TEXT NOT NULL,
                relationship TEXT NOT NULL,
                to_label TEXT NOT NULL,
                to_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (partition_name, from_label, from_key, relationship, to_label, to_key)
            );

            -- Reverse traversal (e.g. all whispers tagged X)
            CREATE INDEX IF NOT EXISTS idx_edges_target
                ON edges(partition_name, to_label, to_key, relationship);

            CREATE TABLE IF NOT EXISTS tombstones (
                partition_name TEXT NOT NULL,
                label TEXT NOT NULL,
                node_key TEXT NOT NULL,
                deleted_at TEXT NOT NULL,
                PRIMARY KEY (partition_name, label, node_key)
            );

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            partition: Partition::default(),
        })
    }

    fn is_tombstoned(conn: &Connection, partition: &str, node: &NodeRef) -> StorageResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tombstones WHERE partition_name = ?1 AND label = ?2 AND node_key = ?3",
                params![partition, node.label, node.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_node_sync(
        conn: &Connection,
        partition: &str,
        node: &NodeRef,
    ) -> StorageResult<Option<MirrorNode>> {
        let properties_json: Option<String> = conn
            .query_row(
                "SELECT properties_json FROM nodes
                 WHERE partition_name = ?1 AND label = ?2 AND node_key = ?3",
                params![partition, node.label, node.key],
                |row| row.get(0),
            )
            .optional()?;

        match properties_json {
            Some(json) => Ok(Some(MirrorNode {
                node: node.clone(),
                properties: serde_json::from_str(&json)?,
            })),
            None => Ok(None),
        }
    }

    fn merge_node_sync(
        conn: &Connection,
        partition: &str,
        node: &NodeRef,
        set: &Properties,
    ) -> StorageResult<()> {
        let mut properties = Self::load_node_sync(conn, partition, node)?
            .map(|n| n.properties)
            .unwrap_or_default();
        for (k, v) in set {
            properties.insert(k.clone(), v.clone());
        }
        let properties_json = serde_json::to_string(&properties)?;

        conn.execute(
            r#"
            INSERT INTO nodes (partition_name, label, node_key, properties_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(partition_name, label, node_key) DO UPDATE SET
                properties_json = excluded.properties_json
            "#,
            params![partition, node.label, node.key, properties_json],
        )?;
        Ok(())
    }

    fn node_exists(conn: &Connection, partition: &str, node: &NodeRef) -> StorageResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE partition_name = ?1 AND label = ?2 AND node_key = ?3",
                params![partition, node.label, node.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn merge_edge_sync(
        conn: &Connection,
        partition: &str,
        from: &NodeRef,
        relationship: &str,
        to: &NodeRef,
    ) -> StorageResult<()> {
        for endpoint in [from, to] {
            if !Self::node_exists(conn, partition, endpoint)? {
                return Err(StorageError::NodeNotFound(endpoint.to_string()));
            }
        }
        conn.execute(
            r#"
            INSERT OR IGNORE INTO edges
                (partition_name, from_label, from_key, relationship, to_label, to_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                partition,
                from.label,
                from.key,
                relationship,
                to.label,
                to.key,
                timestamp_to_text(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn detach_delete_sync(conn: &Connection, partition: &str, node: &NodeRef) -> StorageResult<()> {
        conn.execute(
            "DELETE FROM edges WHERE partition_name = ?1
               AND ((from_label = ?2 AND from_key = ?3) OR (to_label = ?2 AND to_key = ?3))",
            params![partition, node.label, node.key],
        )?;
        conn.execute(
            "DELETE FROM nodes WHERE partition_name = ?1 AND label = ?2 AND node_key = ?3",
            params![partition, node.label, node.key],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO tombstones (partition_name, label, node_key, deleted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![partition, node.label, node.key, timestamp_to_text(&Utc::now())],
        )?;
        Ok(())
    }

    fn execute_sync(
        conn: &mut Connection,
        partition: &str,
        batch: &MirrorBatch,
    ) -> StorageResult<BatchOutcome> {
        // Dropping the transaction without commit rolls it back.
        let tx = conn.transaction()?;

        for node in batch.merged_nodes() {
            if Self::is_tombstoned(&tx, partition, node)? {
                return Ok(BatchOutcome::Stale);
            }
        }

        if let Some(guard) = &batch.guard {
            let stored = Self::load_node_sync(&tx, partition, &guard.node)?
                .map(|n| n.int_or_zero(&guard.property))
                .unwrap_or(0);
            if !guard.admits(stored) {
                return Ok(BatchOutcome::Stale);
            }
        }

        for op in &batch.ops {
            match op {
                MirrorOp::MergeNode { node, set } => {
                    Self::merge_node_sync(&tx, partition, node, set)?;
                }
                MirrorOp::MergeEdge {
                    from,
                    relationship,
                    to,
                } => {
                    Self::merge_edge_sync(&tx, partition, from, relationship, to)?;
                }
                MirrorOp::DeleteEdges { from, relationship } => {
                    tx.execute(
                        "DELETE FROM edges WHERE partition_name = ?1
                           AND from_label = ?2 AND from_key = ?3 AND relationship = ?4",
                        params![partition, from.label, from.key, relationship],
                    )?;
                }
                MirrorOp::DetachDelete { node } => {
                    Self::detach_delete_sync(&tx, partition, node)?;
                }
            }
        }

        tx.commit()?;
        Ok(BatchOutcome::Applied)
    }

    fn row_to_edge(
        from_label: String,
        from_key: String,
        relationship: String,
        to_label: String,
        to_key: String,
        created_at: String,
    ) -> StorageResult<MirrorEdge> {
        Ok(MirrorEdge {
            from: NodeRef::new(from_label, from_key),
            relationship,
            to: NodeRef::new(to_label, to_key),
            created_at: text_to_timestamp(&created_at)?,
        })
    }

    fn query_edges(
        conn: &Connection,
        partition: &str,
        anchor_columns: (&str, &str),
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>> {
        let (label_col, key_col) = anchor_columns;
        let mut sql = format!(
            "SELECT from_label, from_key, relationship, to_label, to_key, created_at
             FROM edges WHERE partition_name = ?1 AND {} = ?2 AND {} = ?3",
            label_col, key_col
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(partition.to_string()),
            Box::new(node.label.clone()),
            Box::new(node.key.clone()),
        ];
        if let Some(rel) = relationship {
            sql.push_str(" AND relationship = ?4");
            params_vec.push(Box::new(rel.to_string()));
        }
        sql.push_str(" ORDER BY relationship, to_label, to_key, from_label, from_key");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut edges = Vec::new();
        for row in rows {
            let (fl, fk, rel, tl, tk, created) = row?;
            edges.push(Self::row_to_edge(fl, fk, rel, tl, tk, created)?);
        }
        Ok(edges)
    }
}

impl OpenStore for SqliteGraphStore {
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
impl MirrorStore for SqliteGraphStore {
    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn execute(&self, batch: MirrorBatch) -> StorageResult<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::Applied);
        }
        let partition = self.partition.as_str().to_string();
        with_connection(&self.conn, move |conn| {
            Self::execute_sync(conn, &partition, &batch)
        })
        .await
    }

    async fn load_node(&self, node: &NodeRef) -> StorageResult<Option<MirrorNode>> {
        let partition = self.partition.as_str().to_string();
        let node = node.clone();
        with_connection(&self.conn, move |conn| {
            Self::load_node_sync(conn, &partition, &node)
        })
        .await
    }

    async fn edges_from(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>> {
        let partition = self.partition.as_str().to_string();
        let node = node.clone();
        let relationship = relationship.map(str::to_string);
        with_connection(&self.conn, move |conn| {
            Self::query_edges(
                conn,
                &partition,
                ("from_label", "from_key"),
                &node,
                relationship.as_deref(),
            )
        })
        .await
    }

    async fn edges_to(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>> {
        let partition = self.partition.as_str().to_string();
        let node = node.clone();
        let relationship = relationship.map(str::to_string);
        with_connection(&self.conn, move |conn| {
            Self::query_edges(
                conn,
                &partition,
                ("to_label", "to_key"),
                &node,
                relationship.as_deref(),
            )
        })
        .await
    }
}
