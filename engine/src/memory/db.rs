//! SQLite row store backing the memory engine.
//!
//! Rows are the durable source of truth; the vector index under `index/` is
//! a rebuildable sidecar. WAL mode is enabled for concurrent readers. The
//! schema keeps metadata as a JSON text column so learned patterns can carry
//! arbitrary scalar fields without migrations.
//!
//! Ids are `INTEGER PRIMARY KEY AUTOINCREMENT`, so they are monotonically
//! increasing for the lifetime of the database and never reused after
//! deletion — the vector index relies on that.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Result};

/// A persisted memory row.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    /// Monotonic row id, unique within the database.
    pub id: u64,
    /// Owning namespace.
    pub namespace: String,
    /// Stored content.
    pub content: String,
    /// Arbitrary scalar metadata as a JSON object.
    pub metadata: serde_json::Value,
    /// Creation time, Unix seconds.
    pub created_at: i64,
    /// Last explicit update, Unix seconds. Always `>= created_at`.
    pub updated_at: i64,
    /// Last read or search match, Unix seconds. Feeds age-based pruning.
    pub last_accessed: i64,
}

/// The SQLite-backed row store.
pub struct MemoryDb {
    conn: Connection,
}

impl MemoryDb {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if the database cannot be opened or migrated —
    /// database open failure is fatal at startup by contract.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::Fatal(format!("cannot open memory.db: {e}")))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if SQLite cannot create the in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Fatal(format!("cannot open in-memory db: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // PRAGMA returns a row, so query_row instead of execute
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| EngineError::Fatal(format!("cannot enable WAL: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_namespace ON memories(namespace);",
        )
        .map_err(|e| EngineError::Fatal(format!("cannot migrate memory.db: {e}")))?;

        Ok(Self { conn })
    }

    /// Insert a new row and return its id.
    pub fn insert(
        &self,
        namespace: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<u64> {
        let now = Utc::now().timestamp();
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| EngineError::StoreFailed(format!("metadata not serializable: {e}")))?;
        self.conn.execute(
            "INSERT INTO memories (namespace, content, metadata, created_at, updated_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
            params![namespace, content, metadata_json, now],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    /// Fetch a single row by id. Does not bump `last_accessed`; callers that
    /// serve reads use [`Self::touch`].
    pub fn get(&self, id: u64) -> Result<Option<MemoryRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, namespace, content, metadata, created_at, updated_at, last_accessed
                 FROM memories WHERE id = ?1",
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(row)
    }

    /// Update content and/or metadata, bumping `updated_at`.
    ///
    /// Returns `false` when the id does not exist.
    pub fn update(
        &self,
        id: u64,
        content: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let changed = match (content, metadata) {
            (Some(c), Some(m)) => {
                let mj = serde_json::to_string(m)
                    .map_err(|e| EngineError::StoreFailed(e.to_string()))?;
                self.conn.execute(
                    "UPDATE memories SET content = ?2, metadata = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, c, mj, now],
                )?
            }
            (Some(c), None) => self.conn.execute(
                "UPDATE memories SET content = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, c, now],
            )?,
            (None, Some(m)) => {
                let mj = serde_json::to_string(m)
                    .map_err(|e| EngineError::StoreFailed(e.to_string()))?;
                self.conn.execute(
                    "UPDATE memories SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, mj, now],
                )?
            }
            (None, None) => 0,
        };
        Ok(changed > 0)
    }

    /// Delete rows by id inside one transaction. Returns the removed count.
    pub fn delete(&mut self, ids: &[u64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut removed = 0usize;
        {
            let mut stmt = tx.prepare("DELETE FROM memories WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Delete every row in a namespace. Returns the removed count.
    pub fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM memories WHERE namespace = ?1", params![namespace])?;
        Ok(removed)
    }

    /// Row count, optionally scoped to one namespace.
    pub fn count(&self, namespace: Option<&str>) -> Result<u64> {
        let count: i64 = match namespace {
            Some(ns) => self.conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE namespace = ?1",
                params![ns],
                |r| r.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?,
        };
        Ok(count as u64)
    }

    /// Distinct namespaces with at least one row, sorted.
    pub fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT namespace FROM memories ORDER BY namespace")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for ns in rows {
            out.push(ns?);
        }
        Ok(out)
    }

    /// Per-namespace row counts, for the pruning auto-trigger.
    pub fn namespace_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT namespace, COUNT(*) FROM memories GROUP BY namespace")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (ns, n) = row?;
            out.push((ns, n as u64));
        }
        Ok(out)
    }

    /// All rows in a namespace, id-ascending. Used by pruning and rebuild.
    pub fn rows_in_namespace(&self, namespace: &str) -> Result<Vec<MemoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, namespace, content, metadata, created_at, updated_at, last_accessed
             FROM memories WHERE namespace = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![namespace], row_to_memory)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `(id, namespace, content)` for every row, id-ascending. This is the
    /// index rebuild feed; content is embedded row by row.
    pub fn index_feed(&self) -> Result<Vec<(u64, String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, namespace, content FROM memories ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)? as u64,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All ids currently in the database.
    pub fn all_ids(&self) -> Result<HashSet<u64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM memories")?;
        let rows = stmt.query_map([], |r| Ok(r.get::<_, i64>(0)? as u64))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// Keyword candidates: rows in `namespace` whose content contains at
    /// least one query token, with the number of distinct tokens hit.
    ///
    /// Tokens must be lowercase alphanumeric (the shared tokenizer guarantees
    /// this), so no LIKE-escaping is needed. Candidates are capped to keep
    /// pathological queries bounded; hit counting happens in Rust.
    pub fn keyword_candidates(
        &self,
        namespace: &str,
        tokens: &[String],
        cap: usize,
    ) -> Result<Vec<(MemoryRow, u32)>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, namespace, content, metadata, created_at, updated_at, last_accessed
             FROM memories WHERE namespace = ?1 AND (",
        );
        for (i, _) in tokens.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str(&format!("lower(content) LIKE ?{}", i + 2));
        }
        sql.push_str(") ORDER BY updated_at DESC LIMIT ");
        sql.push_str(&cap.to_string());

        let mut stmt = self.conn.prepare(&sql)?;
        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(namespace.to_owned())];
        for token in tokens {
            params_vec.push(Box::new(format!("%{token}%")));
        }
        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(AsRef::as_ref).collect();

        let rows = stmt.query_map(params_refs.as_slice(), row_to_memory)?;
        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            let haystack = row.content.to_lowercase();
            let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count() as u32;
            if hits > 0 {
                out.push((row, hits));
            }
        }
        Ok(out)
    }

    /// Bump `last_accessed` for a set of rows that were read or matched.
    pub fn touch(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut stmt = self
            .conn
            .prepare("UPDATE memories SET last_accessed = ?2 WHERE id = ?1")?;
        for id in ids {
            stmt.execute(params![id, now])?;
        }
        Ok(())
    }

    /// Lightweight liveness probe for health reporting.
    pub fn probe(&self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .is_ok()
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    let metadata_json: String = row.get(3)?;
    Ok(MemoryRow {
        id: row.get::<_, i64>(0)? as u64,
        namespace: row.get(1)?,
        content: row.get(2)?,
        metadata: serde_json::from_str(&metadata_json)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        last_accessed: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
