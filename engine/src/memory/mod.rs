//! The memory engine — durable, thread-safe, namespaced storage with
//! keyword, semantic, and hybrid search.
//!
//! Rows live in SQLite ([`db`]); vectors live in a flat rebuildable index
//! ([`index`]); embeddings come from a pluggable provider ([`embedding`]).
//! All other components hold opaque row ids — never references into the
//! store — so the false-positive detector can read while the safety gate
//! writes without either holding back-pointers.
//!
//! ## Search contract
//!
//! - Keyword scores are normalized to `[0, 1]` via `1 - exp(-hits * alpha)`.
//! - Semantic scores are calibrated cosine: `sqrt(max(cos, 0))`, which puts
//!   "clearly related" token overlap above 0.5.
//! - Hybrid merges per id by `max(kw * w_k, sem * w_s)`, tags items found by
//!   both paths as `hybrid`, and breaks score ties by `updated_at` desc.
//! - When the index is unavailable or rebuilding, semantic and hybrid
//!   requests degrade to keyword-only and every hit is tagged `keyword`, so
//!   callers cannot mistake the mode.
//!
//! ## Crash safety
//!
//! A write appends the row first, then adds the vector. On a crash between
//! the two, startup recovery re-embeds any row whose id is absent from the
//! index, and drops index entries whose rows are gone (interrupted prune).

pub mod db;
pub mod embedding;
pub mod index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, MemoryConfig, SearchConfig};
use crate::error::{EngineError, Result};
use db::{MemoryDb, MemoryRow};
use embedding::EmbeddingProvider;
use index::VectorIndex;

/// Shared namespace for cross-language findings and engine bookkeeping.
pub const NS_GLOBAL: &str = "global";
/// Namespace holding false-positive feedback; never pruned by default.
pub const NS_FALSE_POSITIVES: &str = "false-positives";
/// Namespace seeded by the `train` verb.
pub const NS_TRAINING: &str = "training";

/// How a search hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Exact id lookup.
    Id,
    /// Tokenized keyword match.
    Keyword,
    /// Vector cosine match.
    Semantic,
    /// Found by both keyword and semantic paths.
    Hybrid,
}

/// Requested search mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Keyword only.
    Keyword,
    /// Semantic only; degrades to keyword when the index is unavailable.
    Semantic,
    /// Merge of both paths (the default).
    Hybrid,
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    /// Row id.
    pub id: u64,
    /// Owning namespace.
    pub namespace: String,
    /// Stored content.
    pub content: String,
    /// Stored metadata object.
    pub metadata: serde_json::Value,
    /// Normalized score in `[0, 1]`.
    pub score: f32,
    /// How this hit was found.
    pub search_type: SearchType,
    /// Last update time (Unix seconds), used for tie-breaking.
    pub updated_at: i64,
}

/// Database liveness, as reported by [`MemoryEngine::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbStatus {
    /// Probes succeed.
    Ok,
    /// Probes succeed but a recent write failed.
    Degraded,
    /// Probes fail.
    Down,
}

/// Vector index state, as reported by [`MemoryEngine::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    /// Semantic search is serving.
    Ok,
    /// The index is being rebuilt from rows; queries degrade to keyword.
    Rebuilding,
    /// No embedding provider; semantic mode is off.
    Unavailable,
}

/// Snapshot of engine health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Database liveness.
    pub db: DbStatus,
    /// Vector index state.
    pub index: IndexStatus,
    /// Persisted row count.
    pub memory_count: u64,
}

/// The process-wide memory service.
///
/// Constructed once via [`MemoryEngine::init`]; every component receives the
/// handle. Internally synchronized — safe to call from any rayon worker.
pub struct MemoryEngine {
    db: Mutex<MemoryDb>,
    vindex: RwLock<VectorIndex>,
    index_status: RwLock<IndexStatus>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    index_dir: PathBuf,
    search_cfg: SearchConfig,
    memory_cfg: MemoryConfig,
    writes_since_flush: AtomicUsize,
    degraded: std::sync::atomic::AtomicBool,
    /// Held for the engine's lifetime; dropping releases the advisory lock.
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("index_dir", &self.index_dir)
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Open the store under `config.state_dir`.
    ///
    /// Acquires the state-directory lock, opens the database, and loads the
    /// vector index. A corrupt or missing index is not rebuilt here — the
    /// status is left at `Rebuilding` and queries serve keyword-only until
    /// [`Self::rebuild_index`] runs (the engine handle calls it right after
    /// construction).
    ///
    /// # Errors
    ///
    /// `AlreadyLocked` if another process holds the state directory;
    /// `Fatal` if the directory is not writable or the database is unusable.
    pub fn init(config: &EngineConfig) -> Result<Self> {
        let state_dir = &config.state_dir;
        std::fs::create_dir_all(state_dir)
            .map_err(|e| EngineError::Fatal(format!("state dir not writable: {e}")))?;

        let lock_path = state_dir.join("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| EngineError::Fatal(format!("cannot open lock file: {e}")))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::AlreadyLocked)?;

        let db = MemoryDb::open(&state_dir.join("memory.db"))?;
        let embedder = embedding::build_provider(&config.embedder);
        let index_dir = state_dir.join("index");

        let (vindex, status) = match &embedder {
            None => (VectorIndex::new(embedding::DEFAULT_DIM), IndexStatus::Unavailable),
            Some(provider) => match VectorIndex::load(&index_dir, provider.dimension()) {
                Ok(idx) => (idx, IndexStatus::Ok),
                Err(e) => {
                    log::warn!("vector index unusable ({e}); rebuilding from rows");
                    (VectorIndex::new(provider.dimension()), IndexStatus::Rebuilding)
                }
            },
        };

        let engine = Self {
            db: Mutex::new(db),
            vindex: RwLock::new(vindex),
            index_status: RwLock::new(status),
            embedder,
            index_dir,
            search_cfg: config.search.clone(),
            memory_cfg: config.memory.clone(),
            writes_since_flush: AtomicUsize::new(0),
            degraded: std::sync::atomic::AtomicBool::new(false),
            _lock_file: lock_file,
        };

        if status == IndexStatus::Ok {
            engine.repair_index_drift()?;
        }

        Ok(engine)
    }

    /// Reconcile index and rows after a clean load: re-embed rows missing
    /// from the index (crash between row append and vector add) and drop
    /// index entries whose rows are gone (interrupted prune).
    fn repair_index_drift(&self) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };

        let (db_ids, feed) = {
            let db = self.db.lock().expect("memory db lock");
            (db.all_ids()?, db.index_feed()?)
        };

        let mut vindex = self.vindex.write().expect("vector index lock");
        let stale: std::collections::HashSet<u64> =
            vindex.ids().difference(&db_ids).copied().collect();
        if !stale.is_empty() {
            log::info!("dropping {} stale index entries", stale.len());
            vindex.remove(&stale);
        }

        let mut repaired = 0usize;
        for (id, namespace, content) in feed {
            if !vindex.contains(id) {
                vindex.add(id, &namespace, &embedder.embed(&content));
                repaired += 1;
            }
        }
        if repaired > 0 {
            log::info!("re-embedded {repaired} rows missing from the index");
        }
        if repaired > 0 || !stale.is_empty() {
            vindex.save(&self.index_dir)?;
        }
        Ok(())
    }

    /// Rebuild the vector index from persisted rows.
    ///
    /// No-op when no embedding provider is configured. On success the index
    /// status transitions to `Ok` and subsequent queries serve semantic
    /// results again.
    ///
    /// # Errors
    ///
    /// Propagates database read and index write failures.
    pub fn rebuild_index(&self) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        if *self.index_status.read().expect("index status lock") == IndexStatus::Ok {
            return Ok(());
        }

        let feed = {
            let db = self.db.lock().expect("memory db lock");
            db.index_feed()?
        };

        let mut fresh = VectorIndex::new(embedder.dimension());
        for (id, namespace, content) in feed {
            fresh.add(id, &namespace, &embedder.embed(&content));
        }
        fresh.save(&self.index_dir)?;

        *self.vindex.write().expect("vector index lock") = fresh;
        *self.index_status.write().expect("index status lock") = IndexStatus::Ok;
        log::info!("vector index rebuilt");
        Ok(())
    }

    /// Store a new memory and return its id.
    ///
    /// # Errors
    ///
    /// `ContentTooLarge` when the content exceeds the configured cap;
    /// `Store`/`StoreFailed` when the row cannot be persisted. Index-side
    /// failures degrade (logged, recovered at next startup) rather than
    /// failing the call once the row is durable.
    pub fn store(
        &self,
        namespace: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<u64> {
        if content.len() > self.memory_cfg.max_content_bytes {
            return Err(EngineError::ContentTooLarge {
                size: content.len(),
                max: self.memory_cfg.max_content_bytes,
            });
        }

        let id = {
            let db = self.db.lock().expect("memory db lock");
            match db.insert(namespace, content, &metadata) {
                Ok(id) => id,
                Err(e) => {
                    self.degraded.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        };

        if let Some(embedder) = &self.embedder {
            let vector = embedder.embed(content);
            let mut vindex = self.vindex.write().expect("vector index lock");
            vindex.add(id, namespace, &vector);
            let writes = self.writes_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
            if writes >= self.memory_cfg.index_flush_interval {
                self.writes_since_flush.store(0, Ordering::Relaxed);
                if let Err(e) = vindex.save(&self.index_dir) {
                    log::warn!("index flush failed (recovered at next startup): {e}");
                }
            }
        }

        Ok(id)
    }

    /// Fetch one memory by id, bumping its access time.
    pub fn get(&self, id: u64) -> Result<Option<MemoryRow>> {
        let db = self.db.lock().expect("memory db lock");
        let row = db.get(id)?;
        if row.is_some() {
            db.touch(&[id])?;
        }
        Ok(row)
    }

    /// Update content and/or metadata of an existing memory.
    ///
    /// Re-embeds when content changes so the index stays consistent.
    pub fn update(
        &self,
        id: u64,
        content: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        if let Some(c) = content {
            if c.len() > self.memory_cfg.max_content_bytes {
                return Err(EngineError::ContentTooLarge {
                    size: c.len(),
                    max: self.memory_cfg.max_content_bytes,
                });
            }
        }

        let (changed, namespace) = {
            let db = self.db.lock().expect("memory db lock");
            let ns = db.get(id)?.map(|r| r.namespace);
            let changed = db.update(id, content, metadata.as_ref())?;
            (changed, ns)
        };

        if changed {
            if let (Some(c), Some(embedder), Some(ns)) = (content, &self.embedder, namespace) {
                let mut vindex = self.vindex.write().expect("vector index lock");
                vindex.add(id, &ns, &embedder.embed(c));
            }
        }
        Ok(changed)
    }

    /// Delete memories by id.
    pub fn delete(&self, ids: &[u64]) -> Result<usize> {
        let removed = {
            let mut db = self.db.lock().expect("memory db lock");
            db.delete(ids)?
        };
        if removed > 0 {
            let mut vindex = self.vindex.write().expect("vector index lock");
            vindex.remove(&ids.iter().copied().collect());
            if let Err(e) = vindex.save(&self.index_dir) {
                log::warn!("index save after delete failed: {e}");
            }
        }
        Ok(removed)
    }

    /// Delete every memory in a namespace.
    pub fn clear(&self, namespace: &str) -> Result<usize> {
        let (removed, ids) = {
            let db = self.db.lock().expect("memory db lock");
            let ids: Vec<u64> = db.rows_in_namespace(namespace)?.iter().map(|r| r.id).collect();
            (db.clear_namespace(namespace)?, ids)
        };
        if removed > 0 {
            let mut vindex = self.vindex.write().expect("vector index lock");
            vindex.remove(&ids.into_iter().collect());
            if let Err(e) = vindex.save(&self.index_dir) {
                log::warn!("index save after clear failed: {e}");
            }
        }
        Ok(removed)
    }

    /// Count memories, optionally scoped to one namespace.
    pub fn count(&self, namespace: Option<&str>) -> Result<u64> {
        let db = self.db.lock().expect("memory db lock");
        db.count(namespace)
    }

    /// Namespaces with at least one memory.
    pub fn list_namespaces(&self) -> Result<Vec<String>> {
        let db = self.db.lock().expect("memory db lock");
        db.list_namespaces()
    }

    /// Per-namespace counts, for the pruning auto-trigger.
    pub fn namespace_counts(&self) -> Result<Vec<(String, u64)>> {
        let db = self.db.lock().expect("memory db lock");
        db.namespace_counts()
    }

    /// All rows in a namespace (pruning support).
    pub fn rows_in_namespace(&self, namespace: &str) -> Result<Vec<MemoryRow>> {
        let db = self.db.lock().expect("memory db lock");
        db.rows_in_namespace(namespace)
    }

    /// Stored vector for a row, if indexed (pruning support).
    pub fn vector_of(&self, id: u64) -> Option<Vec<f32>> {
        let vindex = self.vindex.read().expect("vector index lock");
        vindex.vector(id).map(<[f32]>::to_vec)
    }

    /// Current engine health.
    pub fn health(&self) -> Health {
        let (db_ok, memory_count) = {
            let db = self.db.lock().expect("memory db lock");
            (db.probe(), db.count(None).unwrap_or(0))
        };
        let db_status = if !db_ok {
            DbStatus::Down
        } else if self.degraded.load(Ordering::Relaxed) {
            DbStatus::Degraded
        } else {
            DbStatus::Ok
        };
        Health {
            db: db_status,
            index: *self.index_status.read().expect("index status lock"),
            memory_count,
        }
    }

    /// Search one namespace.
    ///
    /// `min_score` is applied after mode-specific normalization. Results are
    /// sorted score-descending with `updated_at` breaking ties, truncated to
    /// `limit`, and each hit carries the [`SearchType`] that found it.
    pub fn search(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
        min_score: f32,
        mode: SearchMode,
    ) -> Result<Vec<MemoryHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let semantic_available = self.embedder.is_some()
            && *self.index_status.read().expect("index status lock") == IndexStatus::Ok;

        let effective_mode = match mode {
            SearchMode::Keyword => SearchMode::Keyword,
            SearchMode::Semantic | SearchMode::Hybrid if !semantic_available => {
                SearchMode::Keyword
            }
            other => other,
        };

        // Exact-id fast path: a purely numeric query in the right namespace
        // ranks the row first with search_type = id.
        let mut merged: HashMap<u64, MemoryHit> = HashMap::new();
        if let Ok(id) = query.trim().parse::<u64>() {
            let db = self.db.lock().expect("memory db lock");
            if let Some(row) = db.get(id)? {
                if row.namespace == namespace {
                    merged.insert(
                        id,
                        MemoryHit {
                            id,
                            namespace: row.namespace,
                            content: row.content,
                            metadata: row.metadata,
                            score: 1.0,
                            search_type: SearchType::Id,
                            updated_at: row.updated_at,
                        },
                    );
                }
            }
        }

        if matches!(effective_mode, SearchMode::Keyword | SearchMode::Hybrid) {
            for (row, hits) in self.keyword_hits(namespace, query, limit)? {
                let score = 1.0 - (-(hits.min(64) as f32) * self.search_cfg.keyword_alpha).exp();
                upsert_hit(&mut merged, row, score * self.mode_weight_kw(effective_mode), SearchType::Keyword);
            }
        }

        if matches!(effective_mode, SearchMode::Semantic | SearchMode::Hybrid) {
            for (row, cos) in self.semantic_hits(namespace, query, limit)? {
                let score = cos.max(0.0).sqrt();
                upsert_hit(&mut merged, row, score * self.mode_weight_sem(effective_mode), SearchType::Semantic);
            }
        }

        let mut out: Vec<MemoryHit> = merged
            .into_values()
            .filter(|h| h.score >= min_score)
            .collect();
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(b.id.cmp(&a.id))
        });
        out.truncate(limit);

        let touched: Vec<u64> = out.iter().map(|h| h.id).collect();
        {
            let db = self.db.lock().expect("memory db lock");
            db.touch(&touched)?;
        }
        Ok(out)
    }

    /// Cross-namespace search: explicit and disjunctive. Each namespace is
    /// queried independently and the union is re-ranked.
    pub fn search_many(
        &self,
        namespaces: &[&str],
        query: &str,
        limit: usize,
        min_score: f32,
        mode: SearchMode,
    ) -> Result<Vec<MemoryHit>> {
        let mut all = Vec::new();
        for ns in namespaces {
            all.extend(self.search(ns, query, limit, min_score, mode)?);
        }
        all.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        all.truncate(limit);
        Ok(all)
    }

    /// Persist the vector index now. Called on engine shutdown.
    pub fn flush(&self) {
        if self.embedder.is_none() {
            return;
        }
        let vindex = self.vindex.read().expect("vector index lock");
        if let Err(e) = vindex.save(&self.index_dir) {
            log::warn!("index flush failed: {e}");
        }
    }

    fn mode_weight_kw(&self, mode: SearchMode) -> f32 {
        match mode {
            SearchMode::Hybrid => self.search_cfg.keyword_weight,
            _ => 1.0,
        }
    }

    fn mode_weight_sem(&self, mode: SearchMode) -> f32 {
        match mode {
            SearchMode::Hybrid => self.search_cfg.semantic_weight,
            _ => 1.0,
        }
    }

    fn keyword_hits(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryRow, u32)>> {
        let tokens = embedding::tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().expect("memory db lock");
        db.keyword_candidates(namespace, &tokens, (limit * 8).max(64))
    }

    fn semantic_hits(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryRow, f32)>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        let qvec = embedder.embed(query);
        let candidates = {
            let vindex = self.vindex.read().expect("vector index lock");
            vindex.search(&qvec, (limit * 4).max(16), Some(namespace))
        };
        let db = self.db.lock().expect("memory db lock");
        let mut out = Vec::with_capacity(candidates.len());
        for (id, cos) in candidates {
            if cos <= 0.0 {
                continue;
            }
            if let Some(row) = db.get(id)? {
                out.push((row, cos));
            }
        }
        Ok(out)
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Merge a hit into the per-id map: keep the max score, upgrade the tag to
/// `hybrid` when both paths found the same row.
fn upsert_hit(
    merged: &mut HashMap<u64, MemoryHit>,
    row: MemoryRow,
    score: f32,
    search_type: SearchType,
) {
    match merged.entry(row.id) {
        std::collections::hash_map::Entry::Occupied(mut slot) => {
            let hit = slot.get_mut();
            if hit.search_type == SearchType::Id {
                return;
            }
            if hit.search_type != search_type {
                hit.search_type = SearchType::Hybrid;
            }
            if score > hit.score {
                hit.score = score;
            }
        }
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(MemoryHit {
                id: row.id,
                namespace: row.namespace,
                content: row.content,
                metadata: row.metadata,
                score,
                search_type,
                updated_at: row.updated_at,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn config_at(dir: &Path, embedder: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.state_dir = dir.to_path_buf();
        config.embedder = embedder.to_owned();
        config
    }

    #[test]
    fn test_store_and_get() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        let id = engine
            .store(NS_GLOBAL, "off-by-one in loop bound", json!({"kind": "issue_pattern"}))
            .unwrap();
        let row = engine.get(id).unwrap().unwrap();
        assert_eq!(row.content, "off-by-one in loop bound");
        assert_eq!(row.metadata["kind"], "issue_pattern");
    }

    #[test]
    fn test_content_too_large_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config_at(dir.path(), "hash");
        config.memory.max_content_bytes = 16;
        let engine = MemoryEngine::init(&config).unwrap();
        let err = engine
            .store(NS_GLOBAL, "this content is definitely too large", json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::ContentTooLarge { .. }));
    }

    #[test]
    fn test_second_open_is_already_locked() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path(), "hash");
        let _first = MemoryEngine::init(&config).unwrap();
        let err = MemoryEngine::init(&config).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyLocked));
    }

    #[test]
    fn test_keyword_fallback_when_disabled() {
        // With embeddings disabled, keyword search still serves all hits.
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "disabled")).unwrap();
        for text in [
            "integer overflow in counter",
            "stack overflow on recursion",
            "overflow of the ring buffer",
        ] {
            engine.store(NS_GLOBAL, text, json!({})).unwrap();
        }

        let hits = engine
            .search(NS_GLOBAL, "overflow", 10, 0.1, SearchMode::Hybrid)
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.search_type == SearchType::Keyword));
        assert_eq!(engine.health().index, IndexStatus::Unavailable);
    }

    #[test]
    fn test_semantic_recall_across_wording() {
        // A related wording must land in the top results above 0.5.
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        engine
            .store(NS_GLOBAL, "off-by-one in loop bound", json!({}))
            .unwrap();
        engine
            .store(NS_GLOBAL, "yaml configuration parse failure", json!({}))
            .unwrap();
        engine
            .store(NS_GLOBAL, "dangling pointer in destructor", json!({}))
            .unwrap();

        let hits = engine
            .search(
                NS_GLOBAL,
                "loop iterates one too few times",
                3,
                0.5,
                SearchMode::Semantic,
            )
            .unwrap();
        assert!(!hits.is_empty());
        let top = &hits[0];
        assert_eq!(top.content, "off-by-one in loop bound");
        assert_eq!(top.search_type, SearchType::Semantic);
        assert!(top.score > 0.5, "score {} should beat 0.5", top.score);
    }

    #[test]
    fn test_exact_match_round_trip() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path(), "hash");
        let floor = config.search.exact_match_floor;
        let engine = MemoryEngine::init(&config).unwrap();
        engine
            .store(NS_GLOBAL, "mutable default argument in helper", json!({}))
            .unwrap();

        let hits = engine
            .search(
                NS_GLOBAL,
                "mutable default argument in helper",
                1,
                0.0,
                SearchMode::Hybrid,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(
            hits[0].score >= floor,
            "exact match score {} below floor {floor}",
            hits[0].score
        );
        assert_eq!(hits[0].search_type, SearchType::Hybrid);
    }

    #[test]
    fn test_namespace_isolation_in_search() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        engine.store("python", "overflow in python land", json!({})).unwrap();
        engine.store("cpp", "overflow in cpp land", json!({})).unwrap();

        let hits = engine
            .search("python", "overflow", 10, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].namespace, "python");
    }

    #[test]
    fn test_exact_id_query() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        let id = engine.store(NS_GLOBAL, "some stored pattern", json!({})).unwrap();

        let hits = engine
            .search(NS_GLOBAL, &id.to_string(), 5, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert_eq!(hits[0].id, id);
        assert_eq!(hits[0].search_type, SearchType::Id);
        assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_update_reembeds() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        let id = engine.store(NS_GLOBAL, "original wording here", json!({})).unwrap();
        engine
            .update(id, Some("completely different replacement text"), None)
            .unwrap();

        let hits = engine
            .search(
                NS_GLOBAL,
                "completely different replacement text",
                1,
                0.5,
                SearchMode::Semantic,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn test_delete_removes_from_index() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        let id = engine.store(NS_GLOBAL, "short lived memory", json!({})).unwrap();
        assert_eq!(engine.delete(&[id]).unwrap(), 1);

        let hits = engine
            .search(NS_GLOBAL, "short lived memory", 5, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(engine.health().memory_count, 0);
    }

    #[test]
    fn test_health_counts_rows() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        engine.store(NS_GLOBAL, "a", json!({})).unwrap();
        engine.store("python", "b", json!({})).unwrap();
        let health = engine.health();
        assert_eq!(health.db, DbStatus::Ok);
        assert_eq!(health.index, IndexStatus::Ok);
        assert_eq!(health.memory_count, 2);
    }

    #[test]
    fn test_corrupt_index_degrades_then_rebuilds() {
        // Corrupt index at startup → keyword mode → rebuild →
        // semantic mode again.
        let dir = tempdir().unwrap();
        let config = config_at(dir.path(), "hash");
        {
            let engine = MemoryEngine::init(&config).unwrap();
            engine.store(NS_GLOBAL, "dangling pointer dereference", json!({})).unwrap();
        }

        // Corrupt the id map
        std::fs::write(dir.path().join("index").join("ids.json"), "{broken").unwrap();

        let engine = MemoryEngine::init(&config).unwrap();
        assert_eq!(engine.health().index, IndexStatus::Rebuilding);
        let hits = engine
            .search(NS_GLOBAL, "dangling pointer", 5, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.search_type == SearchType::Keyword));

        engine.rebuild_index().unwrap();
        assert_eq!(engine.health().index, IndexStatus::Ok);
        let hits = engine
            .search(NS_GLOBAL, "dangling pointer dereference", 5, 0.5, SearchMode::Semantic)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].search_type, SearchType::Semantic);
    }

    #[test]
    fn test_crash_recovery_reembeds_missing_rows() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path(), "hash");
        {
            let engine = MemoryEngine::init(&config).unwrap();
            engine.store(NS_GLOBAL, "first memory persists fine", json!({})).unwrap();
            engine.flush();
        }
        {
            // Simulate a crash between row append and index flush: write the
            // row directly, bypassing the engine.
            let db = MemoryDb::open(&dir.path().join("memory.db")).unwrap();
            db.insert(NS_GLOBAL, "row written without vector", &json!({})).unwrap();
        }

        let engine = MemoryEngine::init(&config).unwrap();
        let hits = engine
            .search(NS_GLOBAL, "row written without vector", 3, 0.5, SearchMode::Semantic)
            .unwrap();
        assert!(!hits.is_empty(), "recovery must re-embed the orphaned row");
    }

    #[test]
    fn test_search_many_disjunctive() {
        let dir = tempdir().unwrap();
        let engine = MemoryEngine::init(&config_at(dir.path(), "hash")).unwrap();
        engine.store("python", "overflow python", json!({})).unwrap();
        engine.store("cpp", "overflow cpp", json!({})).unwrap();
        engine.store("rust", "overflow rust", json!({})).unwrap();

        let hits = engine
            .search_many(&["python", "cpp"], "overflow", 10, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.namespace != "rust"));
    }
}
