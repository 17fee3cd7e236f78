//! Flat vector index for semantic search.
//!
//! Brute-force cosine over an in-memory table, persisted under `index/` as a
//! raw f32 file plus a JSON id map. At the store's expected scale (pruning
//! keeps namespaces near 10k entries) a scan of unit vectors is a few
//! milliseconds, and the flat layout makes the rebuild-from-rows recovery
//! path trivial: the database is the source of truth, this file is a cache.
//!
//! Persistence is atomic in two steps: `vectors.bin` is written first,
//! `ids.json` second (temp file + rename each). A crash between the two
//! leaves a stale-but-consistent pair or a mismatched pair; mismatches are
//! detected at load and force a rebuild.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::embedding::cosine;

/// On-disk name of the raw vector table.
const VECTORS_FILE: &str = "vectors.bin";
/// On-disk name of the id map.
const IDS_FILE: &str = "ids.json";

/// One indexed entry: the row id and the namespace it belongs to.
///
/// Namespace lives in the index so namespace-scoped semantic queries can
/// filter candidates without a database round-trip per vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Memory row id.
    pub id: u64,
    /// Owning namespace.
    pub namespace: String,
}

/// Serialized id-map header.
#[derive(Debug, Serialize, Deserialize)]
struct IdMapFile {
    dim: usize,
    entries: Vec<IndexEntry>,
}

/// The in-memory vector table.
pub struct VectorIndex {
    dim: usize,
    entries: Vec<IndexEntry>,
    /// Flattened row-major vectors; `entries[i]` owns `vectors[i*dim..(i+1)*dim]`.
    vectors: Vec<f32>,
    pos: HashMap<u64, usize>,
}

impl VectorIndex {
    /// Create an empty index for `dim`-dimensional vectors.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
            vectors: Vec::new(),
            pos: HashMap::new(),
        }
    }

    /// Load the index from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when files are missing, unreadable, or mutually
    /// inconsistent (dimension mismatch, truncated vector file). The caller
    /// treats any error as "rebuild from rows".
    pub fn load(dir: &Path, dim: usize) -> std::io::Result<Self> {
        let ids_raw = std::fs::read_to_string(dir.join(IDS_FILE))?;
        let id_map: IdMapFile = serde_json::from_str(&ids_raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if id_map.dim != dim {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("index dimension {} != expected {dim}", id_map.dim),
            ));
        }

        let raw = std::fs::read(dir.join(VECTORS_FILE))?;
        let expected = id_map.entries.len() * dim * 4;
        if raw.len() != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("vector file is {} bytes, expected {expected}", raw.len()),
            ));
        }

        let mut vectors = Vec::with_capacity(id_map.entries.len() * dim);
        for chunk in raw.chunks_exact(4) {
            vectors.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        let mut pos = HashMap::with_capacity(id_map.entries.len());
        for (i, entry) in id_map.entries.iter().enumerate() {
            pos.insert(entry.id, i);
        }

        Ok(Self {
            dim,
            entries: id_map.entries,
            vectors,
            pos,
        })
    }

    /// Persist the index to `dir` atomically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either file cannot be written or renamed.
    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;

        let pid = std::process::id();

        // Vectors first: ids.json is the commit point.
        let vec_tmp: PathBuf = dir.join(format!("{VECTORS_FILE}.tmp.{pid}"));
        {
            let mut f = std::fs::File::create(&vec_tmp)?;
            for x in &self.vectors {
                f.write_all(&x.to_le_bytes())?;
            }
            f.flush()?;
            f.sync_all()?;
        }
        std::fs::rename(&vec_tmp, dir.join(VECTORS_FILE))?;

        let id_map = IdMapFile {
            dim: self.dim,
            entries: self.entries.clone(),
        };
        let ids_tmp = dir.join(format!("{IDS_FILE}.tmp.{pid}"));
        let json = serde_json::to_string(&id_map)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&ids_tmp, json)?;
        std::fs::rename(&ids_tmp, dir.join(IDS_FILE))?;
        Ok(())
    }

    /// Number of indexed vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an id is indexed.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.pos.contains_key(&id)
    }

    /// All indexed ids.
    #[must_use]
    pub fn ids(&self) -> HashSet<u64> {
        self.pos.keys().copied().collect()
    }

    /// Add or replace the vector for `id`.
    ///
    /// Vectors with the wrong dimension are rejected with `false` rather
    /// than corrupting the table layout.
    pub fn add(&mut self, id: u64, namespace: &str, vector: &[f32]) -> bool {
        if vector.len() != self.dim {
            log::warn!(
                "rejecting vector for id {id}: dimension {} != {}",
                vector.len(),
                self.dim
            );
            return false;
        }

        if let Some(&i) = self.pos.get(&id) {
            self.vectors[i * self.dim..(i + 1) * self.dim].copy_from_slice(vector);
            self.entries[i].namespace = namespace.to_owned();
        } else {
            let i = self.entries.len();
            self.entries.push(IndexEntry {
                id,
                namespace: namespace.to_owned(),
            });
            self.vectors.extend_from_slice(vector);
            self.pos.insert(id, i);
        }
        true
    }

    /// Remove a set of ids via swap-remove; order is not preserved.
    pub fn remove(&mut self, ids: &HashSet<u64>) {
        for &id in ids {
            let Some(i) = self.pos.remove(&id) else {
                continue;
            };
            let last = self.entries.len() - 1;
            if i != last {
                self.entries.swap(i, last);
                let (head, tail) = self.vectors.split_at_mut(last * self.dim);
                head[i * self.dim..(i + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
                self.pos.insert(self.entries[i].id, i);
            }
            self.entries.pop();
            self.vectors.truncate(self.entries.len() * self.dim);
        }
    }

    /// Fetch a stored vector by id.
    #[must_use]
    pub fn vector(&self, id: u64) -> Option<&[f32]> {
        self.pos
            .get(&id)
            .map(|&i| &self.vectors[i * self.dim..(i + 1) * self.dim])
    }

    /// Top-k cosine search, optionally scoped to a namespace.
    ///
    /// Returns `(id, cosine)` pairs sorted descending by cosine, then by id
    /// descending so results are deterministic under score ties.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize, namespace: Option<&str>) -> Vec<(u64, f32)> {
        if query.len() != self.dim || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(u64, f32)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| namespace.map_or(true, |ns| e.namespace == ns))
            .map(|(i, e)| {
                let v = &self.vectors[i * self.dim..(i + 1) * self.dim];
                (e.id, cosine(query, v))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });
        scored.truncate(k);
        scored
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
