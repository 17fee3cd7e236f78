//! Content-addressable per-file scan cache.
//!
//! Caches analyzer results by file content hash + config hash + engine
//! version. A hit means the file bytes, configuration, and engine all match
//! the previous run, so the stored issues can be reused without dispatching
//! analyzers.
//!
//! Writes are atomic (temp file + rename); last writer wins, no locking.
//! A corrupt cache is logged, deleted, and rebuilt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Issue;

/// Current engine version, used for cache invalidation.
const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cache format version.
const CACHE_VERSION: &str = "1";

/// On-disk cache file name inside the state directory.
const CACHE_FILE: &str = "scan_cache.json";

/// A single cache entry for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// SHA-256 hash of the file content.
    pub content_hash: String,
    /// When this file was last analyzed.
    pub last_analyzed: DateTime<Utc>,
    /// Issues from the last analysis (fingerprints included).
    pub issues: Vec<Issue>,
}

/// The on-disk cache file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    engine_version: String,
    config_hash: String,
    /// Project id → file path → entry.
    projects: HashMap<String, HashMap<String, CacheEntry>>,
}

/// The scan cache, managing reads and writes of cached analyzer results.
pub struct ScanCache {
    entries: HashMap<String, CacheEntry>,
    project_id: String,
    other_projects: HashMap<String, HashMap<String, CacheEntry>>,
    config_hash: String,
    cache_path: Option<PathBuf>,
    enabled: bool,
}

impl ScanCache {
    /// Load the cache for one project, validating version and config hash.
    ///
    /// `state_dir` is the engine state directory; `project_id` scopes the
    /// entries. Passing `enabled = false` yields an inert cache.
    pub fn new(state_dir: &Path, project_id: &str, config_hash: &str, enabled: bool) -> Self {
        if !enabled {
            return Self {
                entries: HashMap::new(),
                project_id: project_id.to_owned(),
                other_projects: HashMap::new(),
                config_hash: config_hash.to_owned(),
                cache_path: None,
                enabled: false,
            };
        }

        let cache_path = state_dir.join(CACHE_FILE);
        let mut projects = load_cache_file(&cache_path, config_hash);
        let entries = projects.remove(project_id).unwrap_or_default();

        Self {
            entries,
            project_id: project_id.to_owned(),
            other_projects: projects,
            config_hash: config_hash.to_owned(),
            cache_path: Some(cache_path),
            enabled: true,
        }
    }

    /// Cached issues for a file, if its content hash still matches.
    #[must_use]
    pub fn get(&self, rel_path: &str, content_hash: &str) -> Option<&[Issue]> {
        if !self.enabled {
            return None;
        }
        self.entries
            .get(rel_path)
            .filter(|e| e.content_hash == content_hash)
            .map(|e| e.issues.as_slice())
    }

    /// Record analysis results for a file.
    pub fn update(&mut self, rel_path: &str, content_hash: &str, issues: &[Issue]) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            rel_path.to_owned(),
            CacheEntry {
                content_hash: content_hash.to_owned(),
                last_analyzed: Utc::now(),
                issues: issues.to_vec(),
            },
        );
    }

    /// Write the cache to disk atomically.
    ///
    /// Errors are logged, never propagated: the cache is a performance
    /// optimization, not a correctness requirement.
    pub fn flush(&self) {
        if !self.enabled {
            return;
        }
        let Some(cache_path) = &self.cache_path else {
            return;
        };

        let mut projects = self.other_projects.clone();
        projects.insert(self.project_id.clone(), self.entries.clone());

        let cache_file = CacheFile {
            version: CACHE_VERSION.to_owned(),
            engine_version: ENGINE_VERSION.to_owned(),
            config_hash: self.config_hash.clone(),
            projects,
        };

        let json = match serde_json::to_string(&cache_file) {
            Ok(j) => j,
            Err(e) => {
                log::warn!("Failed to serialize scan cache: {e}");
                return;
            }
        };

        if let Some(parent) = cache_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create cache directory: {e}");
                return;
            }
        }

        let pid = std::process::id();
        let tmp_path = cache_path.with_extension(format!("json.tmp.{pid}"));

        if let Err(e) = std::fs::write(&tmp_path, &json) {
            log::warn!("Failed to write scan cache temp file: {e}");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, cache_path) {
            log::warn!("Failed to rename scan cache file: {e}");
            let _ = std::fs::remove_file(&tmp_path);
        }
    }
}

/// Load and validate the cache file. Returns the per-project entry map;
/// empty on miss, mismatch, or corruption.
fn load_cache_file(
    cache_path: &Path,
    config_hash: &str,
) -> HashMap<String, HashMap<String, CacheEntry>> {
    if !cache_path.is_file() {
        return HashMap::new();
    }

    let content = match std::fs::read_to_string(cache_path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("Failed to read scan cache: {e}");
            return HashMap::new();
        }
    };

    let cache_file: CacheFile = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("Corrupt scan cache ({e}). Deleting and rebuilding.");
            let _ = std::fs::remove_file(cache_path);
            return HashMap::new();
        }
    };

    if cache_file.engine_version != ENGINE_VERSION
        || cache_file.version != CACHE_VERSION
        || cache_file.config_hash != config_hash
    {
        log::info!("Scan cache invalidated (version or config change).");
        return HashMap::new();
    }

    cache_file.projects
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
