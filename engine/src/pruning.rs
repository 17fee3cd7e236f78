//! Memory pruning — four strategies plus the startup auto-trigger.
//!
//! - **Age**: drop memories past `max_age_days` that have not been read or
//!   matched within `refresh_window_days`.
//! - **Redundancy**: cluster near-identical memories (same kind and type,
//!   embedding cosine above the threshold), keep the highest-quality
//!   representative, and fold the losers' counts into it.
//! - **Quality**: drop memories whose derived quality (feedback confidence,
//!   citation count, recency) falls below the floor.
//! - **Hybrid**: redundancy, then quality, then age, sharing one removal cap.
//!
//! The `false-positives` namespace is exempt unless explicitly enabled in
//! config. Removal is transactional per batch and the vector index is saved
//! after the rows commit; an interruption between the two is repaired by
//! the index reconciliation at next startup.

use chrono::Utc;
use serde::Serialize;

use crate::config::PruningConfig;
use crate::error::Result;
use crate::memory::db::MemoryRow;
use crate::memory::embedding::cosine;
use crate::memory::{MemoryEngine, NS_FALSE_POSITIVES};

/// Pruning strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneStrategy {
    /// Age-based expiry.
    Age,
    /// Embedding-cluster deduplication.
    Redundancy,
    /// Quality floor.
    Quality,
    /// Redundancy, then quality, then age.
    Hybrid,
}

impl std::fmt::Display for PruneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Age => write!(f, "age"),
            Self::Redundancy => write!(f, "redundancy"),
            Self::Quality => write!(f, "quality"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl PruneStrategy {
    /// Parse a strategy name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "age" => Some(Self::Age),
            "redundancy" => Some(Self::Redundancy),
            "quality" => Some(Self::Quality),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Summary of one pruning run.
#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    /// Strategy that ran.
    pub strategy: String,
    /// Rows examined.
    pub examined: usize,
    /// Rows removed.
    pub removed: usize,
    /// Rows folded into a surviving representative (subset of `removed`).
    pub merged: usize,
}

/// The pruning system.
pub struct Pruner<'a> {
    memory: &'a MemoryEngine,
    config: &'a PruningConfig,
}

impl<'a> Pruner<'a> {
    /// Create a pruner over the given memory handle.
    #[must_use]
    pub fn new(memory: &'a MemoryEngine, config: &'a PruningConfig) -> Self {
        Self { memory, config }
    }

    /// Run one strategy over one namespace, or over every prunable
    /// namespace when `namespace` is `None`.
    ///
    /// # Errors
    ///
    /// Propagates memory read/delete failures.
    pub fn run(&self, strategy: PruneStrategy, namespace: Option<&str>) -> Result<PruneReport> {
        let namespaces = self.target_namespaces(namespace)?;
        let mut report = PruneReport {
            strategy: strategy.to_string(),
            examined: 0,
            removed: 0,
            merged: 0,
        };
        let mut budget = self.config.max_removed_per_run;

        for ns in &namespaces {
            if budget == 0 {
                log::info!("pruning removal cap reached; stopping");
                break;
            }
            match strategy {
                PruneStrategy::Age => self.prune_age(ns, &mut report, &mut budget)?,
                PruneStrategy::Redundancy => self.prune_redundancy(ns, &mut report, &mut budget)?,
                PruneStrategy::Quality => self.prune_quality(ns, &mut report, &mut budget)?,
                PruneStrategy::Hybrid => {
                    self.prune_redundancy(ns, &mut report, &mut budget)?;
                    self.prune_quality(ns, &mut report, &mut budget)?;
                    self.prune_age(ns, &mut report, &mut budget)?;
                }
            }
        }

        log::info!(
            "prune {} examined {} removed {} merged {}",
            report.strategy,
            report.examined,
            report.removed,
            report.merged
        );
        Ok(report)
    }

    /// Startup auto-trigger: hybrid pruning with conservative caps when any
    /// namespace grew past the threshold.
    ///
    /// # Errors
    ///
    /// Propagates memory failures.
    pub fn auto_trigger(&self) -> Result<Option<PruneReport>> {
        let over: Vec<String> = self
            .memory
            .namespace_counts()?
            .into_iter()
            .filter(|(ns, count)| {
                *count as usize > self.config.auto_threshold && self.prunable(ns)
            })
            .map(|(ns, _)| ns)
            .collect();
        if over.is_empty() {
            return Ok(None);
        }

        log::info!("auto-prune firing for namespaces: {}", over.join(", "));
        let mut total = PruneReport {
            strategy: "hybrid".to_owned(),
            examined: 0,
            removed: 0,
            merged: 0,
        };
        for ns in &over {
            let report = self.run(PruneStrategy::Hybrid, Some(ns))?;
            total.examined += report.examined;
            total.removed += report.removed;
            total.merged += report.merged;
        }
        Ok(Some(total))
    }

    fn prunable(&self, namespace: &str) -> bool {
        namespace != NS_FALSE_POSITIVES || self.config.allow_fp_prune
    }

    fn target_namespaces(&self, namespace: Option<&str>) -> Result<Vec<String>> {
        let all = match namespace {
            Some(ns) => vec![ns.to_owned()],
            None => self.memory.list_namespaces()?,
        };
        Ok(all.into_iter().filter(|ns| self.prunable(ns)).collect())
    }

    fn prune_age(
        &self,
        namespace: &str,
        report: &mut PruneReport,
        budget: &mut usize,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let rows = self.memory.rows_in_namespace(namespace)?;
        report.examined += rows.len();

        let mut doomed: Vec<u64> = rows
            .iter()
            .filter(|row| age_expired(row, now, self.config))
            .map(|row| row.id)
            .collect();
        doomed.truncate(*budget);
        if !doomed.is_empty() {
            let removed = self.memory.delete(&doomed)?;
            report.removed += removed;
            *budget -= removed.min(*budget);
        }
        Ok(())
    }

    fn prune_quality(
        &self,
        namespace: &str,
        report: &mut PruneReport,
        budget: &mut usize,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let rows = self.memory.rows_in_namespace(namespace)?;
        report.examined += rows.len();

        let mut doomed: Vec<u64> = rows
            .iter()
            .filter(|row| quality_score(row, now, self.config) < self.config.min_quality)
            .map(|row| row.id)
            .collect();
        doomed.truncate(*budget);
        if !doomed.is_empty() {
            let removed = self.memory.delete(&doomed)?;
            report.removed += removed;
            *budget -= removed.min(*budget);
        }
        Ok(())
    }

    /// Greedy clustering by `(kind, type)` plus embedding cosine. The
    /// highest-quality row in each cluster survives and absorbs the counts
    /// of the rest.
    fn prune_redundancy(
        &self,
        namespace: &str,
        report: &mut PruneReport,
        budget: &mut usize,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut rows = self.memory.rows_in_namespace(namespace)?;
        report.examined += rows.len();

        // Best representative first.
        rows.sort_by(|a, b| {
            quality_score(b, now, self.config)
                .partial_cmp(&quality_score(a, now, self.config))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        let mut claimed: Vec<bool> = vec![false; rows.len()];
        for i in 0..rows.len() {
            if claimed[i] || *budget == 0 {
                continue;
            }
            let Some(rep_vec) = self.memory.vector_of(rows[i].id) else {
                continue;
            };

            let mut absorbed_count =
                rows[i].metadata.get("count").and_then(serde_json::Value::as_u64).unwrap_or(1);
            let mut doomed = Vec::new();

            for j in (i + 1)..rows.len() {
                if claimed[j] || doomed.len() >= *budget {
                    continue;
                }
                if !same_cluster_key(&rows[i], &rows[j]) {
                    continue;
                }
                let Some(other_vec) = self.memory.vector_of(rows[j].id) else {
                    continue;
                };
                if cosine(&rep_vec, &other_vec) >= self.config.redundancy_threshold {
                    claimed[j] = true;
                    absorbed_count += rows[j]
                        .metadata
                        .get("count")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(1);
                    doomed.push(rows[j].id);
                }
            }

            if doomed.is_empty() {
                continue;
            }
            let mut metadata = rows[i].metadata.clone();
            metadata["count"] = serde_json::json!(absorbed_count);
            self.memory.update(rows[i].id, None, Some(metadata))?;
            let removed = self.memory.delete(&doomed)?;
            report.removed += removed;
            report.merged += removed;
            *budget -= removed.min(*budget);
        }
        Ok(())
    }
}

/// Whether a row is past the age limit and outside the refresh window.
fn age_expired(row: &MemoryRow, now: i64, config: &PruningConfig) -> bool {
    let max_age_secs = config.max_age_days * 86_400;
    let refresh_secs = config.refresh_window_days * 86_400;
    now - row.updated_at > max_age_secs && now - row.last_accessed > refresh_secs
}

/// Derived quality in `[0, 1]`: recency, citation count, and feedback
/// confidence, equally-ish weighted.
fn quality_score(row: &MemoryRow, now: i64, config: &PruningConfig) -> f32 {
    let max_age_secs = (config.max_age_days * 86_400).max(1) as f32;
    let age = (now - row.last_accessed).max(0) as f32;
    let recency = (-age / max_age_secs).exp();

    let count = row.metadata.get("count").and_then(serde_json::Value::as_u64).unwrap_or(1) as f32;
    let citations = (count / 5.0).min(1.0);

    let confidence = row
        .metadata
        .get("user_confidence")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.5) as f32;

    0.3 * recency + 0.4 * citations + 0.3 * confidence
}

fn same_cluster_key(a: &MemoryRow, b: &MemoryRow) -> bool {
    let key = |row: &MemoryRow| {
        (
            row.metadata.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_owned(),
            row.metadata.get("type").and_then(|v| v.as_str()).unwrap_or("").to_owned(),
        )
    };
    key(a) == key(b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (MemoryEngine, EngineConfig, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.state_dir = dir.path().to_path_buf();
        let memory = MemoryEngine::init(&config).unwrap();
        (memory, config, dir)
    }

    fn row(updated_at: i64, last_accessed: i64, metadata: serde_json::Value) -> MemoryRow {
        MemoryRow {
            id: 1,
            namespace: "global".to_owned(),
            content: "x".to_owned(),
            metadata,
            created_at: updated_at,
            updated_at,
            last_accessed,
        }
    }

    #[test]
    fn test_age_expiry_logic() {
        let config = PruningConfig::default();
        let now = 1_700_000_000i64;
        let old = now - 200 * 86_400;
        let recent = now - 86_400;

        // Old and unread: expired.
        assert!(age_expired(&row(old, old, json!({})), now, &config));
        // Old but recently matched: kept.
        assert!(!age_expired(&row(old, recent, json!({})), now, &config));
        // Fresh: kept.
        assert!(!age_expired(&row(recent, recent, json!({})), now, &config));
    }

    #[test]
    fn test_quality_score_ordering() {
        let config = PruningConfig::default();
        let now = 1_700_000_000i64;
        let fresh_cited = row(now, now, json!({"count": 10, "user_confidence": 1.0}));
        let stale_uncited = row(now - 400 * 86_400, now - 400 * 86_400, json!({"count": 1}));

        let good = quality_score(&fresh_cited, now, &config);
        let bad = quality_score(&stale_uncited, now, &config);
        assert!(good > bad);
        assert!(good > 0.9);
        assert!(bad < 0.5);
    }

    #[test]
    fn test_age_prune_keeps_fresh_rows() {
        let (memory, config, _dir) = setup();
        memory.store("global", "fresh pattern", json!({})).unwrap();
        let pruner = Pruner::new(&memory, &config.pruning);

        let report = pruner.run(PruneStrategy::Age, Some("global")).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(memory.count(Some("global")).unwrap(), 1);
    }

    #[test]
    fn test_redundancy_merges_identical_content() {
        // Round-trip property: re-ingesting identical content then pruning
        // leaves one surviving memory.
        let (memory, config, _dir) = setup();
        let metadata = json!({"kind": "issue_pattern", "type": "python.bare-except", "count": 1});
        memory.store("python", "bare except in handler", metadata.clone()).unwrap();
        memory.store("python", "bare except in handler", metadata.clone()).unwrap();
        memory.store("python", "bare except in handler", metadata).unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Redundancy, Some("python")).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.merged, 2);
        assert_eq!(memory.count(Some("python")).unwrap(), 1);

        // Counts folded into the survivor.
        let rows = memory.rows_in_namespace("python").unwrap();
        assert_eq!(rows[0].metadata["count"], json!(3));
    }

    #[test]
    fn test_redundancy_respects_type_boundary() {
        let (memory, config, _dir) = setup();
        memory
            .store(
                "python",
                "bare except in handler",
                json!({"kind": "issue_pattern", "type": "python.bare-except"}),
            )
            .unwrap();
        memory
            .store(
                "python",
                "bare except in handler",
                json!({"kind": "issue_pattern", "type": "python.eval-call"}),
            )
            .unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Redundancy, Some("python")).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(memory.count(Some("python")).unwrap(), 2);
    }

    #[test]
    fn test_quality_prune_drops_low_quality() {
        let (memory, mut config, _dir) = setup();
        config.pruning.min_quality = 0.9;
        memory
            .store("global", "weak pattern", json!({"count": 1, "user_confidence": 0.1}))
            .unwrap();
        memory
            .store("global", "strong pattern", json!({"count": 10, "user_confidence": 1.0}))
            .unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Quality, Some("global")).unwrap();
        assert_eq!(report.removed, 1);

        let rows = memory.rows_in_namespace("global").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "strong pattern");
    }

    #[test]
    fn test_false_positives_namespace_protected() {
        let (memory, config, _dir) = setup();
        let metadata = json!({"kind": "fp_pattern", "type": "python.bare-except"});
        memory.store(NS_FALSE_POSITIVES, "fp evidence", metadata.clone()).unwrap();
        memory.store(NS_FALSE_POSITIVES, "fp evidence", metadata).unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Hybrid, None).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(memory.count(Some(NS_FALSE_POSITIVES)).unwrap(), 2);
    }

    #[test]
    fn test_false_positives_prunable_when_enabled() {
        let (memory, mut config, _dir) = setup();
        config.pruning.allow_fp_prune = true;
        let metadata = json!({"kind": "fp_pattern", "type": "python.bare-except"});
        memory.store(NS_FALSE_POSITIVES, "fp evidence", metadata.clone()).unwrap();
        memory.store(NS_FALSE_POSITIVES, "fp evidence", metadata).unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Redundancy, Some(NS_FALSE_POSITIVES)).unwrap();
        assert_eq!(report.removed, 1);
    }

    #[test]
    fn test_removal_cap_respected() {
        let (memory, mut config, _dir) = setup();
        config.pruning.max_removed_per_run = 1;
        config.pruning.min_quality = 2.0; // everything fails the floor
        memory.store("global", "a", json!({})).unwrap();
        memory.store("global", "b", json!({})).unwrap();
        memory.store("global", "c", json!({})).unwrap();

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.run(PruneStrategy::Quality, Some("global")).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(memory.count(Some("global")).unwrap(), 2);
    }

    #[test]
    fn test_auto_trigger_fires_over_threshold() {
        let (memory, mut config, _dir) = setup();
        config.pruning.auto_threshold = 3;
        for _ in 0..5 {
            memory
                .store(
                    "python",
                    "duplicate learned pattern",
                    json!({"kind": "issue_pattern", "type": "python.bare-except", "count": 1}),
                )
                .unwrap();
        }

        let pruner = Pruner::new(&memory, &config.pruning);
        let report = pruner.auto_trigger().unwrap().unwrap();
        assert!(report.removed > 0);
        assert!(memory.count(Some("python")).unwrap() < 5);
    }

    #[test]
    fn test_auto_trigger_quiet_under_threshold() {
        let (memory, config, _dir) = setup();
        memory.store("python", "one pattern", json!({})).unwrap();
        let pruner = Pruner::new(&memory, &config.pruning);
        assert!(pruner.auto_trigger().unwrap().is_none());
    }
}
