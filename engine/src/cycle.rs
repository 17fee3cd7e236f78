//! Improvement-cycle tracking — diffing successive scans of a project.
//!
//! Each scan's fingerprint set is persisted in the project namespace by the
//! orchestrator. Closing a cycle compares the two most recent sets:
//! fingerprints that disappeared without a corresponding applied proposal
//! are classified as manual fixes and remembered with their type and
//! context, so the proposer and detector can learn which issues humans
//! reliably fix by hand. The tracker produces rate metrics but takes no
//! action itself.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::Result;
use crate::memory::{MemoryEngine, SearchMode, NS_GLOBAL};
use crate::types::{CycleRecord, ScanResult};

/// A persisted scan summary, as recovered from memory.
#[derive(Debug, Clone)]
pub struct StoredScan {
    /// Scan identifier.
    pub scan_id: String,
    /// Fingerprints present in that scan.
    pub fingerprints: Vec<String>,
    /// When the summary was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// The cycle tracker. Stateless; everything lives in memory rows.
pub struct CycleTracker<'a> {
    memory: &'a MemoryEngine,
}

impl<'a> CycleTracker<'a> {
    /// Create a tracker over the given memory handle.
    #[must_use]
    pub fn new(memory: &'a MemoryEngine) -> Self {
        Self { memory }
    }

    /// The two most recent stored scans for a project, newest first.
    ///
    /// # Errors
    ///
    /// Propagates memory read failures.
    pub fn recent_scans(&self, project_id: &str) -> Result<Vec<StoredScan>> {
        let mut scans: Vec<(u64, StoredScan)> = self
            .memory
            .rows_in_namespace(project_id)?
            .into_iter()
            .filter(|row| row.metadata.get("kind").and_then(|v| v.as_str()) == Some("scan"))
            .map(|row| {
                let scan_id = row
                    .metadata
                    .get("scan_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned();
                let fingerprints = row
                    .content
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect();
                let recorded_at = Utc
                    .timestamp_opt(row.created_at, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                (
                    row.id,
                    StoredScan {
                        scan_id,
                        fingerprints,
                        recorded_at,
                    },
                )
            })
            .collect();

        // Ids are monotonic, so the largest id is the newest scan.
        scans.sort_by(|a, b| b.0.cmp(&a.0));
        scans.truncate(2);
        Ok(scans.into_iter().map(|(_, s)| s).collect())
    }

    /// Close the cycle between the previous stored scan and `current`.
    ///
    /// `applied_fingerprints` are the fingerprints whose proposals were
    /// applied by the gate in the interval. Returns `None` when no earlier
    /// scan exists.
    ///
    /// # Errors
    ///
    /// Propagates memory failures while reading the previous scan or
    /// storing the cycle record.
    pub fn close_cycle(
        &self,
        current: &ScanResult,
        applied_fingerprints: &[String],
    ) -> Result<Option<CycleRecord>> {
        let recent = self.recent_scans(&current.project_id)?;
        // The current scan was already recorded by the orchestrator; the
        // previous one is the second-newest summary.
        let prev = match recent.iter().find(|s| s.scan_id != current.scan_id) {
            Some(prev) => prev.clone(),
            None => return Ok(None),
        };

        let prev_set: std::collections::HashSet<&str> =
            prev.fingerprints.iter().map(String::as_str).collect();
        let cur_set: std::collections::HashSet<&str> =
            current.issues.iter().map(|i| i.fingerprint.as_str()).collect();

        let resolved: Vec<String> = prev_set
            .difference(&cur_set)
            .map(|s| (*s).to_owned())
            .collect();
        let new_issues: Vec<String> = cur_set
            .difference(&prev_set)
            .map(|s| (*s).to_owned())
            .collect();

        let applied: std::collections::HashSet<&str> =
            applied_fingerprints.iter().map(String::as_str).collect();
        let mut manual_fixes = Vec::new();
        let mut automated_fixes = Vec::new();
        for fp in &resolved {
            if applied.contains(fp.as_str()) {
                automated_fixes.push(fp.clone());
            } else {
                manual_fixes.push(fp.clone());
            }
        }

        let record = CycleRecord {
            project: current.project_id.clone(),
            prev_scan_id: prev.scan_id.clone(),
            cur_scan_id: current.scan_id.clone(),
            resolved,
            new_issues,
            manual_fixes,
            automated_fixes,
            started_at: prev.recorded_at,
            ended_at: current.started_at,
        };

        self.persist_cycle(&record)?;
        Ok(Some(record))
    }

    /// Store the cycle record and one manual-fix memory per fingerprint.
    fn persist_cycle(&self, record: &CycleRecord) -> Result<()> {
        let content = format!(
            "cycle {} -> {} resolved {} new {} manual {} automated {}",
            record.prev_scan_id,
            record.cur_scan_id,
            record.resolved.len(),
            record.new_issues.len(),
            record.manual_fixes.len(),
            record.automated_fixes.len(),
        );
        let metadata = serde_json::json!({
            "kind": "cycle",
            "prev_scan_id": record.prev_scan_id,
            "cur_scan_id": record.cur_scan_id,
            "manual_fix_rate": record.manual_fix_rate(),
            "automated_fix_rate": record.automated_fix_rate(),
        });
        self.memory.store(&record.project, &content, metadata)?;

        for fp in &record.manual_fixes {
            // Recover type/context from the recorded issue pattern so the
            // proposer and detector can learn from it.
            let pattern = self
                .memory
                .search(NS_GLOBAL, fp, 4, 0.0, SearchMode::Keyword)?
                .into_iter()
                .find(|h| {
                    h.metadata.get("fingerprint").and_then(|v| v.as_str()) == Some(fp.as_str())
                        && h.metadata.get("kind").and_then(|v| v.as_str())
                            == Some("issue_pattern")
                });
            let (issue_type, context) = pattern
                .map(|h| {
                    (
                        h.metadata
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_owned(),
                        h.metadata
                            .get("context")
                            .and_then(|v| v.as_str())
                            .unwrap_or("production")
                            .to_owned(),
                    )
                })
                .unwrap_or_else(|| ("unknown".to_owned(), "production".to_owned()));

            let content = format!("manual_fix {issue_type} fingerprint {fp} context {context}");
            let metadata = serde_json::json!({
                "kind": "manual_fix",
                "fingerprint": fp,
                "type": issue_type,
                "context": context,
                "project": record.project,
            });
            self.memory.store(NS_GLOBAL, &content, metadata)?;
        }
        Ok(())
    }

    /// Count of recorded manual fixes for an issue type.
    ///
    /// # Errors
    ///
    /// Propagates memory read failures.
    pub fn manual_fix_count(&self, issue_type: &str) -> Result<u64> {
        let hits = self.memory.search(
            NS_GLOBAL,
            &format!("manual_fix {issue_type}"),
            64,
            0.0,
            SearchMode::Keyword,
        )?;
        Ok(hits
            .iter()
            .filter(|h| {
                h.metadata.get("kind").and_then(|v| v.as_str()) == Some("manual_fix")
                    && h.metadata.get("type").and_then(|v| v.as_str()) == Some(issue_type)
            })
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
