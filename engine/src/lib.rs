//! Scrutiny — a multi-language static analysis engine with persistent
//! semantic memory and gated automatic fixes.
//!
//! The crate is organized leaves-first:
//!
//! - [`memory`] — hybrid keyword+vector store with namespaces and recovery
//! - [`analyzers`] — per-language issue detectors behind one capability
//! - [`orchestrator`] — file walking, dispatch, fingerprints, scan results
//! - [`context`] — production/test/demo/... classification
//! - [`fp_detector`] — false-positive scoring with learned feedback
//! - [`fixer`] — single-span mechanical fix recipes
//! - [`gate`] — the four-layer safety gate (the only write path)
//! - [`sandbox`] — isolated build/run validation
//! - [`cycle`] — scan-over-scan improvement tracking
//! - [`pruning`] — memory growth control
//!
//! [`Engine`] is the process-wide service handle: `Engine::init(config)`
//! acquires the state directory, recovers the index, and fires the pruning
//! auto-trigger; `Engine::shutdown` flushes state. There are no ambient
//! globals — every component receives the handle or a piece of it.

pub mod analyzers;
pub mod config;
pub mod context;
pub mod cycle;
pub mod error;
pub mod fixer;
pub mod fp_detector;
pub mod gate;
pub mod memory;
pub mod orchestrator;
pub mod pruning;
pub mod reporter;
pub mod sandbox;
pub mod scan_cache;
pub mod types;

use std::path::Path;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::cycle::CycleTracker;
use crate::error::{EngineError, Result};
use crate::fixer::FixProposer;
use crate::fp_detector::{FalsePositiveDetector, FpAssessment};
use crate::gate::{ApprovalHandler, GateOutcome, SafetyGate};
use crate::memory::{Health, MemoryEngine, SearchMode, NS_GLOBAL, NS_TRAINING};
use crate::orchestrator::{CancelToken, Orchestrator};
use crate::pruning::{PruneReport, PruneStrategy, Pruner};
use crate::sandbox::SandboxValidator;
use crate::types::{CycleRecord, Issue, ScanResult};

/// Result of one `fix` run.
#[derive(Debug, Default, Serialize)]
pub struct FixReport {
    /// Fingerprints whose proposals were applied.
    pub applied: Vec<String>,
    /// Proposals deferred by the approval surface.
    pub deferred: usize,
    /// Proposals refused by any gate layer.
    pub refused: usize,
    /// Whether the run was marked compromised (halts further fixes).
    pub compromised: bool,
}

/// Aggregate engine statistics for the `stats` verb.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Memory engine health.
    pub health: Health,
    /// Per-namespace memory counts.
    pub namespaces: Vec<(String, u64)>,
}

/// The process-wide engine handle.
pub struct Engine {
    /// Resolved configuration for this run.
    pub config: EngineConfig,
    memory: MemoryEngine,
}

impl Engine {
    /// Initialize the engine: lock the state directory, open the store,
    /// recover the vector index, and fire the pruning auto-trigger.
    ///
    /// # Errors
    ///
    /// `AlreadyLocked` when another process owns the state directory;
    /// `Fatal` when the database or state directory is unusable.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let memory = MemoryEngine::init(&config)?;
        memory.rebuild_index()?;

        let pruner = Pruner::new(&memory, &config.pruning);
        if let Some(report) = pruner.auto_trigger()? {
            log::info!(
                "auto-prune removed {} memories at startup",
                report.removed
            );
        }

        Ok(Self { config, memory })
    }

    /// Borrow the memory handle.
    #[must_use]
    pub fn memory(&self) -> &MemoryEngine {
        &self.memory
    }

    /// Scan a project and filter findings through the false-positive
    /// detector. Returns the filtered result plus the suppressed issues
    /// with their assessments.
    ///
    /// # Errors
    ///
    /// `Input` for a bad path; memory failures degrade per component.
    pub fn analyze(
        &self,
        root: &Path,
        cancel: &CancelToken,
    ) -> Result<(ScanResult, Vec<(Issue, FpAssessment)>)> {
        let orchestrator = Orchestrator::new(&self.config, &self.memory);
        let mut result = orchestrator.scan(root, cancel)?;

        let detector = FalsePositiveDetector::new(&self.memory, &self.config);
        let (kept, suppressed) = detector.filter(std::mem::take(&mut result.issues));
        result.issues = kept;
        Ok((result, suppressed))
    }

    /// Scan, propose fixes, and push each proposal through the safety gate.
    ///
    /// # Errors
    ///
    /// `Input` for a bad path; per-proposal refusals are folded into the
    /// report rather than propagated, except that an integrity violation
    /// halts the pipeline for the rest of the run.
    pub fn fix(
        &self,
        root: &Path,
        approver: &dyn ApprovalHandler,
        cancel: &CancelToken,
    ) -> Result<FixReport> {
        let (result, _suppressed) = self.analyze(root, cancel)?;

        let proposer = FixProposer::new();
        let validator = SandboxValidator::new(&self.config.sandbox);
        let gate = SafetyGate::new(&self.memory, &self.config, approver, &validator)?;

        let mut report = FixReport::default();
        for issue in &result.issues {
            if cancel.is_cancelled() {
                break;
            }
            let target = root.join(&issue.file);
            let content = match std::fs::read_to_string(&target) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("cannot re-read {} for fixing: {e}", issue.file);
                    continue;
                }
            };
            let Some(proposal) = proposer.propose(&content, issue) else {
                continue;
            };

            let fingerprint = issue.fingerprint.clone();
            match gate.process(root, proposal) {
                Ok(GateOutcome::Applied { .. }) => report.applied.push(fingerprint),
                Ok(GateOutcome::Deferred) => report.deferred += 1,
                Err(EngineError::IntegrityViolation(reason)) => {
                    log::error!("integrity violation: {reason}; halting fix pipeline");
                    report.refused += 1;
                    report.compromised = true;
                    break;
                }
                Err(e) if e.is_safety_refusal() => {
                    log::info!("proposal refused: {e}");
                    report.refused += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Close the improvement cycle for a project against its previous scan.
    ///
    /// Applied-proposal fingerprints are recovered from `fix_success`
    /// memories so manual fixes are not misattributed.
    ///
    /// # Errors
    ///
    /// Propagates memory failures.
    pub fn close_cycle(&self, result: &ScanResult) -> Result<Option<CycleRecord>> {
        let applied = self.applied_fingerprints()?;
        CycleTracker::new(&self.memory).close_cycle(result, &applied)
    }

    /// Fingerprints of fixes the gate has applied, from memory.
    fn applied_fingerprints(&self) -> Result<Vec<String>> {
        let hits = self
            .memory
            .search(NS_GLOBAL, "fix_success", 256, 0.0, SearchMode::Keyword)?;
        Ok(hits
            .into_iter()
            .filter(|h| h.metadata.get("kind").and_then(|v| v.as_str()) == Some("fix_success"))
            .filter_map(|h| {
                h.metadata
                    .get("fingerprint")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .collect())
    }

    /// Seed training memories from `(content, metadata)` pairs.
    ///
    /// # Errors
    ///
    /// Fails on the first rejected write (size cap, store failure).
    pub fn train(&self, entries: Vec<(String, serde_json::Value)>) -> Result<usize> {
        let mut stored = 0;
        for (content, metadata) in entries {
            self.memory.store(NS_TRAINING, &content, metadata)?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Engine statistics.
    ///
    /// # Errors
    ///
    /// Propagates memory read failures.
    pub fn stats(&self) -> Result<StatsReport> {
        Ok(StatsReport {
            health: self.memory.health(),
            namespaces: self.memory.namespace_counts()?,
        })
    }

    /// Run a pruning strategy.
    ///
    /// # Errors
    ///
    /// Propagates memory failures.
    pub fn prune(
        &self,
        strategy: PruneStrategy,
        namespace: Option<&str>,
    ) -> Result<PruneReport> {
        Pruner::new(&self.memory, &self.config.pruning).run(strategy, namespace)
    }

    /// Flush state and release the handle.
    pub fn shutdown(self) {
        self.memory.flush();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::IndexStatus;
    use crate::types::ApprovalDecision;
    use tempfile::tempdir;

    fn engine_at(state: &Path) -> Engine {
        let mut config = EngineConfig::default();
        config.state_dir = state.to_path_buf();
        Engine::init(config).unwrap()
    }

    #[test]
    fn test_init_and_shutdown() {
        let state = tempdir().unwrap();
        let engine = engine_at(state.path());
        assert_eq!(engine.memory().health().index, IndexStatus::Ok);
        engine.shutdown();
        // Lock released: a second init succeeds.
        let engine = engine_at(state.path());
        engine.shutdown();
    }

    #[test]
    fn test_analyze_end_to_end() {
        let state = tempdir().unwrap();
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.py"), "x = eval(raw)\n").unwrap();
        let engine = engine_at(state.path());

        let (result, suppressed) = engine.analyze(project.path(), &CancelToken::new()).unwrap();
        assert_eq!(result.issues.len(), 1);
        assert!(suppressed.is_empty());
        assert_eq!(result.issues[0].issue_type, "python.eval-call");
    }

    #[test]
    fn test_fix_end_to_end_applies_none_comparison() {
        let state = tempdir().unwrap();
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.py"), "if x == None:\n    pass\n").unwrap();
        // Sandbox policy that accepts the build trivially.
        std::fs::write(project.path().join("scrutiny.sandbox.yaml"), "build: [\"true\"]\n")
            .unwrap();
        let engine = engine_at(state.path());

        let approver = gate::StaticApprover {
            decision: ApprovalDecision::Approve,
            user_confidence: 0.9,
        };
        let report = engine.fix(project.path(), &approver, &CancelToken::new()).unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(!report.compromised);

        let fixed = std::fs::read_to_string(project.path().join("app.py")).unwrap();
        assert_eq!(fixed, "if x is None:\n    pass\n");
    }

    #[test]
    fn test_train_seeds_namespace() {
        let state = tempdir().unwrap();
        let engine = engine_at(state.path());
        let stored = engine
            .train(vec![
                (
                    "off-by-one in loop bound".to_owned(),
                    serde_json::json!({"kind": "issue_pattern"}),
                ),
                (
                    "bare except hides errors".to_owned(),
                    serde_json::json!({"kind": "issue_pattern"}),
                ),
            ])
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(engine.memory().count(Some(NS_TRAINING)).unwrap(), 2);
    }

    #[test]
    fn test_stats_reports_namespaces() {
        let state = tempdir().unwrap();
        let engine = engine_at(state.path());
        engine
            .train(vec![("x".to_owned(), serde_json::json!({}))])
            .unwrap();
        let stats = engine.stats().unwrap();
        assert!(stats.namespaces.iter().any(|(ns, n)| ns == NS_TRAINING && *n == 1));
    }
}
