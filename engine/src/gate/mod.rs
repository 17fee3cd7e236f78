//! The four-layer safety gate — the only path by which a proposal may touch
//! the filesystem.
//!
//! Ordering is total and no layer is skipped:
//!
//! 1. **Pattern scan** — the read-only library in [`patterns`] over the
//!    replacement text and the hypothetical post-apply buffer.
//! 2. **Approval with learned trust** — policy auto-approval for provably
//!    boring fixes, everything else goes to the approval surface. Decisions
//!    feed per-type trust: rejections tighten the auto bar immediately,
//!    approvals loosen it only under a long clean history.
//! 3. **Emergency re-check** — immediately before any byte is written, the
//!    pattern scan reruns on the final bytes, the original text is compared
//!    against the file, and the proposal is checked against the digest taken
//!    at layer 1. Any discrepancy marks the whole session compromised and
//!    refuses further fixes this run.
//! 4. **Sandbox** — isolated build/run via a [`ProposalValidator`]; only an
//!    `ok` outcome passes.
//!
//! The apply itself writes a temp file in the target's directory, fsyncs,
//! and renames over the target, keeping a rotated `.bak` per file in the
//! state directory.

pub mod patterns;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fixer::apply_to_buffer;
use crate::memory::{MemoryEngine, SearchMode, NS_GLOBAL};
use crate::types::{
    ApprovalDecision, ApprovalRecord, FileContext, FixProposal, SandboxOutcome, SandboxRun,
};

/// Outcome of a proposal that was not refused.
#[derive(Debug)]
pub enum GateOutcome {
    /// The fix was validated and written.
    Applied {
        /// Path of the rotated backup taken before the write.
        backup: PathBuf,
        /// The sandbox run that admitted the fix.
        sandbox: SandboxRun,
    },
    /// The approval surface deferred the decision.
    Deferred,
}

/// Decision returned by an approval surface.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// The decision.
    pub decision: ApprovalDecision,
    /// Free-form reason.
    pub reason: Option<String>,
    /// Reviewer confidence, 0.0..=1.0.
    pub user_confidence: f32,
}

/// The approval surface contract (CLI prompt, HTTP façade, test stub).
///
/// The proposal is handed out mutably; any mutation of its safety-relevant
/// fields is caught at layer 3 against the layer-1 digest.
pub trait ApprovalHandler {
    /// Review one proposal.
    fn review(&self, proposal: &mut FixProposal) -> ApprovalOutcome;
}

/// Non-interactive default surface: defers everything that was not
/// auto-approved.
pub struct DeferringApprover;

impl ApprovalHandler for DeferringApprover {
    fn review(&self, _proposal: &mut FixProposal) -> ApprovalOutcome {
        ApprovalOutcome {
            decision: ApprovalDecision::Defer,
            reason: Some("no interactive approval surface".to_owned()),
            user_confidence: 0.0,
        }
    }
}

/// Fixed-decision surface, used by tests and the `--assume-yes` CLI path.
pub struct StaticApprover {
    /// Decision returned for every proposal.
    pub decision: ApprovalDecision,
    /// Confidence attached to every decision.
    pub user_confidence: f32,
}

impl ApprovalHandler for StaticApprover {
    fn review(&self, _proposal: &mut FixProposal) -> ApprovalOutcome {
        ApprovalOutcome {
            decision: self.decision,
            reason: None,
            user_confidence: self.user_confidence,
        }
    }
}

/// Layer 4 contract. Implemented by the sandbox validator; tests substitute
/// stubs so gate logic is exercised without spawning processes.
pub trait ProposalValidator {
    /// Validate a proposal against a throwaway copy of the project.
    ///
    /// # Errors
    ///
    /// Implementations return resource errors for setup failures; validation
    /// verdicts are expressed through [`SandboxRun::outcome`].
    fn validate(&self, project_root: &Path, proposal: &FixProposal) -> Result<SandboxRun>;
}

/// Append-only audit log of gate decisions under `logs/audit.log`.
///
/// Never pruned by the pruner; the log is the forensic record of every
/// refusal and apply.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open (creating the `logs/` directory if needed).
    pub fn open(state_dir: &Path) -> Result<Self> {
        let logs = state_dir.join("logs");
        std::fs::create_dir_all(&logs)
            .map_err(|e| EngineError::Fatal(format!("cannot create logs dir: {e}")))?;
        Ok(Self {
            path: logs.join("audit.log"),
        })
    }

    /// Append one decision record. Failures are logged at error level and
    /// never propagated.
    pub fn record(&self, proposal_id: &str, stage: &str, decision: &str, detail: &str) {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "proposal_id": proposal_id,
            "stage": stage,
            "decision": decision,
            "detail": detail,
        });
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                writeln!(f, "{entry}")?;
                f.flush()
            });
        if let Err(e) = result {
            log::error!("audit log append failed: {e}");
        }
    }
}

/// The safety gate. One instance per run; a detected integrity violation
/// poisons the instance and every later proposal is refused.
pub struct SafetyGate<'a> {
    memory: &'a MemoryEngine,
    config: &'a EngineConfig,
    approver: &'a dyn ApprovalHandler,
    validator: &'a dyn ProposalValidator,
    audit: AuditLog,
    compromised: AtomicBool,
}

impl<'a> SafetyGate<'a> {
    /// Create a gate for one run.
    ///
    /// # Errors
    ///
    /// `Fatal` when the audit log directory cannot be created.
    pub fn new(
        memory: &'a MemoryEngine,
        config: &'a EngineConfig,
        approver: &'a dyn ApprovalHandler,
        validator: &'a dyn ProposalValidator,
    ) -> Result<Self> {
        Ok(Self {
            memory,
            config,
            approver,
            validator,
            audit: AuditLog::open(&config.state_dir)?,
            compromised: AtomicBool::new(false),
        })
    }

    /// Whether this run has been marked compromised.
    #[must_use]
    pub fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::Relaxed)
    }

    /// Run a proposal through all four layers and, if everything passes,
    /// apply it.
    ///
    /// # Errors
    ///
    /// - `RejectPattern` — layer 1 or 3 matched a dangerous pattern.
    /// - `Refused` — approval rejected, the session is compromised, or the
    ///   proposal is stale.
    /// - `IntegrityViolation` — layer 3 mismatch; poisons the run.
    /// - `SandboxRejected` — layer 4 returned a non-ok outcome.
    /// - `Io` — the apply itself failed.
    pub fn process(
        &self,
        project_root: &Path,
        mut proposal: FixProposal,
    ) -> Result<GateOutcome> {
        if self.is_compromised() {
            return Err(EngineError::Refused(
                "session is compromised; no further fixes this run".to_owned(),
            ));
        }

        let target = project_root.join(&proposal.original_span.path);
        let content = std::fs::read_to_string(&target)?;

        // A stale proposal (file changed since the scan snapshot) is a plain
        // refusal, not an integrity violation: nothing tampered with the
        // proposal itself.
        if !span_matches(&content, &proposal) {
            self.audit.record(&proposal.id, "L1", "refused", "original text drifted");
            return Err(EngineError::Refused(
                "file changed since the proposal was created".to_owned(),
            ));
        }
        let post = apply_to_buffer(&content, &proposal);

        // Layer 1 — pattern scan.
        if let Some(hit) = patterns::scan_proposal(&proposal.replacement_text, &post) {
            self.audit.record(
                &proposal.id,
                "L1",
                "reject-pattern",
                &format!("{}: {}", hit.rule, hit.evidence),
            );
            self.record_fix_memory(&proposal, "fix_failure", &format!("L1 {}", hit.rule));
            return Err(EngineError::RejectPattern {
                rule: hit.rule.to_owned(),
                evidence: hit.evidence,
            });
        }
        let digest = proposal_digest(&proposal);

        // Layer 2 — approval with learned trust.
        let auto_bar = self.trust_threshold(&proposal.issue.issue_type);
        let auto_ok = self.config.gate.auto_approve
            && proposal.auto_approvable
            && proposal.safety_score >= auto_bar
            && matches!(
                proposal.issue.context,
                FileContext::Production | FileContext::Script
            );

        let outcome = if auto_ok {
            ApprovalOutcome {
                decision: ApprovalDecision::Approve,
                reason: Some("policy auto-approval".to_owned()),
                user_confidence: 0.99,
            }
        } else {
            self.approver.review(&mut proposal)
        };

        let record = ApprovalRecord {
            proposal_id: proposal.id.clone(),
            fingerprint: proposal.issue.fingerprint.clone(),
            decision: outcome.decision,
            reason: outcome.reason.clone(),
            user_confidence: outcome.user_confidence,
            ts: Utc::now(),
        };
        self.record_approval(&record, &proposal.issue.issue_type);

        match outcome.decision {
            ApprovalDecision::Approve => {}
            ApprovalDecision::Reject => {
                self.audit.record(
                    &proposal.id,
                    "L2",
                    "reject",
                    outcome.reason.as_deref().unwrap_or(""),
                );
                return Err(EngineError::Refused(
                    outcome.reason.unwrap_or_else(|| "rejected by reviewer".to_owned()),
                ));
            }
            ApprovalDecision::Defer => {
                self.audit.record(&proposal.id, "L2", "defer", "");
                return Ok(GateOutcome::Deferred);
            }
        }

        // Layer 3 — emergency re-check against the final computed bytes.
        if let Err(reason) = self.emergency_recheck(&target, &proposal, &digest) {
            self.compromised.store(true, Ordering::Relaxed);
            self.audit.record(&proposal.id, "L3", "integrity-violation", &reason);
            self.record_fix_memory(&proposal, "fix_failure", &format!("L3 {reason}"));
            return Err(EngineError::IntegrityViolation(reason));
        }

        // Layer 4 — sandbox.
        let run = self.validator.validate(project_root, &proposal)?;
        if run.outcome != SandboxOutcome::Ok {
            self.audit.record(
                &proposal.id,
                "L4",
                "sandbox-reject",
                &run.outcome.to_string(),
            );
            let kind = match run.outcome {
                SandboxOutcome::SecurityViolation | SandboxOutcome::Timeout => "untrusted_fix",
                _ => "fix_failure",
            };
            self.record_fix_memory(&proposal, kind, &format!("sandbox {}", run.outcome));
            return Err(EngineError::SandboxRejected(run.outcome));
        }

        // Apply: backup, then temp + fsync + rename.
        let final_content = std::fs::read_to_string(&target)?;
        let post = apply_to_buffer(&final_content, &proposal);
        let backup = self.write_backup(project_root, &proposal.original_span.path, &final_content)?;
        atomic_write(&target, &post)?;

        self.audit.record(&proposal.id, "apply", "applied", &proposal.original_span.path);
        self.record_fix_memory(&proposal, "fix_success", "applied");
        log::info!(
            "applied {} to {} (backup {})",
            proposal.id,
            proposal.original_span.path,
            backup.display()
        );
        Ok(GateOutcome::Applied { backup, sandbox: run })
    }

    /// Layer 3 verification: digest intact, original text still present,
    /// final bytes pattern-clean.
    fn emergency_recheck(
        &self,
        target: &Path,
        proposal: &FixProposal,
        l1_digest: &str,
    ) -> std::result::Result<(), String> {
        if proposal_digest(proposal) != l1_digest {
            return Err("proposal mutated after layer 1 (digest mismatch)".to_owned());
        }

        let content = std::fs::read_to_string(target)
            .map_err(|e| format!("target unreadable at layer 3: {e}"))?;
        if !span_matches(&content, proposal) {
            return Err("original text no longer matches the file at the span".to_owned());
        }

        let post = apply_to_buffer(&content, proposal);
        if let Some(hit) = patterns::scan(&post).into_iter().next() {
            return Err(format!("final bytes match pattern '{}': {}", hit.rule, hit.evidence));
        }
        Ok(())
    }

    /// Per-type auto-approval bar with learned trust.
    ///
    /// Base 98. Every recorded rejection raises the bar by one (a bar above
    /// 100 disables auto-approval for the type). A long clean history — at
    /// least 20 approvals and no rejections — relaxes the bar to 97.
    fn trust_threshold(&self, issue_type: &str) -> u8 {
        let (approvals, rejections) = self.trust_stats(issue_type);
        if rejections > 0 {
            return self
                .config
                .gate
                .auto_threshold
                .saturating_add(rejections.min(10) as u8);
        }
        if approvals >= 20 {
            return self.config.gate.auto_threshold.saturating_sub(1);
        }
        self.config.gate.auto_threshold
    }

    fn trust_stats(&self, issue_type: &str) -> (u64, u64) {
        let hit = self
            .memory
            .search(NS_GLOBAL, &format!("trust {issue_type}"), 8, 0.0, SearchMode::Keyword)
            .ok()
            .and_then(|hits| {
                hits.into_iter().find(|h| {
                    h.metadata.get("kind").and_then(|v| v.as_str()) == Some("trust")
                        && h.metadata.get("type").and_then(|v| v.as_str()) == Some(issue_type)
                })
            });
        match hit {
            Some(h) => (
                h.metadata.get("approvals").and_then(serde_json::Value::as_u64).unwrap_or(0),
                h.metadata.get("rejections").and_then(serde_json::Value::as_u64).unwrap_or(0),
            ),
            None => (0, 0),
        }
    }

    /// Store the approval record and fold it into the per-type trust stats.
    fn record_approval(&self, record: &ApprovalRecord, issue_type: &str) {
        let content = format!(
            "approval {} {} fingerprint {} decision {}",
            record.proposal_id, issue_type, record.fingerprint, record.decision
        );
        let metadata = serde_json::json!({
            "kind": "approval",
            "type": issue_type,
            "fingerprint": record.fingerprint,
            "decision": record.decision.to_string(),
            "user_confidence": record.user_confidence,
        });
        if let Err(e) = self.memory.store(NS_GLOBAL, &content, metadata) {
            log::warn!("failed to store approval record: {e}");
        }

        if record.decision == ApprovalDecision::Defer {
            return;
        }
        let (mut approvals, mut rejections) = self.trust_stats(issue_type);
        match record.decision {
            ApprovalDecision::Approve => approvals += 1,
            ApprovalDecision::Reject => rejections += 1,
            ApprovalDecision::Defer => {}
        }

        let existing = self
            .memory
            .search(NS_GLOBAL, &format!("trust {issue_type}"), 8, 0.0, SearchMode::Keyword)
            .ok()
            .and_then(|hits| {
                hits.into_iter().find(|h| {
                    h.metadata.get("kind").and_then(|v| v.as_str()) == Some("trust")
                        && h.metadata.get("type").and_then(|v| v.as_str()) == Some(issue_type)
                })
            });
        let metadata = serde_json::json!({
            "kind": "trust",
            "type": issue_type,
            "approvals": approvals,
            "rejections": rejections,
        });
        let result = match existing {
            Some(h) => self.memory.update(h.id, None, Some(metadata)).map(|_| 0),
            None => self
                .memory
                .store(NS_GLOBAL, &format!("trust {issue_type}"), metadata),
        };
        if let Err(e) = result {
            log::warn!("failed to update trust stats: {e}");
        }
    }

    /// Record a fix outcome memory in the global namespace.
    fn record_fix_memory(&self, proposal: &FixProposal, kind: &str, detail: &str) {
        let content = format!(
            "{kind} proposal {} fingerprint {} for {} in {} ({detail})",
            proposal.id, proposal.issue.fingerprint, proposal.issue.issue_type, proposal.issue.file
        );
        let metadata = serde_json::json!({
            "kind": kind,
            "proposal_id": proposal.id,
            "fingerprint": proposal.issue.fingerprint,
            "type": proposal.issue.issue_type,
        });
        if let Err(e) = self.memory.store(NS_GLOBAL, &content, metadata) {
            log::warn!("failed to store {kind} memory: {e}");
        }
    }

    /// Copy the pre-apply file into the rotated backup tree:
    /// `backups/<project-hash>/<path>/<ts>.bak`, keeping the newest N.
    fn write_backup(
        &self,
        project_root: &Path,
        rel_path: &str,
        content: &str,
    ) -> Result<PathBuf> {
        let project_hash = crate::orchestrator::project_id(project_root);
        let dir = self
            .config
            .state_dir
            .join("backups")
            .join(project_hash)
            .join(rel_path);
        std::fs::create_dir_all(&dir)?;

        let backup = dir.join(format!("{}.bak", Utc::now().timestamp_millis()));
        std::fs::write(&backup, content)?;

        // Rotation: keep the newest N per file.
        let mut baks: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "bak"))
            .collect();
        baks.sort();
        while baks.len() > self.config.gate.backups_per_file {
            let oldest = baks.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                log::warn!("backup rotation failed for {}: {e}", oldest.display());
            }
        }

        Ok(backup)
    }
}

/// Whether the proposal's original text still matches the file content at
/// its span.
fn span_matches(content: &str, proposal: &FixProposal) -> bool {
    let span = &proposal.original_span;
    content
        .get(span.offset..span.end())
        .is_some_and(|slice| slice == proposal.original_text)
}

/// Digest binding the safety-relevant proposal fields at layer 1.
fn proposal_digest(proposal: &FixProposal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(proposal.id.as_bytes());
    hasher.update([0]);
    hasher.update(proposal.original_span.path.as_bytes());
    hasher.update([0]);
    hasher.update(proposal.original_span.offset.to_le_bytes());
    hasher.update(proposal.original_span.len.to_le_bytes());
    hasher.update([0]);
    hasher.update(proposal.original_text.as_bytes());
    hasher.update([0]);
    hasher.update(proposal.replacement_text.as_bytes());
    hasher.update([0]);
    hasher.update([proposal.safety_score]);
    hex::encode(hasher.finalize())
}

/// Write content to a temp file in the target's directory, fsync, and
/// rename over the target.
fn atomic_write(target: &Path, content: &str) -> Result<()> {
    let pid = std::process::id();
    let tmp = target.with_extension(format!("scrutiny-tmp.{pid}"));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, target)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixer::FixProposer;
    use crate::types::{Issue, Severity};
    use tempfile::tempdir;

    /// Validator stub returning a fixed outcome.
    struct StubValidator(SandboxOutcome);

    impl ProposalValidator for StubValidator {
        fn validate(&self, _root: &Path, proposal: &FixProposal) -> Result<SandboxRun> {
            Ok(SandboxRun {
                proposal_id: proposal.id.clone(),
                build_status: "ok".to_owned(),
                run_status: "skipped".to_owned(),
                outcome: self.0,
                violations: Vec::new(),
                wall_ms: 5,
                cpu_ms: 1,
                rss_peak: 0,
            })
        }
    }

    /// Approval surface that tampers with the safety score.
    struct TamperingApprover;

    impl ApprovalHandler for TamperingApprover {
        fn review(&self, proposal: &mut FixProposal) -> ApprovalOutcome {
            proposal.safety_score = 100;
            ApprovalOutcome {
                decision: ApprovalDecision::Approve,
                reason: None,
                user_confidence: 1.0,
            }
        }
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, EngineConfig, MemoryEngine) {
        let state = tempdir().unwrap();
        let project = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.state_dir = state.path().to_path_buf();
        let memory = MemoryEngine::init(&config).unwrap();
        (state, project, config, memory)
    }

    fn none_proposal(project: &Path) -> FixProposal {
        let content = "if x == None:\n    pass\n";
        std::fs::write(project.join("app.py"), content).unwrap();
        let issue = Issue {
            issue_type: "python.comparison-to-none".to_owned(),
            severity: Severity::Low,
            file: "app.py".to_owned(),
            line: Some(1),
            column: Some(6),
            description: "Equality comparison with None.".to_owned(),
            suggestion: None,
            context: FileContext::Production,
            fingerprint: "cafebabecafebabe".to_owned(),
        };
        FixProposer::new().propose(content, &issue).unwrap()
    }

    #[test]
    fn test_auto_approved_fix_applied() {
        let (_state, project, config, memory) = setup();
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let proposal = none_proposal(project.path());
        let outcome = gate.process(project.path(), proposal).unwrap();
        let GateOutcome::Applied { backup, .. } = outcome else {
            panic!("expected apply");
        };
        assert!(backup.exists());

        let after = std::fs::read_to_string(project.path().join("app.py")).unwrap();
        assert_eq!(after, "if x is None:\n    pass\n");
        // A fix_success memory is recorded.
        let hits = memory
            .search(NS_GLOBAL, "fix_success", 5, 0.0, SearchMode::Keyword)
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_pattern_gate_rejects_dangerous_replacement() {
        // A replacement containing os.system("rm -rf /") is
        // rejected at L1 with shell-destructive, nothing is written, and a
        // fix_failure memory lands in global.
        let (_state, project, config, memory) = setup();
        let approver = StaticApprover {
            decision: ApprovalDecision::Approve,
            user_confidence: 1.0,
        };
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let mut proposal = none_proposal(project.path());
        proposal.replacement_text = r#"os.system("rm -rf /")"#.to_owned();
        let before = std::fs::read_to_string(project.path().join("app.py")).unwrap();

        let err = gate.process(project.path(), proposal).unwrap_err();
        match err {
            EngineError::RejectPattern { rule, .. } => assert_eq!(rule, "shell-destructive"),
            other => panic!("expected RejectPattern, got {other}"),
        }

        let after = std::fs::read_to_string(project.path().join("app.py")).unwrap();
        assert_eq!(before, after, "no file may be modified on a pattern reject");

        let hits = memory
            .search(NS_GLOBAL, "fix_failure", 5, 0.0, SearchMode::Keyword)
            .unwrap();
        assert!(hits
            .iter()
            .any(|h| h.metadata.get("kind").and_then(|v| v.as_str()) == Some("fix_failure")));
        assert!(!gate.is_compromised());
    }

    #[test]
    fn test_tamper_detected_and_session_poisoned() {
        // safety_score mutated after L2 approval → IntegrityViolation,
        // and the next proposal in the same run is refused.
        let (_state, project, config, memory) = setup();
        let approver = TamperingApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        // Medium severity → not auto-approvable → goes through the
        // (tampering) approval surface.
        let content = "try:\n    run()\nexcept:\n    pass\n";
        std::fs::write(project.path().join("app.py"), content).unwrap();
        let issue = Issue {
            issue_type: "python.bare-except".to_owned(),
            severity: Severity::Medium,
            file: "app.py".to_owned(),
            line: Some(3),
            column: Some(1),
            description: "Bare except".to_owned(),
            suggestion: None,
            context: FileContext::Production,
            fingerprint: "0123456789abcdef".to_owned(),
        };
        let proposal = FixProposer::new().propose(content, &issue).unwrap();

        let err = gate.process(project.path(), proposal).unwrap_err();
        assert!(matches!(err, EngineError::IntegrityViolation(_)));
        assert!(gate.is_compromised());

        // Further fixes this run are refused outright.
        let second = none_proposal(project.path());
        let err = gate.process(project.path(), second).unwrap_err();
        assert!(matches!(err, EngineError::Refused(_)));
    }

    #[test]
    fn test_sandbox_timeout_discards_and_marks_untrusted() {
        // Sandbox timeout → proposal discarded, fingerprint
        // recorded as untrusted.
        let (_state, project, config, memory) = setup();
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Timeout);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let proposal = none_proposal(project.path());
        let fingerprint = proposal.issue.fingerprint.clone();
        let before = std::fs::read_to_string(project.path().join("app.py")).unwrap();

        let err = gate.process(project.path(), proposal).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SandboxRejected(SandboxOutcome::Timeout)
        ));
        let after = std::fs::read_to_string(project.path().join("app.py")).unwrap();
        assert_eq!(before, after);

        let hits = memory
            .search(NS_GLOBAL, &fingerprint, 5, 0.0, SearchMode::Keyword)
            .unwrap();
        assert!(hits
            .iter()
            .any(|h| h.metadata.get("kind").and_then(|v| v.as_str()) == Some("untrusted_fix")));
    }

    #[test]
    fn test_reviewer_rejection_tightens_trust() {
        let (_state, project, config, memory) = setup();
        let validator = StubValidator(SandboxOutcome::Ok);

        {
            let approver = StaticApprover {
                decision: ApprovalDecision::Reject,
                user_confidence: 0.9,
            };
            let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();
            // Context Test → not auto-approvable → reviewer rejects.
            let content = "if x == None:\n    pass\n";
            std::fs::write(project.path().join("t.py"), content).unwrap();
            let issue = Issue {
                issue_type: "python.comparison-to-none".to_owned(),
                severity: Severity::Low,
                file: "t.py".to_owned(),
                line: Some(1),
                column: Some(6),
                description: "none compare".to_owned(),
                suggestion: None,
                context: FileContext::Test,
                fingerprint: "feedc0defeedc0de".to_owned(),
            };
            let proposal = FixProposer::new().propose(content, &issue).unwrap();
            let err = gate.process(project.path(), proposal).unwrap_err();
            assert!(matches!(err, EngineError::Refused(_)));
        }

        // After a rejection, the auto bar for the type exceeds 98, so a
        // production proposal with score 98 is no longer auto-approved; the
        // deferring surface then defers it.
        let approver = DeferringApprover;
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();
        let proposal = none_proposal(project.path());
        assert_eq!(proposal.safety_score, 98);
        let outcome = gate.process(project.path(), proposal).unwrap();
        assert!(matches!(outcome, GateOutcome::Deferred));
    }

    #[test]
    fn test_deferred_leaves_file_untouched() {
        let (_state, project, mut config, memory) = setup();
        config.gate.auto_approve = false;
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let proposal = none_proposal(project.path());
        let before = std::fs::read_to_string(project.path().join("app.py")).unwrap();
        let outcome = gate.process(project.path(), proposal).unwrap();
        assert!(matches!(outcome, GateOutcome::Deferred));
        assert_eq!(
            before,
            std::fs::read_to_string(project.path().join("app.py")).unwrap()
        );
    }

    #[test]
    fn test_backup_rotation_keeps_last_n() {
        let (_state, project, config, memory) = setup();
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        // Apply more fixes than the retention limit to the same file.
        for i in 0..(config.gate.backups_per_file + 2) {
            let content = format!("a{i} == None\n");
            std::fs::write(project.path().join("app.py"), &content).unwrap();
            let issue = Issue {
                issue_type: "python.comparison-to-none".to_owned(),
                severity: Severity::Low,
                file: "app.py".to_owned(),
                line: Some(1),
                column: Some(1),
                description: "none".to_owned(),
                suggestion: None,
                context: FileContext::Production,
                fingerprint: format!("fp{i}"),
            };
            let proposal = FixProposer::new().propose(&content, &issue).unwrap();
            gate.process(project.path(), proposal).unwrap();
            // Backup timestamps have millisecond resolution.
            std::thread::sleep(std::time::Duration::from_millis(3));
        }

        let project_hash = crate::orchestrator::project_id(project.path());
        let dir = config
            .state_dir
            .join("backups")
            .join(project_hash)
            .join("app.py");
        let baks = std::fs::read_dir(dir).unwrap().count();
        assert_eq!(baks, config.gate.backups_per_file);
    }

    #[test]
    fn test_stale_proposal_refused_without_poisoning() {
        let (_state, project, config, memory) = setup();
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let proposal = none_proposal(project.path());
        // The file changes underneath the proposal.
        std::fs::write(project.path().join("app.py"), "something else\n").unwrap();

        let err = gate.process(project.path(), proposal).unwrap_err();
        assert!(matches!(err, EngineError::Refused(_)));
        assert!(!gate.is_compromised());
    }

    #[test]
    fn test_audit_log_appended() {
        let (state, project, config, memory) = setup();
        let approver = DeferringApprover;
        let validator = StubValidator(SandboxOutcome::Ok);
        let gate = SafetyGate::new(&memory, &config, &approver, &validator).unwrap();

        let proposal = none_proposal(project.path());
        gate.process(project.path(), proposal).unwrap();

        let audit = std::fs::read_to_string(state.path().join("logs").join("audit.log")).unwrap();
        assert!(audit.lines().count() >= 1);
        assert!(audit.contains("applied"));
    }
}
