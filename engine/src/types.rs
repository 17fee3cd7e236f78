//! Core type definitions for the Scrutiny engine.
//!
//! These types form the contract between the engine and its consumers (CLI,
//! JSON output, persisted memories):
//!
//! - [`Severity`] is the five-level issue severity scale
//! - [`FileContext`] classifies where in a project a file lives
//! - [`Issue`] is the atomic unit of analyzer output
//! - [`ScanResult`] is the aggregate result of one project scan
//! - [`FixProposal`] is a single-span mechanical rewrite derived from an issue
//! - [`ApprovalRecord`] captures a human (or policy) decision on a proposal
//! - [`CycleRecord`] summarizes the delta between two successive scans
//! - [`SandboxRun`] is the outcome of one isolated build/run validation
//!
//! All JSON-emitted types are forward-compatible: consumers must ignore
//! unknown fields, and fields are never removed once emitted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue severity scale.
///
/// Analyzers assign severity under a fixed rubric: security defects default
/// to `High` or worse, correctness defects to `Medium` or worse, style to
/// `Low` or `Cosmetic`. Declaration order gives `Critical < Cosmetic` under
/// `Ord`, so `severity <= Severity::High` reads "high or worse".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must be fixed; exploitable or data-destroying.
    Critical,
    /// Security-relevant or likely to cause incorrect behavior in production.
    High,
    /// Correctness defect with bounded blast radius.
    Medium,
    /// Style or maintainability issue.
    Low,
    /// Whitespace-level nit.
    Cosmetic,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Cosmetic => write!(f, "cosmetic"),
        }
    }
}

impl Severity {
    /// Parse a lowercase severity name. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "cosmetic" => Some(Self::Cosmetic),
            _ => None,
        }
    }
}

/// Classification of a file's role within the project.
///
/// Produced by the context analyzer from path-segment heuristics plus content
/// sniffs. Input to false-positive scoring and to the fix proposer's severity
/// policy (fixes in `Test` and `Demo` contexts are held to stricter patterns).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileContext {
    /// Shipped application or library code (the default).
    #[default]
    Production,
    /// Test harnesses and fixtures.
    Test,
    /// Demonstration or example code.
    Demo,
    /// Configuration files.
    Config,
    /// Machine-generated code.
    Generated,
    /// Third-party code vendored into the tree.
    Vendored,
    /// Operational scripts.
    Script,
}

impl std::fmt::Display for FileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
            Self::Demo => write!(f, "demo"),
            Self::Config => write!(f, "config"),
            Self::Generated => write!(f, "generated"),
            Self::Vendored => write!(f, "vendored"),
            Self::Script => write!(f, "script"),
        }
    }
}

/// A single finding produced by a language analyzer.
///
/// Every issue must have a stable `type` identifier (e.g.
/// `"python.bare-except"`), an actionable description, and the correct
/// severity under the rubric. The `fingerprint` is filled in by the
/// orchestrator so analyzer logic stays language-local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable issue type identifier, `<language>.<rule>` form.
    #[serde(rename = "type")]
    pub issue_type: String,

    /// Severity under the fixed rubric.
    pub severity: Severity,

    /// File path relative to project root (always forward slashes).
    pub file: String,

    /// 1-based line number, if the issue is line-anchored.
    pub line: Option<u32>,

    /// 1-based column number, if known.
    pub column: Option<u32>,

    /// Human-readable, actionable description.
    pub description: String,

    /// Suggested remedy, if one exists.
    pub suggestion: Option<String>,

    /// Context classification of the containing file.
    pub context: FileContext,

    /// Stable cross-scan identity hash. Empty until the orchestrator fills it.
    pub fingerprint: String,
}

/// Aggregate result of scanning one project.
///
/// Issues are ordered `(line, column, type)` within a file and files are
/// path-sorted, so output is stable for diff-based consumers and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Opaque scan identifier, unique per run.
    pub scan_id: String,

    /// Stable project identifier derived from the canonical root path.
    pub project_id: String,

    /// Project root as given by the caller.
    pub project_root: String,

    /// All surviving issues in stable order.
    pub issues: Vec<Issue>,

    /// Number of files dispatched to an analyzer this run.
    pub files_analyzed: u32,

    /// Number of files skipped (size cap, read errors, unknown type).
    pub files_skipped: u32,

    /// Number of files served from the scan cache.
    pub files_cached: u32,

    /// Issue count per severity name.
    pub severity_counts: BTreeMap<String, u32>,

    /// Issue count per issue type.
    pub type_counts: BTreeMap<String, u32>,

    /// Wall-clock milliseconds for the whole scan.
    pub elapsed_ms: u64,

    /// When the scan started.
    pub started_at: DateTime<Utc>,
}

impl ScanResult {
    /// Whether the scan found nothing at all.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// The set of issue fingerprints in this scan.
    #[must_use]
    pub fn fingerprints(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.fingerprint.clone()).collect()
    }
}

/// A contiguous byte span inside one file.
///
/// `offset`/`len` are byte-accurate and drive the apply; `line`/`col` are
/// 1-based and informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// File path relative to project root.
    pub path: String,
    /// Byte offset of the span start.
    pub offset: usize,
    /// Span length in bytes.
    pub len: usize,
    /// 1-based line of the span start.
    pub line: u32,
    /// 1-based column of the span start.
    pub col: u32,
}

impl Span {
    /// Byte offset one past the end of the span.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A single-span mechanical fix derived from an issue.
///
/// Invariants: `original_text` must match the file bytes at `original_span`
/// before apply; the span is a single contiguous range; `auto_approvable`
/// implies `safety_score >= 98` and severity in `{cosmetic, low}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    /// Opaque proposal identifier (content hash).
    pub id: String,

    /// The issue this proposal addresses.
    pub issue: Issue,

    /// The byte span to be replaced.
    pub original_span: Span,

    /// Exact bytes currently at `original_span`.
    pub original_text: String,

    /// Replacement bytes.
    pub replacement_text: String,

    /// Why this rewrite is mechanical and safe.
    pub rationale: String,

    /// Recipe-assigned safety score, 0..=100.
    pub safety_score: u8,

    /// Whether this proposal is eligible for policy auto-approval.
    pub auto_approvable: bool,
}

/// Decision on a fix proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Apply the proposal.
    Approve,
    /// Discard the proposal.
    Reject,
    /// Leave the proposal pending.
    Defer,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Defer => write!(f, "defer"),
        }
    }
}

/// A recorded decision on a proposal, keyed by issue fingerprint.
///
/// Decisions feed the false-positive detector and the gate's learned-trust
/// thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Proposal this decision applies to.
    pub proposal_id: String,
    /// Fingerprint of the underlying issue.
    pub fingerprint: String,
    /// The decision.
    pub decision: ApprovalDecision,
    /// Free-form reason, if the reviewer gave one.
    pub reason: Option<String>,
    /// Reviewer's confidence in their own decision, 0.0..=1.0.
    pub user_confidence: f32,
    /// When the decision was made.
    pub ts: DateTime<Utc>,
}

/// Delta between two successive scans of the same project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Project identifier.
    pub project: String,
    /// Scan id of the earlier scan.
    pub prev_scan_id: String,
    /// Scan id of the later scan.
    pub cur_scan_id: String,
    /// Fingerprints present before and absent now.
    pub resolved: Vec<String>,
    /// Fingerprints absent before and present now.
    #[serde(rename = "new")]
    pub new_issues: Vec<String>,
    /// Resolved fingerprints with no applied proposal in the interval.
    pub manual_fixes: Vec<String>,
    /// Resolved fingerprints matched to an applied proposal.
    pub automated_fixes: Vec<String>,
    /// Start of the interval (earlier scan).
    pub started_at: DateTime<Utc>,
    /// End of the interval (later scan).
    pub ended_at: DateTime<Utc>,
}

impl CycleRecord {
    /// Fraction of resolved issues fixed by hand. `0.0` when nothing resolved.
    #[must_use]
    pub fn manual_fix_rate(&self) -> f64 {
        if self.resolved.is_empty() {
            return 0.0;
        }
        self.manual_fixes.len() as f64 / self.resolved.len() as f64
    }

    /// Fraction of resolved issues fixed by an applied proposal.
    #[must_use]
    pub fn automated_fix_rate(&self) -> f64 {
        if self.resolved.is_empty() {
            return 0.0;
        }
        self.automated_fixes.len() as f64 / self.resolved.len() as f64
    }
}

/// Outcome category of a sandbox validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxOutcome {
    /// Build (and test command, if declared) succeeded within budget.
    Ok,
    /// Build command failed, or no usable build policy exists.
    BuildFailed,
    /// Test command failed.
    TestFailed,
    /// A resource limit (CPU, memory, file descriptors) was hit.
    ResourceExceeded,
    /// The run violated the isolation policy.
    SecurityViolation,
    /// The wall-clock budget elapsed.
    Timeout,
}

impl std::fmt::Display for SandboxOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::BuildFailed => write!(f, "build_failed"),
            Self::TestFailed => write!(f, "test_failed"),
            Self::ResourceExceeded => write!(f, "resource_exceeded"),
            Self::SecurityViolation => write!(f, "security_violation"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of one isolated build/run validation. Ephemeral; a summary is
/// stored as a memory only on failure or policy miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    /// Proposal that was validated.
    pub proposal_id: String,
    /// Build phase status: `"ok"`, `"failed"`, or `"skipped"`.
    pub build_status: String,
    /// Test phase status: `"ok"`, `"failed"`, or `"skipped"`.
    pub run_status: String,
    /// Overall outcome category.
    pub outcome: SandboxOutcome,
    /// Isolation policy notes and violations observed during the run.
    pub violations: Vec<String>,
    /// Wall-clock milliseconds consumed.
    pub wall_ms: u64,
    /// CPU milliseconds consumed (user + system, children).
    pub cpu_ms: u64,
    /// Peak resident set size in bytes, if the platform reports it.
    pub rss_peak: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
