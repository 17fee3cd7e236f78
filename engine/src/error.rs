//! Error taxonomy for the Scrutiny engine.
//!
//! One enum covers the whole engine; variants map onto the seven kinds the
//! engine distinguishes for propagation and exit codes:
//!
//! | Kind | Variants | Handling |
//! |---|---|---|
//! | Input | `Input` | reported, not recorded |
//! | Resource | `Io`, `Resource` | failing file skipped, scan continues |
//! | Analyzer | `AnalysisTimeout`, `AnalyzerPanic` | file skipped, memory recorded |
//! | Memory | `Store`, `StoreFailed`, `ContentTooLarge`, `AlreadyLocked` | call fails, engine continues |
//! | Safety refusal | `RejectPattern`, `Refused`, `SandboxRejected` | proposal dropped, never fatal |
//! | Integrity | `IntegrityViolation` | fix pipeline halted for the run |
//! | Fatal | `Fatal` | process exits 5 after flushing logs |

use crate::types::SandboxOutcome;

/// Convenient result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors the engine surfaces to callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad paths, malformed JSON, unknown verbs.
    #[error("invalid input: {0}")]
    Input(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-I/O resource failure (permissions, exhausted descriptors).
    #[error("resource error: {0}")]
    Resource(String),

    /// A single file exceeded its analysis wall budget.
    #[error("analysis of '{file}' timed out after {budget_ms} ms")]
    AnalysisTimeout {
        /// File that was skipped.
        file: String,
        /// Budget that was exceeded.
        budget_ms: u64,
    },

    /// An analyzer panicked on one file.
    #[error("analyzer '{analyzer}' failed on '{file}': {message}")]
    AnalyzerPanic {
        /// Analyzer that panicked.
        analyzer: String,
        /// File being analyzed.
        file: String,
        /// Recovered panic payload.
        message: String,
    },

    /// Database-level failure from the row store.
    #[error("memory store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A memory write failed for a non-database reason.
    #[error("memory store failed: {0}")]
    StoreFailed(String),

    /// A memory entry exceeded the configured content size cap.
    #[error("memory content too large ({size} bytes, cap {max})")]
    ContentTooLarge {
        /// Actual content size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Another process holds the state directory.
    #[error("state directory is already locked by another process")]
    AlreadyLocked,

    /// Layer 1 or Layer 3 matched a dangerous pattern.
    #[error("safety pattern '{rule}' matched: {evidence}")]
    RejectPattern {
        /// The pattern rule that matched.
        rule: String,
        /// The offending text.
        evidence: String,
    },

    /// The gate refused the proposal for a non-pattern reason.
    #[error("proposal refused: {0}")]
    Refused(String),

    /// The sandbox returned a non-ok outcome.
    #[error("sandbox rejected proposal: {0}")]
    SandboxRejected(SandboxOutcome),

    /// Proposal state changed between approval and apply.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Unrecoverable engine state (database unusable, state dir unwritable).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Map an error to the CLI exit-code contract.
    ///
    /// `0` and `1` are success codes decided by the caller from findings;
    /// errors map to `2` (usage), `3` (I/O or permission), `4` (safety gate
    /// refusal), or `5` (internal).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) => 2,
            Self::Io(_) | Self::Resource(_) | Self::AlreadyLocked => 3,
            Self::RejectPattern { .. }
            | Self::Refused(_)
            | Self::SandboxRejected(_)
            | Self::IntegrityViolation(_) => 4,
            Self::AnalysisTimeout { .. }
            | Self::AnalyzerPanic { .. }
            | Self::Store(_)
            | Self::StoreFailed(_)
            | Self::ContentTooLarge { .. }
            | Self::Fatal(_) => 5,
        }
    }

    /// Whether this error is a safety refusal (kind 5): surfaced to the
    /// caller but never propagated up the analysis path.
    #[must_use]
    pub fn is_safety_refusal(&self) -> bool {
        matches!(
            self,
            Self::RejectPattern { .. } | Self::Refused(_) | Self::SandboxRejected(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
