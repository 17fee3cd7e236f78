//! Analyzer capability and registry.
//!
//! Every language analyzer implements the [`Analyzer`] trait: stateless,
//! deterministic on `(content, context)`, no file access beyond the provided
//! bytes, no process spawning. New analyzers are added by registering a value
//! in [`build_analyzer_registry`] — a closed capability set, not a subclass
//! hierarchy.
//!
//! Severity follows a fixed rubric: security defects default to `High` or
//! worse, correctness defects to `Medium` or worse, style to `Low` or
//! `Cosmetic`. Analyzers emit issues with stable `type` identifiers of the
//! form `<language>.<rule>`; fingerprints are filled in by the orchestrator
//! so analyzer logic stays language-local.

pub mod cpp;
pub mod python;

use crate::config::EngineConfig;
use crate::types::{FileContext, Issue, Severity};

/// The analyzer capability set.
///
/// Implementations must be `Send + Sync` for parallel dispatch via rayon.
pub trait Analyzer: Send + Sync {
    /// Stable language identifier; doubles as the memory namespace.
    fn language_id(&self) -> &'static str;

    /// File extensions (without dot) this analyzer claims.
    fn supported_extensions(&self) -> &'static [&'static str];

    /// Analyze one file. Must be deterministic on `(content, ctx)` and must
    /// not touch the filesystem or spawn processes.
    fn analyze(
        &self,
        path: &str,
        content: &str,
        ctx: FileContext,
        config: &EngineConfig,
    ) -> Vec<Issue>;

    /// Content sniff used to break extension ties (e.g. extensionless
    /// scripts, `.h` headers). Default: no claim.
    fn sniff(&self, _content: &str) -> bool {
        false
    }
}

/// Build the analyzer registry containing all available analyzers.
#[must_use]
pub fn build_analyzer_registry() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(python::PythonAnalyzer),
        Box::new(cpp::CppAnalyzer),
    ]
}

/// Construct an issue if its rule is enabled, applying severity overrides.
///
/// Shared by the concrete analyzers so override handling lives in one place.
#[allow(clippy::too_many_arguments)]
pub(crate) fn make_issue(
    config: &EngineConfig,
    issue_type: &str,
    default_severity: Severity,
    file: &str,
    line: Option<u32>,
    column: Option<u32>,
    description: String,
    suggestion: Option<String>,
    ctx: FileContext,
) -> Option<Issue> {
    if !config.is_rule_enabled(issue_type) {
        return None;
    }
    Some(Issue {
        issue_type: issue_type.to_owned(),
        severity: config.effective_severity(issue_type, default_severity),
        file: file.to_owned(),
        line,
        column,
        description,
        suggestion,
        context: ctx,
        fingerprint: String::new(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
