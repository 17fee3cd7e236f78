//! JSON and human-readable output for scan results and proposals.
//!
//! JSON is the canonical machine format: a straight `serde_json`
//! serialization of [`ScanResult`] / [`FixProposal`], forward-compatible by
//! contract (consumers ignore unknown fields, producers never remove them).
//! The text form is secondary and intended for terminals.

use std::fmt::Write as _;

use crate::types::{FixProposal, ScanResult, Severity};

/// Serialize a scan result to pretty-printed JSON.
///
/// # Errors
///
/// Returns an error message if serialization fails (should not happen for
/// valid data).
pub fn scan_to_json(result: &ScanResult) -> Result<String, String> {
    serde_json::to_string_pretty(result).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Serialize a proposal list to pretty-printed JSON.
///
/// # Errors
///
/// Returns an error message if serialization fails.
pub fn proposals_to_json(proposals: &[FixProposal]) -> Result<String, String> {
    serde_json::to_string_pretty(proposals).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Render a scan result as human-readable text.
#[must_use]
pub fn scan_to_text(result: &ScanResult) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Scanned {} ({} analyzed, {} cached, {} skipped) in {} ms",
        result.project_root,
        result.files_analyzed,
        result.files_cached,
        result.files_skipped,
        result.elapsed_ms
    );

    if result.issues.is_empty() {
        let _ = writeln!(out, "No issues found.");
        return out;
    }

    for issue in &result.issues {
        let location = match (issue.line, issue.column) {
            (Some(line), Some(col)) => format!("{}:{line}:{col}", issue.file),
            (Some(line), None) => format!("{}:{line}", issue.file),
            _ => issue.file.clone(),
        };
        let _ = writeln!(
            out,
            "{location}: [{}] {} {}",
            issue.severity, issue.issue_type, issue.description
        );
        if let Some(suggestion) = &issue.suggestion {
            let _ = writeln!(out, "    suggestion: {suggestion}");
        }
    }

    let _ = writeln!(out);
    let order = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Cosmetic,
    ];
    let summary: Vec<String> = order
        .iter()
        .filter_map(|sev| {
            let count = result.severity_counts.get(&sev.to_string()).copied().unwrap_or(0);
            (count > 0).then(|| format!("{count} {sev}"))
        })
        .collect();
    let _ = writeln!(out, "{} issue(s): {}", result.issues.len(), summary.join(", "));

    out
}

/// Render a proposal as human-readable text for the approval surface.
#[must_use]
pub fn proposal_to_text(proposal: &FixProposal) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "proposal {} — {} in {}:{}",
        proposal.id,
        proposal.issue.issue_type,
        proposal.original_span.path,
        proposal.original_span.line
    );
    let _ = writeln!(out, "  - {}", proposal.original_text);
    let _ = writeln!(out, "  + {}", proposal.replacement_text);
    let _ = writeln!(
        out,
        "  safety {} | auto {} | {}",
        proposal.safety_score, proposal.auto_approvable, proposal.rationale
    );
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
