//! File context classification.
//!
//! Classifies each path into one of the [`FileContext`] categories using
//! path-segment heuristics first, then content sniffs as a tiebreak. The
//! classification feeds false-positive scoring (a mutable-default warning in
//! a test fixture is far more likely noise) and the fix proposer's severity
//! policy.
//!
//! Priority order matters: a vendored test file is `Vendored` (we never
//! propose fixes to third-party code), a generated config is `Generated`.

use std::path::Path;

use crate::types::FileContext;

/// Directory names that mark vendored third-party code.
const VENDORED_DIRS: &[&str] = &["vendor", "vendors", "third_party", "thirdparty", "node_modules", "external"];

/// Directory names that mark test code.
const TEST_DIRS: &[&str] = &["test", "tests", "testing", "spec", "specs", "__tests__", "fixtures"];

/// Directory names that mark demonstration code.
const DEMO_DIRS: &[&str] = &["demo", "demos", "sample", "samples", "examples", "example"];

/// Directory names that mark operational scripts.
const SCRIPT_DIRS: &[&str] = &["scripts", "tools", "bin", "ci"];

/// Extensions that are configuration regardless of location.
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini", "cfg", "conf", "json", "env"];

/// Markers that generated files carry near the top.
const GENERATED_MARKERS: &[&str] = &[
    "@generated",
    "do not edit",
    "automatically generated",
    "auto-generated",
    "autogenerated",
    "generated by",
];

/// Classify a file by its project-relative path and content.
///
/// `rel_path` must use forward slashes (the walker guarantees this).
/// Only the first 4 KiB of content are sniffed.
#[must_use]
pub fn classify(rel_path: &str, content: &str) -> FileContext {
    let lower = rel_path.to_lowercase();
    let segments: Vec<&str> = lower.split('/').collect();
    let dir_segments = &segments[..segments.len().saturating_sub(1)];
    let file_name = segments.last().copied().unwrap_or("");

    // Vendored wins over everything: we never touch third-party code.
    if dir_segments.iter().any(|s| VENDORED_DIRS.contains(s)) {
        return FileContext::Vendored;
    }

    let head = &content[..content.len().min(4096)];
    let head_lower = head.to_lowercase();
    if GENERATED_MARKERS.iter().any(|m| head_lower.contains(m)) {
        return FileContext::Generated;
    }

    if dir_segments.iter().any(|s| TEST_DIRS.contains(s)) || has_test_name(file_name) {
        return FileContext::Test;
    }
    if sniffs_like_test(&head_lower) {
        return FileContext::Test;
    }

    if dir_segments.iter().any(|s| DEMO_DIRS.contains(s)) {
        return FileContext::Demo;
    }

    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if CONFIG_EXTENSIONS.contains(&ext) {
        return FileContext::Config;
    }

    if dir_segments.iter().any(|s| SCRIPT_DIRS.contains(s)) || head.starts_with("#!") {
        return FileContext::Script;
    }

    FileContext::Production
}

/// Test-file naming conventions: `test_*.py`, `*_test.py`, `*_test.cc`,
/// `*.test.js`-style double extensions.
fn has_test_name(file_name: &str) -> bool {
    let stem = file_name.rsplit_once('.').map_or(file_name, |(s, _)| s);
    stem.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_tests")
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
}

/// Content sniff for test harness imports.
fn sniffs_like_test(head_lower: &str) -> bool {
    head_lower.contains("import pytest")
        || head_lower.contains("import unittest")
        || head_lower.contains("from unittest")
        || head_lower.contains("#include <gtest/")
        || head_lower.contains("#include \"gtest/")
        || head_lower.contains("#include <catch2/")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
