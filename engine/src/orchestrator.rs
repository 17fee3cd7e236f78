//! Scan orchestration — walks a project, dispatches files to analyzers,
//! fans results back in, and feeds findings into memory.
//!
//! Pipeline per scan:
//!
//! 1. Walk the project root (gitignore-aware), skipping symlinks, files over
//!    the size cap, and the hardcoded/configured exclusion set.
//! 2. Detect language by extension, falling back to a content sniff;
//!    unknown types are skipped with an info log.
//! 3. Dispatch files to analyzers on a bounded rayon pool. Every dispatch is
//!    wrapped in `catch_unwind` so a panic in one analyzer becomes an
//!    `analyzer-internal-error` issue instead of killing the scan; files
//!    over the wall budget are dropped and recorded as a timeout.
//! 4. Fill in fingerprints, honoring the ordering guarantees: `(line,
//!    column, type)` within a file, path-sorted across files.
//! 5. Upsert findings into the per-language namespace and the de-duplicated
//!    global view, and persist a scan summary for the cycle tracker.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::analyzers::{build_analyzer_registry, Analyzer};
use crate::config::EngineConfig;
use crate::context;
use crate::error::{EngineError, Result};
use crate::memory::{MemoryEngine, SearchMode, NS_GLOBAL};
use crate::scan_cache::ScanCache;
use crate::types::{FileContext, Issue, ScanResult, Severity};

/// Directory names that are always excluded from walking.
const HARDCODED_EXCLUDES: &[&str] = &[
    "target",
    "build",
    "dist",
    "node_modules",
    "__pycache__",
    ".git",
    ".hg",
    ".svn",
    ".venv",
    "venv",
    ".scrutiny",
    ".tox",
    ".mypy_cache",
];

/// Cooperative cancellation token; checked at file boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One file ready for dispatch.
struct FileTask {
    rel_path: String,
    content: String,
    content_hash: String,
    analyzer_idx: usize,
    ctx: FileContext,
}

/// Per-file dispatch outcome.
enum FileOutcome {
    Issues(Vec<Issue>),
    TimedOut,
    Panicked(String),
    Cancelled,
}

/// The scan orchestrator.
pub struct Orchestrator<'a> {
    config: &'a EngineConfig,
    memory: &'a MemoryEngine,
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl<'a> Orchestrator<'a> {
    /// Create an orchestrator with the default analyzer registry.
    #[must_use]
    pub fn new(config: &'a EngineConfig, memory: &'a MemoryEngine) -> Self {
        Self {
            config,
            memory,
            analyzers: build_analyzer_registry(),
        }
    }

    /// Scan a project root.
    ///
    /// # Errors
    ///
    /// `Input` when the root does not exist or is not a directory. Per-file
    /// failures (read errors, timeouts, panics) are recovered locally and
    /// never fail the scan.
    pub fn scan(&self, root: &Path, cancel: &CancelToken) -> Result<ScanResult> {
        let start = Instant::now();
        let started_at = Utc::now();

        if !root.is_dir() {
            return Err(EngineError::Input(format!(
                "project path '{}' is not a directory",
                root.display()
            )));
        }

        let project_id = project_id(root);
        let scan_id = format!("{project_id}-{}", started_at.timestamp_millis());

        let mut files_skipped = 0u32;
        let mut tasks = self.collect_tasks(root, &mut files_skipped)?;
        // Across files, results are merged in path-sorted order.
        tasks.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        // Partition against the scan cache.
        let mut cache = ScanCache::new(
            &self.config.state_dir,
            &project_id,
            &self.config.config_hash(),
            !self.config.no_cache,
        );
        let mut cached_issues: Vec<Issue> = Vec::new();
        let mut to_analyze: Vec<FileTask> = Vec::new();
        let mut files_cached = 0u32;
        for task in tasks {
            if let Some(issues) = cache.get(&task.rel_path, &task.content_hash) {
                cached_issues.extend(issues.iter().cloned());
                files_cached += 1;
            } else {
                to_analyze.push(task);
            }
        }

        let outcomes = self.dispatch(&to_analyze, cancel);

        let mut all_issues = cached_issues;
        let files_analyzed = to_analyze.len() as u32;
        for (task, outcome) in to_analyze.iter().zip(outcomes) {
            match outcome {
                FileOutcome::Issues(mut issues) => {
                    sort_within_file(&mut issues);
                    assign_fingerprints(&mut issues, &task.content);
                    cache.update(&task.rel_path, &task.content_hash, &issues);
                    all_issues.extend(issues);
                }
                FileOutcome::TimedOut => {
                    files_skipped += 1;
                    self.record_analysis_failure(
                        &task.rel_path,
                        "AnalysisTimeout",
                        &format!(
                            "analysis exceeded {} ms wall budget",
                            self.config.analyzer_timeout_ms
                        ),
                    );
                }
                FileOutcome::Panicked(msg) => {
                    let mut issue = internal_error_issue(&task.rel_path, task.ctx, &msg);
                    assign_fingerprints(std::slice::from_mut(&mut issue), &task.content);
                    self.record_analysis_failure(&task.rel_path, "AnalyzerError", &msg);
                    all_issues.push(issue);
                }
                // Cancelled files are neither cached nor recorded.
                FileOutcome::Cancelled => files_skipped += 1,
            }
        }
        cache.flush();

        // Final ordering: path-sorted across files, (line, column, type)
        // within a file.
        all_issues.sort_by(|a, b| {
            a.file
                .cmp(&b.file)
                .then(line_key(a).cmp(&line_key(b)))
                .then(a.column.unwrap_or(u32::MAX).cmp(&b.column.unwrap_or(u32::MAX)))
                .then(a.issue_type.cmp(&b.issue_type))
        });

        self.record_issue_memories(&all_issues);
        self.record_scan_summary(&project_id, &scan_id, &all_issues);

        let mut severity_counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut type_counts: BTreeMap<String, u32> = BTreeMap::new();
        for issue in &all_issues {
            *severity_counts.entry(issue.severity.to_string()).or_insert(0) += 1;
            *type_counts.entry(issue.issue_type.clone()).or_insert(0) += 1;
        }

        Ok(ScanResult {
            scan_id,
            project_id,
            project_root: root.display().to_string(),
            issues: all_issues,
            files_analyzed,
            files_skipped,
            files_cached,
            severity_counts,
            type_counts,
            elapsed_ms: start.elapsed().as_millis() as u64,
            started_at,
        })
    }

    /// Walk the tree and build dispatchable tasks.
    fn collect_tasks(&self, root: &Path, files_skipped: &mut u32) -> Result<Vec<FileTask>> {
        let mut builder = WalkBuilder::new(root);
        builder.git_ignore(true);
        builder.git_global(false);
        builder.git_exclude(false);
        builder.follow_links(false);

        let exclude_set = build_globset(&self.config.exclude);
        let mut tasks = Vec::new();

        for entry in builder.build().flatten() {
            let path = entry.path();
            // Symlinks are skipped wholesale: a link may leave the root.
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() || !file_type.is_file() {
                continue;
            }
            if is_in_excluded_dir(root, path) {
                continue;
            }

            let rel_path = match path.strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => path.to_string_lossy().replace('\\', "/"),
            };
            if let Some(ref set) = exclude_set {
                if set.is_match(&rel_path) {
                    continue;
                }
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            // At the cap: analyzed. One byte over: skipped with a reason.
            if size > self.config.max_file_bytes {
                *files_skipped += 1;
                self.record_analysis_failure(
                    &rel_path,
                    "FileTooLarge",
                    &format!("{size} bytes exceeds cap {}", self.config.max_file_bytes),
                );
                continue;
            }

            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("Skipping {rel_path} — read error: {e}");
                    *files_skipped += 1;
                    continue;
                }
            };

            let Some(analyzer_idx) = self.select_analyzer(&rel_path, &content) else {
                log::info!("Skipping {rel_path} — no analyzer for this file type");
                continue;
            };

            let ctx = context::classify(&rel_path, &content);
            let content_hash = compute_sha256(&content);
            tasks.push(FileTask {
                rel_path,
                content,
                content_hash,
                analyzer_idx,
                ctx,
            });
        }

        Ok(tasks)
    }

    /// Pick an analyzer by extension, then by content sniff as tiebreak.
    fn select_analyzer(&self, rel_path: &str, content: &str) -> Option<usize> {
        let ext = Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        if !ext.is_empty() {
            for (i, analyzer) in self.analyzers.iter().enumerate() {
                if analyzer.supported_extensions().contains(&ext.as_str()) {
                    return Some(i);
                }
            }
        }
        // Extensionless or unclaimed: let analyzers sniff the content.
        self.analyzers.iter().position(|a| a.sniff(content))
    }

    /// Run analyzers over the tasks with bounded parallelism.
    fn dispatch(&self, tasks: &[FileTask], cancel: &CancelToken) -> Vec<FileOutcome> {
        let threads = if self.config.analyzer_threads == 0 {
            std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(4)
        } else {
            self.config.analyzer_threads
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build();
        let budget_ms = self.config.analyzer_timeout_ms;

        let run = |task: &FileTask| -> FileOutcome {
            if cancel.is_cancelled() {
                return FileOutcome::Cancelled;
            }
            let analyzer = &self.analyzers[task.analyzer_idx];
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| {
                analyzer.analyze(&task.rel_path, &task.content, task.ctx, self.config)
            }));
            match result {
                Ok(issues) => {
                    // The budget is cooperative: an over-budget file has its
                    // results discarded and is recorded as a timeout.
                    if started.elapsed().as_millis() as u64 > budget_ms {
                        FileOutcome::TimedOut
                    } else {
                        FileOutcome::Issues(issues)
                    }
                }
                Err(payload) => FileOutcome::Panicked(panic_message(payload)),
            }
        };

        match pool {
            Ok(pool) => pool.install(|| tasks.par_iter().map(run).collect()),
            Err(e) => {
                log::warn!("thread pool unavailable ({e}); analyzing serially");
                tasks.iter().map(run).collect()
            }
        }
    }

    /// Upsert each finding into its language namespace and the global
    /// de-duplicated view, keyed by fingerprint.
    fn record_issue_memories(&self, issues: &[Issue]) {
        for issue in issues {
            let language = issue.issue_type.split('.').next().unwrap_or("unknown");
            for namespace in [language, NS_GLOBAL] {
                if let Err(e) = self.upsert_issue_memory(namespace, issue) {
                    log::warn!("failed to record issue memory in '{namespace}': {e}");
                }
            }
        }
    }

    fn upsert_issue_memory(&self, namespace: &str, issue: &Issue) -> Result<()> {
        let existing = self
            .memory
            .search(namespace, &issue.fingerprint, 1, 0.0, SearchMode::Keyword)?
            .into_iter()
            .find(|h| h.metadata.get("fingerprint").and_then(|v| v.as_str())
                == Some(issue.fingerprint.as_str()));

        if let Some(hit) = existing {
            let mut metadata = hit.metadata;
            let count = metadata.get("count").and_then(serde_json::Value::as_u64).unwrap_or(1);
            metadata["count"] = serde_json::json!(count + 1);
            self.memory.update(hit.id, None, Some(metadata))?;
            return Ok(());
        }

        let content = format!(
            "{} in {}:{} {} [{}]",
            issue.issue_type,
            issue.file,
            issue.line.unwrap_or(0),
            issue.description,
            issue.fingerprint
        );
        let metadata = serde_json::json!({
            "kind": "issue_pattern",
            "fingerprint": issue.fingerprint,
            "type": issue.issue_type,
            "severity": issue.severity.to_string(),
            "context": issue.context.to_string(),
            "count": 1,
        });
        self.memory.store(namespace, &content, metadata)?;
        Ok(())
    }

    /// Persist the fingerprint set of this scan for the cycle tracker.
    fn record_scan_summary(&self, project_id: &str, scan_id: &str, issues: &[Issue]) {
        let fingerprints: Vec<&str> = issues.iter().map(|i| i.fingerprint.as_str()).collect();
        let content = fingerprints.join(" ");
        let metadata = serde_json::json!({
            "kind": "scan",
            "scan_id": scan_id,
            "issue_count": issues.len(),
        });
        if let Err(e) = self.memory.store(project_id, &content, metadata) {
            log::warn!("failed to record scan summary: {e}");
        }
    }

    /// Record a skipped file in the global namespace.
    fn record_analysis_failure(&self, rel_path: &str, kind: &str, detail: &str) {
        let metadata = serde_json::json!({
            "kind": "analyzer_error",
            "error": kind,
            "file": rel_path,
        });
        let content = format!("{kind} on {rel_path}: {detail}");
        if let Err(e) = self.memory.store(NS_GLOBAL, &content, metadata) {
            log::warn!("failed to record {kind} memory: {e}");
        }
    }
}

/// Stable project identifier: prefix of the SHA-256 of the canonical root.
#[must_use]
pub fn project_id(root: &Path) -> String {
    let canonical = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// SHA-256 hex digest of file content.
#[must_use]
pub fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sort issues within one file by `(line, column, type)`.
fn sort_within_file(issues: &mut [Issue]) {
    issues.sort_by(|a, b| {
        line_key(a)
            .cmp(&line_key(b))
            .then(a.column.unwrap_or(u32::MAX).cmp(&b.column.unwrap_or(u32::MAX)))
            .then(a.issue_type.cmp(&b.issue_type))
    });
}

fn line_key(issue: &Issue) -> u32 {
    // File-level issues (no line) sort last.
    issue.line.unwrap_or(u32::MAX)
}

/// Compute fingerprints for a file's issues.
///
/// The fingerprint hashes the issue type, the file path, a
/// whitespace-normalized window of lines around the issue, and an ordinal
/// distinguishing identical findings in the same window. It is stable under
/// whitespace changes inside the window and unstable under type or file
/// changes.
pub fn assign_fingerprints(issues: &mut [Issue], content: &str) {
    let lines: Vec<&str> = content.lines().collect();
    let mut seen: BTreeMap<(String, String), u32> = BTreeMap::new();

    for issue in issues {
        let window = normalized_window(&lines, issue.line);
        let counter = seen.entry((issue.issue_type.clone(), window.clone())).or_insert(0);
        let ordinal = *counter;
        *counter += 1;

        let mut hasher = Sha256::new();
        hasher.update(issue.issue_type.as_bytes());
        hasher.update([0]);
        hasher.update(issue.file.as_bytes());
        hasher.update([0]);
        hasher.update(window.as_bytes());
        hasher.update([0]);
        hasher.update(ordinal.to_le_bytes());
        issue.fingerprint = hex::encode(&hasher.finalize()[..8]);
    }
}

/// Whitespace-normalized, lowercased window of ±2 lines around the issue.
fn normalized_window(lines: &[&str], line: Option<u32>) -> String {
    let Some(line) = line else {
        return String::new();
    };
    let idx = line.saturating_sub(1) as usize;
    let start = idx.saturating_sub(2);
    let end = (idx + 3).min(lines.len());
    if start >= end {
        return String::new();
    }
    lines[start..end]
        .iter()
        .flat_map(|l| l.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Issue emitted when an analyzer panics on a file.
fn internal_error_issue(rel_path: &str, ctx: FileContext, msg: &str) -> Issue {
    Issue {
        issue_type: "engine.analyzer-internal-error".to_owned(),
        severity: Severity::Low,
        file: rel_path.to_owned(),
        line: None,
        column: None,
        description: format!("Analyzer failed on this file: {msg}. The file was skipped."),
        suggestion: None,
        context: ctx,
        fingerprint: String::new(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "unknown panic".to_owned()
    }
}

fn build_globset(patterns: &[String]) -> Option<globset::GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = globset::GlobSetBuilder::new();
    let mut any = false;
    for pattern in patterns {
        // Directory patterns like "generated/" match the whole subtree.
        let normalized = pattern.trim_end_matches('/');
        for candidate in [normalized.to_owned(), format!("{normalized}/**")] {
            if let Ok(glob) = globset::Glob::new(&candidate) {
                builder.add(glob);
                any = true;
            }
        }
    }
    if !any {
        return None;
    }
    builder.build().ok()
}

/// Check if a path is inside a hardcoded-excluded directory.
fn is_in_excluded_dir(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(r) => r,
        Err(_) => return false,
    };
    for component in rel.components() {
        if let std::path::Component::Normal(name) = component {
            if HARDCODED_EXCLUDES.contains(&name.to_string_lossy().as_ref()) {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup(project: &Path) -> (EngineConfig, tempfile::TempDir) {
        let state = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.state_dir = state.path().to_path_buf();
        let _ = project;
        (config, state)
    }

    #[test]
    fn test_empty_project_clean() {
        let project = tempdir().unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.files_analyzed, 0);
    }

    #[test]
    fn test_missing_root_is_input_error() {
        let project = tempdir().unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let err = orch
            .scan(&project.path().join("nope"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[test]
    fn test_scan_finds_issues_in_both_languages() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("app.py"), "x = eval(raw)\n").unwrap();
        fs::write(project.path().join("io.c"), "gets(buf);\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        let types: Vec<&str> = result.issues.iter().map(|i| i.issue_type.as_str()).collect();
        assert!(types.contains(&"python.eval-call"));
        assert!(types.contains(&"cpp.gets-call"));
        assert!(result.issues.iter().all(|i| !i.fingerprint.is_empty()));
    }

    #[test]
    fn test_results_path_sorted() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("b.py"), "x == None\n").unwrap();
        fs::write(project.path().join("a.py"), "x == None\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        let files: Vec<&str> = result.issues.iter().map(|i| i.file.as_str()).collect();
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn test_size_cap_boundary() {
        let project = tempdir().unwrap();
        // Exactly at cap: analyzed. One over: skipped.
        let at_cap = "x = 1\n".repeat(10);
        let (mut config, _state) = setup(project.path());
        config.max_file_bytes = at_cap.len() as u64;
        fs::write(project.path().join("at_cap.py"), &at_cap).unwrap();
        fs::write(project.path().join("over.py"), format!("{at_cap}\n")).unwrap();

        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);
        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert_eq!(result.files_analyzed, 1);
        assert_eq!(result.files_skipped, 1);

        // The skip reason is recorded in the global namespace.
        let hits = memory
            .search(NS_GLOBAL, "FileTooLarge", 5, 0.0, SearchMode::Keyword)
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_unknown_types_skipped_silently() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("notes.md"), "# notes\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert_eq!(result.files_analyzed, 0);
        assert!(result.is_clean());
    }

    #[test]
    fn test_excluded_dirs_not_walked() {
        let project = tempdir().unwrap();
        let vendor = project.path().join("node_modules");
        fs::create_dir_all(&vendor).unwrap();
        fs::write(vendor.join("dep.py"), "eval(x)\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert!(result.is_clean());
    }

    #[test]
    fn test_config_exclude_patterns() {
        let project = tempdir().unwrap();
        let gen = project.path().join("generated");
        fs::create_dir_all(&gen).unwrap();
        fs::write(gen.join("schema.py"), "eval(x)\n").unwrap();
        let (mut config, _state) = setup(project.path());
        config.exclude = vec!["generated/".to_owned()];
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let result = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert!(result.is_clean());
    }

    #[test]
    fn test_second_scan_served_from_cache() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("app.py"), "x == None\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let first = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert_eq!(first.files_analyzed, 1);
        let second = orch.scan(project.path(), &CancelToken::new()).unwrap();
        assert_eq!(second.files_cached, 1);
        assert_eq!(second.files_analyzed, 0);
        // Cached issues keep their fingerprints.
        assert_eq!(first.issues.len(), second.issues.len());
        assert_eq!(first.issues[0].fingerprint, second.issues[0].fingerprint);
    }

    #[test]
    fn test_issue_memories_recorded_per_language_and_global() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("app.py"), "x = eval(raw)\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);
        orch.scan(project.path(), &CancelToken::new()).unwrap();

        let py = memory.search("python", "eval", 10, 0.0, SearchMode::Keyword).unwrap();
        let global = memory.search(NS_GLOBAL, "eval", 10, 0.0, SearchMode::Keyword).unwrap();
        assert!(!py.is_empty());
        assert!(!global.is_empty());
    }

    #[test]
    fn test_repeat_scan_increments_count_not_rows() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("app.py"), "x = eval(raw)\n").unwrap();
        let (mut config, _state) = setup(project.path());
        config.no_cache = true; // force re-analysis so the upsert path runs
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        orch.scan(project.path(), &CancelToken::new()).unwrap();
        let rows_after_first = memory.count(Some("python")).unwrap();
        orch.scan(project.path(), &CancelToken::new()).unwrap();
        let rows_after_second = memory.count(Some("python")).unwrap();
        assert_eq!(rows_after_first, rows_after_second);
    }

    #[test]
    fn test_fingerprint_stable_under_whitespace() {
        let mut issues_a = vec![Issue {
            issue_type: "python.eval-call".to_owned(),
            severity: Severity::High,
            file: "a.py".to_owned(),
            line: Some(2),
            column: Some(5),
            description: "eval".to_owned(),
            suggestion: None,
            context: FileContext::Production,
            fingerprint: String::new(),
        }];
        let mut issues_b = issues_a.clone();

        assign_fingerprints(&mut issues_a, "import os\nx = eval(raw)\n");
        assign_fingerprints(&mut issues_b, "import os\nx   =   eval(raw)\n");
        assert_eq!(issues_a[0].fingerprint, issues_b[0].fingerprint);
    }

    #[test]
    fn test_fingerprint_unstable_under_type_and_file() {
        let base = Issue {
            issue_type: "python.eval-call".to_owned(),
            severity: Severity::High,
            file: "a.py".to_owned(),
            line: Some(1),
            column: Some(1),
            description: "eval".to_owned(),
            suggestion: None,
            context: FileContext::Production,
            fingerprint: String::new(),
        };
        let content = "x = eval(raw)\n";

        let mut same = vec![base.clone()];
        assign_fingerprints(&mut same, content);

        let mut other_type = vec![Issue {
            issue_type: "python.exec-call".to_owned(),
            ..base.clone()
        }];
        assign_fingerprints(&mut other_type, content);
        assert_ne!(same[0].fingerprint, other_type[0].fingerprint);

        let mut other_file = vec![Issue {
            file: "b.py".to_owned(),
            ..base
        }];
        assign_fingerprints(&mut other_file, content);
        assert_ne!(same[0].fingerprint, other_file[0].fingerprint);
    }

    #[test]
    fn test_duplicate_findings_get_distinct_fingerprints() {
        let template = Issue {
            issue_type: "python.comparison-to-none".to_owned(),
            severity: Severity::Low,
            file: "a.py".to_owned(),
            line: Some(1),
            column: Some(1),
            description: "none".to_owned(),
            suggestion: None,
            context: FileContext::Production,
            fingerprint: String::new(),
        };
        let mut issues = vec![
            template.clone(),
            Issue {
                line: Some(2),
                ..template
            },
        ];
        // Lines 1 and 2 share the same ±2 window in a 2-line file.
        assign_fingerprints(&mut issues, "a == None\nb == None\n");
        assert_ne!(issues[0].fingerprint, issues[1].fingerprint);
    }

    #[test]
    fn test_cancelled_scan_stops_early() {
        let project = tempdir().unwrap();
        fs::write(project.path().join("a.py"), "x = eval(raw)\n").unwrap();
        let (config, _state) = setup(project.path());
        let memory = MemoryEngine::init(&config).unwrap();
        let orch = Orchestrator::new(&config, &memory);

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = orch.scan(project.path(), &cancel).unwrap();
        assert!(result.is_clean());
    }
}
