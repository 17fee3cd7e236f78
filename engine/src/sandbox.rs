//! Sandbox validation — isolated build/run of a patched working copy.
//!
//! The validator copies the project into a throwaway directory, applies the
//! proposal there, and runs the project's declared build (and optional test)
//! command under restrictions:
//!
//! - Filesystem: the child runs inside the working copy with `HOME` and
//!   `TMPDIR` pointed at it; the real project is never touched.
//! - Environment: cleared down to a minimal `PATH`, so host credential
//!   stores and shared caches are unreachable.
//! - Process: own session (process group), CPU / address-space /
//!   file-descriptor rlimits, core dumps off; the whole group is killed on
//!   wall timeout.
//! - Network: a fresh user+network namespace is requested via `unshare`
//!   when loopback is not opted in. Where user namespaces are unavailable
//!   the run degrades to environment-level isolation and notes it in
//!   `violations`; `strict_isolation` turns that degradation into a
//!   `security_violation` outcome.
//!
//! Commands come from the optional per-project policy descriptor
//! (`scrutiny.sandbox.yaml`), falling back to language-default heuristics.
//! With neither, proposals that would require execution are rejected with a
//! policy-miss outcome.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::config::SandboxConfig;
use crate::error::{EngineError, Result};
use crate::fixer::apply_to_buffer;
use crate::gate::ProposalValidator;
use crate::types::{FixProposal, SandboxOutcome, SandboxRun};

/// Per-project sandbox policy descriptor file name.
const POLICY_FILE: &str = "scrutiny.sandbox.yaml";

/// Directory names never copied into the working copy.
const COPY_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".scrutiny",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
];

/// Parsed `scrutiny.sandbox.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxPolicy {
    /// Minimal build command as argv.
    pub build: Vec<String>,
    /// Optional test command as argv.
    #[serde(default)]
    pub test: Option<Vec<String>>,
    /// Project opts in to loopback networking for its test harness.
    #[serde(default)]
    pub allow_loopback: bool,
}

/// The sandbox validator.
pub struct SandboxValidator<'a> {
    config: &'a SandboxConfig,
}

impl<'a> SandboxValidator<'a> {
    /// Create a validator with the given budget.
    #[must_use]
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self { config }
    }

    /// Resolve the build/test policy for a project root.
    ///
    /// Priority: descriptor file, then language-default heuristics, then
    /// `None` (policy miss).
    fn resolve_policy(&self, root: &Path) -> Option<SandboxPolicy> {
        let descriptor = root.join(POLICY_FILE);
        if descriptor.is_file() {
            match std::fs::read_to_string(&descriptor)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_yaml::from_str::<SandboxPolicy>(&s).map_err(|e| e.to_string()))
            {
                Ok(policy) if !policy.build.is_empty() => return Some(policy),
                Ok(_) => log::warn!("{POLICY_FILE} has an empty build command; ignoring"),
                Err(e) => log::warn!("unparseable {POLICY_FILE}: {e}"),
            }
        }

        // Language-default heuristics.
        if has_file_with_extension(root, "py") {
            return Some(SandboxPolicy {
                build: vec![
                    "python3".to_owned(),
                    "-m".to_owned(),
                    "compileall".to_owned(),
                    "-q".to_owned(),
                    ".".to_owned(),
                ],
                test: None,
                allow_loopback: false,
            });
        }
        if root.join("Makefile").is_file() {
            return Some(SandboxPolicy {
                build: vec!["make".to_owned(), "--dry-run".to_owned()],
                test: None,
                allow_loopback: false,
            });
        }
        None
    }

    /// Copy the project into `dst`, skipping VCS/state directories and
    /// enforcing the copy-size cap.
    fn copy_working_tree(&self, root: &Path, dst: &Path) -> Result<()> {
        let mut copied: u64 = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| EngineError::Resource(e.to_string()))?;
            let path = entry.path();
            if path == root {
                continue;
            }
            let rel = path.strip_prefix(root).map_err(|e| {
                EngineError::Resource(format!("path outside root during copy: {e}"))
            })?;
            if rel
                .components()
                .any(|c| matches!(c, std::path::Component::Normal(n) if COPY_EXCLUDES.contains(&n.to_string_lossy().as_ref())))
            {
                continue;
            }

            let target = dst.join(rel);
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if file_type.is_file() {
                copied += entry.metadata().map(|m| m.len()).unwrap_or(0);
                if copied > self.config.max_copy_bytes {
                    return Err(EngineError::Resource(format!(
                        "project exceeds sandbox copy cap ({} bytes)",
                        self.config.max_copy_bytes
                    )));
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(path, &target)?;
            }
        }
        Ok(())
    }

    /// Run one command phase inside the working copy.
    ///
    /// Returns `(outcome-for-failure, wall_ms)`; `None` outcome means the
    /// phase succeeded.
    fn run_phase(
        &self,
        workdir: &Path,
        argv: &[String],
        allow_loopback: bool,
        deadline: Instant,
    ) -> Result<(Option<SandboxOutcome>, u64)> {
        let started = Instant::now();
        let (program, args) = argv.split_first().ok_or_else(|| {
            EngineError::Input("sandbox command must not be empty".to_owned())
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C")
            .env("no_proxy", "*");

        configure_limits(&mut cmd, self.config, allow_loopback);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                log::info!("sandbox command '{program}' failed to start: {e}");
                return Ok((Some(SandboxOutcome::BuildFailed), elapsed_ms(started)));
            }
        };

        loop {
            match child.try_wait()? {
                Some(status) => {
                    if status.success() {
                        return Ok((None, elapsed_ms(started)));
                    }
                    let outcome = if killed_by_resource_limit(&status) {
                        SandboxOutcome::ResourceExceeded
                    } else {
                        SandboxOutcome::BuildFailed
                    };
                    return Ok((Some(outcome), elapsed_ms(started)));
                }
                None => {
                    if Instant::now() >= deadline {
                        kill_group(&mut child);
                        let _ = child.wait();
                        return Ok((Some(SandboxOutcome::Timeout), elapsed_ms(started)));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }
}

impl ProposalValidator for SandboxValidator<'_> {
    fn validate(&self, project_root: &Path, proposal: &FixProposal) -> Result<SandboxRun> {
        let started = Instant::now();
        let mut violations = Vec::new();

        let Some(policy) = self.resolve_policy(project_root) else {
            // Absent descriptor and no heuristic: reject anything that
            // would require execution.
            return Ok(SandboxRun {
                proposal_id: proposal.id.clone(),
                build_status: "skipped".to_owned(),
                run_status: "skipped".to_owned(),
                outcome: SandboxOutcome::BuildFailed,
                violations: vec!["no build policy declared and no heuristic applies".to_owned()],
                wall_ms: elapsed_ms(started),
                cpu_ms: 0,
                rss_peak: 0,
            });
        };

        let allow_loopback = policy.allow_loopback || self.config.allow_loopback;
        if allow_loopback {
            violations.push("loopback networking permitted by project opt-in".to_owned());
        } else if !network_namespaces_available() {
            if self.config.strict_isolation {
                return Ok(SandboxRun {
                    proposal_id: proposal.id.clone(),
                    build_status: "skipped".to_owned(),
                    run_status: "skipped".to_owned(),
                    outcome: SandboxOutcome::SecurityViolation,
                    violations: vec!["network namespace isolation unavailable".to_owned()],
                    wall_ms: elapsed_ms(started),
                    cpu_ms: 0,
                    rss_peak: 0,
                });
            }
            violations.push(
                "network namespace unavailable; degraded to environment isolation".to_owned(),
            );
        }

        // Throwaway working copy; deleted on drop regardless of outcome.
        let workdir = tempfile::Builder::new()
            .prefix("scrutiny-sandbox-")
            .tempdir()
            .map_err(|e| EngineError::Resource(format!("cannot create sandbox dir: {e}")))?;
        self.copy_working_tree(project_root, workdir.path())?;

        // Apply the proposal inside the copy only.
        let target = workdir.path().join(&proposal.original_span.path);
        let content = std::fs::read_to_string(&target)?;
        std::fs::write(&target, apply_to_buffer(&content, proposal))?;

        let deadline = started + Duration::from_secs(self.config.wall_secs);
        let usage_before = child_usage();

        let (build_failure, build_ms) =
            self.run_phase(workdir.path(), &policy.build, allow_loopback, deadline)?;
        let mut wall_ms = build_ms;
        let build_status = if build_failure.is_none() { "ok" } else { "failed" };

        let mut run_status = "skipped";
        let mut failure = build_failure;
        if failure.is_none() {
            if let Some(test_cmd) = &policy.test {
                let (test_failure, test_ms) =
                    self.run_phase(workdir.path(), test_cmd, allow_loopback, deadline)?;
                wall_ms += test_ms;
                run_status = if test_failure.is_none() { "ok" } else { "failed" };
                failure = test_failure.map(|o| match o {
                    SandboxOutcome::BuildFailed => SandboxOutcome::TestFailed,
                    other => other,
                });
            }
        }

        let (cpu_ms, rss_peak) = usage_delta(usage_before);

        Ok(SandboxRun {
            proposal_id: proposal.id.clone(),
            build_status: build_status.to_owned(),
            run_status: run_status.to_owned(),
            outcome: failure.unwrap_or(SandboxOutcome::Ok),
            violations,
            wall_ms,
            cpu_ms,
            rss_peak,
        })
    }
}

/// Sandbox self-check for the `test` verb: validates a trivial rewrite in a
/// throwaway probe project, carrying over the real project's policy
/// descriptor when it has one. The user's project is never touched.
///
/// # Errors
///
/// Propagates working-directory setup failures.
pub fn self_check(validator: &SandboxValidator<'_>, project_root: &Path) -> Result<SandboxRun> {
    let probe = tempfile::Builder::new()
        .prefix("scrutiny-selfcheck-")
        .tempdir()
        .map_err(|e| EngineError::Resource(format!("cannot create probe dir: {e}")))?;

    let content = "value = None\nready = value == None\n";
    std::fs::write(probe.path().join("probe.py"), content)?;
    let descriptor = project_root.join(POLICY_FILE);
    if descriptor.is_file() {
        std::fs::copy(&descriptor, probe.path().join(POLICY_FILE))?;
    }

    let offset = content.find("== None").unwrap_or(0);
    let proposal = FixProposal {
        id: "self-check".to_owned(),
        issue: crate::types::Issue {
            issue_type: "python.comparison-to-none".to_owned(),
            severity: crate::types::Severity::Low,
            file: "probe.py".to_owned(),
            line: Some(2),
            column: Some(1),
            description: "Equality comparison with None.".to_owned(),
            suggestion: None,
            context: crate::types::FileContext::Production,
            fingerprint: "self-check".to_owned(),
        },
        original_span: crate::types::Span {
            path: "probe.py".to_owned(),
            offset,
            len: "== None".len(),
            line: 2,
            col: offset as u32,
        },
        original_text: "== None".to_owned(),
        replacement_text: "is None".to_owned(),
        rationale: "sandbox self-check".to_owned(),
        safety_score: 99,
        auto_approvable: true,
    };
    validator.validate(probe.path(), &proposal)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn has_file_with_extension(root: &Path, ext: &str) -> bool {
    WalkDir::new(root)
        .max_depth(4)
        .into_iter()
        .flatten()
        .any(|e| {
            e.file_type().is_file()
                && e.path().extension().and_then(|x| x.to_str()) == Some(ext)
        })
}

// ---------------------------------------------------------------------------
// Unix process controls
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn configure_limits(cmd: &mut Command, config: &SandboxConfig, allow_loopback: bool) {
    use std::os::unix::process::CommandExt;

    let cpu = config.cpu_secs;
    let mem = config.memory_bytes;
    let nofile = config.max_open_files;

    // Safety: only async-signal-safe calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            use nix::sys::resource::{setrlimit, Resource};

            nix::unistd::setsid().map_err(to_io)?;
            setrlimit(Resource::RLIMIT_CPU, cpu, cpu).map_err(to_io)?;
            setrlimit(Resource::RLIMIT_AS, mem, mem).map_err(to_io)?;
            setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile).map_err(to_io)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(to_io)?;

            if !allow_loopback {
                // Best-effort egress denial; availability was probed in the
                // parent, so EPERM here is tolerated rather than fatal.
                let _ = nix::sched::unshare(
                    nix::sched::CloneFlags::CLONE_NEWUSER
                        | nix::sched::CloneFlags::CLONE_NEWNET,
                );
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Probe whether user+network namespaces can be created.
#[cfg(unix)]
fn network_namespaces_available() -> bool {
    use std::os::unix::process::CommandExt;

    let mut probe = Command::new("true");
    probe.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    unsafe {
        probe.pre_exec(|| {
            nix::sched::unshare(
                nix::sched::CloneFlags::CLONE_NEWUSER | nix::sched::CloneFlags::CLONE_NEWNET,
            )
            .map_err(to_io)?;
            Ok(())
        });
    }
    matches!(probe.status(), Ok(s) if s.success())
}

/// Kill the child's whole process group.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    if nix::sys::signal::killpg(pid, nix::sys::signal::Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

/// Whether the exit status looks like a resource-limit kill.
#[cfg(unix)]
fn killed_by_resource_limit(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    matches!(
        status.signal(),
        Some(s) if s == nix::sys::signal::Signal::SIGKILL as i32
            || s == nix::sys::signal::Signal::SIGXCPU as i32
            || s == nix::sys::signal::Signal::SIGSEGV as i32
    )
}

/// Snapshot of children rusage, for delta accounting.
#[cfg(unix)]
fn child_usage() -> (u64, u64) {
    match nix::sys::resource::getrusage(nix::sys::resource::UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let cpu_ms = (usage.user_time().tv_sec() + usage.system_time().tv_sec()) as u64 * 1000
                + (usage.user_time().tv_usec() + usage.system_time().tv_usec()) as u64 / 1000;
            // ru_maxrss is KiB on Linux.
            (cpu_ms, usage.max_rss() as u64 * 1024)
        }
        Err(_) => (0, 0),
    }
}

#[cfg(unix)]
fn usage_delta(before: (u64, u64)) -> (u64, u64) {
    let after = child_usage();
    (after.0.saturating_sub(before.0), after.1)
}

// ---------------------------------------------------------------------------
// Non-unix fallbacks
// ---------------------------------------------------------------------------

#[cfg(not(unix))]
fn configure_limits(_cmd: &mut Command, _config: &SandboxConfig, _allow_loopback: bool) {}

#[cfg(not(unix))]
fn network_namespaces_available() -> bool {
    false
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn killed_by_resource_limit(_status: &std::process::ExitStatus) -> bool {
    false
}

#[cfg(not(unix))]
fn child_usage() -> (u64, u64) {
    (0, 0)
}

#[cfg(not(unix))]
fn usage_delta(_before: (u64, u64)) -> (u64, u64) {
    (0, 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::{FileContext, Issue, Severity, Span};
    use tempfile::tempdir;

    fn proposal(rel_path: &str) -> FixProposal {
        FixProposal {
            id: "prop-1".to_owned(),
            issue: Issue {
                issue_type: "python.comparison-to-none".to_owned(),
                severity: Severity::Low,
                file: rel_path.to_owned(),
                line: Some(1),
                column: Some(1),
                description: "d".to_owned(),
                suggestion: None,
                context: FileContext::Production,
                fingerprint: "fp".to_owned(),
            },
            original_span: Span {
                path: rel_path.to_owned(),
                offset: 5,
                len: 7,
                line: 1,
                col: 6,
            },
            original_text: "== None".to_owned(),
            replacement_text: "is None".to_owned(),
            rationale: "identity test".to_owned(),
            safety_score: 98,
            auto_approvable: true,
        }
    }

    fn write_policy(root: &Path, yaml: &str) {
        std::fs::write(root.join(POLICY_FILE), yaml).unwrap();
    }

    fn config() -> SandboxConfig {
        SandboxConfig {
            wall_secs: 10,
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn test_policy_miss_rejects() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("data.txt"), "x == None\n").unwrap();
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("data.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::BuildFailed);
        assert!(run.violations.iter().any(|v| v.contains("no build policy")));
    }

    #[test]
    fn test_successful_build_passes() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        write_policy(project.path(), "build: [\"true\"]\n");
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::Ok);
        assert_eq!(run.build_status, "ok");
        assert_eq!(run.run_status, "skipped");
    }

    #[test]
    fn test_failing_build_rejects() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        write_policy(project.path(), "build: [\"false\"]\n");
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::BuildFailed);
        assert_eq!(run.build_status, "failed");
    }

    #[test]
    fn test_failing_test_command_rejects() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        write_policy(project.path(), "build: [\"true\"]\ntest: [\"false\"]\n");
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::TestFailed);
        assert_eq!(run.build_status, "ok");
        assert_eq!(run.run_status, "failed");
    }

    #[test]
    fn test_wall_timeout_kills_run() {
        // A command that never finishes is terminated at the
        // wall budget and reported as timeout.
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        write_policy(project.path(), "build: [\"sleep\", \"30\"]\n");
        let cfg = SandboxConfig {
            wall_secs: 1,
            ..SandboxConfig::default()
        };
        let validator = SandboxValidator::new(&cfg);

        let started = Instant::now();
        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn test_cpu_limit_reported_as_resource_exceeded() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        write_policy(
            project.path(),
            "build: [\"sh\", \"-c\", \"while :; do :; done\"]\n",
        );
        let cfg = SandboxConfig {
            wall_secs: 20,
            cpu_secs: 1,
            ..SandboxConfig::default()
        };
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::ResourceExceeded);
    }

    #[test]
    fn test_original_project_untouched() {
        let project = tempdir().unwrap();
        let content = "if x == None: pass\n";
        std::fs::write(project.path().join("app.txt"), content).unwrap();
        write_policy(project.path(), "build: [\"true\"]\n");
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        validator.validate(project.path(), &proposal("app.txt")).unwrap();
        let after = std::fs::read_to_string(project.path().join("app.txt")).unwrap();
        assert_eq!(after, content, "the sandbox must only patch its own copy");
    }

    #[test]
    fn test_vcs_dirs_not_copied_and_workdir_cleaned() {
        let project = tempdir().unwrap();
        std::fs::create_dir_all(project.path().join(".git")).unwrap();
        std::fs::write(project.path().join(".git").join("HEAD"), "ref").unwrap();
        std::fs::write(project.path().join("app.txt"), "if x == None: pass\n").unwrap();
        // The build command fails if .git was copied into the working copy.
        write_policy(project.path(), "build: [\"sh\", \"-c\", \"test ! -e .git\"]\n");
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);

        let run = validator.validate(project.path(), &proposal("app.txt")).unwrap();
        assert_eq!(run.outcome, SandboxOutcome::Ok);
    }

    #[test]
    fn test_copy_cap_enforced() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("big.txt"), vec![b'x'; 4096]).unwrap();
        write_policy(project.path(), "build: [\"true\"]\n");
        let cfg = SandboxConfig {
            max_copy_bytes: 1024,
            ..SandboxConfig::default()
        };
        let validator = SandboxValidator::new(&cfg);

        let err = validator.validate(project.path(), &proposal("big.txt")).unwrap_err();
        assert!(matches!(err, EngineError::Resource(_)));
    }

    #[test]
    fn test_python_heuristic_policy() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("m.py"), "x = 1\n").unwrap();
        let cfg = config();
        let validator = SandboxValidator::new(&cfg);
        let policy = validator.resolve_policy(project.path()).unwrap();
        assert_eq!(policy.build[0], "python3");
    }
}
