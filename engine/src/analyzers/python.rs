//! Python analyzer — line-oriented detection for an indentation-based
//! dynamic language.
//!
//! Rules scan a scrubbed view of each line: comments are removed and string
//! interiors are masked (quotes kept, content blanked) so `eval(` inside a
//! string literal never fires. Docstring state is tracked across lines.
//! These are fast pre-filters in the same spirit as keyword-sequence SQL
//! safety checks: occasional false positives are acceptable, the
//! false-positive detector downstream exists to absorb them.

use std::sync::OnceLock;

use regex::Regex;

use crate::analyzers::{make_issue, Analyzer};
use crate::config::EngineConfig;
use crate::types::{FileContext, Issue, Severity};

/// Python reference analyzer.
pub struct PythonAnalyzer;

impl Analyzer for PythonAnalyzer {
    fn language_id(&self) -> &'static str {
        "python"
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn sniff(&self, content: &str) -> bool {
        content.starts_with("#!") && content.lines().next().is_some_and(|l| l.contains("python"))
    }

    fn analyze(
        &self,
        path: &str,
        content: &str,
        ctx: FileContext,
        config: &EngineConfig,
    ) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut in_docstring: Option<&str> = None;

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx as u32 + 1;

            // Trailing whitespace is checked on the raw line, docstrings
            // included.
            if raw_line.ends_with(' ') || raw_line.ends_with('\t') {
                push(
                    &mut issues,
                    make_issue(
                        config,
                        "python.trailing-whitespace",
                        Severity::Cosmetic,
                        path,
                        Some(line_no),
                        Some(raw_line.trim_end().chars().count() as u32 + 1),
                        "Line has trailing whitespace.".to_owned(),
                        Some("Remove the trailing whitespace.".to_owned()),
                        ctx,
                    ),
                );
            }

            let (scrubbed, next_state) = scrub_line(raw_line, in_docstring);
            let docstring_line = in_docstring.is_some();
            in_docstring = next_state;
            if docstring_line {
                continue;
            }

            self.check_line(path, &scrubbed, raw_line, line_no, ctx, config, &mut issues);
        }

        issues
    }
}

impl PythonAnalyzer {
    #[allow(clippy::too_many_arguments)]
    fn check_line(
        &self,
        path: &str,
        scrubbed: &str,
        raw_line: &str,
        line_no: u32,
        ctx: FileContext,
        config: &EngineConfig,
        issues: &mut Vec<Issue>,
    ) {
        let rx = regexes();

        if let Some(m) = rx.eval_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.eval-call",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "eval() executes arbitrary expressions.".to_owned(),
                    Some("Use ast.literal_eval() for data, or remove the dynamic evaluation.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.exec_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.exec-call",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "exec() executes arbitrary statements.".to_owned(),
                    Some("Replace dynamic execution with an explicit dispatch table.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.os_system.find(scrubbed) {
            // Interpolation into the command string escalates to critical.
            let interpolated = raw_line.contains("+ ")
                || raw_line.contains("f\"")
                || raw_line.contains("f'")
                || raw_line.contains('%');
            push(
                issues,
                make_issue(
                    config,
                    "python.shell-injection",
                    if interpolated { Severity::Critical } else { Severity::High },
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Shell command execution via os.system().".to_owned(),
                    Some("Use subprocess.run() with a list argument and shell=False.".to_owned()),
                    ctx,
                ),
            );
        } else if rx.shell_true.is_match(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.shell-injection",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(1),
                    "subprocess invoked with shell=True.".to_owned(),
                    Some("Pass the command as a list and drop shell=True.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.pickle_load.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.unsafe-pickle",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "pickle deserialization executes attacker-controlled code.".to_owned(),
                    Some("Use json or another data-only format for untrusted input.".to_owned()),
                    ctx,
                ),
            );
        }

        if rx.yaml_load.is_match(scrubbed) && !scrubbed.contains("Loader") {
            push(
                issues,
                make_issue(
                    config,
                    "python.yaml-unsafe-load",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(1),
                    "yaml.load() without an explicit Loader constructs arbitrary objects.".to_owned(),
                    Some("Use yaml.safe_load() or pass Loader=yaml.SafeLoader.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.mutable_default.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.mutable-default-argument",
                    Severity::Medium,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Mutable default argument is shared across calls.".to_owned(),
                    Some("Default to None and create the container inside the function.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.bare_except.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.bare-except",
                    Severity::Medium,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Bare except swallows SystemExit and KeyboardInterrupt.".to_owned(),
                    Some("Catch Exception (or something narrower) instead.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.none_compare.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.comparison-to-none",
                    Severity::Low,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Equality comparison with None.".to_owned(),
                    Some("Use 'is None' / 'is not None'.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.bool_compare.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "python.comparison-to-bool",
                    Severity::Cosmetic,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Equality comparison with a boolean literal.".to_owned(),
                    Some("Test the value directly ('if x:' / 'if not x:').".to_owned()),
                    ctx,
                ),
            );
        }

        // Secrets live inside string literals, so this one scans the raw line.
        if let Some(m) = rx.hardcoded_secret.find(raw_line) {
            push(
                issues,
                make_issue(
                    config,
                    "python.hardcoded-secret",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Possible hardcoded credential.".to_owned(),
                    Some("Read the secret from the environment or a secrets manager.".to_owned()),
                    ctx,
                ),
            );
        }

        if ctx != FileContext::Test {
            if let Some(m) = rx.assert_stmt.find(scrubbed) {
                push(
                    issues,
                    make_issue(
                        config,
                        "python.assert-statement",
                        Severity::Low,
                        path,
                        Some(line_no),
                        Some(col(m.start())),
                        "assert is stripped under python -O; not a production guard.".to_owned(),
                        Some("Raise an explicit exception for runtime validation.".to_owned()),
                        ctx,
                    ),
                );
            }
        }
    }
}

fn push(issues: &mut Vec<Issue>, issue: Option<Issue>) {
    if let Some(i) = issue {
        issues.push(i);
    }
}

fn col(byte_start: usize) -> u32 {
    byte_start as u32 + 1
}

struct PyRegexes {
    eval_call: Regex,
    exec_call: Regex,
    os_system: Regex,
    shell_true: Regex,
    pickle_load: Regex,
    yaml_load: Regex,
    mutable_default: Regex,
    bare_except: Regex,
    none_compare: Regex,
    bool_compare: Regex,
    hardcoded_secret: Regex,
    assert_stmt: Regex,
}

fn regexes() -> &'static PyRegexes {
    static RX: OnceLock<PyRegexes> = OnceLock::new();
    RX.get_or_init(|| PyRegexes {
        eval_call: Regex::new(r"(?:^|[^\w.])eval\s*\(").expect("valid regex"),
        exec_call: Regex::new(r"(?:^|[^\w.])exec\s*\(").expect("valid regex"),
        os_system: Regex::new(r"\bos\.system\s*\(").expect("valid regex"),
        shell_true: Regex::new(r"\bsubprocess\.\w+\s*\(.*shell\s*=\s*True").expect("valid regex"),
        pickle_load: Regex::new(r"\bpickle\.loads?\s*\(").expect("valid regex"),
        yaml_load: Regex::new(r"\byaml\.load\s*\(").expect("valid regex"),
        mutable_default: Regex::new(r"def\s+\w+\s*\([^)]*=\s*(?:\[\]|\{\}|set\(\))")
            .expect("valid regex"),
        bare_except: Regex::new(r"^\s*except\s*:").expect("valid regex"),
        none_compare: Regex::new(r"[=!]=\s*None\b").expect("valid regex"),
        bool_compare: Regex::new(r"[=!]=\s*(?:True|False)\b").expect("valid regex"),
        hardcoded_secret: Regex::new(
            r#"(?i)\b(?:password|passwd|secret|api_key|auth_token)\s*=\s*["'][^"']{4,}["']"#,
        )
        .expect("valid regex"),
        assert_stmt: Regex::new(r"^\s*assert\s").expect("valid regex"),
    })
}

/// Remove comments and mask string interiors on one line, tracking
/// triple-quoted string state across lines.
///
/// Operates on bytes so non-ASCII source never trips a char boundary;
/// code bytes are copied verbatim (whole chars survive intact), masked
/// bytes become one space each.
///
/// Returns the scrubbed line and the docstring delimiter the next line
/// starts inside, if any.
fn scrub_line<'a>(line: &str, in_docstring: Option<&'a str>) -> (String, Option<&'a str>) {
    let bytes = line.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut state = in_docstring;

    while i < bytes.len() {
        if let Some(delim) = state {
            // Inside a triple-quoted string: mask until the closing delimiter.
            if bytes[i..].starts_with(delim.as_bytes()) {
                out.extend_from_slice(b"   ");
                i += 3;
                state = None;
            } else {
                out.push(b' ');
                i += 1;
            }
            continue;
        }

        if bytes[i..].starts_with(b"\"\"\"") {
            out.extend_from_slice(b"   ");
            i += 3;
            state = Some("\"\"\"");
        } else if bytes[i..].starts_with(b"'''") {
            out.extend_from_slice(b"   ");
            i += 3;
            state = Some("'''");
        } else if bytes[i] == b'#' {
            break;
        } else if bytes[i] == b'"' || bytes[i] == b'\'' {
            let quote = bytes[i];
            out.push(quote);
            i += 1;
            while i < bytes.len() && bytes[i] != quote {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    out.extend_from_slice(b"  ");
                    i += 2;
                } else {
                    out.push(b' ');
                    i += 1;
                }
            }
            if i < bytes.len() {
                out.push(quote);
                i += 1;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    (String::from_utf8_lossy(&out).into_owned(), state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
