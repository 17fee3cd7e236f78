//! C/C++ analyzer — line-oriented detection for a curly-brace systems
//! language.
//!
//! Same scanning model as the Python analyzer: comments removed, string
//! interiors masked, block-comment state tracked across lines. Rules target
//! the classic libc footguns (unbounded reads, format strings, shell
//! execution) plus a couple of correctness and style checks.

use std::sync::OnceLock;

use regex::Regex;

use crate::analyzers::{make_issue, Analyzer};
use crate::config::EngineConfig;
use crate::types::{FileContext, Issue, Severity};

/// C/C++ reference analyzer.
pub struct CppAnalyzer;

impl Analyzer for CppAnalyzer {
    fn language_id(&self) -> &'static str {
        "cpp"
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["c", "cc", "cpp", "cxx", "h", "hh", "hpp"]
    }

    fn sniff(&self, content: &str) -> bool {
        content.contains("#include")
    }

    fn analyze(
        &self,
        path: &str,
        content: &str,
        ctx: FileContext,
        config: &EngineConfig,
    ) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut in_block_comment = false;
        let mut alloc_calls = 0u32;
        let mut free_calls = 0u32;

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx as u32 + 1;

            if raw_line.ends_with(' ') || raw_line.ends_with('\t') {
                push(
                    &mut issues,
                    make_issue(
                        config,
                        "cpp.trailing-whitespace",
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

            let (scrubbed, next_state) = scrub_line(raw_line, in_block_comment);
            let comment_line = in_block_comment && next_state;
            in_block_comment = next_state;
            if comment_line {
                continue;
            }

            let rx = regexes();
            alloc_calls += rx.alloc_call.find_iter(&scrubbed).count() as u32;
            free_calls += rx.free_call.find_iter(&scrubbed).count() as u32;

            self.check_line(path, &scrubbed, raw_line, line_no, ctx, config, &mut issues);
        }

        // File-level allocation imbalance; a heuristic, so medium at most.
        if alloc_calls > free_calls && alloc_calls > 0 {
            push(
                &mut issues,
                make_issue(
                    config,
                    "cpp.allocation-imbalance",
                    Severity::Medium,
                    path,
                    None,
                    None,
                    format!(
                        "{alloc_calls} allocation call(s) but only {free_calls} free() call(s) in this file."
                    ),
                    Some("Check ownership of heap allocations, or use RAII containers.".to_owned()),
                    ctx,
                ),
            );
        }

        issues
    }
}

impl CppAnalyzer {
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

        if let Some(m) = rx.gets_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.gets-call",
                    Severity::Critical,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "gets() reads unbounded input and cannot be used safely.".to_owned(),
                    Some("Use fgets() with an explicit buffer size.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.strcpy_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.unbounded-copy",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Unbounded string copy can overflow the destination buffer.".to_owned(),
                    Some("Use strncpy()/strlcpy() or std::string.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.sprintf_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.sprintf-call",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "sprintf() writes without a length bound.".to_owned(),
                    Some("Use snprintf() with the destination size.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.system_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.system-call",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "system() runs a shell command.".to_owned(),
                    Some("Use exec-family calls with an argument vector.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.popen_call.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.popen-call",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "popen() runs a shell command.".to_owned(),
                    Some("Use pipe() + exec-family calls with an argument vector.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.printf_nonliteral.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.format-nonliteral",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "printf-style call with a non-literal format string.".to_owned(),
                    Some("Use a literal format: printf(\"%s\", value).".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.assignment_in_condition.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.assignment-in-condition",
                    Severity::Medium,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Assignment inside a condition; likely a mistyped comparison.".to_owned(),
                    Some("Use '==' for comparison, or parenthesize the assignment.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.goto_stmt.find(scrubbed) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.goto-statement",
                    Severity::Low,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "goto complicates control flow.".to_owned(),
                    Some("Prefer structured control flow or early returns.".to_owned()),
                    ctx,
                ),
            );
        }

        if let Some(m) = rx.hardcoded_secret.find(raw_line) {
            push(
                issues,
                make_issue(
                    config,
                    "cpp.hardcoded-secret",
                    Severity::High,
                    path,
                    Some(line_no),
                    Some(col(m.start())),
                    "Possible hardcoded credential.".to_owned(),
                    Some("Load the secret from the environment at startup.".to_owned()),
                    ctx,
                ),
            );
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

struct CppRegexes {
    gets_call: Regex,
    strcpy_call: Regex,
    sprintf_call: Regex,
    system_call: Regex,
    popen_call: Regex,
    printf_nonliteral: Regex,
    assignment_in_condition: Regex,
    goto_stmt: Regex,
    hardcoded_secret: Regex,
    alloc_call: Regex,
    free_call: Regex,
}

fn regexes() -> &'static CppRegexes {
    static RX: OnceLock<CppRegexes> = OnceLock::new();
    RX.get_or_init(|| CppRegexes {
        gets_call: Regex::new(r"(?:^|[^\w.>])gets\s*\(").expect("valid regex"),
        strcpy_call: Regex::new(r"\bstr(?:cpy|cat)\s*\(").expect("valid regex"),
        sprintf_call: Regex::new(r"(?:^|[^\w])sprintf\s*\(").expect("valid regex"),
        system_call: Regex::new(r"(?:^|[^\w:.])system\s*\(").expect("valid regex"),
        popen_call: Regex::new(r"(?:^|[^\w:.])popen\s*\(").expect("valid regex"),
        printf_nonliteral: Regex::new(r"\b(?:printf|fprintf\s*\(\s*\w+\s*,)\s*\(?\s*[A-Za-z_]\w*\s*\)")
            .expect("valid regex"),
        assignment_in_condition: Regex::new(r"\b(?:if|while)\s*\(\s*\w+(?:->\w+|\.\w+)*\s*=\s*[^=]")
            .expect("valid regex"),
        goto_stmt: Regex::new(r"^\s*goto\s+\w+").expect("valid regex"),
        hardcoded_secret: Regex::new(
            r#"(?i)\b(?:password|passwd|secret|api_key|auth_token)\s*=\s*"[^"]{4,}""#,
        )
        .expect("valid regex"),
        alloc_call: Regex::new(r"\b(?:malloc|calloc|realloc)\s*\(").expect("valid regex"),
        free_call: Regex::new(r"\bfree\s*\(").expect("valid regex"),
    })
}

/// Remove comments and mask string/char interiors on one line, tracking
/// block-comment state across lines.
///
/// Operates on bytes so non-ASCII source never trips a char boundary;
/// code bytes are copied verbatim, masked bytes become one space each.
/// Returns the scrubbed line and whether the next line starts inside a
/// block comment.
fn scrub_line(line: &str, in_block_comment: bool) -> (String, bool) {
    let bytes = line.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_comment = in_block_comment;

    while i < bytes.len() {
        if in_comment {
            if bytes[i..].starts_with(b"*/") {
                out.extend_from_slice(b"  ");
                i += 2;
                in_comment = false;
            } else {
                out.push(b' ');
                i += 1;
            }
            continue;
        }

        if bytes[i..].starts_with(b"//") {
            break;
        }
        if bytes[i..].starts_with(b"/*") {
            out.extend_from_slice(b"  ");
            i += 2;
            in_comment = true;
            continue;
        }
        if bytes[i] == b'"' || bytes[i] == b'\'' {
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
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }

    (String::from_utf8_lossy(&out).into_owned(), in_comment)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn analyze(content: &str) -> Vec<Issue> {
        let config = EngineConfig::default();
        CppAnalyzer.analyze("src/io.c", content, FileContext::Production, &config)
    }

    fn types(issues: &[Issue]) -> Vec<&str> {
        issues.iter().map(|i| i.issue_type.as_str()).collect()
    }

    #[test]
    fn test_gets_is_critical() {
        let issues = analyze("char buf[64];\ngets(buf);\n");
        let issue = issues.iter().find(|i| i.issue_type == "cpp.gets-call").unwrap();
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.line, Some(2));
    }

    #[test]
    fn test_fgets_not_flagged() {
        let issues = analyze("fgets(buf, sizeof(buf), stdin);\n");
        assert!(!types(&issues).contains(&"cpp.gets-call"));
    }

    #[test]
    fn test_strcpy_and_strcat() {
        let issues = analyze("strcpy(dst, src);\nstrcat(dst, more);\n");
        assert_eq!(
            issues.iter().filter(|i| i.issue_type == "cpp.unbounded-copy").count(),
            2
        );
    }

    #[test]
    fn test_sprintf_flagged_snprintf_not() {
        let issues = analyze("sprintf(buf, \"%d\", n);\nsnprintf(buf, sizeof buf, \"%d\", n);\n");
        assert_eq!(
            issues.iter().filter(|i| i.issue_type == "cpp.sprintf-call").count(),
            1
        );
    }

    #[test]
    fn test_system_call() {
        let issues = analyze("system(\"ls -la\");\n");
        assert!(types(&issues).contains(&"cpp.system-call"));
    }

    #[test]
    fn test_system_in_comment_ignored() {
        let issues = analyze(indoc! {"
            /* calling system(cmd) here would be bad
               and it spans lines */
            int x = 1;
            // system(also_bad);
        "});
        assert!(!types(&issues).contains(&"cpp.system-call"));
    }

    #[test]
    fn test_system_in_string_ignored() {
        let issues = analyze("const char* doc = \"never call system(x)\";\n");
        assert!(!types(&issues).contains(&"cpp.system-call"));
    }

    #[test]
    fn test_assignment_in_condition() {
        let issues = analyze("if (x = next()) {\n}\n");
        assert!(types(&issues).contains(&"cpp.assignment-in-condition"));
        let ok = analyze("if (x == next()) {\n}\n");
        assert!(!types(&ok).contains(&"cpp.assignment-in-condition"));
    }

    #[test]
    fn test_goto_low() {
        let issues = analyze("    goto cleanup;\n");
        let issue = issues.iter().find(|i| i.issue_type == "cpp.goto-statement").unwrap();
        assert_eq!(issue.severity, Severity::Low);
    }

    #[test]
    fn test_allocation_imbalance_file_level() {
        let issues = analyze(indoc! {"
            void f() {
                char* a = malloc(10);
                char* b = malloc(20);
                free(a);
            }
        "});
        let issue = issues
            .iter()
            .find(|i| i.issue_type == "cpp.allocation-imbalance")
            .unwrap();
        assert_eq!(issue.line, None);
        assert!(issue.description.contains("2 allocation"));
    }

    #[test]
    fn test_balanced_allocation_ok() {
        let issues = analyze("char* a = malloc(10);\nfree(a);\n");
        assert!(!types(&issues).contains(&"cpp.allocation-imbalance"));
    }

    #[test]
    fn test_popen_detected() {
        let issues = analyze("FILE* p = popen(cmd, \"r\");\n");
        assert!(types(&issues).contains(&"cpp.popen-call"));
    }

    #[test]
    fn test_hardcoded_secret() {
        let issues = analyze("const char* password = \"super-secret-value\";\n");
        assert!(types(&issues).contains(&"cpp.hardcoded-secret"));
    }

    #[test]
    fn test_non_ascii_source_scans_cleanly() {
        let issues = analyze("// café ☕ naïve comment\nconst char* s = \"héllo\";\ngets(buf);\n");
        assert!(types(&issues).contains(&"cpp.gets-call"));
    }

    #[test]
    fn test_sniff_include() {
        assert!(CppAnalyzer.sniff("#include <stdio.h>\n"));
        assert!(!CppAnalyzer.sniff("import os\n"));
    }
}
