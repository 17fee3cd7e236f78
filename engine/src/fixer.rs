//! Fix proposer — converts issues into single-span mechanical rewrites.
//!
//! Each recipe is pure: given the file content and the issue location it
//! yields one contiguous span replacement plus a rationale and a safety
//! score, or nothing. Recipes must be idempotent (a second application finds
//! nothing to change) and must return `None` rather than guess when a safe
//! single-span rewrite does not exist — which is why there is no recipe for
//! mutable default arguments: fixing those needs a second edit in the
//! function body.
//!
//! Proposals in `test` and `demo` contexts are held to stricter patterns:
//! their safety score is docked so they never reach the auto-approval bar.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::types::{FileContext, FixProposal, Issue, Severity, Span};

/// A recipe's raw output before proposal assembly.
struct RecipeFix {
    offset: usize,
    len: usize,
    col: u32,
    replacement: String,
    rationale: String,
    safety_score: u8,
}

type RecipeFn = fn(&str, &Issue) -> Option<RecipeFix>;

/// Registry of fix recipes, keyed by issue type.
pub struct FixProposer {
    recipes: HashMap<&'static str, RecipeFn>,
}

impl Default for FixProposer {
    fn default() -> Self {
        Self::new()
    }
}

impl FixProposer {
    /// Build the proposer with all registered recipes.
    #[must_use]
    pub fn new() -> Self {
        let mut recipes: HashMap<&'static str, RecipeFn> = HashMap::new();
        recipes.insert("python.comparison-to-none", recipe_none_comparison);
        recipes.insert("python.trailing-whitespace", recipe_trailing_whitespace);
        recipes.insert("cpp.trailing-whitespace", recipe_trailing_whitespace);
        recipes.insert("python.bare-except", recipe_bare_except);
        Self { recipes }
    }

    /// Issue types with a registered recipe.
    #[must_use]
    pub fn fixable_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.recipes.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Produce a proposal for an issue, or `None` when no recipe applies or
    /// the recipe finds nothing to change (already fixed).
    #[must_use]
    pub fn propose(&self, content: &str, issue: &Issue) -> Option<FixProposal> {
        let recipe = self.recipes.get(issue.issue_type.as_str())?;
        let fix = recipe(content, issue)?;

        let original_text = content.get(fix.offset..fix.offset + fix.len)?.to_owned();

        // Stricter bar outside production and script code.
        let safety_score = match issue.context {
            FileContext::Test | FileContext::Demo => fix.safety_score.saturating_sub(10),
            _ => fix.safety_score,
        };
        let auto_approvable =
            safety_score >= 98 && matches!(issue.severity, Severity::Low | Severity::Cosmetic);

        let span = Span {
            path: issue.file.clone(),
            offset: fix.offset,
            len: fix.len,
            line: issue.line.unwrap_or(0),
            col: fix.col,
        };

        let mut hasher = Sha256::new();
        hasher.update(issue.fingerprint.as_bytes());
        hasher.update([0]);
        hasher.update(fix.offset.to_le_bytes());
        hasher.update([0]);
        hasher.update(fix.replacement.as_bytes());
        let id = hex::encode(&hasher.finalize()[..8]);

        Some(FixProposal {
            id,
            issue: issue.clone(),
            original_span: span,
            original_text,
            replacement_text: fix.replacement,
            rationale: fix.rationale,
            safety_score,
            auto_approvable,
        })
    }
}

/// Apply a proposal to a buffer. Pure; the safety gate owns the file write.
#[must_use]
pub fn apply_to_buffer(content: &str, proposal: &FixProposal) -> String {
    let span = &proposal.original_span;
    let mut out = String::with_capacity(
        content.len() + proposal.replacement_text.len().saturating_sub(span.len),
    );
    out.push_str(&content[..span.offset]);
    out.push_str(&proposal.replacement_text);
    out.push_str(&content[span.end()..]);
    out
}

/// Byte offset of the start of a 1-based line, plus the line text.
fn line_at(content: &str, line: u32) -> Option<(usize, &str)> {
    if line == 0 {
        return None;
    }
    let mut offset = 0usize;
    for (idx, text) in content.split_inclusive('\n').enumerate() {
        if idx as u32 + 1 == line {
            return Some((offset, text.trim_end_matches(['\n', '\r'])));
        }
        offset += text.len();
    }
    None
}

// ---------------------------------------------------------------------------
// Recipes
// ---------------------------------------------------------------------------

/// `== None` → `is None`, `!= None` → `is not None`.
fn recipe_none_comparison(content: &str, issue: &Issue) -> Option<RecipeFix> {
    let (line_start, line_text) = line_at(content, issue.line?)?;

    for (needle, replacement) in [("== None", "is None"), ("!= None", "is not None")] {
        if let Some(pos) = line_text.find(needle) {
            return Some(RecipeFix {
                offset: line_start + pos,
                len: needle.len(),
                col: pos as u32 + 1,
                replacement: replacement.to_owned(),
                rationale: format!(
                    "Identity comparison is the defined way to test None; '{needle}' relies on \
                     __eq__ overloads."
                ),
                safety_score: 98,
            });
        }
    }
    None
}

/// Strip trailing whitespace from the issue line.
fn recipe_trailing_whitespace(content: &str, issue: &Issue) -> Option<RecipeFix> {
    let (line_start, line_text) = line_at(content, issue.line?)?;
    let trimmed = line_text.trim_end();
    if trimmed.len() == line_text.len() {
        return None;
    }
    Some(RecipeFix {
        offset: line_start + trimmed.len(),
        len: line_text.len() - trimmed.len(),
        col: trimmed.chars().count() as u32 + 1,
        replacement: String::new(),
        rationale: "Deleting trailing whitespace cannot change program behavior.".to_owned(),
        safety_score: 99,
    })
}

/// `except:` → `except Exception:`.
fn recipe_bare_except(content: &str, issue: &Issue) -> Option<RecipeFix> {
    let (line_start, line_text) = line_at(content, issue.line?)?;
    let indent_len = line_text.len() - line_text.trim_start().len();
    let rest = &line_text[indent_len..];
    if !rest.starts_with("except") {
        return None;
    }
    let after = rest["except".len()..].trim_start();
    if !after.starts_with(':') {
        // Already qualified (e.g. `except Exception:`), nothing to do.
        return None;
    }
    let needle_len = line_text.len() - indent_len - after.len() + 1; // "except" + spacing + ":"
    Some(RecipeFix {
        offset: line_start + indent_len,
        len: needle_len,
        col: indent_len as u32 + 1,
        replacement: "except Exception:".to_owned(),
        rationale: "Exception still catches every ordinary error but lets SystemExit and \
                    KeyboardInterrupt propagate."
            .to_owned(),
        safety_score: 90,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
