//! False-positive detection with learned feedback.
//!
//! Scores a candidate issue against remembered evidence: confirmed false
//! positives of the same type push the confidence up, confirmed valid
//! findings push it down, and a context prior captures structural knowledge
//! (a mutable-default warning inside a test fixture is usually noise; almost
//! anything in generated or vendored code is).
//!
//! Learning is append-only: feedback adds memories, never deletes them, so
//! accumulated trust is monotone in history until explicit pruning.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::{MemoryEngine, SearchMode, NS_FALSE_POSITIVES};
use crate::types::{FileContext, Issue, Severity};

/// Assessment of one candidate issue.
#[derive(Debug, Clone)]
pub struct FpAssessment {
    /// Whether the issue should be suppressed.
    pub is_false_positive: bool,
    /// Confidence in `[0, 1]` that the issue is a false positive.
    pub confidence: f32,
    /// Human-readable evidence trail.
    pub reasons: Vec<String>,
}

/// The false-positive detector. Holds only opaque handles; all evidence
/// lives in memory.
pub struct FalsePositiveDetector<'a> {
    memory: &'a MemoryEngine,
    config: &'a EngineConfig,
}

impl<'a> FalsePositiveDetector<'a> {
    /// Create a detector over the given memory handle.
    #[must_use]
    pub fn new(memory: &'a MemoryEngine, config: &'a EngineConfig) -> Self {
        Self { memory, config }
    }

    /// Assess one issue. Never fails the scan: memory errors degrade to a
    /// prior-only assessment.
    #[must_use]
    pub fn assess(&self, issue: &Issue) -> FpAssessment {
        let mut reasons = Vec::new();

        let prior = context_prior(issue);
        if prior > 0.0 {
            reasons.push(format!(
                "context prior {:.2} for {} in {} code",
                prior, issue.issue_type, issue.context
            ));
        }

        let (positive, negative) = match self.evidence(issue, &mut reasons) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("fp evidence retrieval failed, using prior only: {e}");
                (0.0, 0.0)
            }
        };

        let confidence = (prior + positive - negative).clamp(0.0, 1.0);
        let is_false_positive = confidence >= self.config.fp.suppress_threshold;
        if is_false_positive {
            reasons.push(format!(
                "confidence {confidence:.2} >= threshold {:.2}",
                self.config.fp.suppress_threshold
            ));
        }

        FpAssessment {
            is_false_positive,
            confidence,
            reasons,
        }
    }

    /// Filter a scan's issues, returning the survivors and the suppressed.
    #[must_use]
    pub fn filter(&self, issues: Vec<Issue>) -> (Vec<Issue>, Vec<(Issue, FpAssessment)>) {
        let mut kept = Vec::new();
        let mut suppressed = Vec::new();
        for issue in issues {
            let assessment = self.assess(&issue);
            if assessment.is_false_positive {
                log::info!(
                    "suppressing {} in {} (confidence {:.2})",
                    issue.issue_type,
                    issue.file,
                    assessment.confidence
                );
                suppressed.push((issue, assessment));
            } else {
                kept.push(issue);
            }
        }
        (kept, suppressed)
    }

    /// Record reviewer feedback about an issue.
    ///
    /// Stores a new memory in the `false-positives` namespace; evidence is
    /// only ever added, never removed.
    ///
    /// # Errors
    ///
    /// Propagates memory write failures.
    pub fn record_feedback(
        &self,
        issue: &Issue,
        is_false_positive: bool,
        reason: &str,
        user_confidence: f32,
    ) -> Result<u64> {
        let kind = if is_false_positive {
            "fp_pattern"
        } else {
            "issue_pattern"
        };
        let content = format!(
            "{} {} (context: {}) reason: {}",
            issue.issue_type, issue.description, issue.context, reason
        );
        let metadata = serde_json::json!({
            "kind": kind,
            "confirmed_valid": !is_false_positive,
            "type": issue.issue_type,
            "context": issue.context.to_string(),
            "fingerprint": issue.fingerprint,
            "user_confidence": user_confidence,
        });
        self.memory.store(NS_FALSE_POSITIVES, &content, metadata)
    }

    /// Retrieve similar past evidence and aggregate it into positive
    /// (false-positive) and negative (confirmed-valid) weight sums.
    fn evidence(&self, issue: &Issue, reasons: &mut Vec<String>) -> Result<(f32, f32)> {
        let language = issue.issue_type.split('.').next().unwrap_or("unknown");
        let query = format!("{} {}", issue.issue_type, issue.description);
        let hits = self.memory.search_many(
            &[NS_FALSE_POSITIVES, language],
            &query,
            self.config.fp.top_k,
            0.2,
            SearchMode::Hybrid,
        )?;

        let mut positive = 0.0f32;
        let mut negative = 0.0f32;

        for hit in hits {
            let kind = hit.metadata.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            let hit_type = hit.metadata.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let hit_ctx = hit.metadata.get("context").and_then(|v| v.as_str()).unwrap_or("");
            let user_confidence = hit
                .metadata
                .get("user_confidence")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.5) as f32;

            // Type affinity: exact type is strong evidence, same language is
            // weak evidence, anything else is ignored.
            let affinity = if hit_type == issue.issue_type {
                1.0
            } else if hit_type.starts_with(language) {
                0.3
            } else {
                continue;
            };

            let context_bonus = if hit_ctx == issue.context.to_string() { 0.1 } else { 0.0 };
            let weight = hit.score * user_confidence * affinity + context_bonus;

            match kind {
                "fp_pattern" => {
                    positive += weight;
                    reasons.push(format!(
                        "past false positive #{} (score {:.2})",
                        hit.id, hit.score
                    ));
                }
                "issue_pattern"
                    if hit.metadata.get("confirmed_valid").and_then(serde_json::Value::as_bool)
                        == Some(true) =>
                {
                    negative += weight;
                    reasons.push(format!(
                        "past confirmed valid issue #{} (score {:.2})",
                        hit.id, hit.score
                    ));
                }
                _ => {}
            }
        }

        Ok((positive, negative))
    }
}

/// Structural prior that an issue is a false positive, from file context.
fn context_prior(issue: &Issue) -> f32 {
    let style = issue.severity >= Severity::Low;
    match issue.context {
        FileContext::Generated => 0.5,
        FileContext::Vendored => 0.45,
        FileContext::Test => {
            if issue.issue_type.contains("mutable-default") || style {
                0.35
            } else {
                0.15
            }
        }
        FileContext::Demo => {
            if style {
                0.25
            } else {
                0.1
            }
        }
        FileContext::Config | FileContext::Script | FileContext::Production => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (MemoryEngine, EngineConfig, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.state_dir = dir.path().to_path_buf();
        let memory = MemoryEngine::init(&config).unwrap();
        (memory, config, dir)
    }

    fn issue(issue_type: &str, ctx: FileContext, severity: Severity) -> Issue {
        Issue {
            issue_type: issue_type.to_owned(),
            severity,
            file: "src/app.py".to_owned(),
            line: Some(10),
            column: Some(1),
            description: "mutable default argument is shared across calls".to_owned(),
            suggestion: None,
            context: ctx,
            fingerprint: "abcd1234abcd1234".to_owned(),
        }
    }

    #[test]
    fn test_no_evidence_no_suppression() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let assessment = detector.assess(&issue(
            "python.mutable-default-argument",
            FileContext::Production,
            Severity::Medium,
        ));
        assert!(!assessment.is_false_positive);
        assert!(assessment.confidence < 0.5);
    }

    #[test]
    fn test_learned_suppression_after_feedback() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let target = issue(
            "python.mutable-default-argument",
            FileContext::Test,
            Severity::Medium,
        );

        for _ in 0..3 {
            detector
                .record_feedback(&target, true, "test fixture intentionally shares state", 1.0)
                .unwrap();
        }

        let assessment = detector.assess(&target);
        assert!(
            assessment.is_false_positive,
            "confidence {} should reach threshold after repeated confirmation",
            assessment.confidence
        );
        assert!(!assessment.reasons.is_empty());
    }

    #[test]
    fn test_confirmed_valid_counteracts() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let target = issue(
            "python.mutable-default-argument",
            FileContext::Production,
            Severity::Medium,
        );

        for _ in 0..2 {
            detector.record_feedback(&target, true, "looked harmless", 0.8).unwrap();
        }
        for _ in 0..3 {
            detector
                .record_feedback(&target, false, "actually caused a shared-state bug", 1.0)
                .unwrap();
        }

        let assessment = detector.assess(&target);
        assert!(
            !assessment.is_false_positive,
            "confirmed valid evidence must keep the issue alive (confidence {})",
            assessment.confidence
        );
    }

    #[test]
    fn test_generated_context_prior() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let gen = detector.assess(&issue(
            "python.comparison-to-none",
            FileContext::Generated,
            Severity::Low,
        ));
        let prod = detector.assess(&issue(
            "python.comparison-to-none",
            FileContext::Production,
            Severity::Low,
        ));
        assert!(gen.confidence > prod.confidence);
    }

    #[test]
    fn test_learning_is_append_only() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let target = issue(
            "python.bare-except",
            FileContext::Production,
            Severity::Medium,
        );

        detector.record_feedback(&target, true, "expected", 0.9).unwrap();
        let count_after_one = memory.count(Some(NS_FALSE_POSITIVES)).unwrap();
        detector.record_feedback(&target, false, "changed my mind", 0.9).unwrap();
        let count_after_two = memory.count(Some(NS_FALSE_POSITIVES)).unwrap();
        assert_eq!(count_after_one + 1, count_after_two);
    }

    #[test]
    fn test_filter_splits_issues() {
        let (memory, config, _dir) = engine();
        let detector = FalsePositiveDetector::new(&memory, &config);
        let suppressible = issue(
            "python.mutable-default-argument",
            FileContext::Test,
            Severity::Medium,
        );
        for _ in 0..3 {
            detector.record_feedback(&suppressible, true, "fixture", 1.0).unwrap();
        }

        let kept_issue = issue("python.eval-call", FileContext::Production, Severity::High);
        let (kept, suppressed) = detector.filter(vec![suppressible, kept_issue]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].issue_type, "python.eval-call");
        assert_eq!(suppressed.len(), 1);
    }
}
