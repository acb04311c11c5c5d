//! Lessons: condensed records of past failures used to bias recovery.
//!
//! A lesson is derived when a failed attempt is recorded. Retrieval ranks
//! stored lessons by a weighted similarity score: failure-class match plus
//! term overlap between diagnostic signatures.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::classifier::FailureSignal;
use crate::core::types::{FailureClass, VerificationReport};

/// Condensed fingerprint of a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSignature {
    /// Sorted, deduplicated signals.
    pub signals: Vec<FailureSignal>,
    /// Sorted, deduplicated targets of the failing criteria.
    pub failing_targets: Vec<String>,
}

impl DiagnosticSignature {
    pub fn new(
        signals: impl IntoIterator<Item = FailureSignal>,
        failing_targets: impl IntoIterator<Item = String>,
    ) -> Self {
        let signals: BTreeSet<_> = signals.into_iter().collect();
        let failing_targets: BTreeSet<_> = failing_targets.into_iter().collect();
        Self {
            signals: signals.into_iter().collect(),
            failing_targets: failing_targets.into_iter().collect(),
        }
    }

    pub fn from_report(
        report: &VerificationReport,
        signals: impl IntoIterator<Item = FailureSignal>,
    ) -> Self {
        Self::new(signals, report.failures().map(|result| result.criterion.target()))
    }

    /// Terms compared during retrieval: signal names plus target tokens.
    fn terms(&self) -> BTreeSet<String> {
        let mut terms: BTreeSet<String> = self
            .signals
            .iter()
            .map(|signal| format!("signal:{}", signal.as_str()))
            .collect();
        for target in &self.failing_targets {
            terms.extend(
                target
                    .split(|c: char| !c.is_alphanumeric() && c != '_')
                    .filter(|token| token.len() > 1)
                    .map(str::to_lowercase),
            );
        }
        terms
    }
}

/// A past failure and what to do differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub class: FailureClass,
    pub signature: DiagnosticSignature,
    /// What went wrong, in one line.
    pub mistake: String,
    /// What to do instead.
    pub remediation: String,
}

/// Relative weights of the similarity components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LessonWeights {
    pub class_weight: f64,
    pub overlap_weight: f64,
}

impl Default for LessonWeights {
    fn default() -> Self {
        Self {
            class_weight: 0.6,
            overlap_weight: 0.4,
        }
    }
}

/// Weighted similarity between a stored lesson and the current failure.
pub fn similarity(
    weights: LessonWeights,
    class: FailureClass,
    signature: &DiagnosticSignature,
    lesson: &Lesson,
) -> f64 {
    let class_score = if lesson.class == class { 1.0 } else { 0.0 };
    weights.class_weight * class_score
        + weights.overlap_weight * jaccard(&signature.terms(), &lesson.signature.terms())
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Rank lessons (given oldest first) and keep the best `k`.
///
/// Only positive scores are returned; ties go to the most recent lesson.
pub fn rank<'a>(
    lessons: impl IntoIterator<Item = &'a Lesson>,
    weights: LessonWeights,
    class: FailureClass,
    signature: &DiagnosticSignature,
    k: usize,
) -> Vec<Lesson> {
    let mut scored: Vec<(f64, usize, &Lesson)> = lessons
        .into_iter()
        .enumerate()
        .map(|(index, lesson)| (similarity(weights, class, signature, lesson), index, lesson))
        .filter(|(score, _, _)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
    scored
        .into_iter()
        .take(k)
        .map(|(_, _, lesson)| lesson.clone())
        .collect()
}

static MISSING_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"No module named ['"]?([A-Za-z0-9_.\-]+)|Cannot find module ['"]([^'"]+)['"]|cannot find package ['"]?([^\s'"]+)|can't find crate for `([^`]+)`|([A-Za-z0-9_.\-]+) is not installed"#,
    )
    .unwrap()
});

static MISSING_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"command not found: ([^\s:]+)|([^\s:/]+): command not found|sh: \d+: ([^\s:]+): not found",
    )
    .unwrap()
});

fn captures(re: &Regex, text: &str) -> BTreeSet<String> {
    re.captures_iter(text)
        .filter_map(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().trim_end_matches('.').to_string())
        })
        .collect()
}

/// Dependency names mentioned by missing-module errors, top-level package only.
pub fn missing_dependencies(text: &str) -> BTreeSet<String> {
    captures(&MISSING_MODULE_RE, text)
        .into_iter()
        .map(|name| {
            if name.starts_with('@') {
                return name;
            }
            name.split(['.', '/']).next().unwrap_or(&name).to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Program names reported as not found.
pub fn missing_commands(text: &str) -> BTreeSet<String> {
    captures(&MISSING_COMMAND_RE, text)
}

/// Diagnostic text of a failed attempt: failing results plus agent stderr.
pub fn failure_text(report: &VerificationReport, stderr: &str) -> String {
    let mut text = String::new();
    for result in report.failures() {
        text.push_str(&result.diagnostic);
        text.push('\n');
    }
    text.push_str(stderr);
    text
}

/// Concrete remediation steps for the signals observed, each tagged with
/// the class it resolves.
pub fn remediation_steps(
    signals: &BTreeSet<FailureSignal>,
    text: &str,
) -> Vec<(FailureClass, String)> {
    let mut steps = Vec::new();
    for dependency in missing_dependencies(text) {
        steps.push((
            FailureClass::Tooling,
            format!("Install missing dependency `{dependency}` before running any checks"),
        ));
    }
    for command in missing_commands(text) {
        steps.push((
            FailureClass::Tooling,
            format!("Make `{command}` available on PATH (install it or use an equivalent tool)"),
        ));
    }
    for signal in signals {
        let step = match signal {
            FailureSignal::DependencyMissing if steps.is_empty() => {
                "Install the missing dependencies reported in the diagnostics"
            }
            FailureSignal::CommandNotFound if steps.is_empty() => {
                "Install the missing command reported in the diagnostics"
            }
            FailureSignal::Timeout => {
                "Keep commands within their time limit; avoid interactive or long-running processes"
            }
            FailureSignal::UnparsableOutput => {
                "Make sure the coverage tool is installed and prints a total percentage"
            }
            FailureSignal::PermissionDenied => {
                "Avoid operations that need elevated permissions; fix file modes instead"
            }
            FailureSignal::MissingInterpreter => {
                "Use an interpreter that exists on this machine in shebangs and scripts"
            }
            FailureSignal::ResourceUnavailable => {
                "Free disk space or memory before writing large outputs"
            }
            FailureSignal::ContradictoryCriteria => {
                "Criteria contradict each other; satisfy the stated objective and report the conflict"
            }
            FailureSignal::NoCriteria => "Define at least one machine-checkable success criterion",
            _ => continue,
        };
        steps.push((signal.class(), step.to_string()));
    }
    steps
}

/// Derive the lesson stored alongside a failed attempt.
pub fn derive_lesson(
    class: FailureClass,
    signals: &BTreeSet<FailureSignal>,
    report: &VerificationReport,
    stderr: &str,
) -> Lesson {
    let signature = DiagnosticSignature::from_report(report, signals.iter().copied());
    let text = failure_text(report, stderr);

    let mistake = match report.failures().next() {
        Some(result) => format!(
            "{} `{}` failed: {}",
            result.criterion.kind(),
            result.criterion.target(),
            result.headline()
        ),
        None => match report.note.as_deref() {
            Some(note) => note.to_string(),
            None => format!("{class} failure with no failing criterion"),
        },
    };

    let mut remediation: Vec<String> = remediation_steps(signals, &text)
        .into_iter()
        .filter(|(step_class, _)| *step_class == class)
        .map(|(_, step)| step)
        .collect();
    if remediation.is_empty() {
        let targets = &signature.failing_targets;
        remediation.push(if targets.is_empty() {
            "Re-read the objectives and verify the result before finishing".to_string()
        } else {
            format!("Fix the implementation so these checks pass: {}", targets.join(", "))
        });
    }

    Lesson {
        class,
        signature,
        mistake,
        remediation: remediation.join("; "),
    }
}
