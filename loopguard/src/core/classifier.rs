//! Deterministic failure classification.
//!
//! Classification happens in two steps: [`extract_signals`] reduces a failed
//! attempt (verification report, agent exit code, agent stderr) to a set of
//! [`FailureSignal`]s, and [`classify`] maps that set to a [`FailureClass`].
//! Both are pure: identical inputs always produce identical outputs.
//!
//! Priority on ties is TOOLING > ENVIRONMENT > LOGIC > AMBIGUITY.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::criteria::Criterion;
use crate::core::types::{CriterionResult, FailureClass, VerificationReport};

/// Exit code shells use for "command not found".
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit code shells use for "found but not executable".
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Fine-grained diagnostic signal extracted from a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignal {
    CommandNotFound,
    DependencyMissing,
    Timeout,
    UnparsableOutput,
    PermissionDenied,
    MissingInterpreter,
    ResourceUnavailable,
    TestFailure,
    SyntaxError,
    ContentMismatch,
    MissingPath,
    CoverageBelowThreshold,
    ProtectedPathModified,
    UnexpectedFiles,
    CommandFailed,
    EvalFailed,
    AgentError,
    ContradictoryCriteria,
    NoCriteria,
}

impl FailureSignal {
    /// The class this signal alone would imply.
    pub fn class(self) -> FailureClass {
        match self {
            FailureSignal::CommandNotFound
            | FailureSignal::DependencyMissing
            | FailureSignal::Timeout
            | FailureSignal::UnparsableOutput => FailureClass::Tooling,
            FailureSignal::PermissionDenied
            | FailureSignal::MissingInterpreter
            | FailureSignal::ResourceUnavailable => FailureClass::Environment,
            FailureSignal::TestFailure
            | FailureSignal::SyntaxError
            | FailureSignal::ContentMismatch
            | FailureSignal::MissingPath
            | FailureSignal::CoverageBelowThreshold
            | FailureSignal::ProtectedPathModified
            | FailureSignal::UnexpectedFiles
            | FailureSignal::CommandFailed
            | FailureSignal::EvalFailed
            | FailureSignal::AgentError => FailureClass::Logic,
            FailureSignal::ContradictoryCriteria | FailureSignal::NoCriteria => {
                FailureClass::Ambiguity
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureSignal::CommandNotFound => "command_not_found",
            FailureSignal::DependencyMissing => "dependency_missing",
            FailureSignal::Timeout => "timeout",
            FailureSignal::UnparsableOutput => "unparsable_output",
            FailureSignal::PermissionDenied => "permission_denied",
            FailureSignal::MissingInterpreter => "missing_interpreter",
            FailureSignal::ResourceUnavailable => "resource_unavailable",
            FailureSignal::TestFailure => "test_failure",
            FailureSignal::SyntaxError => "syntax_error",
            FailureSignal::ContentMismatch => "content_mismatch",
            FailureSignal::MissingPath => "missing_path",
            FailureSignal::CoverageBelowThreshold => "coverage_below_threshold",
            FailureSignal::ProtectedPathModified => "protected_path_modified",
            FailureSignal::UnexpectedFiles => "unexpected_files",
            FailureSignal::CommandFailed => "command_failed",
            FailureSignal::EvalFailed => "eval_failed",
            FailureSignal::AgentError => "agent_error",
            FailureSignal::ContradictoryCriteria => "contradictory_criteria",
            FailureSignal::NoCriteria => "no_criteria",
        }
    }
}

/// Diagnostic marker the evaluator writes when coverage output has no percentage.
pub const UNPARSABLE_COVERAGE: &str = "no coverage percentage found";

struct TextRule {
    signal: FailureSignal,
    pattern: &'static str,
}

const TEXT_RULES: &[TextRule] = &[
    TextRule {
        signal: FailureSignal::CommandNotFound,
        pattern: r"(?i)command not found|: not found\b|is not recognized as an internal or external command",
    },
    TextRule {
        signal: FailureSignal::DependencyMissing,
        pattern: r"ModuleNotFoundError|No module named|ImportError|Cannot find module|cannot find package|(?i)\bis not installed\b|\bunresolved import\b|can't find crate",
    },
    TextRule {
        signal: FailureSignal::Timeout,
        pattern: r"(?i)\btimed out\b",
    },
    TextRule {
        signal: FailureSignal::PermissionDenied,
        pattern: r"(?i)permission denied|\bEACCES\b|operation not permitted|\bEPERM\b",
    },
    TextRule {
        signal: FailureSignal::MissingInterpreter,
        pattern: r"(?i)bad interpreter|env: '?[^\s':]+'?: No such file or directory",
    },
    TextRule {
        signal: FailureSignal::ResourceUnavailable,
        pattern: r"(?i)no space left on device|read-only file system|cannot allocate memory|out of memory|\bENOSPC\b|\bEROFS\b",
    },
    TextRule {
        signal: FailureSignal::SyntaxError,
        pattern: r"SyntaxError|IndentationError|ParseError|(?i)syntax error",
    },
    TextRule {
        signal: FailureSignal::TestFailure,
        pattern: r"AssertionError|(?i)assertion failed|assertion `[^`]*` failed|test result: FAILED|^FAILED |\d+ failed\b|panicked at",
    },
];

static TEXT_REGEXES: LazyLock<Vec<(FailureSignal, Regex)>> = LazyLock::new(|| {
    TEXT_RULES
        .iter()
        .map(|rule| {
            let re = regex::RegexBuilder::new(rule.pattern)
                .multi_line(true)
                .build()
                .unwrap();
            (rule.signal, re)
        })
        .collect()
});

/// Signals found in free-form diagnostic text.
pub fn text_signals(text: &str) -> BTreeSet<FailureSignal> {
    TEXT_REGEXES
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(signal, _)| *signal)
        .collect()
}

/// Reduce a failed attempt to its diagnostic signals.
pub fn extract_signals(
    report: &VerificationReport,
    exit_code: Option<i32>,
    stderr: &str,
) -> BTreeSet<FailureSignal> {
    let mut signals = BTreeSet::new();

    if report.results.is_empty() {
        signals.insert(FailureSignal::NoCriteria);
    }

    let contradictory = contradictory_indices(report);
    if !contradictory.is_empty() {
        signals.insert(FailureSignal::ContradictoryCriteria);
    }

    for (index, result) in report.results.iter().enumerate() {
        // Failures explained by a contradictory pair are not logic failures.
        if result.passed || contradictory.contains(&index) {
            continue;
        }
        signals.extend(result_signals(result));
    }

    match exit_code {
        Some(EXIT_COMMAND_NOT_FOUND) => {
            signals.insert(FailureSignal::CommandNotFound);
        }
        Some(EXIT_NOT_EXECUTABLE) => {
            signals.insert(FailureSignal::PermissionDenied);
        }
        Some(code) if code != 0 => {
            signals.insert(FailureSignal::AgentError);
        }
        _ => {}
    }
    signals.extend(text_signals(stderr));
    signals
}

fn result_signals(result: &CriterionResult) -> BTreeSet<FailureSignal> {
    let mut signals = text_signals(&result.diagnostic);
    if result.timed_out {
        signals.insert(FailureSignal::Timeout);
    }
    match result.exit_code {
        Some(EXIT_COMMAND_NOT_FOUND) => {
            signals.insert(FailureSignal::CommandNotFound);
        }
        Some(EXIT_NOT_EXECUTABLE) => {
            signals.insert(FailureSignal::PermissionDenied);
        }
        _ => {}
    }

    let structural = match &result.criterion {
        Criterion::Command { .. } => FailureSignal::CommandFailed,
        Criterion::Exists { .. } => FailureSignal::MissingPath,
        Criterion::Contains { .. } | Criterion::NotContains { .. } => {
            FailureSignal::ContentMismatch
        }
        Criterion::Coverage { .. } if result.diagnostic.contains(UNPARSABLE_COVERAGE) => {
            FailureSignal::UnparsableOutput
        }
        Criterion::Coverage { .. } => FailureSignal::CoverageBelowThreshold,
        Criterion::Eval { .. } => FailureSignal::EvalFailed,
        Criterion::NoNewFiles { .. } => FailureSignal::UnexpectedFiles,
        Criterion::NoClobber { .. } => FailureSignal::ProtectedPathModified,
    };
    // A bare non-zero exit only counts when nothing more specific was found.
    if structural != FailureSignal::CommandFailed || signals.is_empty() {
        signals.insert(structural);
    }
    signals
}

/// Indices of criteria that can never pass together: CONTAINS and
/// NOT_CONTAINS over the same path and pattern.
fn contradictory_indices(report: &VerificationReport) -> BTreeSet<usize> {
    let mut indices = BTreeSet::new();
    for (i, a) in report.results.iter().enumerate() {
        let Criterion::Contains { path, pattern } = &a.criterion else {
            continue;
        };
        for (j, b) in report.results.iter().enumerate() {
            if let Criterion::NotContains {
                path: other_path,
                pattern: other_pattern,
            } = &b.criterion
                && other_path == path
                && other_pattern == pattern
            {
                indices.insert(i);
                indices.insert(j);
            }
        }
    }
    indices
}

/// Map signals to a class using the fixed priority order.
///
/// A failed attempt with no recognizable signal is AMBIGUITY.
pub fn class_of(signals: &BTreeSet<FailureSignal>) -> FailureClass {
    signals
        .iter()
        .map(|signal| signal.class())
        .min_by_key(|class| class.priority())
        .unwrap_or(FailureClass::Ambiguity)
}

/// Classify a failed attempt.
pub fn classify(report: &VerificationReport, exit_code: Option<i32>, stderr: &str) -> FailureClass {
    class_of(&extract_signals(report, exit_code, stderr))
}
