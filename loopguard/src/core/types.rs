//! Shared deterministic types for the verification and recovery loop.
//!
//! Everything here is plain data: it is serialized into the history log and
//! passed between the pure `core` logic and the side-effecting `io` layer.

use std::fmt;
use std::str::FromStr;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::criteria::Criterion;

/// Coarse failure category that selects a recovery strategy.
///
/// Always derived by the classifier, never supplied by a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Logic,
    Tooling,
    Environment,
    Ambiguity,
}

impl FailureClass {
    pub const ALL: [FailureClass; 4] = [
        FailureClass::Tooling,
        FailureClass::Environment,
        FailureClass::Logic,
        FailureClass::Ambiguity,
    ];

    /// Resolution priority: lower resolves first.
    pub fn priority(self) -> u8 {
        match self {
            FailureClass::Tooling => 0,
            FailureClass::Environment => 1,
            FailureClass::Logic => 2,
            FailureClass::Ambiguity => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Logic => "LOGIC",
            FailureClass::Tooling => "TOOLING",
            FailureClass::Environment => "ENVIRONMENT",
            FailureClass::Ambiguity => "AMBIGUITY",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown failure class '{s}' (expected logic, tooling, environment or ambiguity)"))
    }
}

/// Outcome recorded for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Completed,
    Failed,
    Interrupted,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Failed => "FAILED",
            RecordStatus::Interrupted => "INTERRUPTED",
        };
        f.write_str(label)
    }
}

/// Why a mission stopped without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RetriesExhausted,
    BudgetExhausted,
    PlanRejected,
    PlanningError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::RetriesExhausted => "retry bound exhausted",
            StopReason::BudgetExhausted => "cost budget exhausted",
            StopReason::PlanRejected => "contract rejected too many times",
            StopReason::PlanningError => "planning failed too many times",
        };
        f.write_str(label)
    }
}

/// Result of evaluating one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: Criterion,
    pub passed: bool,
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl CriterionResult {
    pub fn pass(criterion: &Criterion, diagnostic: impl Into<String>) -> Self {
        Self {
            criterion: criterion.clone(),
            passed: true,
            diagnostic: diagnostic.into(),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn fail(criterion: &Criterion, diagnostic: impl Into<String>) -> Self {
        Self {
            criterion: criterion.clone(),
            passed: false,
            diagnostic: diagnostic.into(),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// First non-empty diagnostic line, for summaries.
    pub fn headline(&self) -> &str {
        self.diagnostic
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Aggregated verification outcome for one attempt.
///
/// `passed` is the conjunction of every result and is false when there are no
/// results at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<CriterionResult>,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl VerificationReport {
    pub fn from_results(results: Vec<CriterionResult>, duration_ms: u64) -> Self {
        if results.is_empty() {
            return Self {
                results,
                passed: false,
                duration_ms,
                note: Some("no success criteria: an unverifiable mission cannot pass".to_string()),
            };
        }
        let passed = results.iter().all(|result| result.passed);
        Self {
            results,
            passed,
            duration_ms,
            note: None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CriterionResult> {
        self.results.iter().filter(|result| !result.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exists(path: &str) -> Criterion {
        Criterion::Exists {
            path: path.to_string(),
        }
    }

    #[test]
    fn empty_report_never_passes() {
        let report = VerificationReport::from_results(Vec::new(), 3);
        assert!(!report.passed);
        assert!(report.note.is_some());
    }

    #[test]
    fn report_is_conjunction_of_results() {
        let all_pass = VerificationReport::from_results(
            vec![
                CriterionResult::pass(&exists("a"), "present"),
                CriterionResult::pass(&exists("b"), "present"),
            ],
            1,
        );
        assert!(all_pass.passed);

        let one_fail = VerificationReport::from_results(
            vec![
                CriterionResult::pass(&exists("a"), "present"),
                CriterionResult::fail(&exists("b"), "missing"),
            ],
            1,
        );
        assert!(!one_fail.passed);
        assert_eq!(one_fail.failed_count(), 1);
    }

    #[test]
    fn failure_class_parses_case_insensitively() {
        assert_eq!("tooling".parse::<FailureClass>().unwrap(), FailureClass::Tooling);
        assert_eq!("LOGIC".parse::<FailureClass>().unwrap(), FailureClass::Logic);
        assert!("flaky".parse::<FailureClass>().is_err());
    }

    #[test]
    fn record_status_serializes_lowercase() {
        let json = serde_json::to_string(&RecordStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }

    #[test]
    fn headline_skips_blank_lines() {
        let result = CriterionResult::fail(&exists("a"), "\n  path a does not exist\nmore");
        assert_eq!(result.headline(), "path a does not exist");
    }
}
