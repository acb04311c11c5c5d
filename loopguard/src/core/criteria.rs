//! Success criterion definitions.
//!
//! Criteria are a closed set of kinds; the evaluator dispatches over them
//! exhaustively, so adding a kind is a compile-checked change.

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::expr;

/// One machine-checkable acceptance condition.
///
/// `cmd` fields accept either an argv array or a single string, which is run
/// through `sh -c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    /// Passes iff the command exits with status zero within its timeout.
    Command {
        #[serde(deserialize_with = "argv")]
        cmd: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    Exists {
        path: String,
    },
    Contains {
        path: String,
        pattern: String,
    },
    /// Passes when the file is absent or the pattern does not match.
    NotContains {
        path: String,
        pattern: String,
    },
    /// Runs the coverage tool and compares the reported percentage.
    Coverage {
        threshold: f64,
        #[serde(
            default,
            deserialize_with = "optional_argv",
            skip_serializing_if = "Option::is_none"
        )]
        cmd: Option<Vec<String>>,
    },
    /// State-inspection expression evaluated against the final tree.
    Eval {
        expr: String,
    },
    /// Fails when files absent from the pre-attempt listing appear.
    NoNewFiles {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow: Vec<String>,
    },
    /// Fails when a protected path's content hash changes.
    NoClobber {
        paths: Vec<String>,
    },
}

/// Discriminant of [`Criterion`], used for display and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CriterionKind {
    Command,
    Exists,
    Contains,
    NotContains,
    Coverage,
    Eval,
    NoNewFiles,
    NoClobber,
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CriterionKind::Command => "COMMAND",
            CriterionKind::Exists => "EXISTS",
            CriterionKind::Contains => "CONTAINS",
            CriterionKind::NotContains => "NOT_CONTAINS",
            CriterionKind::Coverage => "COVERAGE",
            CriterionKind::Eval => "EVAL",
            CriterionKind::NoNewFiles => "NO_NEW_FILES",
            CriterionKind::NoClobber => "NO_CLOBBER",
        };
        f.write_str(label)
    }
}

impl Criterion {
    pub fn kind(&self) -> CriterionKind {
        match self {
            Criterion::Command { .. } => CriterionKind::Command,
            Criterion::Exists { .. } => CriterionKind::Exists,
            Criterion::Contains { .. } => CriterionKind::Contains,
            Criterion::NotContains { .. } => CriterionKind::NotContains,
            Criterion::Coverage { .. } => CriterionKind::Coverage,
            Criterion::Eval { .. } => CriterionKind::Eval,
            Criterion::NoNewFiles { .. } => CriterionKind::NoNewFiles,
            Criterion::NoClobber { .. } => CriterionKind::NoClobber,
        }
    }

    /// Human-readable target: the path, command line, or expression checked.
    pub fn target(&self) -> String {
        match self {
            Criterion::Command { cmd, .. } => cmd.join(" "),
            Criterion::Exists { path }
            | Criterion::Contains { path, .. }
            | Criterion::NotContains { path, .. } => path.clone(),
            Criterion::Coverage { threshold, .. } => format!("coverage >= {threshold}%"),
            Criterion::Eval { expr } => expr.clone(),
            Criterion::NoNewFiles { .. } => ".".to_string(),
            Criterion::NoClobber { paths } => paths.join(", "),
        }
    }

    /// Check well-formedness. A contract with a malformed criterion is rejected
    /// before execution.
    pub fn validate(&self) -> Result<()> {
        match self {
            Criterion::Command { cmd, timeout_secs } => {
                if cmd.first().is_none_or(|program| program.trim().is_empty()) {
                    bail!("command must be a non-empty array");
                }
                if *timeout_secs == Some(0) {
                    bail!("timeout_secs must be > 0");
                }
            }
            Criterion::Exists { path } => require_path(path)?,
            Criterion::Contains { path, pattern } | Criterion::NotContains { path, pattern } => {
                require_path(path)?;
                if let Err(err) = regex::Regex::new(pattern) {
                    bail!("invalid pattern '{pattern}': {err}");
                }
            }
            Criterion::Coverage { threshold, cmd } => {
                if !(0.0..=100.0).contains(threshold) {
                    bail!("threshold must be within 0..=100, got {threshold}");
                }
                if let Some(cmd) = cmd
                    && cmd.first().is_none_or(|program| program.trim().is_empty())
                {
                    bail!("coverage command must be a non-empty array");
                }
            }
            Criterion::Eval { expr } => {
                if let Err(err) = expr::parse(expr) {
                    bail!("invalid expression: {err}");
                }
            }
            Criterion::NoNewFiles { allow } => validate_globs(allow)?,
            Criterion::NoClobber { paths } => {
                if paths.is_empty() {
                    bail!("no_clobber requires at least one protected path");
                }
                validate_globs(paths)?;
            }
        }
        Ok(())
    }
}

fn require_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        bail!("path must be non-empty");
    }
    Ok(())
}

fn validate_globs(patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        if let Err(err) = glob::Pattern::new(pattern) {
            bail!("invalid glob '{pattern}': {err}");
        }
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl From<CommandLine> for Vec<String> {
    fn from(line: CommandLine) -> Self {
        match line {
            CommandLine::Argv(argv) => argv,
            CommandLine::Shell(script) => vec!["sh".to_string(), "-c".to_string(), script],
        }
    }
}

fn argv<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    CommandLine::deserialize(deserializer).map(Vec::from)
}

fn optional_argv<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Option::<CommandLine>::deserialize(deserializer).map(|line| line.map(Vec::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_criteria() {
        let raw = r#"[
            {"kind": "command", "cmd": ["cargo", "test"], "timeout_secs": 30},
            {"kind": "exists", "path": "tests/test_foo.py"},
            {"kind": "not_contains", "path": "src/lib.rs", "pattern": "todo!\\("},
            {"kind": "coverage", "threshold": 75},
            {"kind": "no_new_files", "allow": ["docs/**"]}
        ]"#;
        let criteria: Vec<Criterion> = serde_json::from_str(raw).expect("parse");
        assert_eq!(criteria.len(), 5);
        assert_eq!(criteria[0].kind(), CriterionKind::Command);
        assert_eq!(criteria[0].target(), "cargo test");
        assert_eq!(criteria[3], Criterion::Coverage { threshold: 75.0, cmd: None });
        assert!(criteria.iter().all(|c| c.validate().is_ok()));
    }

    #[test]
    fn string_command_runs_through_shell() {
        let raw = r#"{"kind": "command", "cmd": "pytest -q && ruff check ."}"#;
        let criterion: Criterion = serde_json::from_str(raw).expect("parse");
        let Criterion::Command { cmd, timeout_secs } = criterion else {
            panic!("expected command");
        };
        assert_eq!(cmd, vec!["sh", "-c", "pytest -q && ruff check ."]);
        assert_eq!(timeout_secs, None);
    }

    #[test]
    fn rejects_malformed_criteria() {
        let cases = [
            Criterion::Command {
                cmd: Vec::new(),
                timeout_secs: None,
            },
            Criterion::Exists {
                path: "  ".to_string(),
            },
            Criterion::Contains {
                path: "a.txt".to_string(),
                pattern: "(unclosed".to_string(),
            },
            Criterion::Coverage {
                threshold: 120.0,
                cmd: None,
            },
            Criterion::Eval {
                expr: "exists(".to_string(),
            },
            Criterion::NoClobber { paths: Vec::new() },
        ];
        for criterion in cases {
            assert!(criterion.validate().is_err(), "{criterion:?} should be rejected");
        }
    }

    #[test]
    fn kind_display_uses_canonical_names() {
        let criterion = Criterion::NotContains {
            path: "a".to_string(),
            pattern: "b".to_string(),
        };
        assert_eq!(criterion.kind().to_string(), "NOT_CONTAINS");
    }
}
