//! Criterion evaluator: runs one check against the working tree.
//!
//! [`evaluate`] never fails. Spawn errors, unreadable files, malformed
//! expressions and missing baselines all become failing results whose
//! diagnostic says what went wrong, so the classifier can work from text.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use glob::Pattern;
use regex::Regex;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::classifier::UNPARSABLE_COVERAGE;
use crate::core::criteria::Criterion;
use crate::core::expr::{self, Inspector};
use crate::core::types::CriterionResult;
use crate::io::baseline::{TreeBaseline, compile_patterns, is_excluded};
use crate::io::config::ControllerConfig;
use crate::io::process::{CommandOutput, SpawnError, run_command_with_timeout, tail};

/// Characters of stdout/stderr kept in a diagnostic.
const DIAGNOSTIC_TAIL_CHARS: usize = 2_000;

/// Limits and defaults shared by every criterion of one verification run.
#[derive(Debug, Clone)]
pub struct VerificationSettings {
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    pub coverage_command: Vec<String>,
    pub exclude_patterns: Vec<Pattern>,
}

impl VerificationSettings {
    pub fn from_config(cfg: &ControllerConfig) -> Result<Self> {
        Ok(Self {
            command_timeout: Duration::from_secs(cfg.verification.command_timeout_secs),
            output_limit_bytes: cfg.verification.output_limit_bytes,
            coverage_command: cfg.verification.coverage_command.clone(),
            exclude_patterns: compile_patterns(&cfg.exclude_patterns)?,
        })
    }
}

/// Everything a criterion may look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub workdir: &'a Path,
    /// Tree listing captured before the attempt; required by the
    /// `no_new_files` and `no_clobber` kinds.
    pub baseline: Option<&'a TreeBaseline>,
    pub settings: &'a VerificationSettings,
}

/// Evaluate one criterion.
#[instrument(skip_all, fields(kind = %criterion.kind(), target = %criterion.target()))]
pub fn evaluate(criterion: &Criterion, ctx: &EvalContext<'_>) -> CriterionResult {
    let result = match criterion {
        Criterion::Command { cmd, timeout_secs } => {
            let timeout = timeout_secs.map_or(ctx.settings.command_timeout, Duration::from_secs);
            eval_command(criterion, cmd, timeout, ctx)
        }
        Criterion::Exists { path } => eval_exists(criterion, path, ctx),
        Criterion::Contains { path, pattern } => eval_contains(criterion, path, pattern, ctx),
        Criterion::NotContains { path, pattern } => {
            eval_not_contains(criterion, path, pattern, ctx)
        }
        Criterion::Coverage { threshold, cmd } => {
            let cmd = cmd.as_deref().unwrap_or(&ctx.settings.coverage_command);
            eval_coverage(criterion, *threshold, cmd, ctx)
        }
        Criterion::Eval { expr } => eval_expression(criterion, expr, ctx),
        Criterion::NoNewFiles { allow } => eval_no_new_files(criterion, allow, ctx),
        Criterion::NoClobber { paths } => eval_no_clobber(criterion, paths, ctx),
    };
    debug!(passed = result.passed, "criterion evaluated");
    result
}

enum Ran {
    Finished(CommandOutput),
    TimedOut(CommandOutput),
    NotStarted(String),
}

fn run_argv(argv: &[String], timeout: Duration, ctx: &EvalContext<'_>) -> Ran {
    let Some((program, args)) = argv.split_first() else {
        return Ran::NotStarted("empty command".to_string());
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(ctx.workdir);
    match run_command_with_timeout(cmd, None, timeout, ctx.settings.output_limit_bytes) {
        Ok(output) if output.timed_out => Ran::TimedOut(output),
        Ok(output) => Ran::Finished(output),
        Err(err) => match err.downcast_ref::<SpawnError>() {
            Some(spawn) => Ran::NotStarted(spawn.to_string()),
            None => Ran::NotStarted(format!("{err:#}")),
        },
    }
}

fn output_tails(output: &CommandOutput) -> String {
    let mut text = String::new();
    for (label, body) in [("stdout", output.stdout_text()), ("stderr", output.stderr_text())] {
        let body = body.trim_end();
        if body.is_empty() {
            continue;
        }
        text.push_str(&format!("\n--- {label} ---\n{}", tail(body, DIAGNOSTIC_TAIL_CHARS)));
    }
    text
}

fn eval_command(
    criterion: &Criterion,
    argv: &[String],
    timeout: Duration,
    ctx: &EvalContext<'_>,
) -> CriterionResult {
    match run_argv(argv, timeout, ctx) {
        Ran::Finished(output) => {
            let code = output.exit_code();
            let headline = match code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            };
            let diagnostic = format!("{headline}{}", output_tails(&output));
            let result = if output.status.success() {
                CriterionResult::pass(criterion, diagnostic)
            } else {
                CriterionResult::fail(criterion, diagnostic)
            };
            result.with_exit_code(code)
        }
        Ran::TimedOut(output) => CriterionResult::fail(
            criterion,
            format!("timed out after {}s{}", timeout.as_secs(), output_tails(&output)),
        )
        .with_timeout(),
        Ran::NotStarted(reason) => CriterionResult::fail(criterion, reason),
    }
}

fn eval_exists(criterion: &Criterion, path: &str, ctx: &EvalContext<'_>) -> CriterionResult {
    // symlink_metadata so a dangling link still counts as present.
    if fs::symlink_metadata(ctx.workdir.join(path)).is_ok() {
        CriterionResult::pass(criterion, format!("path {path} exists"))
    } else {
        CriterionResult::fail(criterion, format!("path {path} does not exist"))
    }
}

enum Search {
    Absent,
    Matched,
    NoMatch,
    Error(String),
}

fn search_file(path: &str, pattern: &str, ctx: &EvalContext<'_>) -> Search {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => return Search::Error(format!("invalid pattern '{pattern}': {err}")),
    };
    match fs::read(ctx.workdir.join(path)) {
        Ok(bytes) => {
            if re.is_match(&String::from_utf8_lossy(&bytes)) {
                Search::Matched
            } else {
                Search::NoMatch
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Search::Absent,
        Err(err) => Search::Error(format!("cannot read {path}: {err}")),
    }
}

fn eval_contains(
    criterion: &Criterion,
    path: &str,
    pattern: &str,
    ctx: &EvalContext<'_>,
) -> CriterionResult {
    match search_file(path, pattern, ctx) {
        Search::Matched => CriterionResult::pass(criterion, format!("{path} matches /{pattern}/")),
        Search::NoMatch => {
            CriterionResult::fail(criterion, format!("{path} does not match /{pattern}/"))
        }
        Search::Absent => CriterionResult::fail(criterion, format!("file {path} does not exist")),
        Search::Error(reason) => CriterionResult::fail(criterion, reason),
    }
}

fn eval_not_contains(
    criterion: &Criterion,
    path: &str,
    pattern: &str,
    ctx: &EvalContext<'_>,
) -> CriterionResult {
    match search_file(path, pattern, ctx) {
        Search::Absent => CriterionResult::pass(criterion, format!("file {path} is absent")),
        Search::NoMatch => {
            CriterionResult::pass(criterion, format!("{path} does not match /{pattern}/"))
        }
        Search::Matched => {
            CriterionResult::fail(criterion, format!("{path} unexpectedly matches /{pattern}/"))
        }
        Search::Error(reason) => CriterionResult::fail(criterion, reason),
    }
}

static TOTAL_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^TOTAL\b.*?(\d+(?:\.\d+)?)%\s*$").unwrap());
static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").unwrap());

/// Coverage percentage from tool output: the `TOTAL` line if present,
/// otherwise the last percentage printed.
pub fn parse_coverage(output: &str) -> Option<f64> {
    let from_total = TOTAL_LINE_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| caps[1].parse().ok());
    from_total.or_else(|| {
        PERCENT_RE
            .captures_iter(output)
            .last()
            .and_then(|caps| caps[1].parse().ok())
    })
}

fn eval_coverage(
    criterion: &Criterion,
    threshold: f64,
    argv: &[String],
    ctx: &EvalContext<'_>,
) -> CriterionResult {
    let timeout = ctx.settings.command_timeout;
    let output = match run_argv(argv, timeout, ctx) {
        Ran::Finished(output) => output,
        Ran::TimedOut(output) => {
            return CriterionResult::fail(
                criterion,
                format!("coverage timed out after {}s{}", timeout.as_secs(), output_tails(&output)),
            )
            .with_timeout();
        }
        Ran::NotStarted(reason) => return CriterionResult::fail(criterion, reason),
    };
    let code = output.exit_code();
    match parse_coverage(&output.stdout_text()) {
        Some(percent) if percent >= threshold => CriterionResult::pass(
            criterion,
            format!("coverage {percent:.1}% >= {threshold}%"),
        )
        .with_exit_code(code),
        Some(percent) => CriterionResult::fail(
            criterion,
            format!("coverage {percent:.1}% is below {threshold}%"),
        )
        .with_exit_code(code),
        None => {
            let status = code.map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
            CriterionResult::fail(
                criterion,
                format!("{status}: {UNPARSABLE_COVERAGE}{}", output_tails(&output)),
            )
            .with_exit_code(code)
        }
    }
}

fn eval_expression(criterion: &Criterion, source: &str, ctx: &EvalContext<'_>) -> CriterionResult {
    let inspector = FsInspector::new(ctx.workdir);
    match expr::evaluate(source, &inspector) {
        Ok(true) => CriterionResult::pass(criterion, "expression is true"),
        Ok(false) => CriterionResult::fail(criterion, "expression is false"),
        Err(err) => CriterionResult::fail(criterion, format!("expression error: {err}")),
    }
}

fn current_tree(ctx: &EvalContext<'_>) -> Result<TreeBaseline, String> {
    TreeBaseline::capture(ctx.workdir, &ctx.settings.exclude_patterns)
        .map_err(|err| format!("cannot list working tree: {err:#}"))
}

fn eval_no_new_files(criterion: &Criterion, allow: &[String], ctx: &EvalContext<'_>) -> CriterionResult {
    let Some(baseline) = ctx.baseline else {
        return CriterionResult::fail(criterion, "no baseline listing captured before the attempt");
    };
    let allow = match compile_patterns(allow) {
        Ok(patterns) => patterns,
        Err(err) => return CriterionResult::fail(criterion, format!("{err:#}")),
    };
    let current = match current_tree(ctx) {
        Ok(current) => current,
        Err(reason) => return CriterionResult::fail(criterion, reason),
    };
    let unexpected: Vec<&str> = baseline
        .new_files(&current)
        .into_iter()
        .filter(|path| !is_excluded(path, &allow))
        .collect();
    if unexpected.is_empty() {
        return CriterionResult::pass(criterion, "no unexpected files");
    }
    CriterionResult::fail(
        criterion,
        format!("{} unexpected new file(s): {}", unexpected.len(), unexpected.join(", ")),
    )
}

fn eval_no_clobber(criterion: &Criterion, paths: &[String], ctx: &EvalContext<'_>) -> CriterionResult {
    let Some(baseline) = ctx.baseline else {
        return CriterionResult::fail(criterion, "no baseline listing captured before the attempt");
    };
    let protected = match compile_patterns(paths) {
        Ok(patterns) => patterns,
        Err(err) => return CriterionResult::fail(criterion, format!("{err:#}")),
    };
    let current = match current_tree(ctx) {
        Ok(current) => current,
        Err(reason) => return CriterionResult::fail(criterion, reason),
    };
    let clobbered = baseline.clobbered(&current, &protected);
    if clobbered.is_empty() {
        return CriterionResult::pass(criterion, "protected paths unchanged");
    }
    let listed: Vec<String> = clobbered
        .iter()
        .map(|(path, how)| format!("{path} ({how})"))
        .collect();
    CriterionResult::fail(
        criterion,
        format!("protected path(s) changed: {}", listed.join(", ")),
    )
}

/// Read-only [`Inspector`] over a directory. Absolute paths and `..` are
/// refused so expressions cannot look outside the tree.
pub struct FsInspector<'a> {
    root: &'a Path,
}

impl<'a> FsInspector<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path must stay inside the working tree: {path}"),
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl Inspector for FsInspector<'_> {
    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(fs::symlink_metadata(self.resolve(path)?).is_ok())
    }

    fn is_file(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn is_dir(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.is_dir())
    }

    fn file_count(&self, pattern: &str) -> io::Result<usize> {
        self.resolve(pattern)?;
        let pattern = Pattern::new(pattern)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        let mut count = 0;
        let walker = WalkDir::new(self.root)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git");
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(self.root) else {
                continue;
            };
            if pattern.matches_path(rel) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let bytes = fs::read(self.resolve(path)?)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(path)?)?.len())
    }
}
