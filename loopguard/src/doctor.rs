//! `loopguard doctor`: environment checks before running a mission.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::io::config::{ControllerConfig, load_config};
use crate::io::git::Git;
use crate::io::memory::{MemoryStore, has_torn_tail};
use crate::io::process::find_executable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

/// Run every check against `workdir` and the config at `config_path`.
pub fn diagnose(workdir: &Path, config_path: &Path) -> Vec<Check> {
    let mut checks = Vec::new();

    let config = match load_config(config_path).and_then(|cfg| cfg.validate().map(|()| cfg)) {
        Ok(cfg) => {
            let source = if config_path.exists() {
                config_path.display().to_string()
            } else {
                "defaults (no config file)".to_string()
            };
            checks.push(Check::new("config", CheckStatus::Ok, source));
            cfg
        }
        Err(err) => {
            checks.push(Check::new("config", CheckStatus::Fail, format!("{err:#}")));
            ControllerConfig::default()
        }
    };

    checks.push(git_check(workdir, config.rollback));
    if let Some(check) = worktree_check(workdir, config.rollback) {
        checks.push(check);
    }
    checks.push(program_check("agent", &config.agent.command, CheckStatus::Fail));
    if !config.reasoner.command.is_empty() {
        checks.push(program_check("reasoner", &config.reasoner.command, CheckStatus::Fail));
    }
    checks.push(program_check(
        "coverage",
        &config.verification.coverage_command,
        CheckStatus::Warn,
    ));
    checks.push(history_check(&config.history_path_in(workdir)));
    checks
}

fn git_check(workdir: &Path, rollback: bool) -> Check {
    // Without rollback a missing git is only informational.
    let missing = if rollback {
        CheckStatus::Fail
    } else {
        CheckStatus::Warn
    };
    let Some(git) = find_executable("git") else {
        return Check::new("git", missing, "git not found on PATH");
    };
    match Git::new(workdir).is_work_tree() {
        Ok(true) => Check::new("git", CheckStatus::Ok, git.display().to_string()),
        Ok(false) => Check::new(
            "git",
            missing,
            format!("{} is not inside a git work tree; rollback unavailable", workdir.display()),
        ),
        Err(err) => Check::new("git", missing, format!("{err:#}")),
    }
}

/// Uncommitted changes and rollback scope; `None` outside a work tree.
fn worktree_check(workdir: &Path, rollback: bool) -> Option<Check> {
    let git = Git::new(workdir);
    if !git.is_work_tree().unwrap_or(false) {
        return None;
    }
    if rollback && !git.is_top_level().unwrap_or(false) {
        return Some(Check::new(
            "worktree",
            CheckStatus::Warn,
            "not the repository top level; attempts will not be rolled back",
        ));
    }
    Some(match git.status_porcelain() {
        Ok(entries) if entries.is_empty() => Check::new("worktree", CheckStatus::Ok, "clean"),
        Ok(entries) => {
            let untracked = entries.iter().filter(|entry| entry.code == "??").count();
            Check::new(
                "worktree",
                CheckStatus::Ok,
                format!(
                    "{} uncommitted change(s), {untracked} untracked; kept by snapshots",
                    entries.len()
                ),
            )
        }
        Err(err) => Check::new("worktree", CheckStatus::Warn, format!("{err:#}")),
    })
}

fn program_check(name: &'static str, argv: &[String], missing: CheckStatus) -> Check {
    let Some(program) = argv.first() else {
        return Check::new(name, missing, "command is empty");
    };
    match find_executable(program) {
        Some(path) => Check::new(name, CheckStatus::Ok, path.display().to_string()),
        None => Check::new(name, missing, format!("{program} not found on PATH")),
    }
}

fn history_check(path: &Path) -> Check {
    let Ok(meta) = fs::metadata(path) else {
        return Check::new(
            "history",
            CheckStatus::Ok,
            format!("{} (not created yet)", path.display()),
        );
    };
    let store = match MemoryStore::open(path) {
        Ok(store) => store,
        Err(err) => return Check::new("history", CheckStatus::Fail, format!("{err:#}")),
    };
    let records = store.records().map(|records| records.len()).unwrap_or(0);
    let mut detail = format!("{} ({} bytes, {records} records)", path.display(), meta.len());
    let mut status = CheckStatus::Ok;
    if store.skipped_lines() > 0 {
        status = CheckStatus::Warn;
        detail.push_str(&format!(", {} malformed line(s) skipped", store.skipped_lines()));
    }
    if has_torn_tail(path).unwrap_or(false) {
        status = CheckStatus::Warn;
        detail.push_str(", last line is incomplete");
    }
    Check::new("history", status, detail)
}

/// One line per check.
pub fn render_checks(checks: &[Check]) -> String {
    checks
        .iter()
        .map(|check| format!("[{:>4}] {:<9} {}\n", check.status, check.name, check.detail))
        .collect()
}

/// True when no check failed.
pub fn healthy(checks: &[Check]) -> bool {
    checks.iter().all(|check| check.status != CheckStatus::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::write_config;
    use crate::test_support::TestRepo;

    fn find<'a>(checks: &'a [Check], name: &str) -> &'a Check {
        checks
            .iter()
            .find(|check| check.name == name)
            .expect("check present")
    }

    #[test]
    fn reports_missing_agent_and_valid_config() {
        let repo = TestRepo::new().expect("repo");
        let config_path = repo.root().join(".loopguard/config.toml");
        let mut config = ControllerConfig::default();
        config.agent.command = vec!["definitely-not-an-agent-binary".to_string()];
        write_config(&config_path, &config).expect("write config");

        let checks = diagnose(repo.root(), &config_path);
        assert_eq!(find(&checks, "config").status, CheckStatus::Ok);
        assert_eq!(find(&checks, "git").status, CheckStatus::Ok);
        let agent = find(&checks, "agent");
        assert_eq!(agent.status, CheckStatus::Fail);
        assert!(agent.detail.contains("definitely-not-an-agent-binary"));
        assert!(!healthy(&checks));
    }

    #[test]
    fn worktree_reports_changes_and_subdirectories() {
        let repo = TestRepo::new().expect("repo");
        let config_path = repo.root().join(".loopguard/config.toml");
        let clean = diagnose(repo.root(), &config_path);
        assert_eq!(find(&clean, "worktree").detail, "clean");

        repo.write("README.md", "edited\n").expect("write");
        repo.write("pkg/notes.txt", "new\n").expect("write");
        let dirty = diagnose(repo.root(), &config_path);
        let worktree = find(&dirty, "worktree");
        assert_eq!(worktree.status, CheckStatus::Ok);
        assert!(worktree.detail.starts_with("2 uncommitted change(s), 1 untracked"));

        let nested = diagnose(&repo.root().join("pkg"), &config_path);
        assert_eq!(find(&nested, "worktree").status, CheckStatus::Warn);
    }

    #[test]
    fn invalid_config_fails_and_falls_back_to_defaults() {
        let repo = TestRepo::new().expect("repo");
        repo.write(".loopguard/config.toml", "max_retries = \"many\"\n")
            .expect("write");
        let checks = diagnose(repo.root(), &repo.root().join(".loopguard/config.toml"));
        assert_eq!(find(&checks, "config").status, CheckStatus::Fail);
        assert!(checks.iter().any(|check| check.name == "history"));
    }

    #[test]
    fn torn_history_is_a_warning() {
        let repo = TestRepo::new().expect("repo");
        repo.write(".loopguard/history.jsonl", "not json\n{\"task_id\":")
            .expect("write");
        let checks = diagnose(repo.root(), &repo.root().join(".loopguard/config.toml"));
        let history = find(&checks, "history");
        assert_eq!(history.status, CheckStatus::Warn);
        assert!(history.detail.contains("malformed"));
        assert!(history.detail.contains("incomplete"));
    }

    #[test]
    fn renders_one_line_per_check() {
        let checks = vec![
            Check::new("git", CheckStatus::Ok, "/usr/bin/git"),
            Check::new("agent", CheckStatus::Fail, "npx not found on PATH"),
        ];
        assert_eq!(
            render_checks(&checks),
            "[  ok] git       /usr/bin/git\n[FAIL] agent     npx not found on PATH\n"
        );
    }
}
