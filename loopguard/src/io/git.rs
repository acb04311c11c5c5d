//! Git adapter used for checkpoints and restores.
//!
//! A small, explicit wrapper around `git` subprocess calls. Snapshots are
//! written as tree objects through a throwaway index so the user's staging
//! area is never touched.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git work tree. Errors only when git
    /// itself cannot be spawned.
    pub fn is_work_tree(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"], &[])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    /// Full HEAD sha, or `None` for a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"], &[])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Current branch name, or `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"], &[])?;
        if !out.status.success() {
            debug!("detached HEAD");
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Absolute path of the repository's top-level directory.
    pub fn top_level(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// True if `workdir` is the top level of its repository rather than a
    /// subdirectory of it.
    pub fn is_top_level(&self) -> Result<bool> {
        let top = fs::canonicalize(self.top_level()?).context("resolve repository top level")?;
        let workdir = fs::canonicalize(&self.workdir)
            .with_context(|| format!("resolve {}", self.workdir.display()))?;
        Ok(top == workdir)
    }

    /// Absolute path of the `.git` directory.
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Write the full working tree (tracked and untracked, minus ignored files
    /// and `exclude` directories) as a tree object and return its id.
    #[instrument(skip_all)]
    pub fn write_worktree_tree(&self, exclude: &[&str]) -> Result<String> {
        let index = self.git_dir()?.join("loopguard-snapshot.index");
        let index_str = index.to_string_lossy().into_owned();
        let env = [("GIT_INDEX_FILE", index_str.as_str())];

        let result = (|| -> Result<String> {
            self.run_checked_env(&["read-tree", "HEAD"], &env)?;
            let mut args = vec!["add", "-A", "--", "."];
            let excludes: Vec<String> = exclude
                .iter()
                .map(|dir| format!(":(exclude){dir}"))
                .collect();
            args.extend(excludes.iter().map(String::as_str));
            self.run_checked_env(&args, &env)?;
            let tree = self.run_checked_env(&["write-tree"], &env)?;
            Ok(String::from_utf8_lossy(&tree.stdout).trim().to_string())
        })();

        if let Err(err) = fs::remove_file(&index)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(err = %err, path = %index.display(), "failed to remove temporary index");
        }
        let tree = result?;
        debug!(tree = %tree, "wrote worktree tree");
        Ok(tree)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "--force", "--quiet", branch])?;
        Ok(())
    }

    /// Move the current branch (and index and worktree) to `commit`.
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", commit])?;
        Ok(())
    }

    /// Reset the index to `commit`, leaving the worktree alone.
    pub fn reset_index(&self, commit: &str) -> Result<()> {
        self.run_checked(&["reset", "--quiet", commit])?;
        Ok(())
    }

    /// Remove untracked files and directories, keeping ignored files and
    /// anything matching `keep`.
    pub fn clean(&self, keep: &[&str]) -> Result<()> {
        let mut args = vec!["clean", "-f", "-d", "-q"];
        for pattern in keep {
            args.push("-e");
            args.push(pattern);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    /// Check out `tree` into the index and worktree.
    pub fn read_tree_into_worktree(&self, tree: &str) -> Result<()> {
        self.run_checked(&["read-tree", "-u", "--reset", tree])?;
        Ok(())
    }

    /// Stage everything and commit. Used to set up repositories in tests and
    /// by callers that want a recoverable checkpoint of their own.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_env(args, &[])
    }

    fn run_checked_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        let output = self.run(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
