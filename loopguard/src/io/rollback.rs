//! Pre-attempt checkpoints and restores, backed by git.
//!
//! A snapshot records HEAD, the branch, and a tree object holding the whole
//! working tree (tracked and untracked files, minus ignored files and the
//! tool's state directory). Restoring is destructive: every change made since
//! the snapshot, committed or not, is discarded.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::io::git::Git;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub head: String,
    /// `None` when HEAD was detached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub tree: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollbackError {
    /// Rollback cannot work here; the attempt proceeds without it.
    #[error("rollback unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("snapshot failed: {reason}")]
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct RollbackManager {
    git: Git,
    state_dir: String,
}

impl RollbackManager {
    pub fn new(workdir: &Path, state_dir: impl Into<String>) -> Self {
        Self {
            git: Git::new(workdir),
            state_dir: state_dir.into(),
        }
    }

    #[instrument(skip_all, fields(workdir = %self.git.workdir().display()))]
    pub fn snapshot(&self) -> Result<RepositorySnapshot, RollbackError> {
        let inside = self.git.is_work_tree().map_err(|err| RollbackError::Unavailable {
            reason: format!("{err:#}"),
        })?;
        if !inside {
            return Err(RollbackError::Unavailable {
                reason: "not inside a git work tree".to_string(),
            });
        }
        // `reset --hard` acts on the whole repository, but the snapshot only
        // covers the working directory.
        if !self.git.is_top_level().map_err(failed)? {
            return Err(RollbackError::Unavailable {
                reason: "working directory is not the repository top level".to_string(),
            });
        }
        let head = self
            .git
            .head_sha()
            .map_err(failed)?
            .ok_or_else(|| RollbackError::Unavailable {
                reason: "repository has no commits".to_string(),
            })?;
        let branch = self.git.current_branch().map_err(failed)?;
        let tree = self
            .git
            .write_worktree_tree(&[self.state_dir.as_str()])
            .map_err(failed)?;
        info!(head = %head, tree = %tree, "snapshot taken");
        Ok(RepositorySnapshot {
            head,
            branch,
            tree,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Put the working tree back exactly as it was at `snapshot`.
    #[instrument(skip_all, fields(head = %snapshot.head, tree = %snapshot.tree))]
    pub fn restore(&self, snapshot: &RepositorySnapshot) -> Result<()> {
        if let Some(branch) = &snapshot.branch
            && self.git.current_branch()?.as_ref() != Some(branch)
        {
            self.git
                .checkout_branch(branch)
                .with_context(|| format!("switch back to {branch}"))?;
        }
        self.git.reset_hard(&snapshot.head).context("reset to snapshot head")?;
        self.git
            .clean(&[self.state_dir.as_str()])
            .context("remove files created since snapshot")?;
        self.git
            .read_tree_into_worktree(&snapshot.tree)
            .context("check out snapshot tree")?;
        self.git
            .reset_index(&snapshot.head)
            .context("reset index to snapshot head")?;
        info!("working tree restored");
        Ok(())
    }
}

fn failed(err: anyhow::Error) -> RollbackError {
    RollbackError::Failed {
        reason: format!("{err:#}"),
    }
}
