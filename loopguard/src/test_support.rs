//! Test-only helpers: git fixtures and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::budget::TokenUsage;
use crate::core::contract::MissionContract;
use crate::core::criteria::Criterion;
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::reasoner::{AuditVerdict, Directive, PlanRequest, Reasoner};

/// `git init` with a committed README. Panics on failure.
pub fn init_git_repo(root: &Path) {
    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {} failed", args.join(" "));
    };
    git(&["init", "--quiet"]);
    git(&["config", "user.email", "loopguard@example.com"]);
    git(&["config", "user.name", "loopguard"]);
    git(&["config", "commit.gpgsign", "false"]);
    fs::write(root.join("README.md"), "# fixture\n").expect("write README");
    git(&["add", "."]);
    git(&["commit", "--quiet", "-m", "init"]);
}

/// Scratch git repository with one commit, removed on drop.
#[derive(Debug)]
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        init_git_repo(dir.path());
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

/// Contract with the given criteria and nothing else.
pub fn contract(criteria: Vec<Criterion>) -> MissionContract {
    MissionContract {
        summary: "test mission".to_string(),
        criteria,
        ..MissionContract::default()
    }
}

/// What one scripted agent run does.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Files written (relative path, contents) when the run starts.
    pub writes: Vec<(String, String)>,
    /// Never exits on its own.
    pub hang: bool,
    /// Fail to start with this message.
    pub start_error: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ScriptedRun {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn writing(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }
}

/// Executor that replays [`ScriptedRun`]s in order and records requests.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    runs: RefCell<VecDeque<ScriptedRun>>,
    requests: RefCell<Vec<ExecRequest>>,
    cancel_on_start: Option<CancelToken>,
}

impl ScriptedExecutor {
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Cancel `token` as soon as a run starts, as a Ctrl-C would.
    pub fn cancelling(mut self, token: CancelToken) -> Self {
        self.cancel_on_start = Some(token);
        self
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }
}

#[derive(Debug)]
pub struct ScriptedHandle {
    run: ScriptedRun,
}

impl Executor for ScriptedExecutor {
    type Handle = ScriptedHandle;

    fn start(&self, request: &ExecRequest) -> Result<ScriptedHandle> {
        self.requests.borrow_mut().push(request.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left"))?;
        if let Some(message) = &run.start_error {
            return Err(anyhow!("{message}"));
        }
        for (path, contents) in &run.writes {
            let full = request.workdir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, contents)?;
        }
        if let Some(token) = &self.cancel_on_start {
            token.cancel();
        }
        Ok(ScriptedHandle { run })
    }

    fn wait(&self, handle: &mut ScriptedHandle, slice: Duration) -> Result<Option<ExecOutput>> {
        if handle.run.hang {
            thread::sleep(slice.min(Duration::from_millis(5)));
            return Ok(None);
        }
        Ok(Some(ExecOutput {
            exit_code: handle.run.exit_code,
            stdout: handle.run.stdout.clone(),
            stderr: handle.run.stderr.clone(),
            timed_out: false,
            usage: handle.run.usage,
        }))
    }

    fn kill(&self, handle: ScriptedHandle) -> Result<ExecOutput> {
        Ok(ExecOutput {
            exit_code: None,
            stdout: handle.run.stdout,
            stderr: handle.run.stderr,
            timed_out: true,
            usage: handle.run.usage,
        })
    }
}

/// Reasoner that replays directives and verdicts. Runs out of verdicts by
/// accepting; runs out of directives by failing.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    directives: RefCell<VecDeque<Result<Directive, String>>>,
    verdicts: RefCell<VecDeque<AuditVerdict>>,
    requests: RefCell<Vec<PlanRequest>>,
}

impl ScriptedReasoner {
    pub fn new(contracts: impl IntoIterator<Item = MissionContract>) -> Self {
        let directives = contracts
            .into_iter()
            .map(|contract| {
                Ok(Directive {
                    contract,
                    usage: None,
                })
            })
            .collect();
        Self {
            directives: RefCell::new(directives),
            ..Self::default()
        }
    }

    pub fn with_directive(self, directive: Result<Directive, String>) -> Self {
        self.directives.borrow_mut().push_back(directive);
        self
    }

    pub fn with_verdicts(self, verdicts: impl IntoIterator<Item = AuditVerdict>) -> Self {
        self.verdicts.borrow_mut().extend(verdicts);
        self
    }

    /// Requests seen by `directive`, in order.
    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.borrow().clone()
    }
}

impl Reasoner for ScriptedReasoner {
    fn directive(&self, request: &PlanRequest) -> Result<Directive> {
        self.requests.borrow_mut().push(request.clone());
        match self.directives.borrow_mut().pop_front() {
            Some(Ok(directive)) => Ok(directive),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Err(anyhow!("no scripted directive left")),
        }
    }

    fn audit(&self, _request: &PlanRequest, _contract: &MissionContract) -> Result<AuditVerdict> {
        Ok(self
            .verdicts
            .borrow_mut()
            .pop_front()
            .unwrap_or(AuditVerdict::Accept))
    }
}
