//! CLI command implementations. Each returns the process exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

use crate::cancel::{CancelToken, install_ctrl_c_handler};
use crate::controller::{DryRun, MissionController, MissionOutcome, MissionRequest};
use crate::core::lessons::DiagnosticSignature;
use crate::core::types::FailureClass;
use crate::doctor::{diagnose, healthy, render_checks};
use crate::exit_codes;
use crate::history::{render_history, render_lessons};
use crate::io::agents::{AgentRegistry, global_agents_path};
use crate::io::baseline::compile_patterns;
use crate::io::config::{CONFIG_PATH, ControllerConfig, load_config, write_config};
use crate::io::context::{CommandContext, ContextSource, TreeContext};
use crate::io::evaluator::{EvalContext, VerificationSettings};
use crate::io::executor::ProcessExecutor;
use crate::io::memory::MemoryStore;
use crate::io::reasoner::{CommandReasoner, FileReasoner, Reasoner, load_contract};
use crate::io::rollback::RollbackManager;
use crate::io::verification;

/// Working directory and config file shared by every command.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub dir: PathBuf,
    pub config_path: PathBuf,
}

impl Workspace {
    pub fn resolve(dir: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("resolve current directory")?,
        };
        let config_path = config.unwrap_or_else(|| dir.join(CONFIG_PATH));
        Ok(Self { dir, config_path })
    }

    pub fn config(&self) -> Result<ControllerConfig> {
        let config = load_config(&self.config_path)?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", self.config_path.display()))?;
        Ok(config)
    }

    /// `path` as given when absolute, otherwise relative to the working
    /// directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    fn memory(&self, config: &ControllerConfig) -> Result<MemoryStore> {
        Ok(MemoryStore::open(&config.history_path_in(&self.dir))?
            .with_weights(config.lessons.weights()))
    }
}

/// Command-line overrides for `loopguard run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub goal: Option<String>,
    pub contract: Option<PathBuf>,
    /// Shell command line for an external reasoner.
    pub reasoner_cmd: Option<String>,
    pub model: Option<String>,
    pub max_retries: Option<u32>,
    pub budget: Option<f64>,
    pub no_rollback: bool,
    pub task_id: Option<String>,
    /// Named agent profile replacing `agent.command`.
    pub agent: Option<String>,
    /// Plan and audit only; print the instruction instead of running the agent.
    pub dry_run: bool,
}

/// Write the default config unless one exists.
pub fn init(ws: &Workspace, force: bool) -> Result<i32> {
    if ws.config_path.exists() && !force {
        println!("init: config exists at {}", ws.config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&ws.config_path, &ControllerConfig::default())?;
    println!("init: wrote {}", ws.config_path.display());
    Ok(exit_codes::OK)
}

pub fn run(ws: &Workspace, opts: RunOptions) -> Result<i32> {
    let mut config = ws.config()?;
    if let Some(model) = &opts.model {
        config.model = model.clone();
    }
    if let Some(max_retries) = opts.max_retries {
        config.max_retries = max_retries;
    }
    if opts.budget.is_some() {
        config.cost_budget = opts.budget;
    }
    if opts.no_rollback {
        config.rollback = false;
    }
    if let Some(name) = &opts.agent {
        let registry = AgentRegistry::load(global_agents_path().as_deref(), &config.agents);
        let profile = registry.get(name).ok_or_else(|| {
            anyhow!("unknown agent '{name}' (available: {})", registry.names().join(", "))
        })?;
        config.agent.command = profile.command.clone();
    }
    config.validate().context("invalid run options")?;

    let reasoner = build_reasoner(ws, &config, &opts)?;
    let context = build_context(&config)?;
    let goal = match (opts.goal, &opts.contract) {
        (Some(goal), _) => goal,
        (None, Some(path)) => format!("Satisfy the contract in {}", path.display()),
        (None, None) => bail!("--goal is required unless --contract is given"),
    };

    // A dry run leaves the history untouched.
    let memory = if opts.dry_run {
        MemoryStore::in_memory()
    } else {
        ws.memory(&config)?
    };
    let executor = ProcessExecutor::new(config.agent.command.clone(), config.agent.output_limit_bytes);
    let cancel = CancelToken::new();
    install_ctrl_c_handler(cancel.clone());

    let request = MissionRequest {
        goal,
        task_id: opts.task_id,
    };
    let controller = MissionController::new(
        &config,
        &ws.dir,
        &memory,
        &executor,
        reasoner.as_ref(),
        context.as_ref(),
    )
    .with_cancel(cancel);

    if opts.dry_run {
        return match controller.dry_run(&request)? {
            DryRun::Ready { instruction, .. } => {
                println!("{}", instruction.trim_end());
                Ok(exit_codes::OK)
            }
            DryRun::Stopped(outcome) => {
                print_outcome(&outcome);
                Ok(outcome.exit_code())
            }
        };
    }
    let outcome = controller.run(&request)?;
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn build_reasoner(
    ws: &Workspace,
    config: &ControllerConfig,
    opts: &RunOptions,
) -> Result<Box<dyn Reasoner>> {
    if let Some(path) = &opts.contract {
        let path = ws.resolve_path(path);
        // Fail fast on a bad file instead of burning planning rejections.
        load_contract(&path)?;
        return Ok(Box::new(FileReasoner::new(path)));
    }
    let command = match &opts.reasoner_cmd {
        Some(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
        None => config.reasoner.command.clone(),
    };
    if command.is_empty() {
        bail!("no planner: pass --contract or --reasoner-cmd, or set reasoner.command in config");
    }
    Ok(Box::new(CommandReasoner::new(
        command,
        ws.dir.clone(),
        Duration::from_secs(config.reasoner.timeout_secs),
    )))
}

fn build_context(config: &ControllerConfig) -> Result<Box<dyn ContextSource>> {
    if config.context.command.is_empty() {
        return Ok(Box::new(TreeContext::new(compile_patterns(&config.exclude_patterns)?)));
    }
    Ok(Box::new(CommandContext::new(
        config.context.command.clone(),
        Duration::from_secs(config.reasoner.timeout_secs),
        config.verification.output_limit_bytes,
    )))
}

fn print_outcome(outcome: &MissionOutcome) {
    match outcome {
        MissionOutcome::Succeeded {
            task_id,
            attempts,
            cost,
            ..
        } => println!("run: task={task_id} outcome=succeeded attempts={attempts} cost=${cost:.4}"),
        MissionOutcome::Failed {
            task_id,
            attempts,
            reason,
            classification,
            report,
            cost,
        } => {
            let class = classification.map_or_else(|| "-".to_string(), |class| class.to_string());
            println!(
                "run: task={task_id} outcome=failed attempts={attempts} class={class} cost=${cost:.4} reason=\"{reason}\""
            );
            for result in report.iter().flat_map(|report| report.failures()) {
                println!(
                    "run: failing {} `{}`: {}",
                    result.criterion.kind(),
                    result.criterion.target(),
                    result.headline()
                );
            }
        }
        MissionOutcome::Interrupted {
            task_id,
            attempts,
            snapshot,
        } => {
            println!("run: task={task_id} outcome=interrupted attempts={attempts}");
            if snapshot.is_some() {
                println!("run: restore with `loopguard rollback --task {task_id}`");
            }
        }
    }
}

/// Run the verification engine once and print the report as JSON.
pub fn verify(ws: &Workspace, contract_path: &Path) -> Result<i32> {
    let config = ws.config()?;
    let contract = load_contract(&ws.resolve_path(contract_path))?;
    contract.validate()?;
    let settings = VerificationSettings::from_config(&config)?;
    let ctx = EvalContext {
        workdir: &ws.dir,
        baseline: None,
        settings: &settings,
    };
    let report = verification::run(&contract, &ctx);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(if report.passed {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

pub fn history(ws: &Workspace, task: Option<&str>, json: bool) -> Result<i32> {
    let config = ws.config()?;
    let memory = ws.memory(&config)?;
    let records = match task {
        Some(task) => memory.records_for(task)?,
        None => memory.records()?,
    };
    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record).context("serialize record")?);
        }
    } else {
        print!("{}", render_history(&records));
    }
    Ok(exit_codes::OK)
}

pub fn lessons(ws: &Workspace, class: FailureClass, limit: usize) -> Result<i32> {
    let config = ws.config()?;
    let memory = ws.memory(&config)?;
    let lessons = memory.retrieve_lessons(class, &DiagnosticSignature::default(), limit)?;
    print!("{}", render_lessons(&lessons));
    Ok(exit_codes::OK)
}

/// Restore the snapshot stored on the task's latest record that has one.
pub fn rollback(ws: &Workspace, task: &str) -> Result<i32> {
    let config = ws.config()?;
    let memory = ws.memory(&config)?;
    let snapshot = memory
        .latest_snapshot(task)?
        .ok_or_else(|| anyhow!("no snapshot recorded for task {task}"))?;
    debug!(head = %snapshot.head, tree = %snapshot.tree, "restoring");
    RollbackManager::new(&ws.dir, config.state_dir.clone()).restore(&snapshot)?;
    info!(task, "rolled back");
    println!(
        "rollback: task={task} head={} taken_at={}",
        snapshot.head, snapshot.created_at
    );
    Ok(exit_codes::OK)
}

pub fn doctor(ws: &Workspace) -> Result<i32> {
    let checks = diagnose(&ws.dir, &ws.config_path);
    print!("{}", render_checks(&checks));
    Ok(if healthy(&checks) {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

