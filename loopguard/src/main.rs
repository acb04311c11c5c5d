//! `loopguard` command-line entry point.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use loopguard::cli::{self, RunOptions, Workspace};
use loopguard::core::types::FailureClass;
use loopguard::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "loopguard",
    version,
    about = "Verification and recovery loop for coding-agent runs"
)]
struct Cli {
    /// Working directory the agent operates on (default: current directory).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Config file (default: <dir>/.loopguard/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log mission progress to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.loopguard/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Drive a mission until it succeeds, fails or is interrupted.
    Run {
        /// What the agent should achieve.
        #[arg(long)]
        goal: Option<String>,
        /// Fixed contract file (JSON or TOML) instead of a reasoner.
        #[arg(long, conflicts_with = "reasoner_cmd")]
        contract: Option<PathBuf>,
        /// Shell command acting as the reasoner.
        #[arg(long)]
        reasoner_cmd: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Cumulative dollar budget.
        #[arg(long)]
        budget: Option<f64>,
        /// Keep the agent's changes after a failed attempt.
        #[arg(long)]
        no_rollback: bool,
        /// Reuse a task id instead of generating one.
        #[arg(long)]
        task_id: Option<String>,
        /// Agent profile (built-in, ~/.loopguard/agents.toml or [agents] in config).
        #[arg(long)]
        agent: Option<String>,
        /// Plan and audit, then print the agent instruction without running it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Evaluate a contract against the working tree and print the report.
    Verify {
        #[arg(long)]
        contract: PathBuf,
    },
    /// Show mission records.
    History {
        #[arg(long)]
        task: Option<String>,
        /// One JSON record per line.
        #[arg(long)]
        json: bool,
    },
    /// Show stored lessons for a failure class, most relevant first.
    Lessons {
        #[arg(long)]
        class: FailureClass,
        #[arg(long, default_value_t = 3)]
        limit: usize,
    },
    /// Restore the working tree to the task's latest recorded snapshot.
    Rollback {
        #[arg(long)]
        task: String,
    },
    /// Check git, the agent command, config and history.
    Doctor,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let ws = Workspace::resolve(cli.dir, cli.config)?;
    match cli.command {
        Command::Init { force } => cli::init(&ws, force),
        Command::Run {
            goal,
            contract,
            reasoner_cmd,
            model,
            max_retries,
            budget,
            no_rollback,
            task_id,
            agent,
            dry_run,
        } => cli::run(
            &ws,
            RunOptions {
                goal,
                contract,
                reasoner_cmd,
                model,
                max_retries,
                budget,
                no_rollback,
                task_id,
                agent,
                dry_run,
            },
        ),
        Command::Verify { contract } => cli::verify(&ws, &contract),
        Command::History { task, json } => cli::history(&ws, task.as_deref(), json),
        Command::Lessons { class, limit } => cli::lessons(&ws, class, limit),
        Command::Rollback { task } => cli::rollback(&ws, &task),
        Command::Doctor => cli::doctor(&ws),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_contract() {
        let cli = Cli::parse_from([
            "loopguard",
            "run",
            "--contract",
            "mission.json",
            "--max-retries",
            "4",
            "--no-rollback",
        ]);
        let Command::Run {
            contract,
            max_retries,
            no_rollback,
            goal,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(contract, Some(PathBuf::from("mission.json")));
        assert_eq!(max_retries, Some(4));
        assert!(no_rollback);
        assert!(goal.is_none());
    }

    #[test]
    fn contract_and_reasoner_conflict() {
        let parsed = Cli::try_parse_from([
            "loopguard",
            "run",
            "--contract",
            "a.json",
            "--reasoner-cmd",
            "plan",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_lessons_class_case_insensitively() {
        let cli = Cli::parse_from(["loopguard", "--dir", "/tmp/x", "lessons", "--class", "tooling"]);
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(
            cli.command,
            Command::Lessons {
                class: FailureClass::Tooling,
                limit: 3
            }
        ));
    }

    #[test]
    fn parse_run_with_agent_and_dry_run() {
        let cli = Cli::parse_from(["loopguard", "run", "--goal", "g", "--agent", "aider", "--dry-run"]);
        let Command::Run { agent, dry_run, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(agent.as_deref(), Some("aider"));
        assert!(dry_run);
    }
}
