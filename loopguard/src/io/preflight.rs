//! Cheap environment checks run while auditing a contract, before anything
//! is executed.
//!
//! A contract whose checks can never pass in this environment is refused up
//! front: a command criterion naming a program that is not on PATH, or a path
//! criterion whose parent is an existing regular file.

use std::path::{Component, Path};

use crate::core::contract::MissionContract;
use crate::core::criteria::Criterion;
use crate::io::process::find_executable;

/// Problems that make `contract` unsatisfiable in `workdir`, one per
/// offending criterion. Empty when the contract may proceed.
pub fn preflight(
    contract: &MissionContract,
    workdir: &Path,
    coverage_command: &[String],
) -> Vec<String> {
    let mut problems = Vec::new();
    for criterion in &contract.criteria {
        let problem = match criterion {
            Criterion::Command { cmd, .. } => missing_program(cmd),
            Criterion::Coverage { cmd, .. } => {
                missing_program(cmd.as_deref().unwrap_or(coverage_command))
            }
            Criterion::Exists { path }
            | Criterion::Contains { path, .. }
            | Criterion::NotContains { path, .. } => blocked_parent(workdir, path),
            Criterion::Eval { .. } | Criterion::NoNewFiles { .. } | Criterion::NoClobber { .. } => {
                None
            }
        };
        if let Some(problem) = problem {
            problems.push(format!("{} `{}`: {problem}", criterion.kind(), criterion.target()));
        }
    }
    problems
}

/// Only bare program names are looked up; anything with a path separator may
/// be created by the agent.
fn missing_program(argv: &[String]) -> Option<String> {
    let program = argv.first()?;
    if Path::new(program).components().count() > 1 {
        return None;
    }
    find_executable(program)
        .is_none()
        .then(|| format!("`{program}` is not installed (not found on PATH)"))
}

fn blocked_parent(workdir: &Path, rel: &str) -> Option<String> {
    let mut current = workdir.to_path_buf();
    let components: Vec<Component<'_>> = Path::new(rel).components().collect();
    let parents = components.len().saturating_sub(1);
    for component in &components[..parents] {
        let Component::Normal(name) = component else {
            continue;
        };
        current.push(name);
        if current.is_file() {
            return Some(format!("`{}` is a file, not a directory", current.display()));
        }
        if !current.exists() {
            // The agent may create the rest.
            return None;
        }
    }
    None
}
