//! Side-effecting operations: filesystem, git, subprocesses, persistence.

pub mod agents;
pub mod baseline;
pub mod config;
pub mod context;
pub mod evaluator;
pub mod executor;
pub mod git;
pub mod instruction;
pub mod memory;
pub mod preflight;
pub mod process;
pub mod reasoner;
pub mod rollback;
pub mod verification;
