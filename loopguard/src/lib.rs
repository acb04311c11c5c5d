//! Verification and recovery loop for coding-agent runs.
//!
//! A mission plans a contract of machine-checkable success criteria, runs an
//! agent against it, verifies the result, and on failure classifies what went
//! wrong, rolls the working tree back, and re-plans with lessons from past
//! failures. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (criteria, classification,
//!   lesson ranking, recovery directives, the lifecycle state machine).
//! - **[`io`]**: Side-effecting operations (filesystem, git, subprocesses,
//!   history persistence). Isolated behind traits to enable fakes in tests.
//!
//! [`controller`] coordinates the two; [`cli`], [`history`] and [`doctor`]
//! implement the CLI commands.

pub mod cancel;
pub mod cli;
pub mod controller;
pub mod core;
pub mod doctor;
pub mod exit_codes;
pub mod history;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
