//! Mission state machine.
//!
//! ```text
//! PLANNING -> AUDITING -> EXECUTING -> VERIFYING -> SUCCEEDED
//!    ^            |                        |
//!    |  rejected  |                        v
//!    +------------+<------------------ RECOVERING -> FAILED
//! ```
//!
//! Any non-terminal phase may also end in INTERRUPTED. The controller drives
//! transitions through [`Lifecycle::advance`], which refuses edges that are
//! not in the diagram, and consults the pure decision helpers below at the
//! two branching points.

use std::fmt;

use thiserror::Error;

use crate::core::budget::CostLedger;
use crate::core::types::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Planning,
    Auditing,
    Executing,
    Verifying,
    Recovering,
    Succeeded,
    Failed,
    Interrupted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed | Phase::Interrupted)
    }

    fn allows(self, next: Phase) -> bool {
        if next == Phase::Interrupted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Phase::Planning, Phase::Auditing)
                | (Phase::Planning, Phase::Failed)
                | (Phase::Auditing, Phase::Planning)
                | (Phase::Auditing, Phase::Executing)
                | (Phase::Auditing, Phase::Failed)
                | (Phase::Executing, Phase::Verifying)
                | (Phase::Verifying, Phase::Succeeded)
                | (Phase::Verifying, Phase::Recovering)
                | (Phase::Recovering, Phase::Planning)
                | (Phase::Recovering, Phase::Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Planning => "PLANNING",
            Phase::Auditing => "AUDITING",
            Phase::Executing => "EXECUTING",
            Phase::Verifying => "VERIFYING",
            Phase::Recovering => "RECOVERING",
            Phase::Succeeded => "SUCCEEDED",
            Phase::Failed => "FAILED",
            Phase::Interrupted => "INTERRUPTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Current phase plus the transition history.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: Phase,
    history: Vec<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Planning,
            history: vec![Phase::Planning],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), TransitionError> {
        if !self.phase.allows(next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

/// Decision taken in RECOVERING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Replan,
    Stop(StopReason),
}

/// Decide whether a failed attempt may be followed by another.
///
/// `attempts` counts executed attempts including the one that just failed; a
/// retry bound of N permits at most N+1 attempts. Budget exhaustion takes
/// precedence when both limits are hit.
pub fn after_failure(attempts: u32, max_retries: u32, ledger: &CostLedger) -> RecoveryDecision {
    if ledger.exhausted() {
        return RecoveryDecision::Stop(StopReason::BudgetExhausted);
    }
    if attempts > max_retries {
        return RecoveryDecision::Stop(StopReason::RetriesExhausted);
    }
    RecoveryDecision::Replan
}

/// Gate checked on every entry into PLANNING and before an accepted contract
/// is executed: planning calls cost money too.
pub fn budget_gate(ledger: &CostLedger) -> RecoveryDecision {
    if ledger.exhausted() {
        return RecoveryDecision::Stop(StopReason::BudgetExhausted);
    }
    RecoveryDecision::Replan
}

/// Decide what happens after AUDITING refuses a contract or planning errors.
///
/// Refusals do not consume retries but are bounded separately.
pub fn after_rejection(rejections: u32, max_rejections: u32, reason: StopReason) -> RecoveryDecision {
    if rejections > max_rejections {
        return RecoveryDecision::Stop(reason);
    }
    RecoveryDecision::Replan
}
