//! Verification engine: evaluates a contract's full criteria set.

use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::core::contract::MissionContract;
use crate::core::types::VerificationReport;
use crate::io::evaluator::{EvalContext, evaluate};

/// Evaluate every criterion in order. Later criteria still run after an
/// earlier one fails, so the report always describes the whole contract.
#[instrument(skip_all, fields(criteria = contract.criteria.len()))]
pub fn run(contract: &MissionContract, ctx: &EvalContext<'_>) -> VerificationReport {
    let started = Instant::now();
    let mut results = Vec::with_capacity(contract.criteria.len());
    for criterion in &contract.criteria {
        let result = evaluate(criterion, ctx);
        if result.passed {
            info!(kind = %criterion.kind(), target = %criterion.target(), "criterion passed");
        } else {
            warn!(
                kind = %criterion.kind(),
                target = %criterion.target(),
                diagnostic = %result.headline(),
                "criterion failed"
            );
        }
        results.push(result);
    }
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let report = VerificationReport::from_results(results, duration_ms);
    info!(
        passed = report.passed,
        failed = report.failed_count(),
        duration_ms,
        "verification finished"
    );
    report
}
