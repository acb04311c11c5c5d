//! Recovery directives: the next contract after a failed attempt.
//!
//! The recovery contract keeps the original criteria, forbidden actions and
//! budget, narrows objectives to what failed, forbids repeating known
//! mistakes, and orders the checklist so infrastructure problems
//! (TOOLING, ENVIRONMENT) are resolved before logic work.

use std::collections::BTreeSet;

use crate::core::classifier::extract_signals;
use crate::core::contract::{ChecklistItem, MissionContract};
use crate::core::lessons::{Lesson, failure_text, remediation_steps};
use crate::core::types::{FailureClass, VerificationReport};

/// Build the contract for the next attempt. `exit_code` and `stderr` are the
/// agent's; remediation steps draw on them as well as on the report.
pub fn build_recovery_directive(
    original: &MissionContract,
    report: &VerificationReport,
    exit_code: Option<i32>,
    stderr: &str,
    class: FailureClass,
    lessons: &[Lesson],
) -> MissionContract {
    let mut contract = original.clone();

    contract.summary = if original.summary.is_empty() {
        format!("Recover from a {class} failure")
    } else {
        format!("Recover from a {class} failure: {}", original.summary)
    };

    let narrowed: Vec<String> = report
        .failures()
        .map(|result| {
            format!(
                "Make {} `{}` pass (last result: {})",
                result.criterion.kind(),
                result.criterion.target(),
                result.headline()
            )
        })
        .collect();
    if !narrowed.is_empty() {
        contract.objectives = narrowed;
    }

    for lesson in lessons {
        let non_goal = format!("Do not repeat: {}", lesson.mistake);
        if !contract.non_goals.contains(&non_goal) {
            contract.non_goals.push(non_goal);
        }
    }

    let signals = extract_signals(report, exit_code, stderr);
    let text = failure_text(report, stderr);
    let mut checklist: Vec<ChecklistItem> = remediation_steps(&signals, &text)
        .into_iter()
        .map(|(step_class, step)| ChecklistItem::tagged(step, step_class))
        .collect();
    for lesson in lessons {
        checklist.push(ChecklistItem::tagged(lesson.remediation.clone(), lesson.class));
    }
    for result in report.failures() {
        checklist.push(ChecklistItem::tagged(
            format!(
                "Fix {} `{}`: {}",
                result.criterion.kind(),
                result.criterion.target(),
                result.headline()
            ),
            FailureClass::Logic,
        ));
    }
    checklist.extend(original.checklist.iter().cloned());

    let mut seen = BTreeSet::new();
    checklist.retain(|item| seen.insert(item.text.clone()));
    // Stable: relative order within a rank is preserved.
    checklist.sort_by_key(ChecklistItem::rank);
    contract.checklist = checklist;

    contract
}
