//! Renders the self-contained instruction handed to the agent.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::contract::{ChecklistItem, MissionContract};

const INSTRUCTION_TEMPLATE: &str = include_str!("prompts/instruction.md");

#[derive(Debug, Serialize)]
struct ChecklistView<'a> {
    text: &'a str,
    category: Option<String>,
}

impl<'a> From<&'a ChecklistItem> for ChecklistView<'a> {
    fn from(item: &'a ChecklistItem) -> Self {
        Self {
            text: &item.text,
            category: item.category.map(|class| class.as_str().to_string()),
        }
    }
}

fn describe_budget(contract: &MissionContract) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(secs) = contract.budget.max_duration_secs {
        parts.push(format!("Finish within {secs} seconds."));
    }
    if let Some(cost) = contract.budget.max_cost {
        parts.push(format!("Spend at most ${cost:.2}."));
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Render `contract` for attempt number `attempt` (1-based), followed by the
/// project rules when there are any.
pub fn render_instruction(
    contract: &MissionContract,
    attempt: u32,
    rules: Option<&str>,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("instruction", INSTRUCTION_TEMPLATE)
        .context("load instruction template")?;
    let template = env.get_template("instruction")?;

    let checklist: Vec<ChecklistView<'_>> = contract.checklist.iter().map(Into::into).collect();
    let checks: Vec<String> = contract
        .criteria
        .iter()
        .map(|criterion| format!("{} `{}`", criterion.kind(), criterion.target()))
        .collect();
    let summary = if contract.summary.trim().is_empty() {
        "Make every check below pass."
    } else {
        contract.summary.trim()
    };
    let rendered = template
        .render(context! {
            attempt => attempt,
            summary => summary,
            objectives => &contract.objectives,
            checklist => checklist,
            non_goals => &contract.non_goals,
            forbidden_actions => &contract.forbidden_actions,
            checks => checks,
            rules => rules.map(str::trim).filter(|text| !text.is_empty()),
            budget => describe_budget(contract),
        })
        .context("render instruction")?;
    Ok(rendered)
}
