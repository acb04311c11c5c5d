//! Mission contracts: the directive one attempt is executed against.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::criteria::{Criterion, CriterionKind};
use crate::core::types::FailureClass;

/// Per-attempt limits declared by the directive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

/// One ordered checklist step. Plain strings deserialize as untagged items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChecklistRepr")]
pub struct ChecklistItem {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureClass>,
}

impl ChecklistItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category: None,
        }
    }

    pub fn tagged(text: impl Into<String>, category: FailureClass) -> Self {
        Self {
            text: text.into(),
            category: Some(category),
        }
    }

    /// Ordering rank: infrastructure items first, ambiguity last.
    pub fn rank(&self) -> u8 {
        match self.category {
            Some(FailureClass::Tooling) => 0,
            Some(FailureClass::Environment) => 1,
            None | Some(FailureClass::Logic) => 2,
            Some(FailureClass::Ambiguity) => 3,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChecklistRepr {
    Text(String),
    Item {
        text: String,
        #[serde(default)]
        category: Option<FailureClass>,
    },
}

impl From<ChecklistRepr> for ChecklistItem {
    fn from(repr: ChecklistRepr) -> Self {
        match repr {
            ChecklistRepr::Text(text) => ChecklistItem::new(text),
            ChecklistRepr::Item { text, category } => ChecklistItem { text, category },
        }
    }
}

/// Structured directive for one attempt.
///
/// The controller clones the contract into each attempt; nothing mutates it
/// once it is handed to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionContract {
    pub summary: String,
    pub objectives: Vec<String>,
    pub non_goals: Vec<String>,
    pub forbidden_actions: Vec<String>,
    pub checklist: Vec<ChecklistItem>,
    pub criteria: Vec<Criterion>,
    pub budget: Budget,
}

/// Why a contract was refused before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("contract has no success criteria")]
    NoCriteria,
    #[error("criterion #{index} ({kind}) is malformed: {reason}")]
    InvalidCriterion {
        index: usize,
        kind: CriterionKind,
        reason: String,
    },
    #[error("budget.{field} must be positive")]
    InvalidBudget { field: &'static str },
}

impl MissionContract {
    /// Well-formedness gate applied during auditing.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.criteria.is_empty() {
            return Err(ContractError::NoCriteria);
        }
        for (index, criterion) in self.criteria.iter().enumerate() {
            if let Err(err) = criterion.validate() {
                return Err(ContractError::InvalidCriterion {
                    index,
                    kind: criterion.kind(),
                    reason: format!("{err:#}"),
                });
            }
        }
        if self.budget.max_cost.is_some_and(|cost| !cost.is_finite() || cost <= 0.0) {
            return Err(ContractError::InvalidBudget { field: "max_cost" });
        }
        if self.budget.max_duration_secs == Some(0) {
            return Err(ContractError::InvalidBudget {
                field: "max_duration_secs",
            });
        }
        Ok(())
    }

    /// Append guardrail criteria that are not already present.
    pub fn with_guardrails(mut self, guardrails: &[Criterion]) -> Self {
        for guardrail in guardrails {
            if !self.criteria.contains(guardrail) {
                self.criteria.push(guardrail.clone());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exists(path: &str) -> Criterion {
        Criterion::Exists {
            path: path.to_string(),
        }
    }

    #[test]
    fn checklist_accepts_plain_strings_and_tagged_items() {
        let raw = r#"{
            "objectives": ["add parser"],
            "checklist": ["write tests", {"text": "install pytest", "category": "tooling"}],
            "criteria": [{"kind": "exists", "path": "parser.py"}]
        }"#;
        let contract: MissionContract = serde_json::from_str(raw).expect("parse");
        assert_eq!(contract.checklist[0], ChecklistItem::new("write tests"));
        assert_eq!(
            contract.checklist[1],
            ChecklistItem::tagged("install pytest", FailureClass::Tooling)
        );
        assert!(contract.validate().is_ok());
    }

    #[test]
    fn empty_criteria_is_rejected() {
        let contract = MissionContract {
            objectives: vec!["do a thing".to_string()],
            ..MissionContract::default()
        };
        assert_eq!(contract.validate(), Err(ContractError::NoCriteria));
    }

    #[test]
    fn malformed_criterion_reports_index() {
        let contract = MissionContract {
            criteria: vec![
                exists("a"),
                Criterion::Contains {
                    path: "b".to_string(),
                    pattern: "[".to_string(),
                },
            ],
            ..MissionContract::default()
        };
        let err = contract.validate().unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidCriterion {
                index: 1,
                kind: CriterionKind::Contains,
                ..
            }
        ));
    }

    #[test]
    fn non_positive_budget_is_rejected() {
        let contract = MissionContract {
            criteria: vec![exists("a")],
            budget: Budget {
                max_cost: Some(0.0),
                max_duration_secs: None,
            },
            ..MissionContract::default()
        };
        assert_eq!(
            contract.validate(),
            Err(ContractError::InvalidBudget { field: "max_cost" })
        );
    }

    #[test]
    fn guardrails_are_added_once() {
        let guard = Criterion::NoClobber {
            paths: vec!["Cargo.lock".to_string()],
        };
        let contract = MissionContract {
            criteria: vec![exists("a")],
            ..MissionContract::default()
        }
        .with_guardrails(std::slice::from_ref(&guard))
        .with_guardrails(std::slice::from_ref(&guard));
        assert_eq!(contract.criteria, vec![exists("a"), guard]);
    }
}
