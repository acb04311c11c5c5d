//! The reasoning collaborator: produces directives and audits them.
//!
//! Two backends: [`FileReasoner`] serves a fixed contract from disk and
//! accepts everything, [`CommandReasoner`] speaks JSON to an external planner
//! over stdin/stdout. Planner output may be wrapped in prose or markdown
//! fences; the outermost JSON object is extracted and validated against the
//! directive schema before it is deserialized.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::TokenUsage;
use crate::core::contract::MissionContract;
use crate::io::process::{run_command_with_timeout, tail};

const DIRECTIVE_SCHEMA: &str = include_str!("../../schemas/directive.schema.json");

/// Inputs for planning one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub goal: String,
    /// Repository context blob.
    pub context: String,
    pub model: String,
    /// Why the previous contract was refused.
    pub feedback: Option<String>,
    pub attempt: u32,
    /// Project rules the contract must respect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
}

/// A planned contract and what producing it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub contract: MissionContract,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum AuditVerdict {
    Accept,
    Reject { reason: String },
}

pub trait Reasoner {
    fn directive(&self, request: &PlanRequest) -> Result<Directive>;
    fn audit(&self, request: &PlanRequest, contract: &MissionContract) -> Result<AuditVerdict>;
}

/// Serves a contract file (JSON, or TOML by extension).
#[derive(Debug, Clone)]
pub struct FileReasoner {
    path: PathBuf,
}

impl FileReasoner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reasoner for FileReasoner {
    fn directive(&self, _request: &PlanRequest) -> Result<Directive> {
        Ok(Directive {
            contract: load_contract(&self.path)?,
            usage: None,
        })
    }

    fn audit(&self, _request: &PlanRequest, _contract: &MissionContract) -> Result<AuditVerdict> {
        Ok(AuditVerdict::Accept)
    }
}

/// Load and schema-check a contract file.
pub fn load_contract(path: &Path) -> Result<MissionContract> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?,
        _ => serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?,
    };
    contract_from_value(value).with_context(|| format!("invalid contract {}", path.display()))
}

/// Validate a JSON value against the directive schema and deserialize it.
pub fn contract_from_value(value: Value) -> Result<MissionContract> {
    validate_schema(&value)?;
    serde_json::from_value(value).context("deserialize contract")
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(DIRECTIVE_SCHEMA).context("parse directive schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile directive schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Outermost `{...}` span of `text`, ignoring fences and prose around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// External planner. Receives one JSON request on stdin per call:
/// `{"action": "directive" | "audit", "request": {...}, "contract"?: {...}}`.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandReasoner {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
            output_limit_bytes: 1_000_000,
        }
    }

    #[instrument(skip_all, fields(action = %action))]
    fn call(&self, action: &str, payload: &Value) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let input = serde_json::to_vec(payload).context("serialize reasoner request")?;
        let output = run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run reasoner for {action}"))?;
        if output.timed_out {
            bail!("reasoner timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            bail!(
                "reasoner exited with {:?}: {}",
                output.exit_code(),
                tail(stderr.trim(), 500)
            );
        }
        debug!(bytes = output.stdout.len(), "reasoner replied");
        Ok(output.stdout_text())
    }
}

#[derive(Deserialize)]
struct WrappedDirective {
    contract: Value,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

/// Parse planner output: a bare contract or `{"contract": ..., "usage": ...}`.
pub fn parse_directive(text: &str) -> Result<Directive> {
    let span = extract_json_object(text).ok_or_else(|| anyhow!("no JSON object in reasoner output"))?;
    let value: Value = serde_json::from_str(span).context("parse reasoner JSON")?;
    let wrapped = value.get("contract").is_some_and(Value::is_object);
    if wrapped {
        let WrappedDirective { contract, usage } =
            serde_json::from_value(value).context("parse wrapped directive")?;
        return Ok(Directive {
            contract: contract_from_value(contract)?,
            usage,
        });
    }
    Ok(Directive {
        contract: contract_from_value(value)?,
        usage: None,
    })
}

pub fn parse_verdict(text: &str) -> Result<AuditVerdict> {
    let span = extract_json_object(text).ok_or_else(|| anyhow!("no JSON object in audit output"))?;
    serde_json::from_str(span).context("parse audit verdict")
}

impl Reasoner for CommandReasoner {
    fn directive(&self, request: &PlanRequest) -> Result<Directive> {
        let payload = json!({ "action": "directive", "request": request });
        let directive = parse_directive(&self.call("directive", &payload)?)?;
        info!(criteria = directive.contract.criteria.len(), "directive received");
        Ok(directive)
    }

    fn audit(&self, request: &PlanRequest, contract: &MissionContract) -> Result<AuditVerdict> {
        let payload = json!({ "action": "audit", "request": request, "contract": contract });
        let verdict = parse_verdict(&self.call("audit", &payload)?)?;
        if let AuditVerdict::Reject { reason } = &verdict {
            warn!(reason = %reason, "contract rejected by audit");
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::criteria::Criterion;

    fn plan_request() -> PlanRequest {
        PlanRequest {
            goal: "ship it".to_string(),
            context: String::new(),
            model: "m".to_string(),
            feedback: None,
            attempt: 1,
            rules: None,
        }
    }

    #[test]
    fn parses_fenced_directive_with_usage() {
        let text = "Here is the plan:\n```json\n{\"contract\": {\"summary\": \"s\", \"criteria\": [{\"kind\": \"exists\", \"path\": \"a.txt\"}], \"checklist\": [\"one\", {\"text\": \"two\", \"category\": \"tooling\"}]}, \"usage\": {\"input_tokens\": 10, \"output_tokens\": 5}}\n```\nGood luck.";
        let directive = parse_directive(text).expect("parse");
        assert_eq!(
            directive.contract.criteria,
            vec![Criterion::Exists {
                path: "a.txt".to_string()
            }]
        );
        assert_eq!(directive.contract.checklist.len(), 2);
        assert_eq!(
            directive.usage,
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5
            })
        );
    }

    #[test]
    fn rejects_schema_violations() {
        let err = parse_directive(r#"{"criteria": [{"kind": "coverage", "threshold": 150}]}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
        assert!(parse_directive("no json at all").is_err());
    }

    #[test]
    fn parses_verdicts() {
        assert_eq!(parse_verdict(r#"{"verdict":"accept"}"#).expect("parse"), AuditVerdict::Accept);
        assert_eq!(
            parse_verdict("```\n{\"verdict\":\"reject\",\"reason\":\"too vague\"}\n```").expect("parse"),
            AuditVerdict::Reject {
                reason: "too vague".to_string()
            }
        );
    }

    #[test]
    fn file_reasoner_reads_json_and_toml() {
        let temp = tempfile::tempdir().expect("tempdir");
        let json_path = temp.path().join("contract.json");
        fs::write(
            &json_path,
            r#"{"objectives": ["add tests"], "criteria": [{"kind": "command", "cmd": "cargo test"}]}"#,
        )
        .expect("write");
        let contract = FileReasoner::new(&json_path)
            .directive(&plan_request())
            .expect("directive")
            .contract;
        assert_eq!(
            contract.criteria,
            vec![Criterion::Command {
                cmd: vec!["sh".to_string(), "-c".to_string(), "cargo test".to_string()],
                timeout_secs: None,
            }]
        );

        let toml_path = temp.path().join("contract.toml");
        fs::write(
            &toml_path,
            "summary = \"docs\"\n\n[[criteria]]\nkind = \"contains\"\npath = \"README.md\"\npattern = \"Usage\"\n",
        )
        .expect("write");
        let contract = load_contract(&toml_path).expect("load");
        assert_eq!(contract.summary, "docs");
        assert_eq!(contract.criteria.len(), 1);
    }

    #[test]
    fn command_reasoner_round_trips_over_stdio() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"read -r input
case "$input" in
  *'"action":"audit"'*) echo '{"verdict":"reject","reason":"needs tests"}' ;;
  *) echo '{"criteria":[{"kind":"exists","path":"out.txt"}]}' ;;
esac"#;
        let reasoner = CommandReasoner::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            temp.path(),
            Duration::from_secs(10),
        );
        let directive = reasoner.directive(&plan_request()).expect("directive");
        assert_eq!(directive.contract.criteria.len(), 1);
        let verdict = reasoner
            .audit(&plan_request(), &directive.contract)
            .expect("audit");
        assert_eq!(
            verdict,
            AuditVerdict::Reject {
                reason: "needs tests".to_string()
            }
        );
    }

    #[test]
    fn project_rules_reach_the_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"read -r input
case "$input" in
  *'"rules":"No new deps."'*) echo '{"criteria":[{"kind":"exists","path":"ruled.txt"}]}' ;;
  *) echo '{"criteria":[{"kind":"exists","path":"unruled.txt"}]}' ;;
esac"#;
        let reasoner = CommandReasoner::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            temp.path(),
            Duration::from_secs(10),
        );
        let target = |request: &PlanRequest| {
            reasoner.directive(request).expect("directive").contract.criteria[0].target()
        };
        assert_eq!(target(&plan_request()), "unruled.txt");
        let ruled = PlanRequest {
            rules: Some("No new deps.".to_string()),
            ..plan_request()
        };
        assert_eq!(target(&ruled), "ruled.txt");
    }
}
