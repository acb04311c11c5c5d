//! Controller configuration stored under `.loopguard/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::ModelPricing;
use crate::core::lessons::LessonWeights;
use crate::io::agents::AgentProfile;
use crate::io::baseline::compile_patterns;

/// Relative path of the config file inside a working directory.
pub const CONFIG_PATH: &str = ".loopguard/config.toml";

/// Controller configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or a partial
/// file both load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Model name passed to the agent and reasoner, also used for pricing.
    pub model: String,

    /// Retries after the first attempt; N permits N+1 executed attempts.
    pub max_retries: u32,

    /// Contract rejections tolerated before the mission fails.
    pub max_plan_rejections: u32,

    /// Cumulative dollar budget across attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_budget: Option<f64>,

    /// Restore the pre-attempt snapshot after a failed attempt.
    pub rollback: bool,

    /// Globs guarded by an implicit `no_clobber` criterion.
    pub protected_paths: Vec<String>,

    /// Globs ignored by the working tree baseline.
    pub exclude_patterns: Vec<String>,

    /// Tool state directory, relative to the working directory.
    pub state_dir: String,

    /// History file; defaults to `<state_dir>/history.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<String>,

    /// Project rules file; defaults to `<state_dir>/rules.md`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,

    /// Refuse contracts whose checks cannot run here (missing tools,
    /// impossible paths) while auditing.
    pub preflight: bool,

    pub agent: AgentConfig,

    /// Named agent commands selectable with `run --agent`, layered over the
    /// built-in and global profiles.
    pub agents: BTreeMap<String, AgentProfile>,
    pub verification: VerificationConfig,
    pub lessons: LessonsConfig,
    pub reasoner: ReasonerConfig,
    pub context: ContextConfig,

    /// Per-model price overrides.
    pub pricing: BTreeMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv. `{model}` in any argument is replaced by the model name.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Flat cost charged when the agent reports no token usage.
    pub cost_per_attempt: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "npx".to_string(),
                "@google/gemini-cli".to_string(),
                "--yolo".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
            cost_per_attempt: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Default timeout for `command` and `coverage` criteria.
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Used by `coverage` criteria that do not name their own command.
    pub coverage_command: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            coverage_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "coverage run -m pytest -q && coverage report".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LessonsConfig {
    /// Lessons injected into a recovery directive.
    pub limit: usize,
    pub class_weight: f64,
    pub overlap_weight: f64,
}

impl Default for LessonsConfig {
    fn default() -> Self {
        let weights = LessonWeights::default();
        Self {
            limit: 3,
            class_weight: weights.class_weight,
            overlap_weight: weights.overlap_weight,
        }
    }
}

impl LessonsConfig {
    pub fn weights(&self) -> LessonWeights {
        LessonWeights {
            class_weight: self.class_weight,
            overlap_weight: self.overlap_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// External planner argv; empty means a contract file must be given.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Command whose stdout is handed to the reasoner as repository context.
    pub command: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            max_retries: 2,
            max_plan_rejections: 3,
            cost_budget: None,
            rollback: true,
            protected_paths: Vec::new(),
            exclude_patterns: vec![
                ".git/**".to_string(),
                ".loopguard/**".to_string(),
                "target/**".to_string(),
            ],
            state_dir: ".loopguard".to_string(),
            history_path: None,
            rules_path: None,
            preflight: true,
            agent: AgentConfig::default(),
            agents: BTreeMap::new(),
            verification: VerificationConfig::default(),
            lessons: LessonsConfig::default(),
            reasoner: ReasonerConfig::default(),
            context: ContextConfig::default(),
            pricing: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.cost_budget.is_some_and(|budget| !budget.is_finite() || budget <= 0.0) {
            return Err(anyhow!("cost_budget must be > 0"));
        }
        if self.state_dir.trim().is_empty() || Path::new(&self.state_dir).is_absolute() {
            return Err(anyhow!("state_dir must be a non-empty relative path"));
        }
        compile_patterns(&self.protected_paths).context("protected_paths")?;
        compile_patterns(&self.exclude_patterns).context("exclude_patterns")?;

        if self.agent.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if !self.agent.cost_per_attempt.is_finite() || self.agent.cost_per_attempt < 0.0 {
            return Err(anyhow!("agent.cost_per_attempt must be >= 0"));
        }
        for (name, profile) in &self.agents {
            if profile.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!("agents.{name}.command must be a non-empty array"));
            }
        }
        if self.verification.command_timeout_secs == 0 {
            return Err(anyhow!("verification.command_timeout_secs must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        if self.verification.coverage_command.is_empty() {
            return Err(anyhow!("verification.coverage_command must be a non-empty array"));
        }
        for (name, weight) in [
            ("lessons.class_weight", self.lessons.class_weight),
            ("lessons.overlap_weight", self.lessons.overlap_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(anyhow!("{name} must be >= 0"));
            }
        }
        if self.reasoner.timeout_secs == 0 {
            return Err(anyhow!("reasoner.timeout_secs must be > 0"));
        }
        for (model, pricing) in &self.pricing {
            if pricing.input_per_million < 0.0 || pricing.output_per_million < 0.0 {
                return Err(anyhow!("pricing.{model} must not be negative"));
            }
        }
        Ok(())
    }

    /// Absolute state directory for a working directory.
    pub fn state_dir_in(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.state_dir)
    }

    /// Absolute history file for a working directory.
    pub fn history_path_in(&self, workdir: &Path) -> PathBuf {
        match &self.history_path {
            Some(path) => workdir.join(path),
            None => self.state_dir_in(workdir).join("history.jsonl"),
        }
    }

    /// Absolute project rules file for a working directory.
    pub fn rules_path_in(&self, workdir: &Path) -> PathBuf {
        match &self.rules_path {
            Some(path) => workdir.join(path),
            None => self.state_dir_in(workdir).join("rules.md"),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControllerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        let cfg = ControllerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ControllerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
