//! Named agent commands.
//!
//! Profiles are layered: built-ins first, then the user's global file
//! (`~/.loopguard/agents.toml`), then the `[agents]` table of the project
//! config. A later layer replaces an earlier profile of the same name.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent argv. `{model}` in any argument is replaced by the model name.
    pub command: Vec<String>,
}

impl AgentProfile {
    fn new(argv: &[&str]) -> Self {
        Self {
            command: argv.iter().map(ToString::to_string).collect(),
        }
    }
}

pub fn builtin_agents() -> BTreeMap<String, AgentProfile> {
    BTreeMap::from([
        (
            "gemini-cli".to_string(),
            AgentProfile::new(&["npx", "@google/gemini-cli", "--yolo", "--model", "{model}"]),
        ),
        ("qwen".to_string(), AgentProfile::new(&["qwen"])),
        ("aider".to_string(), AgentProfile::new(&["aider", "--architect"])),
    ])
}

/// `~/.loopguard/agents.toml`, if a home directory is known.
pub fn global_agents_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".loopguard").join("agents.toml"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistry {
    profiles: BTreeMap<String, AgentProfile>,
}

impl AgentRegistry {
    /// Built-ins, overlaid by `global` (skipped with a warning when
    /// unreadable) and then by `local`.
    pub fn load(global: Option<&Path>, local: &BTreeMap<String, AgentProfile>) -> Self {
        let mut profiles = builtin_agents();
        if let Some(path) = global.filter(|path| path.exists()) {
            match read_profiles(path) {
                Ok(global) => {
                    debug!(path = %path.display(), count = global.len(), "global agents loaded");
                    profiles.extend(global);
                }
                Err(err) => {
                    let err = format!("{err:#}");
                    warn!(path = %path.display(), err = %err, "ignoring agents file");
                }
            }
        }
        profiles.extend(local.iter().map(|(name, profile)| (name.clone(), profile.clone())));
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

fn read_profiles(path: &Path) -> Result<BTreeMap<String, AgentProfile>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let profiles: BTreeMap<String, AgentProfile> =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if let Some((name, _)) = profiles.iter().find(|(_, profile)| profile.command.is_empty()) {
        bail!("agent {name} has an empty command");
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_available_without_any_file() {
        let registry = AgentRegistry::load(None, &BTreeMap::new());
        assert_eq!(registry.names(), ["aider", "gemini-cli", "qwen"]);
        assert_eq!(registry.get("qwen").expect("qwen").command, ["qwen"]);
    }

    #[test]
    fn local_overrides_global_which_overrides_builtins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let global = temp.path().join("agents.toml");
        fs::write(
            &global,
            "[qwen]\ncommand = [\"qwen\", \"--yolo\"]\n\n[codex]\ncommand = [\"codex\", \"exec\"]\n",
        )
        .expect("write");
        let local = BTreeMap::from([(
            "codex".to_string(),
            AgentProfile::new(&["codex", "--full-auto"]),
        )]);

        let registry = AgentRegistry::load(Some(global.as_path()), &local);
        assert_eq!(registry.get("qwen").expect("qwen").command, ["qwen", "--yolo"]);
        assert_eq!(registry.get("codex").expect("codex").command, ["codex", "--full-auto"]);
        assert!(registry.get("aider").is_some());
    }

    #[test]
    fn broken_global_file_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let global = temp.path().join("agents.toml");
        fs::write(&global, "[qwen\ncommand = 3\n").expect("write");
        let registry = AgentRegistry::load(Some(global.as_path()), &BTreeMap::new());
        assert_eq!(registry, AgentRegistry::load(None, &BTreeMap::new()));
    }
}
