//! Repository context handed to the reasoner when planning.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::io::baseline::is_excluded;
use crate::io::process::{run_command_with_timeout, tail};

/// Produces an opaque text blob describing the repository.
pub trait ContextSource {
    fn extract(&self, workdir: &Path) -> Result<String>;
}

/// No context at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

impl ContextSource for NoContext {
    fn extract(&self, _workdir: &Path) -> Result<String> {
        Ok(String::new())
    }
}

/// Runs an external dump tool and uses its stdout.
#[derive(Debug, Clone)]
pub struct CommandContext {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandContext {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl ContextSource for CommandContext {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn extract(&self, workdir: &Path) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("context command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run context command")?;
        if output.timed_out {
            bail!("context command timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "context command exited with {:?}: {}",
                output.exit_code(),
                tail(output.stderr_text().trim(), 500)
            );
        }
        let mut text = output.stdout_text();
        text.push_str(&output.stdout_truncated_notice("context"));
        Ok(text)
    }
}

/// Built-in dump: a file listing followed by the contents of small text
/// files, up to a character budget.
#[derive(Debug, Clone)]
pub struct TreeContext {
    exclude: Vec<Pattern>,
    max_chars: usize,
    max_file_bytes: u64,
}

impl TreeContext {
    pub fn new(exclude: Vec<Pattern>) -> Self {
        Self {
            exclude,
            max_chars: 200_000,
            max_file_bytes: 32 * 1024,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

impl ContextSource for TreeContext {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn extract(&self, workdir: &Path) -> Result<String> {
        let mut files = Vec::new();
        let walker = WalkDir::new(workdir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry.file_name() == ".git" {
                    return false;
                }
                let rel = entry
                    .path()
                    .strip_prefix(workdir)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                !is_excluded(&rel, &self.exclude)
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", workdir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(workdir)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            files.push((rel, entry.path().to_path_buf(), size));
        }

        let mut out = String::from("# Files\n\n");
        for (rel, _, size) in &files {
            out.push_str(&format!("- {rel} ({size} bytes)\n"));
        }
        out.push_str("\n# Contents\n");
        let mut omitted = 0usize;
        for (rel, path, size) in &files {
            if *size > self.max_file_bytes {
                continue;
            }
            let Ok(bytes) = fs::read(path) else {
                continue;
            };
            if bytes.contains(&0) {
                continue;
            }
            let body = String::from_utf8_lossy(&bytes);
            let section = format!("\n## {rel}\n\n```\n{}\n```\n", body.trim_end());
            if out.len() + section.len() > self.max_chars {
                omitted += 1;
                continue;
            }
            out.push_str(&section);
        }
        if omitted > 0 {
            out.push_str(&format!("\n[{omitted} file(s) omitted: context budget reached]\n"));
        }
        debug!(files = files.len(), omitted, chars = out.len(), "tree context built");
        Ok(out)
    }
}

/// Project rules the agent and reasoner must follow. `None` when the file is
/// absent, blank or unreadable.
pub fn load_rules(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => {
            debug!(path = %path.display(), chars = text.len(), "project rules loaded");
            Some(text.trim().to_string())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cannot read project rules; continuing without");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::baseline::compile_patterns;

    #[test]
    fn rules_are_trimmed_and_optional() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rules.md");
        assert_eq!(load_rules(&path), None);
        fs::write(&path, "  \n").expect("write");
        assert_eq!(load_rules(&path), None);
        fs::write(&path, "\n- Use tabs.\n- No new deps.\n\n").expect("write");
        assert_eq!(load_rules(&path).as_deref(), Some("- Use tabs.\n- No new deps."));
        // A directory cannot be read as a file.
        assert_eq!(load_rules(temp.path()), None);
    }

    #[test]
    fn tree_context_lists_files_and_skips_excluded_and_binary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/lib.rs"), "pub fn answer() -> u8 { 42 }\n").expect("write");
        fs::write(root.join("logo.bin"), [0u8, 1, 2, 3]).expect("write");
        fs::create_dir_all(root.join("target")).expect("mkdir");
        fs::write(root.join("target/out"), "built").expect("write");

        let exclude = compile_patterns(&["target/**".to_string()]).expect("globs");
        let text = TreeContext::new(exclude).extract(root).expect("extract");
        assert!(text.contains("- src/lib.rs (29 bytes)"));
        assert!(text.contains("pub fn answer()"));
        assert!(text.contains("- logo.bin (4 bytes)"));
        assert!(!text.contains("target/out"));
        assert!(!text.contains("## logo.bin"));
    }

    #[test]
    fn tree_context_respects_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "a".repeat(500)).expect("write");
        let text = TreeContext::new(Vec::new())
            .with_max_chars(200)
            .extract(temp.path())
            .expect("extract");
        assert!(text.contains("1 file(s) omitted"));
    }

    #[test]
    fn command_context_returns_stdout_or_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ok = CommandContext::new(
            vec!["sh".to_string(), "-c".to_string(), "echo repo summary".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        assert_eq!(ok.extract(temp.path()).expect("extract"), "repo summary\n");

        let failing = CommandContext::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 2".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let err = failing.extract(temp.path()).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(NoContext.extract(temp.path()).expect("extract"), "");
    }
}
