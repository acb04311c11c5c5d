//! Content-hash listing of the working tree.
//!
//! Captured before each attempt and compared afterwards by the
//! `no_new_files` and `no_clobber` criteria.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

/// Relative path (forward slashes) to SHA-256 hex digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBaseline {
    pub files: BTreeMap<String, String>,
}

/// Compile glob strings, reporting the first invalid one.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| Pattern::new(raw).with_context(|| format!("invalid glob '{raw}'")))
        .collect()
}

/// True if `path` (or a directory containing it) matches any pattern.
pub fn is_excluded(path: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches(path)
            || pattern
                .as_str()
                .strip_suffix("/**")
                .is_some_and(|dir| path == dir || path.starts_with(&format!("{dir}/")))
    })
}

impl TreeBaseline {
    /// Hash every file under `root`, skipping `.git` and excluded paths.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn capture(root: &Path, exclude: &[Pattern]) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry.file_type().is_dir() && entry.file_name() == ".git" {
                    return false;
                }
                relative(root, entry.path()).is_none_or(|rel| !is_excluded(&rel, exclude))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(rel) = relative(root, entry.path()) else {
                continue;
            };
            let digest = if entry.file_type().is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("read link {}", entry.path().display()))?;
                hash_bytes(target.to_string_lossy().as_bytes())
            } else {
                file_sha256(entry.path())?
            };
            files.insert(rel, digest);
        }
        debug!(file_count = files.len(), "captured tree baseline");
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths in `current` that were not in this baseline.
    pub fn new_files<'a>(&self, current: &'a TreeBaseline) -> Vec<&'a str> {
        current
            .files
            .keys()
            .filter(|path| !self.files.contains_key(*path))
            .map(String::as_str)
            .collect()
    }

    /// Baseline paths matching `protected` whose content changed or that were
    /// removed, with a short reason each.
    pub fn clobbered(&self, current: &TreeBaseline, protected: &[Pattern]) -> Vec<(String, &'static str)> {
        self.files
            .iter()
            .filter(|(path, _)| is_excluded(path, protected))
            .filter_map(|(path, digest)| match current.files.get(path) {
                None => Some((path.clone(), "deleted")),
                Some(now) if now != digest => Some((path.clone(), "modified")),
                Some(_) => None,
            })
            .collect()
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// SHA-256 hex digest of a file, streamed.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
