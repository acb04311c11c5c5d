//! Append-only mission history with lesson retrieval.
//!
//! Records are stored as JSON lines. Each append is a single `write_all` of
//! one complete line on an `O_APPEND` handle, taken under a process-local
//! mutex, so concurrent appends never interleave within the process and a
//! crash can at worst leave one truncated final line, which `open` skips.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::classifier::FailureSignal;
use crate::core::contract::MissionContract;
use crate::core::lessons::{self, DiagnosticSignature, Lesson, LessonWeights};
use crate::core::types::{FailureClass, RecordStatus, StopReason, VerificationReport};
use crate::io::rollback::RepositorySnapshot;

/// One attempt, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRecord {
    pub task_id: String,
    pub attempt: u32,
    /// RFC 3339.
    pub timestamp: String,
    pub model: String,
    /// `None` when planning never produced an accepted contract.
    pub contract: Option<MissionContract>,
    pub report: Option<VerificationReport>,
    pub classification: Option<FailureClass>,
    #[serde(default)]
    pub signals: Vec<FailureSignal>,
    pub lesson: Option<Lesson>,
    pub cost: f64,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub snapshot: Option<RepositorySnapshot>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug)]
struct State {
    records: Vec<MissionRecord>,
    /// The file's last byte is not a newline (a torn write).
    needs_newline: bool,
}

/// Mission history. Injected into the controller; there is no global store.
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
    weights: LessonWeights,
    skipped: usize,
}

impl MemoryStore {
    /// Load history from `path`, creating nothing until the first append.
    ///
    /// Lines that do not parse are skipped with a warning.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        let mut records = Vec::new();
        let mut skipped = 0;
        let mut needs_newline = false;
        if path.exists() {
            // Raw bytes: a torn final line may end inside a UTF-8 sequence.
            let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            needs_newline = contents.last().is_some_and(|byte| *byte != b'\n');
            for (index, line) in contents.split(|byte| *byte == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match parse_line(line) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        skipped += 1;
                        warn!(line = index + 1, err = %err, "skipping malformed history line");
                    }
                }
            }
        }
        debug!(records = records.len(), skipped, "history loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(State {
                records,
                needs_newline,
            }),
            weights: LessonWeights::default(),
            skipped,
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State {
                records: Vec::new(),
                needs_newline: false,
            }),
            weights: LessonWeights::default(),
            skipped: 0,
        }
    }

    pub fn with_weights(mut self, weights: LessonWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Malformed lines skipped by [`MemoryStore::open`].
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("history lock poisoned"))
    }

    /// Persist one record. The only mutation the store offers.
    #[instrument(skip_all, fields(task_id = %record.task_id, attempt = record.attempt, status = %record.status))]
    pub fn append(&self, record: MissionRecord) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(path) = &self.path {
            let mut line = String::new();
            if state.needs_newline {
                line.push('\n');
            }
            line.push_str(&serde_json::to_string(&record).context("serialize history record")?);
            line.push('\n');
            append_line(path, line.as_bytes())?;
            state.needs_newline = false;
        }
        state.records.push(record);
        Ok(())
    }

    /// Every record, in insertion order.
    pub fn records(&self) -> Result<Vec<MissionRecord>> {
        Ok(self.lock()?.records.clone())
    }

    pub fn records_for(&self, task_id: &str) -> Result<Vec<MissionRecord>> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|record| record.task_id == task_id)
            .cloned()
            .collect())
    }

    /// Most recent record of `task_id` carrying a snapshot.
    pub fn latest_snapshot(&self, task_id: &str) -> Result<Option<RepositorySnapshot>> {
        Ok(self
            .lock()?
            .records
            .iter()
            .rev()
            .filter(|record| record.task_id == task_id)
            .find_map(|record| record.snapshot.clone()))
    }

    /// Up to `k` stored lessons most similar to the current failure.
    pub fn retrieve_lessons(
        &self,
        class: FailureClass,
        signature: &DiagnosticSignature,
        k: usize,
    ) -> Result<Vec<Lesson>> {
        let state = self.lock()?;
        let stored = state
            .records
            .iter()
            .filter_map(|record| record.lesson.as_ref());
        Ok(lessons::rank(stored, self.weights, class, signature, k))
    }
}

fn parse_line(line: &[u8]) -> Result<MissionRecord> {
    let text = std::str::from_utf8(line).context("invalid UTF-8")?;
    serde_json::from_str(text).context("invalid record")
}

fn append_line(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create history dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("flush {}", path.display()))
}

/// True if `path` exists and its last byte is not a newline.
pub fn has_torn_tail(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
