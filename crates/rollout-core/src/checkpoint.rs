//! Resumable progress log.
//!
//! The checkpoint is a JSONL file in the state directory. The first line is a
//! `run` header naming the goal and plan; every following line is a step
//! entry. Each entry is appended with a single write followed by an fsync, so
//! after an abrupt termination the file holds complete entries plus at most
//! one truncated trailing line, which loading ignores.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RolloutError};
use crate::state::atomic_write;
use crate::types::{StepRecord, StepResult};

/// Default checkpoint file name
pub const CHECKPOINT_FILE: &str = "checkpoint.jsonl";

/// Get the checkpoint file path for a state directory
pub fn checkpoint_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CHECKPOINT_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEntry {
    Run {
        goal: String,
        plan_id: String,
        at: DateTime<Utc>,
    },
    Started {
        step: String,
        at: DateTime<Utc>,
    },
    Finished {
        step: String,
        result: StepResult,
        at: DateTime<Utc>,
    },
}

impl CheckpointEntry {
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Run { .. } => None,
            Self::Started { step, .. } | Self::Finished { step, .. } => Some(step),
        }
    }
}

/// Latest recorded state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus<'a> {
    /// Started but never finished (the run died mid-step).
    Started,
    Finished(&'a StepResult),
}

/// In-memory view of a run's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub goal: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    pub fn new(goal: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            plan_id: plan_id.into(),
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    fn header(&self) -> CheckpointEntry {
        CheckpointEntry::Run {
            goal: self.goal.clone(),
            plan_id: self.plan_id.clone(),
            at: self.created_at,
        }
    }

    /// Step entries, oldest first.
    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.entries
    }

    /// Header followed by step entries, as persisted on disk.
    pub fn all_entries(&self) -> Vec<CheckpointEntry> {
        std::iter::once(self.header())
            .chain(self.entries.iter().cloned())
            .collect()
    }

    pub fn push(&mut self, entry: CheckpointEntry) {
        self.entries.push(entry);
    }

    pub fn status(&self, step: &str) -> Option<StepStatus<'_>> {
        self.entries.iter().rev().find_map(|e| match e {
            CheckpointEntry::Started { step: s, .. } if s == step => Some(StepStatus::Started),
            CheckpointEntry::Finished { step: s, result, .. } if s == step => {
                Some(StepStatus::Finished(result))
            }
            _ => None,
        })
    }

    pub fn succeeded(&self, step: &str) -> bool {
        matches!(self.status(step), Some(StepStatus::Finished(r)) if r.is_success())
    }

    /// Latest finished result per step, in first-seen order.
    pub fn records(&self) -> Vec<StepRecord> {
        let mut out: Vec<StepRecord> = Vec::new();
        for entry in &self.entries {
            if let CheckpointEntry::Finished { step, result, .. } = entry {
                match out.iter_mut().find(|r| &r.step == step) {
                    Some(existing) => existing.result = result.clone(),
                    None => out.push(StepRecord {
                        step: step.clone(),
                        result: result.clone(),
                    }),
                }
            }
        }
        out
    }
}

/// File-backed checkpoint log.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    state_dir: PathBuf,
    path: PathBuf,
}

impl CheckpointLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            path: checkpoint_path(state_dir),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the pending checkpoint, if any.
    ///
    /// Returns `Ok(None)` when the file is missing or its header never made
    /// it to disk.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read checkpoint {}", self.path.display()))
                    .into());
            }
        };

        let entries = parse_entries(&self.path, &content)?;
        let mut iter = entries.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        let CheckpointEntry::Run { goal, plan_id, at } = first else {
            return Err(RolloutError::Malformed {
                path: self.path.clone(),
                message: "first checkpoint entry is not a run header".to_string(),
            });
        };

        Ok(Some(Checkpoint {
            goal,
            plan_id,
            created_at: at,
            entries: iter.collect(),
        }))
    }

    /// Write `checkpoint` as the whole log, replacing any previous file.
    ///
    /// The replacement is atomic, which also drops a truncated trailing
    /// entry before new entries are appended after it.
    pub fn start(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("failed to create state dir {}", self.state_dir.display()))?;

        let mut data = Vec::new();
        for entry in checkpoint.all_entries() {
            data.extend_from_slice(&encode_line(&entry)?);
        }
        atomic_write(&self.path, &data)?;
        Ok(())
    }

    pub fn append(&self, entry: &CheckpointEntry) -> Result<()> {
        let line = encode_line(entry)?;
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open checkpoint {}", self.path.display()))?;
        f.write_all(&line)
            .with_context(|| format!("failed to append to checkpoint {}", self.path.display()))?;
        f.sync_data()
            .with_context(|| format!("failed to sync checkpoint {}", self.path.display()))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to remove checkpoint {}", self.path.display()))
                .into()),
        }
    }
}

fn encode_line(entry: &CheckpointEntry) -> anyhow::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(entry).context("failed to serialize checkpoint entry")?;
    line.push(b'\n');
    Ok(line)
}

fn parse_entries(path: &Path, content: &str) -> Result<Vec<CheckpointEntry>> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        let is_last = idx + 1 == lines.len();
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) => {
                // A trailing line without its newline was cut off mid-append.
                if is_last && !complete {
                    break;
                }
                entries.push(entry);
            }
            Err(_) if is_last => break,
            Err(e) => {
                return Err(RolloutError::Malformed {
                    path: path.to_path_buf(),
                    message: format!("checkpoint line {} is corrupt: {e}", idx + 1),
                });
            }
        }
    }

    Ok(entries)
}
