use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointEntry};
use crate::error::{EXIT_ABORTED, EXIT_COMPLETED, RolloutError};
use crate::version::Version;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    NonZeroExit { code: i32 },
    Timeout { after_ms: u64 },
    Cancelled,
    Spawn { message: String },
    Action { message: String },
    /// A non-idempotent step started in an earlier run and never recorded a result.
    Interrupted,
}

impl FailureReason {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    /// The subprocess error kind behind this failure, if it has one.
    pub fn to_error(&self) -> Option<RolloutError> {
        match self {
            Self::NonZeroExit { code } => Some(RolloutError::NonZeroExit { code: *code }),
            Self::Timeout { after_ms } => Some(RolloutError::Timeout {
                after: Duration::from_millis(*after_ms),
            }),
            Self::Cancelled => Some(RolloutError::Cancelled),
            Self::Spawn { .. } | Self::Action { .. } | Self::Interrupted => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit { code } => write!(f, "exited with code {code}"),
            Self::Timeout { after_ms } => write!(
                f,
                "timed out after {}",
                humantime::format_duration(Duration::from_millis(*after_ms))
            ),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Spawn { message } => write!(f, "failed to start: {message}"),
            Self::Action { message } => f.write_str(message),
            Self::Interrupted => f.write_str(
                "interrupted during an earlier run; outcome unknown (re-run with --force to repeat it)",
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure(FailureReason),
    /// Returned by an action that found nothing to do. The engine never
    /// produces it; steps passed over on resume keep their earlier record.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub outcome: StepOutcome,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success() -> Self {
        Self::with_outcome(StepOutcome::Success)
    }

    pub fn failure(reason: FailureReason) -> Self {
        Self::with_outcome(StepOutcome::Failure(reason))
    }

    fn with_outcome(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success)
    }

    /// Last `lines` lines of stdout followed by stderr.
    pub fn output_tail(&self, lines: usize) -> String {
        let combined: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .collect();
        let start = combined.len().saturating_sub(lines);
        combined[start..].join("\n")
    }
}

/// A step's final result as it appears in receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        version: Version,
        artifacts: Vec<PathBuf>,
    },
    Aborted {
        step: String,
        reason: FailureReason,
        output_tail: String,
        /// Checkpoint entries left on disk for `resume`.
        checkpoint: Vec<CheckpointEntry>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Process exit code the CLI reports for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed { .. } => EXIT_COMPLETED,
            Self::Aborted { reason, .. } => reason
                .to_error()
                .map_or(EXIT_ABORTED, |e| e.exit_code()),
        }
    }
}

/// Run-scoped state shared by the steps of one execution.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub version: Version,
    pub environment: String,
    pub artifacts: Vec<PathBuf>,
    pub checkpoint: Checkpoint,
}

impl WorkflowContext {
    pub fn new(version: Version, environment: impl Into<String>, checkpoint: Checkpoint) -> Self {
        Self {
            version,
            environment: environment.into(),
            artifacts: Vec::new(),
            checkpoint,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_version: String,
    pub goal: String,
    pub plan_id: String,
    pub environment: String,
    pub version: Version,
    pub artifacts: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}
