//! Error kinds surfaced by the release engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Process exit code for a run that completed.
pub const EXIT_COMPLETED: u8 = 0;
/// Process exit code for a run that aborted on a failing step.
pub const EXIT_ABORTED: u8 = 1;
/// Process exit code for configuration, graph, and version-file errors.
pub const EXIT_CONFIGURATION: u8 = 2;
/// Process exit code when another run holds the lock.
pub const EXIT_ALREADY_RUNNING: u8 = 3;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("version file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("malformed version in {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("prerequisite cycle detected: {}", steps.join(" -> "))]
    CycleDetected { steps: Vec<String> },

    #[error("unknown step `{step}`{}", referenced_by.as_ref().map(|r| format!(" (required by `{r}`)")).unwrap_or_default())]
    UnknownStep {
        step: String,
        referenced_by: Option<String>,
    },

    #[error("command timed out after {}", humantime::format_duration(*after))]
    Timeout { after: Duration },

    #[error("command exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("another run is in progress (pid {pid} on {hostname} since {since})")]
    AlreadyRunning {
        pid: u32,
        hostname: String,
        since: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("{0:#}")]
    Io(#[from] anyhow::Error),
}

impl RolloutError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning { .. } => EXIT_ALREADY_RUNNING,
            Self::Timeout { .. } | Self::NonZeroExit { .. } | Self::Cancelled | Self::Io(_) => {
                EXIT_ABORTED
            }
            Self::NotFound { .. }
            | Self::Malformed { .. }
            | Self::CycleDetected { .. }
            | Self::UnknownStep { .. }
            | Self::ConfigurationError(_) => EXIT_CONFIGURATION,
        }
    }
}

pub type Result<T, E = RolloutError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let aborted = RolloutError::Cancelled.exit_code();
        let config = RolloutError::config("bad").exit_code();
        let running = RolloutError::AlreadyRunning {
            pid: 1,
            hostname: "h".to_string(),
            since: "now".to_string(),
        }
        .exit_code();

        assert_eq!(aborted, EXIT_ABORTED);
        assert_eq!(config, EXIT_CONFIGURATION);
        assert_eq!(running, EXIT_ALREADY_RUNNING);
        assert_ne!(aborted, EXIT_COMPLETED);
    }

    #[test]
    fn unknown_step_mentions_referrer() {
        let err = RolloutError::UnknownStep {
            step: "sign".to_string(),
            referenced_by: Some("publish".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "unknown step `sign` (required by `publish`)"
        );
    }

    #[test]
    fn cycle_lists_steps_in_order() {
        let err = RolloutError::CycleDetected {
            steps: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "prerequisite cycle detected: a -> b -> a");
    }
}
