//! Configuration file support (`.rollout.toml`).
//!
//! The file is optional; every section has defaults. CLI flags are merged on
//! top with [`RolloutConfig::build_config`], producing the immutable
//! [`Config`] the orchestrator is constructed with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, RolloutError};
use crate::state::resolve_dir;

pub const CONFIG_FILE: &str = ".rollout.toml";

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&humantime::format_duration(*duration))
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn serialize_opt_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
        None => serializer.serialize_none(),
    }
}

/// An external tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides `commands.timeout` for this tool.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolsConfig {
    #[serde(default = "default_lock_check")]
    pub lock_check: ToolCommand,
    #[serde(default = "default_vcs_status")]
    pub vcs_status: ToolCommand,
    #[serde(default = "default_build")]
    pub build: ToolCommand,
    #[serde(default = "default_verify")]
    pub verify: ToolCommand,
    #[serde(default = "default_upload")]
    pub upload: ToolCommand,
    #[serde(default = "default_host_release")]
    pub host_release: ToolCommand,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            lock_check: default_lock_check(),
            vcs_status: default_vcs_status(),
            build: default_build(),
            verify: default_verify(),
            upload: default_upload(),
            host_release: default_host_release(),
        }
    }
}

impl ToolsConfig {
    /// Each tool with its config key.
    pub fn named(&self) -> [(&'static str, &ToolCommand); 6] {
        [
            ("lock_check", &self.lock_check),
            ("vcs_status", &self.vcs_status),
            ("build", &self.build),
            ("verify", &self.verify),
            ("upload", &self.upload),
            ("host_release", &self.host_release),
        ]
    }
}

fn default_lock_check() -> ToolCommand {
    ToolCommand::new("uv", &["lock", "--check"])
}

fn default_vcs_status() -> ToolCommand {
    ToolCommand::new("git", &["status", "--porcelain"])
}

fn default_build() -> ToolCommand {
    ToolCommand::new("uv", &["build"])
}

fn default_verify() -> ToolCommand {
    ToolCommand::new("uvx", &["twine", "check", "--strict", "{artifacts}"])
}

fn default_upload() -> ToolCommand {
    ToolCommand::new("uv", &["publish", "{artifacts}"])
}

fn default_host_release() -> ToolCommand {
    ToolCommand::new(
        "gh",
        &[
            "release",
            "create",
            "v{version}",
            "--title",
            "v{version}",
            "--generate-notes",
            "{artifacts}",
        ],
    )
}

/// Nested version file configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionConfig {
    #[serde(default = "default_version_file")]
    pub file: PathBuf,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            file: default_version_file(),
        }
    }
}

/// Nested state directory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// Nested lock configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LockConfig {
    /// Reclaim a lock older than this. Unset means never reclaim.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub stale_after: Option<Duration>,
}

/// Nested output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    /// Number of output lines shown for a failing step
    #[serde(default = "default_output_lines")]
    pub lines: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            lines: default_output_lines(),
        }
    }
}

/// Nested command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// How long a terminated command may take to exit before it is killed
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_grace_period")]
    pub grace_period: Duration,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            grace_period: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FlagsConfig {
    #[serde(default)]
    pub allow_dirty: bool,
}

/// Contents of `.rollout.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub version: VersionConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub flags: FlagsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            version: VersionConfig::default(),
            state: StateConfig::default(),
            lock: LockConfig::default(),
            output: OutputConfig::default(),
            commands: CommandsConfig::default(),
            artifacts: ArtifactsConfig::default(),
            flags: FlagsConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_version_file() -> PathBuf {
    PathBuf::from("VERSION")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".rollout")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_output_lines() -> usize {
    50
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

/// Values from the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub environment: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub allow_dirty: bool,
}

/// Resolved, immutable settings for one orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub environment: String,
    pub version_file: PathBuf,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub allow_dirty: bool,
    pub output_lines: usize,
    pub default_timeout: Duration,
    pub grace_period: Duration,
    pub lock_stale_after: Option<Duration>,
    pub tools: ToolsConfig,
}

impl RolloutConfig {
    /// Load configuration from the project root by looking for `.rollout.toml`.
    ///
    /// Returns `Ok(None)` if no config file exists.
    pub fn load_from_project(project_dir: &Path) -> Result<Option<Self>> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RolloutError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content).map_err(|e| {
            RolloutError::config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(RolloutError::config("environment cannot be empty"));
        }

        if self.output.lines == 0 {
            return Err(RolloutError::config("output.lines must be greater than 0"));
        }

        if self.commands.timeout.is_zero() {
            return Err(RolloutError::config(
                "commands.timeout must be greater than 0",
            ));
        }

        if self.commands.grace_period.is_zero() {
            return Err(RolloutError::config(
                "commands.grace_period must be greater than 0",
            ));
        }

        if self.lock.stale_after.is_some_and(|d| d.is_zero()) {
            return Err(RolloutError::config(
                "lock.stale_after must be greater than 0",
            ));
        }

        if self.version.file.as_os_str().is_empty() {
            return Err(RolloutError::config("version.file cannot be empty"));
        }

        for (name, tool) in self.tools.named() {
            if tool.program.trim().is_empty() {
                return Err(RolloutError::config(format!(
                    "tools.{name}.program cannot be empty"
                )));
            }
            if tool.timeout.is_some_and(|d| d.is_zero()) {
                return Err(RolloutError::config(format!(
                    "tools.{name}.timeout must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Build the resolved [`Config`] by merging CLI overrides with file values.
    ///
    /// For `Option` fields: CLI value takes precedence; falls back to config.
    /// For `bool` flags: `true` if either CLI or config enables it (OR).
    pub fn build_config(&self, project_dir: &Path, cli: CliOverrides) -> Result<Config> {
        self.validate()?;

        if cli.timeout.is_some_and(|d| d.is_zero()) {
            return Err(RolloutError::config("--timeout must be greater than 0"));
        }
        if cli.environment.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err(RolloutError::config("--env cannot be empty"));
        }

        let state_dir = cli.state_dir.unwrap_or_else(|| self.state.dir.clone());

        Ok(Config {
            project_dir: project_dir.to_path_buf(),
            environment: cli.environment.unwrap_or_else(|| self.environment.clone()),
            version_file: resolve_dir(project_dir, &self.version.file),
            state_dir: resolve_dir(project_dir, &state_dir),
            artifacts_dir: resolve_dir(project_dir, &self.artifacts.dir),
            allow_dirty: cli.allow_dirty || self.flags.allow_dirty,
            output_lines: self.output.lines,
            default_timeout: cli.timeout.unwrap_or(self.commands.timeout),
            grace_period: self.commands.grace_period,
            lock_stale_after: self.lock.stale_after,
            tools: self.tools.clone(),
        })
    }
}
