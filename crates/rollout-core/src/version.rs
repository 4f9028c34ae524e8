//! Version file storage.
//!
//! The version record is a single line `major.minor.patch`. Writes go through
//! a temp file and a rename so a crash mid-write leaves either the old or the
//! new value on disk, never a partial one.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, RolloutError};
use crate::state;

/// Immutable `major.minor.patch` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    Patch,
    Minor,
    Major,
}

impl BumpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patch => "patch",
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BumpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patch" => Ok(Self::Patch),
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            other => Err(format!(
                "unknown bump kind `{other}` (expected patch, minor, or major)"
            )),
        }
    }
}

/// Why a version string was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Successor under `kind`, or `None` if a component would overflow.
    pub fn bumped(self, kind: BumpKind) -> Option<Self> {
        let next = match kind {
            BumpKind::Patch => Self::new(self.major, self.minor, self.patch.checked_add(1)?),
            BumpKind::Minor => Self::new(self.major, self.minor.checked_add(1)?, 0),
            BumpKind::Major => Self::new(self.major.checked_add(1)?, 0, 0),
        };
        Some(next)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_component(part: &str, name: &str) -> Result<u64, ParseVersionError> {
    if part.is_empty() {
        return Err(ParseVersionError(format!("{name} component is empty")));
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseVersionError(format!(
            "{name} component `{part}` is not a non-negative integer"
        )));
    }
    if part.len() > 1 && part.starts_with('0') {
        return Err(ParseVersionError(format!(
            "{name} component `{part}` has a leading zero"
        )));
    }
    part.parse::<u64>()
        .map_err(|_| ParseVersionError(format!("{name} component `{part}` is out of range")))
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(ParseVersionError(format!(
                "expected major.minor.patch, got `{s}`"
            )));
        }
        Ok(Self::new(
            parse_component(parts[0], "major")?,
            parse_component(parts[1], "minor")?,
            parse_component(parts[2], "patch")?,
        ))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// File-backed store for the current version.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Version> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RolloutError::NotFound {
                    path: self.path.clone(),
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read version file {}", self.path.display()))
                    .into());
            }
        };

        content
            .trim()
            .parse()
            .map_err(|e: ParseVersionError| RolloutError::Malformed {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    pub fn write(&self, version: Version) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }
        state::atomic_write(&self.path, format!("{version}\n").as_bytes())?;
        Ok(())
    }

    pub fn bump(&self, kind: BumpKind) -> Result<Version> {
        let current = self.read()?;
        let next = current.bumped(kind).ok_or_else(|| RolloutError::Malformed {
            path: self.path.clone(),
            message: format!("{kind} component of {current} overflows"),
        })?;
        self.write(next)?;
        Ok(next)
    }
}
