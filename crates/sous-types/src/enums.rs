//! Enumeration types for the deployment model.
//!
//! Both enums have a stable string form shared by the YAML file tree and the
//! relational schema, so a value written by one backend reads back unchanged
//! from the other.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// A string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Manifest kind
// ---------------------------------------------------------------------------

/// How a deployable unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ManifestKind {
    /// A long-running HTTP service.
    #[default]
    #[serde(rename = "http-service")]
    Service,
    /// A long-running process with no HTTP interface.
    #[serde(rename = "worker")]
    Worker,
    /// A job run on demand.
    #[serde(rename = "on-demand")]
    OnDemand,
    /// A job run on a cron-style schedule.
    #[serde(rename = "scheduled")]
    Scheduled,
}

impl ManifestKind {
    /// The stable string form of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "http-service",
            Self::Worker => "worker",
            Self::OnDemand => "on-demand",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManifestKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-service" => Ok(Self::Service),
            "worker" => Ok(Self::Worker),
            "on-demand" => Ok(Self::OnDemand),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(ParseEnumError {
                kind: "manifest kind",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume mode
// ---------------------------------------------------------------------------

/// Access mode of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Mounted read-only.
    #[default]
    #[serde(rename = "RO")]
    ReadOnly,
    /// Mounted read-write.
    #[serde(rename = "RW")]
    ReadWrite,
}

impl VolumeMode {
    /// The stable string form of this mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "RO",
            Self::ReadWrite => "RW",
        }
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RO" => Ok(Self::ReadOnly),
            "RW" => Ok(Self::ReadWrite),
            other => Err(ParseEnumError {
                kind: "volume mode",
                value: other.to_owned(),
            }),
        }
    }
}
