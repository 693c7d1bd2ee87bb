//! Entity structs of the Global Deployment Manifest.
//!
//! Covers manifests and their per-cluster [`DeploySpec`]s, cluster
//! definitions, and the field-definition catalogs kept in [`Defs`].
//! Maps and sets are ordered collections so that every serialized form is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::enums::{ManifestKind, VolumeMode};
use crate::ids::{ManifestId, SourceLocation};

// ---------------------------------------------------------------------------
// Startup / health checks
// ---------------------------------------------------------------------------

/// Startup and readiness-check configuration.
///
/// Clusters carry a default; each [`DeploySpec`] carries its own.
/// Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Startup {
    /// Skip the readiness check entirely.
    pub skip_check: bool,
    /// Delay before the first connection attempt.
    pub connect_delay: i32,
    /// Overall time allowed for the instance to become ready.
    pub timeout: i32,
    /// Interval between connection attempts.
    pub connect_interval: i32,
    /// Protocol of the readiness probe, e.g. `HTTP`.
    pub check_ready_protocol: String,
    /// Path requested by the readiness probe.
    pub check_ready_uri_path: String,
    /// Index of the port the probe connects to.
    pub check_ready_port_index: i32,
    /// HTTP statuses treated as definite failure.
    pub check_ready_failure_statuses: Vec<i32>,
    /// Timeout of one probe request.
    pub check_ready_uri_timeout: i32,
    /// Interval between probe requests.
    pub check_ready_interval: i32,
    /// Number of probe retries before giving up.
    pub check_ready_retries: i32,
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// A host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Path on the host.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Access mode.
    pub mode: VolumeMode,
}

// ---------------------------------------------------------------------------
// DeploySpec
// ---------------------------------------------------------------------------

/// The intended deployment of one manifest in one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Version of the artifact to deploy.
    pub version: Version,
    /// Desired instance count. Ignored for scheduled kinds.
    #[serde(default)]
    pub num_instances: i32,
    /// Cron-style schedule for scheduled kinds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    /// Resource requests such as `cpus`, `memory` and `ports`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    /// Environment variable overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Volume mounts, in mount order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Startup and readiness-check configuration.
    #[serde(default)]
    pub startup: Startup,
    /// Explicit scheduler request identifier, when one is pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl DeploySpec {
    /// A spec for `version` with one instance and nothing else set.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            num_instances: 1,
            schedule: String::new(),
            resources: BTreeMap::new(),
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
            volumes: Vec::new(),
            startup: Startup::default(),
            request_id: None,
        }
    }

    /// Add a volume unless a structurally equal one is already present.
    ///
    /// Returns `true` if the volume was added.
    pub fn add_volume(&mut self, volume: Volume) -> bool {
        if self.volumes.contains(&volume) {
            return false;
        }
        self.volumes.push(volume);
        true
    }
}

impl Default for DeploySpec {
    fn default() -> Self {
        Self::new(Version::new(0, 0, 0))
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One deployable unit and its intended deployments, keyed by cluster name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Where the source lives.
    pub source: SourceLocation,
    /// Disambiguates several deployments of the same source.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,
    /// How the unit runs.
    #[serde(default)]
    pub kind: ManifestKind,
    /// Owner identifiers. A set: order never matters and serializes sorted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owners: BTreeSet<String>,
    /// Per-cluster deployments, keyed by cluster name.
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploySpec>,
}

impl Manifest {
    /// An empty manifest with the given identity and kind.
    pub fn new(id: ManifestId, kind: ManifestKind) -> Self {
        Self {
            source: id.source,
            flavor: id.flavor,
            kind,
            owners: BTreeSet::new(),
            deployments: BTreeMap::new(),
        }
    }

    /// This manifest's identity.
    pub fn id(&self) -> ManifestId {
        ManifestId {
            source: self.source.clone(),
            flavor: self.flavor.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// A named deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster name. Matches its key in [`Defs::clusters`].
    #[serde(default)]
    pub name: String,
    /// Scheduler kind, e.g. `singularity`.
    #[serde(default)]
    pub kind: String,
    /// Base URL of the scheduler this cluster fronts.
    #[serde(default)]
    pub base_url: String,
    /// Default startup configuration for deployments in this cluster.
    #[serde(default)]
    pub startup: Startup,
    /// Advisories this cluster tolerates on deployed artifacts.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_advisories: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Field definitions
// ---------------------------------------------------------------------------

/// Definition of a global environment variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvDef {
    /// Variable name.
    pub name: String,
    /// Human-readable description.
    pub desc: String,
    /// Where the variable applies.
    pub scope: String,
    /// Value type.
    #[serde(rename = "type")]
    pub var_type: String,
}

/// Definition of a resource or metadata field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDefinition {
    /// Field name.
    pub name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub var_type: String,
    /// Value used when a deployment leaves the field unset.
    pub default_value: String,
}

/// Fleet-wide definitions stored next to the manifests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defs {
    /// Deployment targets keyed by name.
    pub clusters: BTreeMap<String, Cluster>,
    /// Environment variable definitions.
    pub env_vars: Vec<EnvDef>,
    /// Resource field definitions.
    pub resources: Vec<FieldDefinition>,
    /// Metadata field definitions.
    pub metadata: Vec<FieldDefinition>,
}

impl Defs {
    /// Sort catalogs by name and align cluster names with their keys.
    pub fn canonicalize(&mut self) {
        self.env_vars.sort();
        self.resources.sort();
        self.metadata.sort();
        for (name, cluster) in &mut self.clusters {
            if cluster.name != *name {
                cluster.name.clone_from(name);
            }
        }
    }
}
