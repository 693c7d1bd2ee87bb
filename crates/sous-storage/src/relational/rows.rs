//! Row types and the fold from flat rows back to the object graph.
//!
//! The manifest query joins components, owners, the current deployment per
//! cluster and every child table, so one deployment spans many rows (one
//! per owner x env x resource x metadata x volume combination).
//! [`ManifestFolder`] collapses them: the first row seen for a manifest or
//! deployment creates it, later rows only add owners and child entries.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use sous_types::{
    Cluster, DeploySpec, EnvDef, FieldDefinition, Manifest, ManifestId, ManifestKind, Manifests,
    Startup, Version, Volume, VolumeMode,
};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Startup columns
// ---------------------------------------------------------------------------

/// Startup columns, selected under these aliases from both `clusters`
/// (`crdef_*`) and `deployments` (`cr_*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub(crate) struct StartupColumns {
    pub skip: bool,
    pub connect_delay: i32,
    pub timeout: i32,
    pub connect_interval: i32,
    pub proto: String,
    pub path: String,
    pub port_index: i32,
    pub failure_statuses: Vec<i32>,
    pub uri_timeout: i32,
    pub check_interval: i32,
    pub retries: i32,
}

impl From<StartupColumns> for Startup {
    fn from(c: StartupColumns) -> Self {
        Self {
            skip_check: c.skip,
            connect_delay: c.connect_delay,
            timeout: c.timeout,
            connect_interval: c.connect_interval,
            check_ready_protocol: c.proto,
            check_ready_uri_path: c.path,
            check_ready_port_index: c.port_index,
            check_ready_failure_statuses: c.failure_statuses,
            check_ready_uri_timeout: c.uri_timeout,
            check_ready_interval: c.check_interval,
            check_ready_retries: c.retries,
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions and clusters
// ---------------------------------------------------------------------------

/// A row of `env_var_defs`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EnvDefRow {
    pub name: String,
    pub desc: String,
    pub scope: String,
    #[sqlx(rename = "type")]
    pub var_type: String,
}

impl From<EnvDefRow> for EnvDef {
    fn from(r: EnvDefRow) -> Self {
        Self {
            name: r.name,
            desc: r.desc,
            scope: r.scope,
            var_type: r.var_type,
        }
    }
}

/// A row of `resource_fdefs` or `metadata_fdefs`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FieldDefRow {
    pub field_name: String,
    pub var_type: String,
    pub default_value: String,
}

impl From<FieldDefRow> for FieldDefinition {
    fn from(r: FieldDefRow) -> Self {
        Self {
            name: r.field_name,
            var_type: r.var_type,
            default_value: r.default_value,
        }
    }
}

/// One cluster joined with at most one of its advisories.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ClusterRow {
    pub name: String,
    pub kind: String,
    pub base_url: String,
    #[sqlx(flatten)]
    pub startup: StartupColumns,
    pub advisory: Option<String>,
}

/// Group cluster rows by name, collecting advisories into a set.
pub(crate) fn fold_cluster_rows(
    rows: impl IntoIterator<Item = ClusterRow>,
) -> BTreeMap<String, Cluster> {
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    for row in rows {
        let cluster = clusters.entry(row.name.clone()).or_insert_with(|| Cluster {
            name: row.name,
            kind: row.kind,
            base_url: row.base_url,
            startup: row.startup.into(),
            ..Cluster::default()
        });
        if let Some(advisory) = row.advisory {
            cluster.allowed_advisories.insert(advisory);
        }
    }
    clusters
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// One row of the wide manifest join.
///
/// Everything from `cluster` on is `NULL` for a component with no current
/// deployment, and each child column is `NULL` when that child table has
/// no rows for the deployment.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub(crate) struct ManifestRow {
    pub repo: String,
    pub dir: String,
    pub flavor: String,
    pub kind: String,
    pub owner: Option<String>,
    pub cluster: Option<String>,
    pub deployment_id: Option<i64>,
    pub versionstring: Option<String>,
    pub num_instances: i32,
    pub schedule_string: String,
    pub request_id: Option<String>,
    #[sqlx(flatten)]
    pub startup: StartupColumns,
    pub env_key: Option<String>,
    pub env_value: Option<String>,
    pub resource_name: Option<String>,
    pub resource_value: Option<String>,
    pub metadata_name: Option<String>,
    pub metadata_value: Option<String>,
    pub volume_position: Option<i32>,
    pub volume_host: Option<String>,
    pub volume_container: Option<String>,
    pub volume_mode: Option<String>,
}

/// Incrementally rebuilds [`Manifests`] from [`ManifestRow`]s.
#[derive(Debug, Default)]
pub(crate) struct ManifestFolder {
    manifests: Manifests,
    /// Volumes per (manifest, cluster), keyed by position so that row order
    /// does not matter.
    volumes: BTreeMap<(ManifestId, String), BTreeMap<i32, Volume>>,
    rows: usize,
}

impl ManifestFolder {
    /// Fold one row in.
    pub fn push(&mut self, row: ManifestRow) -> StoreResult<()> {
        self.rows = self.rows.saturating_add(1);

        let kind: ManifestKind = row
            .kind
            .parse()
            .map_err(|e: sous_types::ParseEnumError| {
                StoreError::decode(row_context(&row), e.to_string())
            })?;
        let id = ManifestId::new(row.repo.as_str(), row.dir.as_str(), row.flavor.as_str());
        let context = row_context(&row);

        let manifest = self
            .manifests
            .get_or_insert_with(id.clone(), |id| Manifest::new(id.clone(), kind));
        if let Some(owner) = row.owner {
            manifest.owners.insert(owner);
        }

        let Some(cluster) = row.cluster else {
            return Ok(());
        };

        let spec = match manifest.deployments.entry(cluster.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let version = row
                    .versionstring
                    .as_deref()
                    .ok_or_else(|| StoreError::decode(&context, "deployment without a version"))?;
                let version = Version::parse(version).map_err(|e| {
                    StoreError::decode(&context, format!("version {version:?}: {e}"))
                })?;
                slot.insert(DeploySpec {
                    version,
                    num_instances: row.num_instances,
                    schedule: row.schedule_string,
                    request_id: row.request_id,
                    startup: row.startup.into(),
                    ..DeploySpec::default()
                })
            }
        };

        if let (Some(key), Some(value)) = (row.env_key, row.env_value) {
            spec.env.insert(key, value);
        }
        if let (Some(name), Some(value)) = (row.resource_name, row.resource_value) {
            spec.resources.insert(name, value);
        }
        if let (Some(name), Some(value)) = (row.metadata_name, row.metadata_value) {
            spec.metadata.insert(name, value);
        }
        if let (Some(position), Some(host), Some(container), Some(mode)) = (
            row.volume_position,
            row.volume_host,
            row.volume_container,
            row.volume_mode,
        ) {
            let mode: VolumeMode = mode
                .parse()
                .map_err(|e: sous_types::ParseEnumError| {
                    StoreError::decode(&context, e.to_string())
                })?;
            self.volumes
                .entry((id, cluster))
                .or_default()
                .entry(position)
                .or_insert(Volume {
                    host,
                    container,
                    mode,
                });
        }
        Ok(())
    }

    /// Number of rows folded so far.
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Attach collected volumes in position order and return the result.
    pub fn finish(mut self) -> Manifests {
        for ((id, cluster), volumes) in self.volumes {
            let Some(spec) = self
                .manifests
                .get_mut(&id)
                .and_then(|m| m.deployments.get_mut(&cluster))
            else {
                continue;
            };
            for volume in volumes.into_values() {
                spec.add_volume(volume);
            }
        }
        self.manifests
    }
}

fn row_context(row: &ManifestRow) -> String {
    match (&row.cluster, row.deployment_id) {
        (Some(cluster), Some(id)) => format!(
            "deployment {id} of {} in {cluster}",
            ManifestId::new(row.repo.as_str(), row.dir.as_str(), row.flavor.as_str())
        ),
        _ => format!(
            "component {}",
            ManifestId::new(row.repo.as_str(), row.dir.as_str(), row.flavor.as_str())
        ),
    }
}

/// Fold a complete set of rows.
#[cfg(test)]
pub(crate) fn fold_manifest_rows(
    rows: impl IntoIterator<Item = ManifestRow>,
) -> StoreResult<Manifests> {
    let mut folder = ManifestFolder::default();
    for row in rows {
        folder.push(row)?;
    }
    Ok(folder.finish())
}
