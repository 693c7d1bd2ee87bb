//! The State aggregate root: every manifest plus the fleet-wide [`Defs`].
//!
//! A [`State`] is always a fully owned value. Stores build a fresh one on
//! every read and take one back whole on every write; nothing inside it is
//! addressable for partial update at the store boundary.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::ManifestId;
use crate::structs::{Defs, DeploySpec, Manifest};

/// A manifest with the same identity is already present.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("manifest {0} already exists")]
pub struct DuplicateManifest(pub ManifestId);

/// A structural problem found by [`State::flaws`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateFlaw {
    /// A manifest deploys to a cluster missing from [`Defs::clusters`].
    #[error("cluster {cluster:?} not defined (from manifest {manifest})")]
    UndefinedCluster {
        /// The manifest holding the deployment.
        manifest: ManifestId,
        /// The undefined cluster name.
        cluster: String,
    },

    /// Two entries of one definition catalog share a name.
    #[error("{catalog} definition {name:?} appears more than once")]
    DuplicateDefinition {
        /// `env_vars`, `resources` or `metadata`.
        catalog: &'static str,
        /// The repeated name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// Manifests keyed by identity. Identities are unique by construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifests(BTreeMap<ManifestId, Manifest>);

impl Manifests {
    /// An empty collection.
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a manifest, refusing one whose identity is already present.
    pub fn add(&mut self, manifest: Manifest) -> Result<(), DuplicateManifest> {
        match self.0.entry(manifest.id()) {
            Entry::Occupied(existing) => Err(DuplicateManifest(existing.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(manifest);
                Ok(())
            }
        }
    }

    /// Return the manifest for `id`, creating it with `make` on first sight.
    pub fn get_or_insert_with(
        &mut self,
        id: ManifestId,
        make: impl FnOnce(&ManifestId) -> Manifest,
    ) -> &mut Manifest {
        match self.0.entry(id) {
            Entry::Occupied(existing) => existing.into_mut(),
            Entry::Vacant(slot) => {
                let manifest = make(slot.key());
                slot.insert(manifest)
            }
        }
    }

    /// Look up a manifest by identity.
    pub fn get(&self, id: &ManifestId) -> Option<&Manifest> {
        self.0.get(id)
    }

    /// Look up a manifest by identity for mutation.
    pub fn get_mut(&mut self, id: &ManifestId) -> Option<&mut Manifest> {
        self.0.get_mut(id)
    }

    /// Remove and return a manifest.
    pub fn remove(&mut self, id: &ManifestId) -> Option<Manifest> {
        self.0.remove(id)
    }

    /// Whether a manifest with this identity exists.
    pub fn contains(&self, id: &ManifestId) -> bool {
        self.0.contains_key(id)
    }

    /// Number of manifests.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no manifests.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Manifests in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.0.values()
    }

}

impl<'a> IntoIterator for &'a Manifests {
    type Item = &'a Manifest;
    type IntoIter = std::collections::btree_map::Values<'a, ManifestId, Manifest>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The Global Deployment Manifest.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Fleet-wide definitions.
    pub defs: Defs,
    /// Every deployable unit.
    pub manifests: Manifests,
    /// Backend revision this State was read at, when the backend has one.
    ///
    /// Versioned backends refuse a write whose revision is stale. Not part
    /// of equality.
    pub revision: Option<String>,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.defs == other.defs && self.manifests == other.manifests
    }
}

impl Eq for State {}

impl State {
    /// An empty State: no manifests, no clusters, no definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of per-cluster deployments across all manifests.
    pub fn deployment_count(&self) -> usize {
        self.manifests.iter().map(|m| m.deployments.len()).sum()
    }

    /// Every deployment as `(manifest, cluster name, spec)`.
    pub fn deployments(&self) -> impl Iterator<Item = (&Manifest, &str, &DeploySpec)> {
        self.manifests.iter().flat_map(|manifest| {
            manifest
                .deployments
                .iter()
                .map(move |(cluster, spec)| (manifest, cluster.as_str(), spec))
        })
    }

    /// Put the State in canonical order so equal States serialize equally.
    pub fn canonicalize(&mut self) {
        self.defs.canonicalize();
    }

    /// Structural problems that make this State unsafe to persist.
    ///
    /// Deployments to undefined clusters are reported only when at least
    /// one cluster is defined; a State with no clusters is still being
    /// assembled.
    pub fn flaws(&self) -> Vec<StateFlaw> {
        if self.defs.clusters.is_empty() {
            return Vec::new();
        }
        self.undefined_clusters()
    }

    /// Every deployment whose cluster is missing from the definitions.
    pub fn undefined_clusters(&self) -> Vec<StateFlaw> {
        self.deployments()
            .filter(|(_, cluster, _)| !self.defs.clusters.contains_key(*cluster))
            .map(|(manifest, cluster, _)| StateFlaw::UndefinedCluster {
                manifest: manifest.id(),
                cluster: cluster.to_owned(),
            })
            .collect()
    }

    /// Every name repeated within one of the definition catalogs.
    pub fn duplicate_definitions(&self) -> Vec<StateFlaw> {
        let defs = &self.defs;
        let catalogs = [
            ("env_vars", defs.env_vars.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()),
            ("resources", defs.resources.iter().map(|d| d.name.as_str()).collect()),
            ("metadata", defs.metadata.iter().map(|d| d.name.as_str()).collect()),
        ];
        let mut flaws = Vec::new();
        for (catalog, names) in catalogs {
            let mut seen = BTreeSet::new();
            let mut reported = BTreeSet::new();
            for name in names {
                if !seen.insert(name) && reported.insert(name) {
                    flaws.push(StateFlaw::DuplicateDefinition {
                        catalog,
                        name: name.to_owned(),
                    });
                }
            }
        }
        flaws
    }
}
