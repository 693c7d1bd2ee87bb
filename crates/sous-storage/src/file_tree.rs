//! Plain file-tree store.
//!
//! [`FileTreeStore`] persists the State under a base directory with the
//! [`TreeCodec`] layout. It provides no concurrency control and assumes it
//! owns the directory for the duration of each call.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sous_types::{State, User};

use crate::codec::TreeCodec;
use crate::error::StoreResult;
use crate::observe::{Direction, SharedObserver, Stopwatch};
use crate::store::StateStore;

/// A State stored as a directory of YAML files.
pub struct FileTreeStore {
    codec: Arc<TreeCodec>,
    observer: SharedObserver,
}

impl FileTreeStore {
    /// A store rooted at `base`, reporting to `observer`.
    pub fn new(base: impl AsRef<Path>, observer: SharedObserver) -> Self {
        Self {
            codec: Arc::new(TreeCodec::new(base.as_ref())),
            observer,
        }
    }

    /// The base directory.
    pub fn base(&self) -> &Path {
        self.codec.base()
    }

    /// Decode the tree without reporting an event.
    pub(crate) async fn load(&self) -> StoreResult<State> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || codec.read()).await?
    }

    /// Encode the tree without reporting an event.
    pub(crate) async fn save(&self, state: &State) -> StoreResult<()> {
        let codec = Arc::clone(&self.codec);
        let state = state.clone();
        tokio::task::spawn_blocking(move || codec.write(&state)).await?
    }
}

#[async_trait]
impl StateStore for FileTreeStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn read_state(&self) -> StoreResult<State> {
        let watch = Stopwatch::start(self.name(), Direction::Read);
        let result = self.load().await;
        watch.report_read(self.observer.as_ref(), &result);
        result
    }

    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()> {
        let watch = Stopwatch::start(self.name(), Direction::Write);
        tracing::debug!(base = %self.base().display(), actor = %actor, "Writing state tree");
        let result = self.save(state).await;
        watch.report_write(self.observer.as_ref(), state, &result);
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::observe::CapturingObserver;
    use sous_types::{Cluster, DeploySpec, Manifest, ManifestId, ManifestKind, Version};

    fn sample_state() -> State {
        let mut state = State::new();
        for name in ["east", "west"] {
            state
                .defs
                .clusters
                .insert(name.to_owned(), Cluster::default());
        }
        let mut m = Manifest::new(
            ManifestId::new("github.com/opentable/sous", "", ""),
            ManifestKind::Service,
        );
        m.owners = ["zed@example.com", "amy@example.com"]
            .into_iter()
            .map(String::from)
            .collect();
        for cluster in ["east", "west"] {
            let mut spec = DeploySpec::new(Version::new(1, 4, 0));
            spec.env.insert("CLUSTER".to_owned(), cluster.to_owned());
            m.deployments.insert(cluster.to_owned(), spec);
        }
        state.manifests.add(m).unwrap();
        state.canonicalize();
        state
    }

    #[tokio::test]
    async fn empty_store_reads_empty_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let observer = CapturingObserver::new();
        let store = FileTreeStore::new(dir.path().join("gdm"), observer.clone());

        let state = store.read_state().await.unwrap();
        assert!(state.manifests.is_empty());
        assert!(state.defs.clusters.is_empty());

        let events = observer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events.first().unwrap().direction, Direction::Read);
        assert!(events.first().unwrap().is_success());
    }

    #[tokio::test]
    async fn round_trip_and_idempotent_reread() {
        let dir = tempfile::tempdir().unwrap();
        let observer = CapturingObserver::new();
        let store = FileTreeStore::new(dir.path(), observer.clone());
        let state = sample_state();

        store.write_state(&state, &User::default()).await.unwrap();
        let first = store.read_state().await.unwrap();
        let second = store.read_state().await.unwrap();

        assert_eq!(first, state);
        assert_eq!(first, second);
        let write = observer.events().into_iter().next().unwrap();
        assert_eq!(write.deployments, 2);
    }

    #[tokio::test]
    async fn owner_order_produces_identical_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTreeStore::new(dir.path(), CapturingObserver::new());
        let path = dir.path().join("manifests/github.com/opentable/sous.yaml");

        let state = sample_state();
        store.write_state(&state, &User::default()).await.unwrap();
        let before = fs::read(&path).unwrap();

        let mut reordered = state.clone();
        let id = ManifestId::new("github.com/opentable/sous", "", "");
        let manifest = reordered.manifests.get_mut(&id).unwrap();
        let owners: Vec<String> = manifest.owners.iter().rev().cloned().collect();
        manifest.owners = owners.into_iter().collect();
        store.write_state(&reordered, &User::default()).await.unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn undefined_cluster_write_is_rejected_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let observer = CapturingObserver::new();
        let store = FileTreeStore::new(dir.path(), observer.clone());

        let mut state = sample_state();
        state.defs.clusters.remove("west");
        let err = store.write_state(&state, &User::default()).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
        assert_eq!(observer.failures().len(), 1);
    }
}
