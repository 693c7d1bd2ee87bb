//! Primary store with a best-effort mirror.
//!
//! [`ReplicatedStore`] keeps a secondary backend populated without letting
//! its health affect callers. The primary decides every return value. A
//! secondary failure is reported to the observer exactly once per call and
//! is otherwise swallowed.

use async_trait::async_trait;
use sous_types::{State, User};

use crate::error::{StoreError, StoreResult};
use crate::observe::{Direction, SharedObserver, Stopwatch};
use crate::store::StateStore;

/// Name recorded as the author when a read mirrors into the secondary.
const MIRROR_ACTOR_NAME: &str = "sous";

/// Email recorded as the author when a read mirrors into the secondary.
const MIRROR_ACTOR_EMAIL: &str = "sous@localhost";

/// Composes two stores: `primary` is authoritative, `secondary` mirrors it.
///
/// The observer given here receives only secondary failures. Each inner
/// store reports its own calls to whatever observer it was built with.
pub struct ReplicatedStore<P, S> {
    primary: P,
    secondary: S,
    observer: SharedObserver,
}

impl<P: StateStore, S: StateStore> ReplicatedStore<P, S> {
    /// Compose `primary` and `secondary`, reporting secondary failures to
    /// `observer`.
    pub const fn new(primary: P, secondary: S, observer: SharedObserver) -> Self {
        Self {
            primary,
            secondary,
            observer,
        }
    }

    async fn mirror(&self, state: &State, actor: &User, direction: Direction) {
        let watch = Stopwatch::start(self.secondary.name(), direction);
        if let Err(error) = self.secondary.write_state(state, actor).await {
            tracing::warn!(
                secondary = self.secondary.name(),
                direction = direction.as_str(),
                error = %error,
                "Secondary store write failed; continuing with primary"
            );
            self.report_failure(watch, state, &error);
        }
    }

    fn report_failure(&self, watch: Stopwatch, state: &State, error: &StoreError) {
        let event = watch.finish(state.deployment_count(), Some(error));
        self.observer.report(&event);
    }
}

#[async_trait]
impl<P: StateStore, S: StateStore> StateStore for ReplicatedStore<P, S> {
    fn name(&self) -> &'static str {
        "replicated"
    }

    async fn read_state(&self) -> StoreResult<State> {
        let state = self.primary.read_state().await?;
        let actor = User::new(MIRROR_ACTOR_NAME, MIRROR_ACTOR_EMAIL);
        self.mirror(&state, &actor, Direction::Read).await;
        Ok(state)
    }

    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()> {
        self.mirror(state, actor, Direction::Write).await;
        self.primary.write_state(state, actor).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::null::NullStore;
    use crate::observe::{CapturingObserver, StoreObserver};
    use sous_types::{Cluster, DeploySpec, Manifest, ManifestId, ManifestKind, Version};

    /// A store that keeps the last written State in memory.
    #[derive(Default)]
    struct MemoryStore {
        state: tokio::sync::Mutex<State>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn read_state(&self) -> StoreResult<State> {
            Ok(self.state.lock().await.clone())
        }

        async fn write_state(&self, state: &State, _actor: &User) -> StoreResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().await = state.clone();
            Ok(())
        }
    }

    /// A store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn read_state(&self) -> StoreResult<State> {
            Err(StoreError::Config("broken store".to_owned()))
        }

        async fn write_state(&self, _state: &State, _actor: &User) -> StoreResult<()> {
            Err(StoreError::Config("broken store".to_owned()))
        }
    }

    fn actor() -> User {
        User::new("Amy", "amy@example.com")
    }

    fn sample_state() -> State {
        let mut state = State::new();
        state
            .defs
            .clusters
            .insert("east".to_owned(), Cluster::default());
        let mut m = Manifest::new(
            ManifestId::new("github.com/opentable/sous", "", ""),
            ManifestKind::Service,
        );
        m.deployments
            .insert("east".to_owned(), DeploySpec::new(Version::new(2, 0, 1)));
        state.manifests.add(m).unwrap();
        state.canonicalize();
        state
    }

    #[tokio::test]
    async fn write_succeeds_when_secondary_fails() {
        let observer = CapturingObserver::new();
        let primary = Arc::new(MemoryStore::default());
        let store = ReplicatedStore::new(Arc::clone(&primary), BrokenStore, observer.clone());

        store.write_state(&sample_state(), &actor()).await.unwrap();

        assert_eq!(primary.read_state().await.unwrap(), sample_state());
        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].store, "broken");
        assert_eq!(failures[0].direction, Direction::Write);
        assert_eq!(failures[0].deployments, 1);
    }

    #[tokio::test]
    async fn every_failing_call_reports_once() {
        let observer = CapturingObserver::new();
        let store = ReplicatedStore::new(MemoryStore::default(), BrokenStore, observer.clone());

        for _ in 0..3 {
            store.write_state(&sample_state(), &actor()).await.unwrap();
        }
        assert_eq!(observer.failures().len(), 3);

        observer.clear();
        store.read_state().await.unwrap();
        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].direction, Direction::Read);
    }

    #[tokio::test]
    async fn primary_failure_is_returned() {
        let observer = CapturingObserver::new();
        let secondary = Arc::new(MemoryStore::default());
        let store = ReplicatedStore::new(BrokenStore, Arc::clone(&secondary), observer.clone());

        let err = store
            .write_state(&sample_state(), &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        // the secondary is written first and keeps what it got
        assert_eq!(secondary.writes.load(Ordering::SeqCst), 1);
        assert!(observer.failures().is_empty());

        assert!(store.read_state().await.is_err());
        assert_eq!(secondary.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_mirrors_primary_into_secondary() {
        let observer = CapturingObserver::new();
        let primary = MemoryStore::default();
        *primary.state.lock().await = sample_state();
        let secondary = Arc::new(MemoryStore::default());
        let store = ReplicatedStore::new(primary, Arc::clone(&secondary), observer.clone());

        let state = store.read_state().await.unwrap();
        assert_eq!(state, sample_state());
        assert_eq!(secondary.read_state().await.unwrap(), sample_state());
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn composes_over_trait_objects() {
        let observer = CapturingObserver::new();
        let shared: Arc<dyn StoreObserver> = observer.clone();
        let primary: Arc<dyn StateStore> = Arc::new(MemoryStore::default());
        let secondary: Arc<dyn StateStore> = Arc::new(NullStore::new(Arc::clone(&shared)));
        let store: Arc<dyn StateStore> =
            Arc::new(ReplicatedStore::new(primary, secondary, shared));

        store.write_state(&sample_state(), &actor()).await.unwrap();
        assert_eq!(store.name(), "replicated");
        let events = observer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].store, "null");
        assert!(events[0].is_success());
    }
}
