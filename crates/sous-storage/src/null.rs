//! A store that persists nothing.

use async_trait::async_trait;
use sous_types::{State, User};

use crate::error::StoreResult;
use crate::observe::{Direction, SharedObserver, StoreEvent};
use crate::store::StateStore;

/// Reads an empty State and discards every write.
///
/// Used where a store is structurally required but persistence is turned
/// off, such as dry runs or a secondary that could not be built.
pub struct NullStore {
    observer: SharedObserver,
}

impl NullStore {
    /// A null store reporting to `observer`.
    pub const fn new(observer: SharedObserver) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl StateStore for NullStore {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn read_state(&self) -> StoreResult<State> {
        self.observer
            .report(&StoreEvent::instant(self.name(), Direction::Read, 0));
        Ok(State::new())
    }

    async fn write_state(&self, state: &State, _actor: &User) -> StoreResult<()> {
        self.observer.report(&StoreEvent::instant(
            self.name(),
            Direction::Write,
            state.deployment_count(),
        ));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::observe::CapturingObserver;
    use sous_types::{Cluster, Manifest, ManifestId, ManifestKind};

    #[tokio::test]
    async fn reads_are_empty_and_fresh() {
        let observer = CapturingObserver::new();
        let store = NullStore::new(observer.clone());

        let mut first = store.read_state().await.unwrap();
        first
            .defs
            .clusters
            .insert("east".to_owned(), Cluster::default());
        first
            .manifests
            .add(Manifest::new(
                ManifestId::new("github.com/x/y", "", ""),
                ManifestKind::Service,
            ))
            .unwrap();

        let second = store.read_state().await.unwrap();
        assert_eq!(second, State::new());
        assert_eq!(observer.events().len(), 2);
    }

    #[tokio::test]
    async fn writes_are_discarded_and_reported() {
        let observer = CapturingObserver::new();
        let store = NullStore::new(observer.clone());

        let mut state = State::new();
        state
            .defs
            .clusters
            .insert("east".to_owned(), Cluster::default());
        store
            .write_state(&state, &User::new("Amy", "amy@example.com"))
            .await
            .unwrap();

        assert_eq!(store.read_state().await.unwrap(), State::new());
        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, Direction::Write);
        assert!(events.iter().all(StoreEvent::is_success));
        assert!(events.iter().all(|e| e.elapsed.is_zero()));
    }
}
