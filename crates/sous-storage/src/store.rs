//! The store capability contract.
//!
//! Callers depend on [`StateStore`] and never on a concrete backend. The
//! trait is object safe, so a configured store travels as
//! `Arc<dyn StateStore>`.

use std::sync::Arc;

use async_trait::async_trait;
use sous_types::{State, User};

use crate::error::StoreResult;

/// Read and write the whole Global Deployment Manifest.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name used in events and logs.
    fn name(&self) -> &'static str;

    /// Read the current State.
    ///
    /// A storage location that does not exist yet reads as an empty State,
    /// not an error. Every call returns an independent, fully owned value.
    async fn read_state(&self) -> StoreResult<State>;

    /// Replace the persisted State with `state`.
    ///
    /// `actor` is recorded as audit metadata only.
    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()>;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn read_state(&self) -> StoreResult<State> {
        (**self).read_state().await
    }

    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()> {
        (**self).write_state(state, actor).await
    }
}
