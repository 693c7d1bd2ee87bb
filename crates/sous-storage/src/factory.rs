//! Build the configured store.

use std::sync::Arc;

use crate::config::{BackendKind, StorageConfig};
use crate::error::{StoreError, StoreResult};
use crate::file_tree::FileTreeStore;
use crate::null::NullStore;
use crate::observe::{SharedObserver, TracingObserver};
use crate::postgres::PostgresPool;
use crate::relational::RelationalStore;
use crate::replicated::ReplicatedStore;
use crate::store::StateStore;
use crate::versioned::VersionedFileTreeStore;

/// Build the store `config` describes, reporting to `observer`.
///
/// With a secondary configured the result is a [`ReplicatedStore`]. A
/// secondary that cannot be built is replaced by a [`NullStore`] with a
/// warning, so the primary never depends on it. The secondary backend logs
/// its own calls through a [`TracingObserver`]; `observer` sees the
/// primary's calls and any secondary failure.
///
/// # Errors
///
/// Returns [`StoreError::Config`] when the primary and secondary are the same
/// kind, and whatever building the primary returns.
pub async fn build_store(
    config: &StorageConfig,
    observer: SharedObserver,
) -> StoreResult<Arc<dyn StateStore>> {
    if config.secondary == Some(config.primary) {
        return Err(StoreError::Config(format!(
            "primary and secondary are both {}",
            config.primary.as_str()
        )));
    }

    let primary = build_backend(config.primary, config, Arc::clone(&observer)).await?;
    let Some(kind) = config.secondary else {
        tracing::info!(primary = primary.name(), "State store ready");
        return Ok(primary);
    };

    let secondary = match build_backend(kind, config, TracingObserver::shared()).await {
        Ok(secondary) => secondary,
        Err(error) => {
            tracing::warn!(
                secondary = kind.as_str(),
                error = %error,
                "Secondary store unavailable; mirroring disabled"
            );
            Arc::new(NullStore::new(TracingObserver::shared()))
        }
    };
    tracing::info!(
        primary = primary.name(),
        secondary = secondary.name(),
        "Replicated state store ready"
    );
    Ok(Arc::new(ReplicatedStore::new(primary, secondary, observer)))
}

/// Build a single backend of `kind` from `config`.
///
/// # Errors
///
/// Returns the backend's construction error: a git clone or open failure,
/// or a database connection failure.
pub async fn build_backend(
    kind: BackendKind,
    config: &StorageConfig,
    observer: SharedObserver,
) -> StoreResult<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match kind {
        BackendKind::Git => Arc::new(
            VersionedFileTreeStore::clone_or_open(
                config.git.remote.as_deref(),
                &config.state_location,
                &config.git.branch,
                observer,
            )
            .await?,
        ),
        BackendKind::File => Arc::new(FileTreeStore::new(&config.state_location, observer)),
        BackendKind::Database => {
            let pool = PostgresPool::connect(&config.database.postgres()).await?;
            Arc::new(
                RelationalStore::new(pool, observer)
                    .with_query_timeout(config.database.query_timeout()),
            )
        }
        BackendKind::Null => Arc::new(NullStore::new(observer)),
    };
    Ok(store)
}
