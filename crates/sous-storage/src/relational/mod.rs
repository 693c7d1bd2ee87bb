//! Relational store backed by `PostgreSQL`.
//!
//! Every call runs in a single `REPEATABLE READ` transaction with a
//! `statement_timeout` set for that transaction only, and the whole call is
//! also bounded on the client side. A write loads the State visible to its
//! own transaction and diffs against it, so two writers that race will see
//! one of them fail with a serialization error, surfaced as
//! [`StoreError::Conflict`].
//!
//! Deployment history is append-only. The current DeploySpec of a component
//! in a cluster is the one with the highest `deployment_id`; it is omitted
//! from reads once that row is `decommisioned`.

mod load;
mod rows;
mod save;

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sous_types::{State, User};
use sqlx::{Postgres, Transaction};

use crate::error::{StoreError, StoreResult};
use crate::observe::{Direction, SharedObserver, Stopwatch};
use crate::postgres::PostgresPool;
use crate::store::StateStore;

/// Lifecycle of a deployment row that is current.
pub(crate) const ACTIVE: &str = "active";

/// Lifecycle of a deployment row that retires a DeploySpec. The spelling is
/// part of the stored schema.
pub(crate) const DECOMMISSIONED: &str = "decommisioned";

/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

/// Default bound on a whole read or write.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A State stored in `PostgreSQL` tables.
pub struct RelationalStore {
    pool: PostgresPool,
    query_timeout: Duration,
    observer: SharedObserver,
}

impl RelationalStore {
    /// A store over `pool`, reporting to `observer`. The schema must already
    /// be migrated; see [`PostgresPool::run_migrations`].
    pub const fn new(pool: PostgresPool, observer: SharedObserver) -> Self {
        Self {
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            observer,
        }
    }

    /// Bound each call to `timeout`, on the server and on the client.
    #[must_use]
    pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// The configured per-call bound.
    pub const fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    async fn begin(&self, read_only: bool) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| query_error("begin", e))?;

        let isolation = if read_only {
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY"
        } else {
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        };
        sqlx::query(isolation)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("set transaction", e))?;

        let timeout_ms = self.query_timeout.as_millis().to_string();
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(timeout_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("statement_timeout", e))?;

        Ok(tx)
    }

    async fn read_inner(&self) -> StoreResult<State> {
        let mut tx = self.begin(true).await?;
        let state = load::load_state(&mut *tx).await?;
        tx.commit().await.map_err(|e| query_error("commit", e))?;
        Ok(state)
    }

    async fn write_inner(&self, state: &State) -> StoreResult<()> {
        let flaw = state
            .undefined_clusters()
            .into_iter()
            .chain(state.duplicate_definitions())
            .next();
        if let Some(flaw) = flaw {
            return Err(StoreError::Invalid(flaw.to_string()));
        }
        let mut next = state.clone();
        next.canonicalize();

        let mut tx = self.begin(false).await?;
        let current = load::load_state(&mut *tx).await?;
        let summary = save::save_state(&mut *tx, &current, &next).await?;
        tx.commit().await.map_err(|e| query_error("commit", e))?;

        tracing::info!(
            written = summary.written,
            decommissioned = summary.decommissioned,
            unchanged = summary.unchanged,
            "Wrote state to PostgreSQL"
        );
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<T>> + Send,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.query_timeout, call).await {
            Ok(result) => result,
            Err(elapsed) => {
                tracing::warn!(operation, error = %elapsed, "PostgreSQL call timed out");
                Err(StoreError::Timeout {
                    operation,
                    after: self.query_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl StateStore for RelationalStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn read_state(&self) -> StoreResult<State> {
        let watch = Stopwatch::start(self.name(), Direction::Read);
        let result = self.bounded("read_state", self.read_inner()).await;
        watch.report_read(self.observer.as_ref(), &result);
        result
    }

    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()> {
        let watch = Stopwatch::start(self.name(), Direction::Write);
        tracing::debug!(actor = %actor, "Writing state to PostgreSQL");
        let result = self.bounded("write_state", self.write_inner(state)).await;
        watch.report_write(self.observer.as_ref(), state, &result);
        result
    }
}

/// Map a driver error, turning serialization failures into conflicts.
pub(crate) fn query_error(query: &'static str, err: sqlx::Error) -> StoreError {
    let serialization = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE);
    if serialization {
        StoreError::conflict(format!("{query}: a concurrent write committed first"))
    } else {
        StoreError::query(query, err)
    }
}

/// Log one statement against `table`.
pub(crate) fn log_query(
    table: &'static str,
    direction: Direction,
    rows: usize,
    started: Instant,
    error: Option<&StoreError>,
) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match error {
        None => tracing::debug!(
            table,
            direction = direction.as_str(),
            rows,
            elapsed_ms,
            "SQL statement"
        ),
        Some(error) => tracing::warn!(
            table,
            direction = direction.as_str(),
            elapsed_ms,
            error = %error,
            "SQL statement failed"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sous_types::{
        Cluster, DeploySpec, FieldDefinition, Manifest, ManifestId, ManifestKind, User,
    };
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    use super::*;
    use crate::error::ErrorKind;
    use crate::observe::CapturingObserver;

    /// A store whose pool never connects; only checks before the first
    /// query can pass.
    fn unconnected(observer: SharedObserver) -> RelationalStore {
        let pool = PgPoolOptions::new().connect_lazy_with(PgConnectOptions::new().port(1));
        RelationalStore::new(PostgresPool::from_pool(pool), observer)
    }

    fn actor() -> User {
        User::new("Amy", "amy@example.com")
    }

    #[tokio::test]
    async fn repeated_definition_name_is_invalid() {
        let observer = CapturingObserver::new();
        let store = unconnected(observer.clone());
        let mut state = State::new();
        let cpus = FieldDefinition {
            name: "cpus".to_owned(),
            var_type: "float".to_owned(),
            default_value: "0.1".to_owned(),
        };
        state.defs.resources = vec![cpus.clone(), cpus];

        let err = store.write_state(&state, &actor()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.to_string().contains("cpus"), "got {err}");
        assert_eq!(observer.failures().len(), 1);
    }

    #[tokio::test]
    async fn deployment_to_undefined_cluster_is_invalid() {
        let store = unconnected(CapturingObserver::new());
        let mut state = State::new();
        state
            .defs
            .clusters
            .insert("east".to_owned(), Cluster::default());
        let mut manifest = Manifest::new(
            ManifestId::new("github.com/opentable/sous", "", ""),
            ManifestKind::Service,
        );
        manifest
            .deployments
            .insert("moon".to_owned(), DeploySpec::default());
        state.manifests.add(manifest).unwrap();

        let err = store.write_state(&state, &actor()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.to_string().contains("moon"), "got {err}");
    }
}
