//! Read path: rebuild a State from rows inside one transaction.

use std::time::Instant;

use futures::TryStreamExt;
use sous_types::{Defs, State};
use sqlx::PgConnection;

use super::rows::{
    ClusterRow, EnvDefRow, FieldDefRow, ManifestFolder, ManifestRow, fold_cluster_rows,
};
use super::{ACTIVE, log_query, query_error};
use crate::error::{StoreError, StoreResult};
use crate::observe::Direction;

const ENV_DEFS_SQL: &str = r#"SELECT "name", "desc", "scope", "type"
  FROM env_var_defs
  ORDER BY "name""#;

const RESOURCE_DEFS_SQL: &str = r"SELECT field_name, var_type, default_value
  FROM resource_fdefs
  ORDER BY field_name";

const METADATA_DEFS_SQL: &str = r"SELECT field_name, var_type, default_value
  FROM metadata_fdefs
  ORDER BY field_name";

const CLUSTERS_SQL: &str = r"SELECT
    clusters.name, clusters.kind, clusters.base_url,
    crdef_skip AS skip, crdef_connect_delay AS connect_delay, crdef_timeout AS timeout,
    crdef_connect_interval AS connect_interval, crdef_proto AS proto, crdef_path AS path,
    crdef_port_index AS port_index, crdef_failure_statuses AS failure_statuses,
    crdef_uri_timeout AS uri_timeout, crdef_interval AS check_interval,
    crdef_retries AS retries,
    qualities.name AS advisory
  FROM clusters
    LEFT JOIN cluster_qualities USING (cluster_id)
    LEFT JOIN qualities
      ON qualities.quality_id = cluster_qualities.quality_id
     AND qualities.kind = 'advisory'
  WHERE clusters.active
  ORDER BY clusters.name, advisory";

/// One row per (component x owner x current deployment x env x resource x
/// metadata x volume). The current deployment of a component in a cluster
/// is its highest `deployment_id`; it only joins while `active`.
const MANIFESTS_SQL: &str = r"SELECT
    components.repo, components.dir, components.flavor, components.kind,
    owners.email AS owner,
    clusters.name AS cluster,
    d.deployment_id, d.versionstring,
    COALESCE(d.num_instances, 0) AS num_instances,
    COALESCE(d.schedule_string, '') AS schedule_string,
    d.request_id,
    COALESCE(d.cr_skip, FALSE) AS skip,
    COALESCE(d.cr_connect_delay, 0) AS connect_delay,
    COALESCE(d.cr_timeout, 0) AS timeout,
    COALESCE(d.cr_connect_interval, 0) AS connect_interval,
    COALESCE(d.cr_proto, '') AS proto,
    COALESCE(d.cr_path, '') AS path,
    COALESCE(d.cr_port_index, 0) AS port_index,
    COALESCE(d.cr_failure_statuses, '{}') AS failure_statuses,
    COALESCE(d.cr_uri_timeout, 0) AS uri_timeout,
    COALESCE(d.cr_interval, 0) AS check_interval,
    COALESCE(d.cr_retries, 0) AS retries,
    envs.key AS env_key, envs.value AS env_value,
    resources.resource_name, resources.resource_value,
    metadatas.name AS metadata_name, metadatas.value AS metadata_value,
    volumes.position AS volume_position, volumes.host AS volume_host,
    volumes.container AS volume_container, volumes.mode AS volume_mode
  FROM components
    LEFT JOIN component_owners USING (component_id)
    LEFT JOIN owners USING (owner_id)
    LEFT JOIN deployments d
      ON d.component_id = components.component_id
     AND d.lifecycle = $1
     AND d.deployment_id IN (
           SELECT max(deployment_id) FROM deployments GROUP BY cluster_id, component_id)
    LEFT JOIN clusters ON clusters.cluster_id = d.cluster_id
    LEFT JOIN envs ON envs.deployment_id = d.deployment_id
    LEFT JOIN resources ON resources.deployment_id = d.deployment_id
    LEFT JOIN metadatas ON metadatas.deployment_id = d.deployment_id
    LEFT JOIN volumes ON volumes.deployment_id = d.deployment_id
  WHERE components.active
  ORDER BY components.repo, components.dir, components.flavor, d.deployment_id, volumes.position";

/// Load the full State visible to `conn`'s transaction.
pub(crate) async fn load_state(conn: &mut PgConnection) -> StoreResult<State> {
    let mut defs = Defs {
        env_vars: fetch_all::<EnvDefRow>(conn, "env_var_defs", ENV_DEFS_SQL)
            .await?
            .into_iter()
            .map(Into::into)
            .collect(),
        resources: fetch_all::<FieldDefRow>(conn, "resource_fdefs", RESOURCE_DEFS_SQL)
            .await?
            .into_iter()
            .map(Into::into)
            .collect(),
        metadata: fetch_all::<FieldDefRow>(conn, "metadata_fdefs", METADATA_DEFS_SQL)
            .await?
            .into_iter()
            .map(Into::into)
            .collect(),
        clusters: fold_cluster_rows(fetch_all::<ClusterRow>(conn, "clusters", CLUSTERS_SQL).await?),
    };
    defs.canonicalize();

    let manifests = load_manifests(conn).await?;

    let mut state = State {
        defs,
        manifests,
        revision: None,
    };
    state.canonicalize();
    Ok(state)
}

async fn load_manifests(conn: &mut PgConnection) -> StoreResult<sous_types::Manifests> {
    let started = Instant::now();
    let mut folder = ManifestFolder::default();
    let outcome = async {
        let mut rows = sqlx::query_as::<_, ManifestRow>(MANIFESTS_SQL)
            .bind(ACTIVE)
            .fetch(&mut *conn);
        while let Some(row) = rows.try_next().await.map_err(|e| query_error("components", e))? {
            folder.push(row)?;
        }
        Ok::<(), StoreError>(())
    }
    .await;
    log_query("components", Direction::Read, folder.rows(), started, outcome.as_ref().err());
    outcome?;
    Ok(folder.finish())
}

async fn fetch_all<T>(
    conn: &mut PgConnection,
    table: &'static str,
    sql: &'static str,
) -> StoreResult<Vec<T>>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    let started = Instant::now();
    let result = sqlx::query_as::<_, T>(sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_error(table, e));
    let rows = result.as_ref().map_or(0, Vec::len);
    log_query(table, Direction::Read, rows, started, result.as_ref().err());
    result
}
