//! Write path: bring the rows in line with a new State.
//!
//! Definitions, clusters, advisories, components and owners are upserted
//! or replaced. Deployments are append-only: a changed or new DeploySpec
//! gets a fresh `active` row with its child rows, a removed one gets a
//! `decommisioned` row, and an unchanged one gets nothing.

use std::collections::BTreeMap;
use std::time::Instant;

use sous_types::{Cluster, Defs, DeploySpec, Manifest, ManifestId, State};
use sqlx::postgres::PgArguments;
use sqlx::{PgConnection, Postgres};

use super::{ACTIVE, DECOMMISSIONED, log_query, query_error};
use crate::error::{StoreError, StoreResult};
use crate::observe::Direction;

/// Advisory rows in `qualities` carry this kind.
const ADVISORY: &str = "advisory";

/// What a write changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteSummary {
    /// Deployments given a new `active` row.
    pub written: usize,
    /// Deployments given a `decommisioned` row.
    pub decommissioned: usize,
    /// Deployments left as they were.
    pub unchanged: usize,
}

/// Make the rows visible to `conn` represent `next`, given that they
/// currently represent `current`.
pub(crate) async fn save_state(
    conn: &mut PgConnection,
    current: &State,
    next: &State,
) -> StoreResult<WriteSummary> {
    replace_defs(conn, &next.defs).await?;

    let cluster_ids = upsert_clusters(conn, current, &next.defs.clusters).await?;
    let component_ids = upsert_components(conn, current, next).await?;

    let mut summary = WriteSummary::default();

    for (manifest, cluster, spec) in next.deployments() {
        let id = manifest.id();
        let prior = current
            .manifests
            .get(&id)
            .and_then(|m| m.deployments.get(cluster));
        if prior == Some(spec) {
            summary.unchanged = summary.unchanged.saturating_add(1);
            continue;
        }
        let component_id = *component_ids
            .get(&id)
            .ok_or_else(|| StoreError::Invalid(format!("manifest {id} has no component row")))?;
        let cluster_id = *cluster_ids.get(cluster).ok_or_else(|| {
            StoreError::Invalid(format!("cluster {cluster:?} not defined (from manifest {id})"))
        })?;
        let deployment_id =
            insert_deployment(conn, component_id, cluster_id, spec, ACTIVE).await?;
        insert_children(conn, deployment_id, spec).await?;
        summary.written = summary.written.saturating_add(1);
    }

    for (manifest, cluster, spec) in current.deployments() {
        let id = manifest.id();
        let kept = next
            .manifests
            .get(&id)
            .is_some_and(|m| m.deployments.contains_key(cluster));
        if kept {
            continue;
        }
        let component_id = match component_ids.get(&id) {
            Some(component_id) => *component_id,
            None => lookup_component(conn, &id).await?,
        };
        let cluster_id = match cluster_ids.get(cluster) {
            Some(cluster_id) => *cluster_id,
            None => lookup_cluster(conn, cluster).await?,
        };
        insert_deployment(conn, component_id, cluster_id, spec, DECOMMISSIONED).await?;
        summary.decommissioned = summary.decommissioned.saturating_add(1);
    }

    Ok(summary)
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

async fn replace_defs(conn: &mut PgConnection, defs: &Defs) -> StoreResult<()> {
    execute(conn, "env_var_defs", sqlx::query("DELETE FROM env_var_defs")).await?;
    if !defs.env_vars.is_empty() {
        let names: Vec<&str> = defs.env_vars.iter().map(|d| d.name.as_str()).collect();
        let descs: Vec<&str> = defs.env_vars.iter().map(|d| d.desc.as_str()).collect();
        let scopes: Vec<&str> = defs.env_vars.iter().map(|d| d.scope.as_str()).collect();
        let types: Vec<&str> = defs.env_vars.iter().map(|d| d.var_type.as_str()).collect();
        execute(
            conn,
            "env_var_defs",
            sqlx::query(
                r#"INSERT INTO env_var_defs ("name", "desc", "scope", "type")
                  SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[], $4::TEXT[])"#,
            )
            .bind(names)
            .bind(descs)
            .bind(scopes)
            .bind(types),
        )
        .await?;
    }

    for (table, fields, delete_sql, insert_sql) in [
        (
            "resource_fdefs",
            &defs.resources,
            "DELETE FROM resource_fdefs",
            r"INSERT INTO resource_fdefs (field_name, var_type, default_value)
              SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[])",
        ),
        (
            "metadata_fdefs",
            &defs.metadata,
            "DELETE FROM metadata_fdefs",
            r"INSERT INTO metadata_fdefs (field_name, var_type, default_value)
              SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[])",
        ),
    ] {
        execute(conn, table, sqlx::query(delete_sql)).await?;
        if fields.is_empty() {
            continue;
        }
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        let types: Vec<&str> = fields.iter().map(|f| f.var_type.as_str()).collect();
        let defaults: Vec<&str> = fields.iter().map(|f| f.default_value.as_str()).collect();
        execute(
            conn,
            table,
            sqlx::query(insert_sql).bind(names).bind(types).bind(defaults),
        )
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

const UPSERT_CLUSTER_SQL: &str = r"INSERT INTO clusters (
    name, kind, base_url, active,
    crdef_skip, crdef_connect_delay, crdef_timeout, crdef_connect_interval,
    crdef_proto, crdef_path, crdef_port_index, crdef_failure_statuses,
    crdef_uri_timeout, crdef_interval, crdef_retries)
  VALUES ($1, $2, $3, TRUE, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
  ON CONFLICT (name) DO UPDATE SET
    kind = EXCLUDED.kind,
    base_url = EXCLUDED.base_url,
    active = TRUE,
    crdef_skip = EXCLUDED.crdef_skip,
    crdef_connect_delay = EXCLUDED.crdef_connect_delay,
    crdef_timeout = EXCLUDED.crdef_timeout,
    crdef_connect_interval = EXCLUDED.crdef_connect_interval,
    crdef_proto = EXCLUDED.crdef_proto,
    crdef_path = EXCLUDED.crdef_path,
    crdef_port_index = EXCLUDED.crdef_port_index,
    crdef_failure_statuses = EXCLUDED.crdef_failure_statuses,
    crdef_uri_timeout = EXCLUDED.crdef_uri_timeout,
    crdef_interval = EXCLUDED.crdef_interval,
    crdef_retries = EXCLUDED.crdef_retries
  RETURNING cluster_id";

async fn upsert_clusters(
    conn: &mut PgConnection,
    current: &State,
    clusters: &BTreeMap<String, Cluster>,
) -> StoreResult<BTreeMap<String, i64>> {
    let mut ids = BTreeMap::new();
    for (name, cluster) in clusters {
        let s = &cluster.startup;
        let started = Instant::now();
        let result = sqlx::query_scalar::<_, i64>(UPSERT_CLUSTER_SQL)
            .bind(name)
            .bind(&cluster.kind)
            .bind(&cluster.base_url)
            .bind(s.skip_check)
            .bind(s.connect_delay)
            .bind(s.timeout)
            .bind(s.connect_interval)
            .bind(&s.check_ready_protocol)
            .bind(&s.check_ready_uri_path)
            .bind(s.check_ready_port_index)
            .bind(&s.check_ready_failure_statuses)
            .bind(s.check_ready_uri_timeout)
            .bind(s.check_ready_interval)
            .bind(s.check_ready_retries)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| query_error("clusters", e));
        log_query("clusters", Direction::Write, 1, started, result.as_ref().err());
        let cluster_id = result?;

        let unchanged = current
            .defs
            .clusters
            .get(name)
            .is_some_and(|prior| prior.allowed_advisories == cluster.allowed_advisories);
        if !unchanged {
            replace_advisories(conn, cluster_id, cluster).await?;
        }
        ids.insert(name.clone(), cluster_id);
    }

    let keep: Vec<i64> = ids.values().copied().collect();
    execute(
        conn,
        "clusters",
        sqlx::query(
            "UPDATE clusters SET active = FALSE \
             WHERE active AND NOT (cluster_id = ANY($1::BIGINT[]))",
        )
        .bind(keep),
    )
    .await?;
    Ok(ids)
}

async fn replace_advisories(
    conn: &mut PgConnection,
    cluster_id: i64,
    cluster: &Cluster,
) -> StoreResult<()> {
    execute(
        conn,
        "cluster_qualities",
        sqlx::query("DELETE FROM cluster_qualities WHERE cluster_id = $1").bind(cluster_id),
    )
    .await?;
    if cluster.allowed_advisories.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = cluster
        .allowed_advisories
        .iter()
        .map(String::as_str)
        .collect();
    execute(
        conn,
        "qualities",
        sqlx::query(
            r"INSERT INTO qualities (name, kind)
              SELECT UNNEST($1::TEXT[]), $2
              ON CONFLICT (name, kind) DO NOTHING",
        )
        .bind(&names)
        .bind(ADVISORY),
    )
    .await?;
    execute(
        conn,
        "cluster_qualities",
        sqlx::query(
            r"INSERT INTO cluster_qualities (cluster_id, quality_id)
              SELECT $1, quality_id FROM qualities WHERE kind = $2 AND name = ANY($3::TEXT[])
              ON CONFLICT DO NOTHING",
        )
        .bind(cluster_id)
        .bind(ADVISORY)
        .bind(&names),
    )
    .await?;
    Ok(())
}

async fn lookup_cluster(conn: &mut PgConnection, name: &str) -> StoreResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT cluster_id FROM clusters WHERE name = $1")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| query_error("clusters", e))
}

// ---------------------------------------------------------------------------
// Components and owners
// ---------------------------------------------------------------------------

async fn upsert_components(
    conn: &mut PgConnection,
    current: &State,
    next: &State,
) -> StoreResult<BTreeMap<ManifestId, i64>> {
    let mut ids = BTreeMap::new();
    for manifest in &next.manifests {
        let id = manifest.id();
        let started = Instant::now();
        let result = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO components (repo, dir, flavor, kind, active)
              VALUES ($1, $2, $3, $4, TRUE)
              ON CONFLICT (repo, dir, flavor) DO UPDATE SET kind = EXCLUDED.kind, active = TRUE
              RETURNING component_id",
        )
        .bind(&manifest.source.repo)
        .bind(&manifest.source.dir)
        .bind(&manifest.flavor)
        .bind(manifest.kind.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| query_error("components", e));
        log_query("components", Direction::Write, 1, started, result.as_ref().err());
        let component_id = result?;

        let owners_unchanged = current
            .manifests
            .get(&id)
            .is_some_and(|prior| prior.owners == manifest.owners);
        if !owners_unchanged {
            replace_owners(conn, component_id, manifest).await?;
        }
        ids.insert(id, component_id);
    }

    let keep: Vec<i64> = ids.values().copied().collect();
    execute(
        conn,
        "components",
        sqlx::query(
            "UPDATE components SET active = FALSE \
             WHERE active AND NOT (component_id = ANY($1::BIGINT[]))",
        )
        .bind(keep),
    )
    .await?;
    Ok(ids)
}

async fn replace_owners(
    conn: &mut PgConnection,
    component_id: i64,
    manifest: &Manifest,
) -> StoreResult<()> {
    execute(
        conn,
        "component_owners",
        sqlx::query("DELETE FROM component_owners WHERE component_id = $1").bind(component_id),
    )
    .await?;
    if manifest.owners.is_empty() {
        return Ok(());
    }
    let emails: Vec<&str> = manifest.owners.iter().map(String::as_str).collect();
    execute(
        conn,
        "owners",
        sqlx::query(
            r"INSERT INTO owners (email) SELECT UNNEST($1::TEXT[])
              ON CONFLICT (email) DO NOTHING",
        )
        .bind(&emails),
    )
    .await?;
    execute(
        conn,
        "component_owners",
        sqlx::query(
            r"INSERT INTO component_owners (component_id, owner_id)
              SELECT $1, owner_id FROM owners WHERE email = ANY($2::TEXT[])
              ON CONFLICT DO NOTHING",
        )
        .bind(component_id)
        .bind(&emails),
    )
    .await?;
    Ok(())
}

async fn lookup_component(conn: &mut PgConnection, id: &ManifestId) -> StoreResult<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT component_id FROM components WHERE repo = $1 AND dir = $2 AND flavor = $3",
    )
    .bind(&id.source.repo)
    .bind(&id.source.dir)
    .bind(&id.flavor)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| query_error("components", e))
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

const INSERT_DEPLOYMENT_SQL: &str = r"INSERT INTO deployments (
    component_id, cluster_id, versionstring, num_instances, schedule_string,
    request_id, lifecycle,
    cr_skip, cr_connect_delay, cr_timeout, cr_connect_interval,
    cr_proto, cr_path, cr_port_index, cr_failure_statuses,
    cr_uri_timeout, cr_interval, cr_retries)
  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
  RETURNING deployment_id";

async fn insert_deployment(
    conn: &mut PgConnection,
    component_id: i64,
    cluster_id: i64,
    spec: &DeploySpec,
    lifecycle: &str,
) -> StoreResult<i64> {
    let s = &spec.startup;
    let started = Instant::now();
    let result = sqlx::query_scalar::<_, i64>(INSERT_DEPLOYMENT_SQL)
        .bind(component_id)
        .bind(cluster_id)
        .bind(spec.version.to_string())
        .bind(spec.num_instances)
        .bind(&spec.schedule)
        .bind(spec.request_id.as_deref())
        .bind(lifecycle)
        .bind(s.skip_check)
        .bind(s.connect_delay)
        .bind(s.timeout)
        .bind(s.connect_interval)
        .bind(&s.check_ready_protocol)
        .bind(&s.check_ready_uri_path)
        .bind(s.check_ready_port_index)
        .bind(&s.check_ready_failure_statuses)
        .bind(s.check_ready_uri_timeout)
        .bind(s.check_ready_interval)
        .bind(s.check_ready_retries)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| query_error("deployments", e));
    log_query("deployments", Direction::Write, 1, started, result.as_ref().err());
    result
}

async fn insert_children(
    conn: &mut PgConnection,
    deployment_id: i64,
    spec: &DeploySpec,
) -> StoreResult<()> {
    for (table, map, sql) in [
        (
            "envs",
            &spec.env,
            r"INSERT INTO envs (deployment_id, key, value)
              SELECT $1::BIGINT, * FROM UNNEST($2::TEXT[], $3::TEXT[])",
        ),
        (
            "resources",
            &spec.resources,
            r"INSERT INTO resources (deployment_id, resource_name, resource_value)
              SELECT $1::BIGINT, * FROM UNNEST($2::TEXT[], $3::TEXT[])",
        ),
        (
            "metadatas",
            &spec.metadata,
            r"INSERT INTO metadatas (deployment_id, name, value)
              SELECT $1::BIGINT, * FROM UNNEST($2::TEXT[], $3::TEXT[])",
        ),
    ] {
        if map.is_empty() {
            continue;
        }
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        let values: Vec<&str> = map.values().map(String::as_str).collect();
        execute(
            conn,
            table,
            sqlx::query(sql).bind(deployment_id).bind(keys).bind(values),
        )
        .await?;
    }

    if spec.volumes.is_empty() {
        return Ok(());
    }
    let mut positions = Vec::with_capacity(spec.volumes.len());
    for index in 0..spec.volumes.len() {
        let position = i32::try_from(index)
            .map_err(|e| StoreError::Invalid(format!("too many volumes: {e}")))?;
        positions.push(position);
    }
    let hosts: Vec<&str> = spec.volumes.iter().map(|v| v.host.as_str()).collect();
    let containers: Vec<&str> = spec.volumes.iter().map(|v| v.container.as_str()).collect();
    let modes: Vec<&str> = spec.volumes.iter().map(|v| v.mode.as_str()).collect();
    execute(
        conn,
        "volumes",
        sqlx::query(
            r"INSERT INTO volumes (deployment_id, position, host, container, mode)
              SELECT $1::BIGINT, * FROM UNNEST($2::INT[], $3::TEXT[], $4::TEXT[], $5::TEXT[])",
        )
        .bind(deployment_id)
        .bind(positions)
        .bind(hosts)
        .bind(containers)
        .bind(modes),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run a statement, logging it against `table`.
async fn execute(
    conn: &mut PgConnection,
    table: &'static str,
    query: sqlx::query::Query<'_, Postgres, PgArguments>,
) -> StoreResult<u64> {
    let started = Instant::now();
    let result = query
        .execute(&mut *conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(|e| query_error(table, e));
    let rows = result
        .as_ref()
        .map_or(0, |n| usize::try_from(*n).unwrap_or(usize::MAX));
    log_query(table, Direction::Write, rows, started, result.as_ref().err());
    result
}
