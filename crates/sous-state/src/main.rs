//! `sous-state`: inspect and maintain the Sous deployment state store.
//!
//! ```text
//! sous-state read      # read the State, log a summary, print it as JSON
//! sous-state mirror    # read through a replicated store to fill its secondary
//! sous-state migrate   # apply the PostgreSQL schema migrations
//! ```
//!
//! Storage configuration is read from the YAML file named by
//! `SOUS_STORAGE_CONFIG` (default `sous-storage.yaml`). A missing file means
//! every default applies.

mod error;

use std::path::{Path, PathBuf};

use sous_storage::{
    BackendKind, PostgresPool, StateStore, StorageConfig, TracingObserver, build_store,
};
use sous_types::State;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Config file used when `SOUS_STORAGE_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "sous-storage.yaml";

/// What to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Read,
    Mirror,
    Migrate,
}

impl Command {
    fn parse(arg: Option<&str>) -> Result<Self, AppError> {
        match arg {
            Some("read") => Ok(Self::Read),
            Some("mirror") => Ok(Self::Mirror),
            Some("migrate") => Ok(Self::Migrate),
            Some(other) => Err(AppError::Usage(format!(
                "unknown command {other:?}; expected read, mirror or migrate"
            ))),
            None => Err(AppError::Usage(
                "missing command; expected read, mirror or migrate".to_owned(),
            )),
        }
    }
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the command line, configuration or store call fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let arg = std::env::args().nth(1);
    let command = Command::parse(arg.as_deref())?;

    let config_path = std::env::var_os("SOUS_STORAGE_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&config_path)?;
    info!(
        config = %config_path.display(),
        primary = config.primary.as_str(),
        secondary = config.secondary.map(BackendKind::as_str),
        state_location = %config.state_location.display(),
        "configuration loaded"
    );

    match command {
        Command::Read => read(&config).await?,
        Command::Mirror => mirror(&config).await?,
        Command::Migrate => migrate(&config).await?,
    }
    Ok(())
}

/// Load `path`, or fall back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<StorageConfig, AppError> {
    if path.exists() {
        return Ok(StorageConfig::from_file(path)?);
    }
    let mut config = StorageConfig::default();
    config.apply_env_overrides();
    Ok(config)
}

async fn read(config: &StorageConfig) -> Result<(), AppError> {
    let store = build_store(config, TracingObserver::shared()).await?;
    let state = store.read_state().await?;
    log_summary(store.name(), &state);
    println!("{}", render(&state)?);
    Ok(())
}

async fn mirror(config: &StorageConfig) -> Result<(), AppError> {
    if config.secondary.is_none() {
        return Err(AppError::Usage(
            "mirror needs a secondary store in the configuration".to_owned(),
        ));
    }
    let store = build_store(config, TracingObserver::shared()).await?;
    let state = store.read_state().await?;
    log_summary(store.name(), &state);
    info!("mirror complete");
    Ok(())
}

async fn migrate(config: &StorageConfig) -> Result<(), AppError> {
    let pool = PostgresPool::connect(&config.database.postgres()).await?;
    let result = pool.run_migrations().await;
    pool.close().await;
    result?;
    Ok(())
}

fn log_summary(store: &str, state: &State) {
    info!(
        store,
        clusters = state.defs.clusters.len(),
        manifests = state.manifests.len(),
        deployments = state.deployment_count(),
        revision = state.revision.as_deref().unwrap_or("-"),
        "state read"
    );
}

/// The State as pretty JSON: definitions, manifests in identity order, and
/// the revision it was read at.
fn render(state: &State) -> Result<String, AppError> {
    let manifests: Vec<_> = state.manifests.iter().collect();
    let value = serde_json::json!({
        "defs": state.defs,
        "manifests": manifests,
        "revision": state.revision,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sous_types::{Manifest, ManifestId, ManifestKind};

    #[test]
    fn parses_known_commands() {
        assert_eq!(Command::parse(Some("read")).unwrap(), Command::Read);
        assert_eq!(Command::parse(Some("mirror")).unwrap(), Command::Mirror);
        assert_eq!(Command::parse(Some("migrate")).unwrap(), Command::Migrate);
        assert!(matches!(Command::parse(Some("push")), Err(AppError::Usage(_))));
        assert!(matches!(Command::parse(None), Err(AppError::Usage(_))));
    }

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.primary, StorageConfig::default().primary);
        assert_eq!(config.git.branch, "master");
    }

    #[test]
    fn render_lists_manifests() {
        let mut state = State::new();
        state
            .manifests
            .add(Manifest::new(
                ManifestId::new("github.com/opentable/sous", "", ""),
                ManifestKind::Worker,
            ))
            .unwrap();
        state.revision = Some("abc123".to_owned());

        let value: serde_json::Value = serde_json::from_str(&render(&state).unwrap()).unwrap();
        assert_eq!(value["revision"], "abc123");
        assert_eq!(value["manifests"].as_array().unwrap().len(), 1);
        assert_eq!(value["manifests"][0]["kind"], "worker");
    }
}
