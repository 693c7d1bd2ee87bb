//! Storage configuration loading.
//!
//! The configuration lives in a YAML file (by default `sous-storage.yaml`).
//! Every section has defaults, so an empty file is a valid configuration
//! that selects a git store at `./gdm` on branch `master`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::postgres::PostgresConfig;
use crate::versioned::DEFAULT_BRANCH;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Which backend a store slot uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A git working copy of a shared remote.
    #[default]
    Git,
    /// A plain directory tree.
    File,
    /// `PostgreSQL` tables.
    Database,
    /// No persistence.
    Null,
}

impl BackendKind {
    /// Lowercase name as written in the configuration file.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::File => "file",
            Self::Database => "database",
            Self::Null => "null",
        }
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// The authoritative backend.
    #[serde(default)]
    pub primary: BackendKind,

    /// Optional best-effort mirror of the primary.
    #[serde(default)]
    pub secondary: Option<BackendKind>,

    /// Base directory of the file tree (the working copy for `git`).
    #[serde(default = "default_state_location")]
    pub state_location: PathBuf,

    /// Git settings.
    #[serde(default)]
    pub git: GitConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl StorageConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    ///
    /// Environment variables override YAML values:
    /// - `SOUS_STATE_LOCATION` overrides `state_location`
    /// - `SOUS_GIT_REMOTE` overrides `git.remote`
    /// - `PGHOST`, `PGPORT`, `PGDATABASE`, `PGUSER` and `PGPASSWORD`
    ///   override the matching `database` fields
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string. No environment overrides
    /// are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps a variable name to its
    /// value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("SOUS_STATE_LOCATION") {
            self.state_location = PathBuf::from(val);
        }
        if let Some(val) = lookup("SOUS_GIT_REMOTE") {
            self.git.remote = Some(val);
        }
        if let Some(val) = lookup("PGHOST") {
            self.database.host = val;
        }
        if let Some(val) = lookup("PGPORT") {
            match val.parse() {
                Ok(port) => self.database.port = port,
                Err(e) => tracing::warn!(value = %val, error = %e, "Ignoring invalid PGPORT"),
            }
        }
        if let Some(val) = lookup("PGDATABASE") {
            self.database.name = val;
        }
        if let Some(val) = lookup("PGUSER") {
            self.database.user = val;
        }
        if let Some(val) = lookup("PGPASSWORD") {
            self.database.password = val;
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary: BackendKind::default(),
            secondary: None,
            state_location: default_state_location(),
            git: GitConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Git store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitConfig {
    /// URL cloned into `state_location` when no working copy exists there.
    #[serde(default)]
    pub remote: Option<String>,

    /// Branch that holds the state.
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: None,
            branch: default_branch(),
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// Server host.
    #[serde(default = "default_db_host")]
    pub host: String,

    /// Server port.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name.
    #[serde(default = "default_db_name")]
    pub name: String,

    /// Role to connect as.
    #[serde(default = "default_db_user")]
    pub user: String,

    /// Password for `user`.
    #[serde(default)]
    pub password: String,

    /// libpq `sslmode`.
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Milliseconds to wait for a pooled connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Milliseconds a pooled connection may sit idle before it is closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Milliseconds allowed for a whole read or write.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Connection settings for [`crate::PostgresPool::connect`].
    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig::new(&self.name)
            .with_host(&self.host)
            .with_port(self.port)
            .with_credentials(&self.user, &self.password)
            .with_ssl_mode(&self.ssl_mode)
            .with_max_connections(self.max_connections)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_idle_timeout(Duration::from_millis(self.idle_timeout_ms))
    }

    /// Bound on a whole read or write.
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            ssl_mode: default_ssl_mode(),
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_state_location() -> PathBuf {
    PathBuf::from("gdm")
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_owned()
}

fn default_db_host() -> String {
    "localhost".to_owned()
}

const fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "sous".to_owned()
}

fn default_db_user() -> String {
    "postgres".to_owned()
}

fn default_ssl_mode() -> String {
    "prefer".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_idle_timeout_ms() -> u64 {
    300_000
}

const fn default_query_timeout_ms() -> u64 {
    30_000
}
