//! `PostgreSQL` connection configuration and pool.
//!
//! [`PostgresConfig`] is a plain value: building its libpq connection
//! string does no I/O and cannot fail. [`PostgresPool`] turns it into a
//! [`sqlx::PgPool`] and applies the embedded schema migrations.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time checked)
//! so the crate builds without a live database. All queries are
//! parameterized.

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::error::{StoreError, StoreResult};

/// Default server host.
const DEFAULT_HOST: &str = "localhost";

/// Default server port.
const DEFAULT_PORT: u16 = 5432;

/// Default role.
const DEFAULT_USER: &str = "postgres";

/// Default TLS negotiation mode.
const DEFAULT_SSL_MODE: &str = "prefer";

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default idle timeout in seconds.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// How to reach the state database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Server host name or socket directory.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Role to connect as.
    pub user: String,
    /// Password for `user`. Empty for none.
    pub password: String,
    /// libpq `sslmode`, e.g. `disable`, `prefer`, `require`.
    pub ssl_mode: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl PostgresConfig {
    /// Configuration for `database` on the local server with default
    /// credentials and pool settings.
    pub fn new(database: &str) -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            database: database.to_owned(),
            user: DEFAULT_USER.to_owned(),
            password: String::new(),
            ssl_mode: DEFAULT_SSL_MODE.to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Set the host.
    #[must_use]
    pub fn with_host(mut self, host: &str) -> Self {
        host.clone_into(&mut self.host);
        self
    }

    /// Set the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the user and password.
    #[must_use]
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        user.clone_into(&mut self.user);
        password.clone_into(&mut self.password);
        self
    }

    /// Set the libpq `sslmode`.
    #[must_use]
    pub fn with_ssl_mode(mut self, mode: &str) -> Self {
        mode.clone_into(&mut self.ssl_mode);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// The libpq keyword/value connection string for this configuration.
    ///
    /// Values that are empty or contain spaces, quotes or backslashes are
    /// single-quoted with libpq escaping.
    pub fn connection_string(&self) -> String {
        let port = self.port.to_string();
        [
            ("dbname", self.database.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
            ("host", self.host.as_str()),
            ("port", port.as_str()),
            ("sslmode", self.ssl_mode.as_str()),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={}", quote_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// A copy with the password masked, for logs.
    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.password.is_empty() {
            copy.password = "*****".to_owned();
        }
        copy
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes =
        value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_owned();
    }
    let mut quoted = String::with_capacity(value.len().saturating_add(2));
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Connection pool handle to `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Connect to `PostgreSQL` using the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if `ssl_mode` is not a libpq mode and
    /// [`StoreError::Postgres`] if the connection fails.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let ssl_mode = PgSslMode::from_str(&config.ssl_mode).map_err(|e| {
            StoreError::Config(format!("invalid sslmode {:?}: {e}", config.ssl_mode))
        })?;

        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .ssl_mode(ssl_mode);
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(
            connection = %config.redacted().connection_string(),
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[cfg(test)]
    pub(crate) const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations from the `migrations/` directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if any migration fails.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Return a reference to the underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close all connections in the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_lists_every_field() {
        let config = PostgresConfig::new("sous")
            .with_host("db.internal")
            .with_port(6543)
            .with_credentials("sous_rw", "hunter2")
            .with_ssl_mode("disable");
        assert_eq!(
            config.connection_string(),
            "dbname=sous user=sous_rw password=hunter2 host=db.internal port=6543 sslmode=disable"
        );
    }

    #[test]
    fn connection_string_quotes_awkward_values() {
        let config = PostgresConfig::new("sous").with_credentials("postgres", "it's a secret");
        let conn = config.connection_string();
        assert!(conn.contains(r"password='it\'s a secret'"));
        assert!(conn.starts_with("dbname=sous user=postgres "));
    }

    #[test]
    fn empty_password_is_quoted_empty() {
        let conn = PostgresConfig::new("sous").connection_string();
        assert!(conn.contains("password='' "));
        assert!(conn.ends_with("port=5432 sslmode=prefer"));
    }

    #[test]
    fn redacted_hides_password() {
        let config = PostgresConfig::new("sous").with_credentials("u", "hunter2");
        assert!(!config.redacted().connection_string().contains("hunter2"));
    }
}
