//! Error types for the storage layer.
//!
//! Every backend reports failures through [`StoreError`]. Variants carry
//! the file, query or git operation that failed so an error can be
//! diagnosed without re-running at higher verbosity. [`StoreError::kind`]
//! collapses the variants into the coarse [`ErrorKind`] callers branch on;
//! in particular [`StoreError::is_conflict`] is the signal for a
//! "reload and reapply" loop.

use core::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result alias used throughout the storage layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The storage root does not exist. Recovered into an empty State by
    /// every read; never returned to callers.
    NotFound,
    /// A concurrent writer won the race. The persisted state is unchanged.
    Conflict,
    /// Stored data could not be turned back into a State.
    Decode,
    /// Network, filesystem, git or SQL driver failure.
    Transport,
    /// The State handed to a write cannot be persisted by this backend.
    Invalid,
    /// The store is misconfigured.
    Config,
}

impl ErrorKind {
    /// Lowercase name used in log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Decode => "decode",
            Self::Transport => "transport",
            Self::Invalid => "invalid",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while reading or writing a State.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage root does not exist.
    #[error("storage root {path} not found")]
    NotFound {
        /// The missing root.
        path: PathBuf,
    },

    /// A concurrent writer changed the persisted state first.
    #[error("write conflict: {reason}")]
    Conflict {
        /// What was detected.
        reason: String,
    },

    /// Stored data is malformed or inconsistent.
    #[error("cannot decode {context}: {reason}")]
    Decode {
        /// Which file, row or field was being decoded.
        context: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A YAML document could not be parsed or produced.
    #[error("YAML error in {path}: {source}")]
    Yaml {
        /// The file being read or written.
        path: PathBuf,
        /// The underlying YAML error.
        source: serde_yml::Error,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A git command exited unsuccessfully.
    #[error("git {operation} failed: {output}")]
    Git {
        /// The git subcommand and its arguments.
        operation: String,
        /// Combined stdout and stderr of the command.
        output: String,
    },

    /// A directory expected to be a git working copy is not one.
    #[error("{path} is not a git working copy")]
    NotARepository {
        /// The directory that was checked.
        path: PathBuf,
    },

    /// A named `PostgreSQL` query failed.
    #[error("PostgreSQL error in {query}: {source}")]
    Query {
        /// Short name of the query, e.g. `load clusters`.
        query: &'static str,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// A `PostgreSQL` operation outside a named query failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was running.
        operation: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The State cannot be persisted by this backend.
    #[error("invalid state: {0}")]
    Invalid(String),

    /// The store is misconfigured.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Decode { .. } | Self::Yaml { .. } => ErrorKind::Decode,
            Self::Io { .. }
            | Self::Git { .. }
            | Self::NotARepository { .. }
            | Self::Query { .. }
            | Self::Postgres(_)
            | Self::Migration(_)
            | Self::Timeout { .. }
            | Self::Task(_) => ErrorKind::Transport,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a concurrent writer won the race.
    ///
    /// Conflicts are the only errors a caller can resolve by re-reading the
    /// State and reapplying its change.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Build a [`StoreError::Conflict`].
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Build a [`StoreError::Decode`].
    pub fn decode(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a YAML error with the file it concerns.
    pub fn yaml(path: impl Into<PathBuf>, source: serde_yml::Error) -> Self {
        Self::Yaml {
            path: path.into(),
            source,
        }
    }

    /// Wrap a driver error with the name of the query that raised it.
    pub const fn query(query: &'static str, source: sqlx::Error) -> Self {
        Self::Query { query, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_is_conflict() {
        assert!(StoreError::conflict("remote advanced").is_conflict());
        assert!(!StoreError::Invalid("x".to_owned()).is_conflict());
        assert!(
            !StoreError::Git {
                operation: "push".to_owned(),
                output: "[remote rejected]".to_owned(),
            }
            .is_conflict()
        );
    }

    #[test]
    fn yaml_and_row_errors_are_decode() {
        let yaml_err = serde_yml::from_str::<u32>("[").map(|_| ()).err();
        if let Some(source) = yaml_err {
            assert_eq!(
                StoreError::yaml("defs.yaml", source).kind(),
                ErrorKind::Decode
            );
        }
        assert_eq!(
            StoreError::decode("deployments row 3", "bad version").kind(),
            ErrorKind::Decode
        );
    }

    #[test]
    fn timeouts_are_transport() {
        let err = StoreError::Timeout {
            operation: "read state",
            after: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("read state"));
    }
}
