//! Deployment state stores for Sous.
//!
//! Every backend implements the two-operation [`StateStore`] contract:
//! read the whole [`sous_types::State`], or replace it. Callers depend on
//! the trait and get a concrete store from [`build_store`].
//!
//! # Architecture
//!
//! ```text
//! build_store(config)
//!     |
//!     +-- VersionedFileTreeStore  (git clone; pull, tag, commit, push)
//!     |       +-- FileTreeStore   (YAML tree via TreeCodec)
//!     +-- FileTreeStore
//!     +-- RelationalStore         (PostgreSQL, append-only deployments)
//!     +-- NullStore
//!     |
//!     +-- ReplicatedStore(primary, secondary)  when a secondary is set
//! ```
//!
//! # Modules
//!
//! - [`store`] -- The [`StateStore`] capability trait
//! - [`codec`] -- Hierarchical YAML file-tree layout
//! - [`file_tree`] -- Plain directory store
//! - [`git`] -- Isolated git command driver
//! - [`versioned`] -- Git-backed store with optimistic concurrency
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`relational`] -- `PostgreSQL`-backed store
//! - [`replicated`] -- Primary plus best-effort mirror
//! - [`null`] -- Store that persists nothing
//! - [`observe`] -- Per-call events and observers
//! - [`config`] -- Storage configuration loading
//! - [`factory`] -- Build the configured store
//! - [`error`] -- Shared error types

pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod file_tree;
pub mod git;
pub mod null;
pub mod observe;
pub mod postgres;
pub mod relational;
pub mod replicated;
pub mod store;
pub mod versioned;

// Re-export primary types for convenience.
pub use codec::TreeCodec;
pub use config::{BackendKind, ConfigError, DatabaseConfig, GitConfig, StorageConfig};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use factory::{build_backend, build_store};
pub use file_tree::FileTreeStore;
pub use git::Git;
pub use null::NullStore;
pub use observe::{
    CapturingObserver, Direction, SharedObserver, Stopwatch, StoreEvent, StoreObserver,
    TracingObserver,
};
pub use postgres::{PostgresConfig, PostgresPool};
pub use relational::RelationalStore;
pub use replicated::ReplicatedStore;
pub use store::StateStore;
pub use versioned::VersionedFileTreeStore;
