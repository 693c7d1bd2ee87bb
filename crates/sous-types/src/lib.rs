//! Shared type definitions for the Sous deployment state store.
//!
//! This crate is the in-memory object graph of the Global Deployment
//! Manifest (GDM). It has no behavior beyond construction, canonical
//! ordering and structural validation; every storage backend reads and
//! writes these types.
//!
//! # Modules
//!
//! - [`ids`] -- Source locations and manifest identities
//! - [`enums`] -- Manifest kinds and volume modes
//! - [`structs`] -- Manifests, deploy specs, clusters and definitions
//! - [`state`] -- The [`State`] aggregate root and its manifest collection
//! - [`user`] -- The actor recorded on writes

pub mod enums;
pub mod ids;
pub mod state;
pub mod structs;
pub mod user;

// Re-export all public types at crate root for convenience.
pub use enums::{ManifestKind, ParseEnumError, VolumeMode};
pub use ids::{ManifestId, SourceLocation};
pub use semver::Version;
pub use state::{DuplicateManifest, Manifests, State, StateFlaw};
pub use structs::{Cluster, Defs, DeploySpec, EnvDef, FieldDefinition, Manifest, Startup, Volume};
pub use user::User;
