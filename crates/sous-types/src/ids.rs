//! Identity types for deployable units.
//!
//! A manifest is identified by where its source lives (repository URL plus
//! an offset directory inside that repository) and an optional flavor that
//! tells apart several deployments of the same source in the same clusters.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Separator between a repository URL and its offset in display form.
pub const OFFSET_SEPARATOR: char = ':';

/// Separator between a source location and its flavor in display form.
pub const FLAVOR_SEPARATOR: char = '~';

/// The location of a deployable unit's source code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Repository URL without a scheme, e.g. `github.com/opentable/sous`.
    pub repo: String,
    /// Repository-relative directory. Empty for the repository root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

impl SourceLocation {
    /// Build a source location from a repository URL and an offset.
    pub fn new(repo: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            dir: dir.into(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_empty() {
            write!(f, "{}", self.repo)
        } else {
            write!(f, "{}{OFFSET_SEPARATOR}{}", self.repo, self.dir)
        }
    }
}

/// Identity of a [`Manifest`](crate::Manifest) within a State.
///
/// Two manifests with equal identities never coexist in one State.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ManifestId {
    /// Where the source lives.
    pub source: SourceLocation,
    /// Disambiguates several deployments of the same source. Usually empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,
}

impl ManifestId {
    /// Build an identity from its parts.
    pub fn new(repo: impl Into<String>, dir: impl Into<String>, flavor: impl Into<String>) -> Self {
        Self {
            source: SourceLocation::new(repo, dir),
            flavor: flavor.into(),
        }
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flavor.is_empty() {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}{FLAVOR_SEPARATOR}{}", self.source, self.flavor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_omits_empty_parts() {
        let id = ManifestId::new("github.com/opentable/sous", "", "");
        assert_eq!(id.to_string(), "github.com/opentable/sous");
    }

    #[test]
    fn display_includes_offset_and_flavor() {
        let id = ManifestId::new("github.com/opentable/sous", "server", "canary");
        assert_eq!(id.to_string(), "github.com/opentable/sous:server~canary");
    }

    #[test]
    fn ordering_groups_flavors_under_their_source() {
        let plain = ManifestId::new("github.com/a/b", "", "");
        let flavored = ManifestId::new("github.com/a/b", "", "x");
        let other = ManifestId::new("github.com/a/c", "", "");
        assert!(plain < flavored);
        assert!(flavored < other);
    }
}
