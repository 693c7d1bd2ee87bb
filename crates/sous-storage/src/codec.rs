//! Hierarchical file-tree codec.
//!
//! Maps a [`State`] onto a directory of YAML files and back:
//!
//! ```text
//! <base>/
//!   defs.yaml                                    Defs
//!   manifests/
//!     github.com/opentable/sous.yaml             repo root, no flavor
//!     github.com/opentable/sous/server.yaml      offset "server"
//!     github.com/opentable/sous~canary.yaml      flavor "canary"
//! ```
//!
//! A manifest's identity comes from the file's contents; its path is a
//! function of that identity and must agree with where the file was found.
//! Writes replace the whole tree: every manifest file is rewritten through
//! a temporary file and a rename, and YAML files belonging to manifests no
//! longer in the State are deleted along with any directories left empty.
//!
//! All functions here block. Async callers run them on
//! [`tokio::task::spawn_blocking`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sous_types::ids::FLAVOR_SEPARATOR;
use sous_types::{Defs, Manifest, ManifestId, Manifests, State};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};

/// File holding the fleet-wide definitions.
pub const DEFS_FILE: &str = "defs.yaml";

/// Directory holding one file per manifest.
pub const MANIFESTS_DIR: &str = "manifests";

/// Extension of every file the codec owns.
const EXTENSION: &str = "yaml";

/// Reads and writes a State rooted at one base directory.
#[derive(Debug, Clone)]
pub struct TreeCodec {
    base: PathBuf,
}

impl TreeCodec {
    /// A codec rooted at `base`. Nothing is touched until the first call.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Decode the whole tree.
    ///
    /// A missing base directory, `defs.yaml` or `manifests/` reads as the
    /// corresponding empty value.
    pub fn read(&self) -> StoreResult<State> {
        if !exists(&self.base)? {
            tracing::debug!(base = %self.base.display(), "State tree absent, reading empty state");
            return Ok(State::new());
        }

        let mut state = State {
            defs: self.read_defs()?,
            manifests: self.read_manifests()?,
            revision: None,
        };
        state.canonicalize();

        if let Some(flaw) = state.flaws().into_iter().next() {
            return Err(StoreError::decode(
                self.base.display().to_string(),
                flaw.to_string(),
            ));
        }

        tracing::debug!(
            base = %self.base.display(),
            manifests = state.manifests.len(),
            clusters = state.defs.clusters.len(),
            "Decoded state tree"
        );
        Ok(state)
    }

    /// Encode the whole tree, replacing what was there.
    ///
    /// Every path is computed and checked before the first file changes, so
    /// a State with an unrepresentable identity leaves the tree untouched.
    pub fn write(&self, state: &State) -> StoreResult<()> {
        if let Some(flaw) = state.flaws().into_iter().next() {
            return Err(StoreError::Invalid(flaw.to_string()));
        }

        let mut wanted: BTreeMap<PathBuf, &Manifest> = BTreeMap::new();
        for manifest in &state.manifests {
            let id = manifest.id();
            let rel = manifest_path(&id)
                .map_err(|reason| StoreError::Invalid(format!("manifest {id}: {reason}")))?;
            if let Some(other) = wanted.get(&rel) {
                return Err(StoreError::Invalid(format!(
                    "manifests {} and {id} both map to {}",
                    other.id(),
                    rel.display()
                )));
            }
            wanted.insert(rel, manifest);
        }

        fs::create_dir_all(&self.base).map_err(|e| StoreError::io(&self.base, e))?;

        let mut defs = state.defs.clone();
        defs.canonicalize();
        write_yaml(&self.base.join(DEFS_FILE), &defs)?;

        for (rel, manifest) in &wanted {
            write_yaml(&self.base.join(rel), *manifest)?;
        }

        let removed = self.remove_stale(&wanted)?;
        tracing::debug!(
            base = %self.base.display(),
            manifests = wanted.len(),
            removed,
            "Encoded state tree"
        );
        Ok(())
    }

    fn read_defs(&self) -> StoreResult<Defs> {
        let path = self.base.join(DEFS_FILE);
        Ok(read_yaml(&path)?.unwrap_or_default())
    }

    fn read_manifests(&self) -> StoreResult<Manifests> {
        let mut manifests = Manifests::new();
        for path in self.manifest_files()? {
            let Some(manifest) = read_yaml::<Manifest>(&path)? else {
                continue;
            };
            let rel = path.strip_prefix(&self.base).unwrap_or(&path);
            let id = manifest.id();
            let expected = manifest_path(&id)
                .map_err(|reason| StoreError::decode(rel.display().to_string(), reason))?;
            if expected != rel {
                return Err(StoreError::decode(
                    rel.display().to_string(),
                    format!("holds manifest {id}, which belongs at {}", expected.display()),
                ));
            }
            manifests
                .add(manifest)
                .map_err(|e| StoreError::decode(rel.display().to_string(), e.to_string()))?;
        }
        Ok(manifests)
    }

    /// Every `.yaml` file under `manifests/`, in path order.
    fn manifest_files(&self) -> StoreResult<Vec<PathBuf>> {
        let root = self.base.join(MANIFESTS_DIR);
        if !exists(&root)? {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| walk_error(&root, e))?;
            if entry.file_type().is_file() && has_yaml_extension(entry.path()) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Delete manifest files not in `wanted`, then directories left empty.
    fn remove_stale(&self, wanted: &BTreeMap<PathBuf, &Manifest>) -> StoreResult<usize> {
        let root = self.base.join(MANIFESTS_DIR);
        let mut removed: usize = 0;
        for path in self.manifest_files()? {
            let rel = path.strip_prefix(&self.base).unwrap_or(&path);
            if !wanted.contains_key(rel) {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                removed = removed.saturating_add(1);
            }
        }

        if !exists(&root)? {
            return Ok(removed);
        }
        let mut dirs = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).contents_first(true) {
            let entry = entry.map_err(|e| walk_error(&root, e))?;
            if entry.file_type().is_dir() {
                dirs.push(entry.into_path());
            }
        }
        for dir in dirs {
            let mut listing = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
            if listing.next().is_none() {
                fs::remove_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Path of a manifest's file relative to the base directory.
///
/// `Err` carries the reason the identity cannot be mapped onto a path.
pub fn manifest_path(id: &ManifestId) -> Result<PathBuf, String> {
    let mut segments = segments(&id.source.repo, "repository")?;
    segments.extend(segments_of_dir(&id.source.dir)?);

    let Some((last, parents)) = segments.split_last() else {
        return Err("empty repository".to_owned());
    };

    let mut path = PathBuf::from(MANIFESTS_DIR);
    for parent in parents {
        path.push(parent);
    }

    let mut file = (*last).to_owned();
    if !id.flavor.is_empty() {
        check_segment(&id.flavor, "flavor")?;
        file.push(FLAVOR_SEPARATOR);
        file.push_str(&id.flavor);
    }
    file.push('.');
    file.push_str(EXTENSION);
    path.push(file);
    Ok(path)
}

fn segments<'a>(value: &'a str, what: &str) -> Result<Vec<&'a str>, String> {
    value
        .split('/')
        .map(|segment| check_segment(segment, what).map(|()| segment))
        .collect()
}

fn segments_of_dir(dir: &str) -> Result<Vec<&str>, String> {
    if dir.is_empty() {
        return Ok(Vec::new());
    }
    segments(dir, "offset")
}

fn check_segment(segment: &str, what: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err(format!("{what} has an empty path segment"));
    }
    if segment == "." || segment == ".." {
        return Err(format!("{what} has a relative path segment {segment:?}"));
    }
    if segment.contains(['\\', '\0']) || (what == "flavor" && segment.contains('/')) {
        return Err(format!("{what} segment {segment:?} has a forbidden character"));
    }
    Ok(())
}

fn has_yaml_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == EXTENSION)
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn exists(path: &Path) -> StoreResult<bool> {
    path.try_exists().map_err(|e| StoreError::io(path, e))
}

fn walk_error(root: &Path, err: walkdir::Error) -> StoreError {
    let path = err.path().unwrap_or(root).to_path_buf();
    StoreError::io(path, err.into())
}

/// Read and parse one YAML file. A missing or blank file is `None`.
fn read_yaml<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_yml::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::yaml(path, e))
}

/// Serialize `value` to `path` through a temporary file in the same
/// directory. An identical file is left alone.
fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let text = serde_yml::to_string(value).map_err(|e| StoreError::yaml(path, e))?;

    match fs::read_to_string(path) {
        Ok(existing) if existing == text => return Ok(()),
        Ok(_) => {}
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::io(path, e)),
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(text.as_bytes())
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sous_types::{Cluster, DeploySpec, ManifestKind};

    fn manifest(repo: &str, dir: &str, flavor: &str) -> Manifest {
        Manifest::new(ManifestId::new(repo, dir, flavor), ManifestKind::Service)
    }

    fn state_with(manifests: Vec<Manifest>) -> State {
        let mut state = State::new();
        for m in manifests {
            state.manifests.add(m).unwrap();
        }
        state
    }

    #[test]
    fn manifest_paths_follow_layout() {
        let root = ManifestId::new("github.com/opentable/sous", "", "");
        let offset = ManifestId::new("github.com/opentable/sous", "server/api", "");
        let flavored = ManifestId::new("github.com/opentable/sous", "", "canary");

        assert_eq!(
            manifest_path(&root).unwrap(),
            PathBuf::from("manifests/github.com/opentable/sous.yaml")
        );
        assert_eq!(
            manifest_path(&offset).unwrap(),
            PathBuf::from("manifests/github.com/opentable/sous/server/api.yaml")
        );
        assert_eq!(
            manifest_path(&flavored).unwrap(),
            PathBuf::from("manifests/github.com/opentable/sous~canary.yaml")
        );
    }

    #[test]
    fn manifest_path_rejects_escaping_segments() {
        assert!(manifest_path(&ManifestId::new("github.com/../etc", "", "")).is_err());
        assert!(manifest_path(&ManifestId::new("github.com/a/b", "./x", "")).is_err());
        assert!(manifest_path(&ManifestId::new("github.com/a/b/", "", "")).is_err());
        assert!(manifest_path(&ManifestId::new("github.com/a/b", "", "x/y")).is_err());
        assert!(manifest_path(&ManifestId::new("", "", "")).is_err());
    }

    #[test]
    fn missing_base_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path().join("never-written"));
        let state = codec.read().unwrap();
        assert!(state.manifests.is_empty());
        assert!(state.defs.clusters.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path());

        let mut state = State::new();
        state
            .defs
            .clusters
            .insert("east".to_owned(), Cluster::default());
        let mut m = manifest("github.com/opentable/sous", "server", "");
        m.owners.insert("ops@example.com".to_owned());
        m.deployments
            .insert("east".to_owned(), DeploySpec::default());
        state.manifests.add(m).unwrap();
        state.canonicalize();

        codec.write(&state).unwrap();
        assert!(dir.path().join(DEFS_FILE).is_file());
        assert!(
            dir.path()
                .join("manifests/github.com/opentable/sous/server.yaml")
                .is_file()
        );
        assert_eq!(codec.read().unwrap(), state);
    }

    #[test]
    fn removed_manifests_are_deleted_with_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path());

        codec
            .write(&state_with(vec![
                manifest("github.com/a/keep", "", ""),
                manifest("github.com/b/gone", "deep/er", ""),
            ]))
            .unwrap();
        assert!(dir.path().join("manifests/github.com/b/gone/deep/er.yaml").is_file());

        codec
            .write(&state_with(vec![manifest("github.com/a/keep", "", "")]))
            .unwrap();

        assert!(dir.path().join("manifests/github.com/a/keep.yaml").is_file());
        assert!(!dir.path().join("manifests/github.com/b").exists());
        assert_eq!(codec.read().unwrap().manifests.len(), 1);
    }

    #[test]
    fn misplaced_manifest_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path());
        codec
            .write(&state_with(vec![manifest("github.com/a/b", "", "")]))
            .unwrap();

        let moved = dir.path().join("manifests/github.com/a/elsewhere.yaml");
        fs::rename(dir.path().join("manifests/github.com/a/b.yaml"), &moved).unwrap();

        let err = codec.read().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
        assert!(err.to_string().contains("elsewhere.yaml"));
    }

    #[test]
    fn colliding_paths_leave_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path());
        let err = codec
            .write(&state_with(vec![
                manifest("github.com/a/b", "", ""),
                manifest("github.com/a", "b", ""),
            ]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
        assert!(!dir.path().join(DEFS_FILE).exists());
    }

    #[test]
    fn non_yaml_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TreeCodec::new(dir.path());
        codec
            .write(&state_with(vec![manifest("github.com/a/b", "", "")]))
            .unwrap();
        fs::write(dir.path().join("manifests/README.md"), "notes").unwrap();

        codec.write(&state_with(Vec::new())).unwrap();
        assert!(dir.path().join("manifests/README.md").is_file());
        assert!(codec.read().unwrap().manifests.is_empty());
    }
}
