//! Git-backed store against throwaway bare remotes.
//!
//! Every test returns early when no `git` binary is on `PATH`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sous_storage::{
    CapturingObserver, Direction, ErrorKind, Git, StateStore, StoreError,
    VersionedFileTreeStore,
};
use sous_types::{Cluster, DeploySpec, Manifest, ManifestId, ManifestKind, State, User, Version};
use tempfile::TempDir;

const BRANCH: &str = "master";

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

struct Remote {
    root: TempDir,
    url: String,
}

impl Remote {
    /// A bare remote holding one seed commit on `master`.
    async fn seeded() -> Option<Self> {
        if !git_available() {
            eprintln!("git not found; skipping");
            return None;
        }
        let root = tempfile::tempdir().expect("tempdir");
        let bare = root.path().join("remote.git");
        std::fs::create_dir_all(&bare).unwrap();
        let git = Git::new(&bare);
        git.run(&["init", "--quiet", "--bare"]).await.unwrap();
        git.run(&["symbolic-ref", "HEAD", "refs/heads/master"])
            .await
            .unwrap();
        let url = bare.to_string_lossy().into_owned();

        let seed = Git::clone_into(&url, &root.path().join("seed")).await.unwrap();
        std::fs::write(seed.workdir().join("README"), "deployment state\n").unwrap();
        seed.run(&["add", "README"]).await.unwrap();
        seed.run_as(&["commit", "--quiet", "--message", "seed"], &actor("Seed"))
            .await
            .unwrap();
        seed.run(&["push", "--quiet", "origin", "HEAD:refs/heads/master"])
            .await
            .unwrap();

        Some(Self { root, url })
    }

    fn bare(&self) -> PathBuf {
        self.root.path().join("remote.git")
    }

    async fn store(&self, name: &str) -> (VersionedFileTreeStore, Arc<CapturingObserver>) {
        let observer = CapturingObserver::new();
        let store = VersionedFileTreeStore::clone_or_open(
            Some(&self.url),
            self.root.path().join(name),
            BRANCH,
            observer.clone(),
        )
        .await
        .unwrap();
        (store, observer)
    }

    async fn branch_head(&self) -> String {
        Git::new(self.bare())
            .run(&["rev-parse", "refs/heads/master"])
            .await
            .unwrap()
    }
}

fn actor(name: &str) -> User {
    User::new(name, format!("{}@example.com", name.to_lowercase()))
}

fn state_with(version: Version) -> State {
    let mut state = State::new();
    state.defs.clusters.insert(
        "east".to_owned(),
        Cluster {
            kind: "singularity".to_owned(),
            base_url: "http://east.example.com".to_owned(),
            ..Cluster::default()
        },
    );
    let mut manifest = Manifest::new(
        ManifestId::new("github.com/opentable/sous", "util", ""),
        ManifestKind::Service,
    );
    manifest.owners.insert("ops@example.com".to_owned());
    let mut spec = DeploySpec::new(version);
    spec.num_instances = 2;
    spec.env.insert("MODE".to_owned(), "prod".to_owned());
    manifest.deployments.insert("east".to_owned(), spec);
    state.manifests.add(manifest).unwrap();
    state.canonicalize();
    state
}

async fn porcelain_status(dir: &Path) -> String {
    Git::new(dir).run(&["status", "--porcelain"]).await.unwrap()
}

#[tokio::test]
async fn write_then_read_through_another_clone() {
    let Some(remote) = Remote::seeded().await else {
        return;
    };
    let (a, _) = remote.store("a").await;
    let (b, _) = remote.store("b").await;

    let written = state_with(Version::new(1, 0, 0));
    a.write_state(&written, &actor("Amy")).await.unwrap();

    let read = b.read_state().await.unwrap();
    assert_eq!(read, written);
    assert_eq!(read.revision.as_deref(), Some(remote.branch_head().await.as_str()));

    let author = Git::new(remote.bare())
        .run(&["log", "-1", "--format=%an <%ae>|%s", "refs/heads/master"])
        .await
        .unwrap();
    assert_eq!(author, "Amy <amy@example.com>|sous commit: Update State");
}

#[tokio::test]
async fn stale_write_conflicts_and_leaves_winner_state() {
    let Some(remote) = Remote::seeded().await else {
        return;
    };
    let (a, _) = remote.store("a").await;
    let (b, observer_b) = remote.store("b").await;

    let mut from_a = a.read_state().await.unwrap();
    let mut from_b = b.read_state().await.unwrap();
    assert_eq!(from_a.revision, from_b.revision);

    let winner = state_with(Version::new(1, 1, 0));
    from_a.defs = winner.defs.clone();
    from_a.manifests = winner.manifests.clone();
    a.write_state(&from_a, &actor("Amy")).await.unwrap();
    let head_after_a = remote.branch_head().await;

    let loser = state_with(Version::new(9, 9, 9));
    from_b.defs = loser.defs.clone();
    from_b.manifests = loser.manifests.clone();
    let err = b.write_state(&from_b, &actor("Bob")).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(remote.branch_head().await, head_after_a);
    assert!(porcelain_status(b.workdir()).await.is_empty());
    assert_eq!(b.read_state().await.unwrap(), winner);

    let failures = observer_b.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].direction, Direction::Write);
}

#[tokio::test]
async fn unchanged_write_makes_no_commit() {
    let Some(remote) = Remote::seeded().await else {
        return;
    };
    let (a, _) = remote.store("a").await;

    a.write_state(&state_with(Version::new(2, 0, 0)), &actor("Amy"))
        .await
        .unwrap();
    let head = remote.branch_head().await;

    let reread = a.read_state().await.unwrap();
    a.write_state(&reread, &actor("Amy")).await.unwrap();

    assert_eq!(remote.branch_head().await, head);
    assert_eq!(a.read_state().await.unwrap().revision.as_deref(), Some(head.as_str()));
}

#[cfg(unix)]
#[tokio::test]
async fn refused_push_rolls_back_working_copy() {
    let Some(remote) = Remote::seeded().await else {
        return;
    };
    let (a, observer) = remote.store("a").await;
    let before = a.read_state().await.unwrap();
    let seed_head = remote.branch_head().await;

    install_hook(
        &remote.bare().join("hooks").join("pre-receive"),
        "#!/bin/sh\necho 'writes are frozen' >&2\nexit 1\n",
    );

    let err = a
        .write_state(&state_with(Version::new(3, 0, 0)), &actor("Amy"))
        .await
        .unwrap_err();
    assert!(!err.is_conflict());
    assert!(matches!(err, StoreError::Git { .. }), "got {err}");
    assert_eq!(err.kind(), ErrorKind::Transport);

    assert_eq!(remote.branch_head().await, seed_head);
    assert!(porcelain_status(a.workdir()).await.is_empty());
    assert!(
        Git::new(a.workdir())
            .run(&["tag", "--list"])
            .await
            .unwrap()
            .is_empty()
    );
    assert!(!a.workdir().join("manifests").exists());
    assert_eq!(a.read_state().await.unwrap(), before);
    assert_eq!(observer.failures().len(), 1);
}

#[cfg(unix)]
fn install_hook(path: &Path, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Another writer lands after B has seen the remote ref but before B's ref
/// update, so the server refuses B with "failed to update ref".
#[cfg(unix)]
#[tokio::test]
async fn push_losing_ref_update_race_conflicts() {
    let Some(remote) = Remote::seeded().await else {
        return;
    };
    let (b, observer_b) = remote.store("b").await;
    let before = b.read_state().await.unwrap();

    let rival_dir = remote.root.path().join("rival");
    let rival = Git::clone_into(&remote.url, &rival_dir).await.unwrap();
    std::fs::write(rival_dir.join("NOTES"), "landed first\n").unwrap();
    rival.run(&["add", "NOTES"]).await.unwrap();
    rival
        .run_as(&["commit", "--quiet", "--message", "rival"], &actor("Rita"))
        .await
        .unwrap();
    let rival_head = rival.head().await.unwrap().unwrap();

    install_hook(
        &b.workdir().join(".git").join("hooks").join("pre-push"),
        &format!(
            "#!/bin/sh\ncat >/dev/null\nunset GIT_DIR GIT_WORK_TREE GIT_INDEX_FILE\n\
             cd '{}' && git push --quiet origin HEAD:refs/heads/master >&2\n",
            rival_dir.display()
        ),
    );

    let mut next = state_with(Version::new(4, 0, 0));
    next.revision.clone_from(&before.revision);
    let err = b.write_state(&next, &actor("Bob")).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(remote.branch_head().await, rival_head);
    assert!(porcelain_status(b.workdir()).await.is_empty());
    assert!(
        Git::new(b.workdir())
            .run(&["tag", "--list"])
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(observer_b.failures().len(), 1);

    std::fs::remove_file(b.workdir().join(".git").join("hooks").join("pre-push")).unwrap();
    let reread = b.read_state().await.unwrap();
    assert_eq!(reread, before);
    assert_eq!(reread.revision.as_deref(), Some(rival_head.as_str()));
}

#[tokio::test]
async fn open_requires_a_working_copy() {
    if !git_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();

    let err = VersionedFileTreeStore::open(dir.path(), BRANCH, CapturingObserver::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::NotARepository { .. }));

    let err = VersionedFileTreeStore::clone_or_open(
        None,
        dir.path().join("missing"),
        BRANCH,
        CapturingObserver::new(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}
