//! Git-backed file-tree store with optimistic concurrency.
//!
//! [`VersionedFileTreeStore`] keeps a local clone of a shared remote. Reads
//! fast-forward the clone and decode the tree. Writes run a small state
//! machine:
//!
//! ```text
//!  Clean --pull--> Pulling --tag, rewrite, add--> Staged --commit, push--> Pushing
//!    ^                                              |                         |
//!    +-------------------- done <-------------------+-------------------------+
//!                                                   |  any failure
//!                                                   v
//!                                              RolledBack  (reset --hard <tag>, clean)
//! ```
//!
//! The remote's accept/reject on push orders all writers. A rejected push
//! and a State read at a revision the remote has moved past are both
//! reported as [`StoreError::Conflict`]; the store never merges.

use std::path::Path;

use async_trait::async_trait;
use sous_types::{State, User};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::file_tree::FileTreeStore;
use crate::git::{Git, GitOutput};
use crate::observe::{Direction, SharedObserver, Stopwatch};
use crate::store::StateStore;

/// Remote every clone pulls from and pushes to.
const REMOTE: &str = "origin";

/// Branch used when none is configured.
pub const DEFAULT_BRANCH: &str = "master";

/// Prefix of the throwaway tag marking the pre-write revision.
const FALLBACK_TAG_PREFIX: &str = "sous-fallback-";

/// Message of every state commit.
const COMMIT_MESSAGE: &str = "sous commit: Update State";

/// Where a write attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    /// Nothing in progress.
    Clean,
    /// Fast-forwarding from the remote.
    Pulling,
    /// Tree rewritten and changes staged; fallback tag set.
    Staged,
    /// Commit made, push in flight.
    Pushing,
    /// The working copy was reset to the fallback tag.
    RolledBack,
}

/// How a successful write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    /// The rewritten tree matched `HEAD`; nothing was committed.
    Unchanged,
    /// A commit was pushed.
    Pushed,
}

/// A State kept in a local git clone of a shared remote.
pub struct VersionedFileTreeStore {
    tree: FileTreeStore,
    git: Git,
    branch: String,
    lock: Mutex<()>,
    observer: SharedObserver,
}

impl VersionedFileTreeStore {
    /// Wrap an existing working copy at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotARepository`] if `dir` is not the top of a
    /// git working copy.
    pub async fn open(
        dir: impl AsRef<Path>,
        branch: &str,
        observer: SharedObserver,
    ) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let git = Git::new(dir);
        if !git.is_work_tree().await {
            return Err(StoreError::NotARepository {
                path: dir.to_path_buf(),
            });
        }
        Ok(Self {
            tree: FileTreeStore::new(dir, observer.clone()),
            git,
            branch: branch.to_owned(),
            lock: Mutex::new(()),
            observer,
        })
    }

    /// Open `dir` if it is already a working copy, otherwise clone `remote`
    /// into it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when `dir` is not a working copy and
    /// no remote is given, and [`StoreError::Git`] if the clone fails.
    pub async fn clone_or_open(
        remote: Option<&str>,
        dir: impl AsRef<Path>,
        branch: &str,
        observer: SharedObserver,
    ) -> StoreResult<Self> {
        let dir = dir.as_ref();
        if dir.join(".git").exists() {
            return Self::open(dir, branch, observer).await;
        }
        let Some(remote) = remote else {
            return Err(StoreError::Config(format!(
                "{} is not a git working copy and no remote is configured",
                dir.display()
            )));
        };
        let git = Git::clone_into(remote, dir).await?;
        let store = Self::open(git.workdir(), branch, observer).await?;
        if store.remote_has_branch().await? {
            let upstream = format!("{REMOTE}/{}", store.branch);
            store
                .git
                .run(&["checkout", "--quiet", "-B", &store.branch, &upstream])
                .await?;
        }
        Ok(store)
    }

    /// The local working copy.
    pub fn workdir(&self) -> &Path {
        self.git.workdir()
    }

    async fn remote_has_branch(&self) -> StoreResult<bool> {
        let heads = self
            .git
            .run(&["ls-remote", "--heads", REMOTE, &self.branch])
            .await?;
        Ok(!heads.is_empty())
    }

    /// The commit the remote branch points at right now, if it exists.
    async fn remote_tip(&self) -> StoreResult<Option<String>> {
        let refname = format!("refs/heads/{}", self.branch);
        let listing = self.git.run(&["ls-remote", REMOTE, &refname]).await?;
        Ok(listing
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .find(|(_, name)| *name == refname)
            .map(|(commit, _)| commit.to_owned()))
    }

    /// Fast-forward the working copy to the remote branch, if it exists.
    async fn pull(&self) -> StoreResult<()> {
        if !self.remote_has_branch().await? {
            tracing::debug!(branch = %self.branch, "Remote branch absent, skipping pull");
            return Ok(());
        }
        self.git
            .run(&["pull", "--quiet", "--ff-only", REMOTE, &self.branch])
            .await?;
        Ok(())
    }

    async fn read_locked(&self) -> StoreResult<State> {
        self.pull().await?;
        let mut state = self.tree.load().await?;
        state.revision = self.git.head().await?;
        Ok(state)
    }

    async fn write_locked(&self, state: &State, actor: &User) -> StoreResult<()> {
        let mut attempt = WriteAttempt::new(self);

        attempt.enter(WritePhase::Pulling);
        self.pull().await?;

        let head = self.git.head().await?.ok_or_else(|| {
            StoreError::Config(format!(
                "working copy {} has no commits; seed the remote with an initial commit",
                self.workdir().display()
            ))
        })?;
        if let Some(revision) = state.revision.as_ref().filter(|r| **r != head) {
            attempt.enter(WritePhase::Clean);
            return Err(StoreError::conflict(format!(
                "state was read at {revision} but {REMOTE}/{} is at {head}",
                self.branch
            )));
        }

        attempt.mark(&head).await?;
        let result = attempt.apply(state, actor).await;
        if result.is_err() {
            attempt.roll_back().await;
        }
        attempt.unmark().await;

        match result? {
            WriteOutcome::Unchanged => {
                tracing::debug!(branch = %self.branch, "State unchanged, nothing to commit");
            }
            WriteOutcome::Pushed => {
                tracing::info!(
                    branch = %self.branch,
                    actor = %actor,
                    manifests = state.manifests.len(),
                    "Pushed state commit"
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write state machine
// ---------------------------------------------------------------------------

/// One in-flight write: the phase it reached, the revision it started from
/// and the tag to fall back to.
struct WriteAttempt<'a> {
    store: &'a VersionedFileTreeStore,
    phase: WritePhase,
    base: String,
    tag: String,
    tagged: bool,
}

impl<'a> WriteAttempt<'a> {
    fn new(store: &'a VersionedFileTreeStore) -> Self {
        Self {
            store,
            phase: WritePhase::Clean,
            base: String::new(),
            tag: format!("{FALLBACK_TAG_PREFIX}{}", uuid::Uuid::new_v4()),
            tagged: false,
        }
    }

    fn enter(&mut self, phase: WritePhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "State write phase");
        self.phase = phase;
    }

    /// Tag `base` so a failed attempt can return to it.
    async fn mark(&mut self, base: &str) -> StoreResult<()> {
        self.store.git.run(&["tag", &self.tag, base]).await?;
        self.base = base.to_owned();
        self.tagged = true;
        Ok(())
    }

    /// Whether the remote branch has moved off the revision this attempt
    /// started from.
    async fn remote_moved(&self) -> bool {
        match self.store.remote_tip().await {
            Ok(tip) => tip.is_some_and(|tip| tip != self.base),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list remote branch after failed push");
                false
            }
        }
    }

    /// Rewrite, stage, commit and push.
    async fn apply(&mut self, state: &State, actor: &User) -> StoreResult<WriteOutcome> {
        let store = self.store;
        let git = &store.git;

        store.tree.save(state).await?;
        git.run(&["add", "--all", "."]).await?;
        self.enter(WritePhase::Staged);

        let diff = git
            .output(&["diff-index", "--cached", "--quiet", "HEAD"], None)
            .await?;
        match diff.code {
            Some(0) => {
                self.enter(WritePhase::Clean);
                return Ok(WriteOutcome::Unchanged);
            }
            Some(1) => {}
            _ => {
                return Err(StoreError::Git {
                    operation: "diff-index --cached --quiet HEAD".to_owned(),
                    output: diff.combined(),
                });
            }
        }

        git.run_as(&["commit", "--quiet", "--message", COMMIT_MESSAGE], actor)
            .await?;

        self.enter(WritePhase::Pushing);
        let refspec = format!("HEAD:refs/heads/{}", store.branch);
        let push = git
            .output(&["push", "--porcelain", REMOTE, &refspec], None)
            .await?;
        if !push.success {
            let moved = self.remote_moved().await;
            return Err(classify_push_failure(&refspec, &push, moved));
        }

        self.enter(WritePhase::Clean);
        Ok(WriteOutcome::Pushed)
    }

    /// Return the working copy to the tagged revision and drop stray files.
    ///
    /// Failures are logged; the original error is what the caller sees.
    async fn roll_back(&mut self) {
        if !self.tagged {
            return;
        }
        let git = &self.store.git;
        let tag = self.tag.clone();
        for args in [
            vec!["reset", "--quiet", "--hard", tag.as_str()],
            vec!["clean", "--quiet", "--force", "-d"],
        ] {
            if let Err(e) = git.run(&args).await {
                tracing::error!(error = %e, tag = %tag, "Rollback step failed");
            }
        }
        self.enter(WritePhase::RolledBack);
    }

    /// Delete the fallback tag.
    async fn unmark(&mut self) {
        if !self.tagged {
            return;
        }
        if let Err(e) = self.store.git.run(&["tag", "--delete", &self.tag]).await {
            tracing::warn!(error = %e, tag = %self.tag, "Could not delete fallback tag");
        }
        self.tagged = false;
    }
}

/// Turn a failed push into a conflict when the remote moved ahead.
///
/// `remote_moved` is whether the remote branch no longer points at the
/// write's base revision. A writer that lands between our ref advertisement
/// and our ref update shows up only there, as a `[remote rejected]` with
/// "failed to update ref". Refusals that leave the branch in place, such as
/// a server-side hook, stay [`StoreError::Git`].
fn classify_push_failure(refspec: &str, push: &GitOutput, remote_moved: bool) -> StoreError {
    let output = push.combined();
    let stale = !output.contains("[remote rejected]")
        && (output.contains("[rejected]")
            || output.contains("non-fast-forward")
            || output.contains("fetch first"));
    if remote_moved || stale {
        StoreError::conflict(format!("push of {refspec} rejected: remote has newer commits"))
    } else {
        StoreError::Git {
            operation: format!("push {REMOTE} {refspec}"),
            output,
        }
    }
}

#[async_trait]
impl StateStore for VersionedFileTreeStore {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn read_state(&self) -> StoreResult<State> {
        let watch = Stopwatch::start(self.name(), Direction::Read);
        let result = {
            let _guard = self.lock.lock().await;
            self.read_locked().await
        };
        watch.report_read(self.observer.as_ref(), &result);
        result
    }

    async fn write_state(&self, state: &State, actor: &User) -> StoreResult<()> {
        let watch = Stopwatch::start(self.name(), Direction::Write);
        let result = {
            let _guard = self.lock.lock().await;
            self.write_locked(state, actor).await
        };
        watch.report_write(self.observer.as_ref(), state, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_push(stdout: &str, stderr: &str) -> GitOutput {
        GitOutput {
            success: false,
            code: Some(1),
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        }
    }

    const REFSPEC: &str = "HEAD:refs/heads/master";

    #[test]
    fn stale_push_is_conflict() {
        let push = failed_push(
            "To ../remote.git\n!\tHEAD:refs/heads/master\t[rejected] (fetch first)\nDone",
            "error: failed to push some refs",
        );
        assert!(classify_push_failure(REFSPEC, &push, false).is_conflict());

        let push = failed_push("", "! [rejected] HEAD -> master (non-fast-forward)");
        assert!(classify_push_failure(REFSPEC, &push, false).is_conflict());
    }

    #[test]
    fn hook_refusal_is_not_conflict() {
        let push = failed_push(
            "!\tHEAD:refs/heads/master\t[remote rejected] (pre-receive hook declined)",
            "",
        );
        let err = classify_push_failure(REFSPEC, &push, false);
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("pre-receive"));
    }

    #[test]
    fn lost_ref_update_is_conflict() {
        let push = failed_push(
            "!\tHEAD:refs/heads/master\t[remote rejected] (failed to update ref)",
            "error: failed to push some refs",
        );
        let err = classify_push_failure(REFSPEC, &push, true);
        assert!(err.is_conflict());
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn unreachable_remote_is_not_conflict() {
        let push = failed_push("", "fatal: could not read from remote repository");
        assert!(!classify_push_failure(REFSPEC, &push, false).is_conflict());
    }
}
