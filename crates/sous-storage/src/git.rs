//! Thin driver around the system `git` binary.
//!
//! Every command runs in a scrubbed environment: only `PATH` and, when set,
//! `GIT_SSH` come from the host, system and global configuration are
//! disabled, and `HOME`/`XDG_CONFIG_HOME` point nowhere. Host git settings
//! therefore cannot change how the store behaves. Commit identity comes from
//! the actor through the author and committer variables.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;

use sous_types::User;
use tokio::process::Command;

use crate::error::{StoreError, StoreResult};

/// Identity used when the actor leaves a field blank.
const FALLBACK_NAME: &str = "sous";
const FALLBACK_EMAIL: &str = "sous@localhost";

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    /// Whether git exited with status zero.
    pub success: bool,
    /// Exit code, when git exited normally.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl GitOutput {
    fn from_output(output: &Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_owned();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Runs git commands against one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    path: Option<OsString>,
    ssh: Option<OsString>,
}

impl Git {
    /// A driver for `workdir`. Captures `PATH` and `GIT_SSH` now.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            path: std::env::var_os("PATH"),
            ssh: std::env::var_os("GIT_SSH"),
        }
    }

    /// The working directory commands run in.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `remote` into `dest`, creating parent directories.
    pub async fn clone_into(remote: &str, dest: &Path) -> StoreResult<Self> {
        let dest = std::path::absolute(dest).map_err(|e| StoreError::io(dest, e))?;
        let parent = dest.parent().unwrap_or_else(|| Path::new("/"));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;

        let dest_arg = dest.to_string_lossy().into_owned();
        Self::new(parent)
            .run(&["clone", "--quiet", remote, &dest_arg])
            .await?;
        tracing::info!(remote, dest = %dest.display(), "Cloned state repository");
        Ok(Self::new(&dest))
    }

    /// Whether the working directory is the top of a git working copy.
    pub async fn is_work_tree(&self) -> bool {
        match self.output(&["rev-parse", "--show-toplevel"], None).await {
            Ok(out) if out.success => {
                let top = PathBuf::from(out.stdout.trim());
                match (top.canonicalize(), self.workdir.canonicalize()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// The commit `HEAD` points at, or `None` on an unborn branch.
    pub async fn head(&self) -> StoreResult<Option<String>> {
        let out = self
            .output(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"], None)
            .await?;
        if out.success {
            Ok(Some(out.stdout.trim().to_owned()))
        } else {
            Ok(None)
        }
    }

    /// Run a command that must succeed; return its trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> StoreResult<String> {
        let out = self.output(args, None).await?;
        check(args, &out)?;
        Ok(out.stdout.trim().to_owned())
    }

    /// Run a command that must succeed with `actor` as author and committer.
    pub async fn run_as(&self, args: &[&str], actor: &User) -> StoreResult<String> {
        let out = self.output(args, Some(actor)).await?;
        check(args, &out)?;
        Ok(out.stdout.trim().to_owned())
    }

    /// Run a command and return its output whatever the exit status.
    pub async fn output(&self, args: &[&str], actor: Option<&User>) -> StoreResult<GitOutput> {
        let mut cmd = self.command(args, actor);
        tracing::debug!(workdir = %self.workdir.display(), args = ?args, "git");
        let output = cmd.output().await.map_err(|e| StoreError::Git {
            operation: args.join(" "),
            output: format!("cannot run git: {e}"),
        })?;
        let out = GitOutput::from_output(&output);
        tracing::trace!(code = ?out.code, output = %out.combined(), "git finished");
        Ok(out)
    }

    fn command(&self, args: &[&str], actor: Option<&User>) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env_clear()
            .env("GIT_CONFIG_NOSYSTEM", "true")
            .env("GIT_CONFIG_NOGLOBAL", "true")
            .env("HOME", "none")
            .env("XDG_CONFIG_HOME", "none")
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(path) = &self.path {
            cmd.env("PATH", path);
        }
        if let Some(ssh) = &self.ssh {
            cmd.env("GIT_SSH", ssh);
        }
        if let Some(actor) = actor {
            let name = non_empty(&actor.name, FALLBACK_NAME);
            let email = non_empty(&actor.email, FALLBACK_EMAIL);
            cmd.env("GIT_AUTHOR_NAME", name)
                .env("GIT_AUTHOR_EMAIL", email)
                .env("GIT_COMMITTER_NAME", name)
                .env("GIT_COMMITTER_EMAIL", email);
        }
        cmd
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() { fallback } else { value }
}

fn check(args: &[&str], out: &GitOutput) -> StoreResult<()> {
    if out.success {
        return Ok(());
    }
    Err(StoreError::Git {
        operation: args.join(" "),
        output: out.combined(),
    })
}
