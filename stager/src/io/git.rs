//! Git adapter for session checkouts.
//!
//! Sessions own a private clone of the target repository and embed its
//! version-control metadata in the transcript header, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Commit, branch, and remote recorded in a session transcript header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMeta {
    pub commit_hash: String,
    pub branch: String,
    pub repository_url: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Clone `url` into `dest` (propagates a non-zero exit verbatim).
    #[instrument(skip_all, fields(url))]
    pub fn clone_into(url: &str, dest: &Path) -> Result<()> {
        debug!(url, dest = %dest.display(), "cloning repository");
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create clone dir {}", parent.display()))?;
        }
        let output = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(dest)
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone {url} failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Return the current HEAD commit hash.
    pub fn head_commit(&self) -> Result<String> {
        self.run_capture(&["rev-parse", "HEAD"])
    }

    /// Return the current branch name (may be "HEAD" when detached).
    pub fn current_branch(&self) -> Result<String> {
        self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Return the origin remote url.
    pub fn remote_url(&self) -> Result<String> {
        self.run_capture(&["config", "--get", "remote.origin.url"])
    }

    /// Collect the metadata embedded in a transcript header.
    pub fn checkout_meta(&self) -> Result<CheckoutMeta> {
        Ok(CheckoutMeta {
            commit_hash: self.head_commit()?,
            branch: self.current_branch()?,
            repository_url: self.remote_url()?,
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
