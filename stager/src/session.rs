//! Session lifecycle: create, fork, and run resumable agent sessions.
//!
//! A session pairs a private repository checkout with a conversation
//! transcript that exists in two places: locally beside the checkout, and in
//! the agent runtime's own archive at a path derived from the session id.
//! The archive is the authority: before a run both copies must be
//! byte-identical, and after every run (success or failure) the archive is
//! copied back over the local file.
//!
//! Forking follows a freeze discipline: the first clone of a session marks
//! it `has_child`, and a session with a recorded child may never run again.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, info, instrument};

use crate::core::session_id::SessionId;
use crate::io::agent::{AgentGateway, ResumeRequest};
use crate::io::git::Git;

const ROLLOUT_FILE: &str = "rollout.jsonl";
const CONFIG_FILE: &str = "config";
const HAS_CHILD_MARKER: &str = "has_child";
const CMD_FILE: &str = "cmd";

/// Where to clone a repository from, and how to name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSource {
    pub owner: String,
    pub repo: String,
    pub url: String,
}

impl RepoSource {
    /// Parse `owner/repo` and derive the GitHub https clone url.
    pub fn github(project: &str) -> Result<Self> {
        let (owner, repo) = project
            .split_once('/')
            .filter(|(owner, repo)| {
                !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
            })
            .ok_or_else(|| anyhow!("expected 'owner/repo', got '{project}'"))?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            url: format!("https://github.com/{owner}/{repo}.git"),
        })
    }

    /// Source backed by a local path (fixtures, mirrors).
    pub fn local(owner: &str, repo: &str, path: &Path) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            url: path.to_string_lossy().to_string(),
        }
    }
}

/// Per-session config record stored beside the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub timestamp: String,
    pub owner: String,
    pub repo: String,
    pub session_id: String,
    /// Path at which the checkout appears inside the sandbox.
    pub cwd: PathBuf,
    pub parent: Option<String>,
}

/// Store managing session directories and their archived transcripts.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_root: PathBuf,
    archive_root: PathBuf,
    apparent_root: PathBuf,
    run_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
        apparent_root: impl Into<PathBuf>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            archive_root: archive_root.into(),
            apparent_root: apparent_root.into(),
            run_timeout,
        }
    }

    pub fn session_dir(&self, id: SessionId) -> PathBuf {
        self.sessions_root.join(id.to_string())
    }

    fn archive_path(&self, id: SessionId) -> Result<PathBuf> {
        Ok(self.archive_root.join(id.archive_rel_path()?))
    }

    fn rollout_path(&self, id: SessionId) -> PathBuf {
        self.session_dir(id).join(ROLLOUT_FILE)
    }

    fn config_path(&self, id: SessionId) -> PathBuf {
        self.session_dir(id).join(CONFIG_FILE)
    }

    /// Create a new session with a fresh checkout of `source`.
    #[instrument(skip_all, fields(owner = %source.owner, repo = %source.repo))]
    pub fn session_new(&self, source: &RepoSource) -> Result<SessionId> {
        let id = SessionId::mint();
        let session_dir = self.session_dir(id);
        if session_dir.exists() {
            return Err(anyhow!(
                "session directory already exists: {}",
                session_dir.display()
            ));
        }
        info!(session_id = %id, "creating session");

        let checkout_dir = session_dir.join("repo").join(&source.repo);
        Git::clone_into(&source.url, &checkout_dir)?;

        let apparent_dir = self.apparent_root.join("repo").join(&source.repo);
        let meta = Git::new(&checkout_dir).checkout_meta()?;

        let created_at = id.created_at()?;
        let header = json!({
            "timestamp": iso_millis(created_at)?,
            "type": "session_meta",
            "payload": {
                "id": id.to_string(),
                "timestamp": iso_millis(created_at)?,
                "cwd": apparent_dir,
                "originator": "codex_exec",
                "cli_version": "0.63.0",
                "instructions": null,
                "source": "exec",
                "model_provider": "openai",
                "git": {
                    "commit_hash": meta.commit_hash,
                    "branch": meta.branch,
                    "repository_url": meta.repository_url,
                },
            },
        });
        let rollout_path = self.rollout_path(id);
        if rollout_path.exists() {
            return Err(anyhow!(
                "transcript already exists: {}",
                rollout_path.display()
            ));
        }
        fs::write(&rollout_path, format!("{header}\n"))
            .with_context(|| format!("write transcript {}", rollout_path.display()))?;

        self.install_rollout(id)?;
        fs::create_dir_all(session_dir.join("tmp")).context("create session tmp dir")?;

        let config = SessionConfig {
            timestamp: iso_seconds(created_at)?,
            owner: source.owner.clone(),
            repo: source.repo.clone(),
            session_id: id.to_string(),
            cwd: apparent_dir,
            parent: None,
        };
        self.write_config(id, &config)?;
        Ok(id)
    }

    /// Fork an existing session into an independent new one.
    ///
    /// Marks the source `has_child` on first clone (idempotent), deep-copies
    /// the session directory, rewrites the id throughout the transcript, and
    /// installs the rewritten transcript into the archive.
    #[instrument(skip_all, fields(src = %src))]
    pub fn session_clone(&self, src: SessionId) -> Result<SessionId> {
        let src_dir = self.session_dir(src);
        if !src_dir.exists() {
            return Err(anyhow!(
                "session directory not found: {}",
                src_dir.display()
            ));
        }
        let marker = src_dir.join(HAS_CHILD_MARKER);
        if !marker.exists() {
            fs::write(&marker, "true\n")
                .with_context(|| format!("write {}", marker.display()))?;
        }

        let dst = SessionId::mint();
        let dst_dir = self.session_dir(dst);
        if dst_dir.exists() {
            return Err(anyhow!(
                "session directory already exists: {}",
                dst_dir.display()
            ));
        }
        info!(dst = %dst, "cloning session");
        copy_dir_recursive(&src_dir, &dst_dir)?;

        // The copy must start its own lineage.
        let inherited = dst_dir.join(HAS_CHILD_MARKER);
        if inherited.exists() {
            fs::remove_file(&inherited)
                .with_context(|| format!("remove {}", inherited.display()))?;
        }

        // The id appears inline in many transcript records, not just the header.
        let rollout_path = self.rollout_path(dst);
        let transcript = fs::read_to_string(&rollout_path)
            .with_context(|| format!("read transcript {}", rollout_path.display()))?;
        let rewritten = transcript.replace(&src.to_string(), &dst.to_string());
        fs::write(&rollout_path, rewritten)
            .with_context(|| format!("rewrite transcript {}", rollout_path.display()))?;

        self.install_rollout(dst)?;

        let mut config = self.read_config(dst)?;
        config.timestamp = iso_seconds(dst.created_at()?)?;
        config.session_id = dst.to_string();
        config.parent = Some(src.to_string());
        self.write_config(dst, &config)?;

        Ok(dst)
    }

    /// Resume the session with new instructions via the agent gateway.
    ///
    /// The archive copy is copied back over the local transcript on every
    /// exit path, so the archive stays authoritative even when the agent
    /// fails mid-run.
    #[instrument(skip_all, fields(session_id = %id))]
    pub fn session_run(
        &self,
        id: SessionId,
        instructions: &str,
        gateway: &impl AgentGateway,
    ) -> Result<()> {
        let session_dir = self.session_dir(id);
        if !session_dir.exists() {
            return Err(anyhow!(
                "session directory not found: {}",
                session_dir.display()
            ));
        }
        if session_dir.join(HAS_CHILD_MARKER).exists() {
            return Err(anyhow!(
                "session {id} has a child session and is frozen (clone it instead of running it)"
            ));
        }
        self.check_rollout_consistency(id)?;

        let config = self.read_config(id)?;
        if config.session_id != id.to_string() {
            return Err(anyhow!(
                "session id in config does not match: {} != {id}",
                config.session_id
            ));
        }
        let checkout_dir = session_dir.join("repo").join(&config.repo);

        let cmd_path = session_dir.join(CMD_FILE);
        fs::write(&cmd_path, instructions)
            .with_context(|| format!("write instructions {}", cmd_path.display()))?;
        fs::create_dir_all(&config.cwd)
            .with_context(|| format!("create apparent dir {}", config.cwd.display()))?;

        info!("running agent on session");
        let run_result = gateway.resume(&ResumeRequest {
            session_id: id,
            checkout_dir,
            apparent_dir: config.cwd.clone(),
            instructions: instructions.to_string(),
            timeout: self.run_timeout,
        });

        // Unconditional: the archive reflects whatever the agent did.
        debug!("copying archived transcript back over local copy");
        let copy_result = self.copy_rollout_back(id);
        run_result?;
        copy_result
    }

    /// True once the session has been forked at least once (and is frozen).
    pub fn has_child(&self, id: SessionId) -> bool {
        self.session_dir(id).join(HAS_CHILD_MARKER).exists()
    }

    pub fn read_config(&self, id: SessionId) -> Result<SessionConfig> {
        let path = self.config_path(id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read session config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse session config {}", path.display()))
    }

    fn write_config(&self, id: SessionId, config: &SessionConfig) -> Result<()> {
        let path = self.config_path(id);
        let mut buf = serde_json::to_string_pretty(config).context("serialize session config")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write session config {}", path.display()))
    }

    /// Install the local transcript into the archive (one-shot artifact).
    fn install_rollout(&self, id: SessionId) -> Result<()> {
        let src = self.rollout_path(id);
        if !src.exists() {
            return Err(anyhow!("transcript not found: {}", src.display()));
        }
        let dst = self.archive_path(id)?;
        if dst.exists() {
            return Err(anyhow!(
                "archived transcript already exists: {}",
                dst.display()
            ));
        }
        let parent = dst.parent().context("archive path missing parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create archive dir {}", parent.display()))?;
        fs::copy(&src, &dst)
            .with_context(|| format!("install transcript {}", dst.display()))?;
        Ok(())
    }

    fn copy_rollout_back(&self, id: SessionId) -> Result<()> {
        let src = self.archive_path(id)?;
        if !src.exists() {
            return Err(anyhow!(
                "archived transcript not found: {}",
                src.display()
            ));
        }
        fs::copy(&src, self.rollout_path(id))
            .with_context(|| format!("copy back transcript for {id}"))?;
        Ok(())
    }

    /// Both transcript copies must exist and be byte-identical before a run.
    fn check_rollout_consistency(&self, id: SessionId) -> Result<()> {
        let archive_path = self.archive_path(id)?;
        if !archive_path.exists() {
            return Err(anyhow!(
                "archived transcript not found: {}",
                archive_path.display()
            ));
        }
        let local_path = self.rollout_path(id);
        if !local_path.exists() {
            return Err(anyhow!(
                "local transcript not found: {}",
                local_path.display()
            ));
        }
        let archived = fs::read_to_string(&archive_path)
            .with_context(|| format!("read {}", archive_path.display()))?;
        let local = fs::read_to_string(&local_path)
            .with_context(|| format!("read {}", local_path.display()))?;
        if archived != local {
            return Err(anyhow!(
                "archived transcript does not match local transcript for {id}; \
                 they should be identical (archive has {} lines, local has {} lines)",
                archived.lines().count(),
                local.lines().count()
            ));
        }
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", src.display()))?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().context("entry file type")?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", target.display()))?;
        }
    }
    Ok(())
}

fn iso_seconds(dt: OffsetDateTime) -> Result<String> {
    dt.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
    ))
    .context("format timestamp")
}

fn iso_millis(dt: OffsetDateTime) -> Result<String> {
    dt.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))
    .context("format timestamp")
}
