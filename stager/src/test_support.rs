//! Test-only helpers: fixture repositories, stores, and a fake agent gateway.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::io::agent::{AgentGateway, ResumeRequest};
use crate::session::SessionStore;

/// Create a tiny committed git repository at `path` to clone from.
pub fn init_fixture_repo(path: &Path) {
    fs::create_dir_all(path).expect("create fixture repo dir");
    run_git(path, &["init"]);
    run_git(path, &["config", "user.email", "test@example.com"]);
    run_git(path, &["config", "user.name", "test"]);
    fs::write(path.join("README.md"), "fixture\n").expect("write README");
    run_git(path, &["add", "README.md"]);
    run_git(path, &["commit", "-m", "chore: init"]);
    // Cloned checkouts read their origin url from this repo's path.
}

fn run_git(cwd: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .status()
        .unwrap_or_else(|_| panic!("spawn git {args:?}"));
    assert!(status.success(), "git {args:?} failed");
}

/// Session store rooted inside a temp directory with a deterministic layout.
pub fn fixture_store(root: &Path) -> SessionStore {
    SessionStore::new(
        root.join("sessions"),
        root.join("archive"),
        root.join("apparent"),
        Duration::from_secs(60),
    )
}

/// Archive root matching [`fixture_store`].
pub fn fixture_archive_root(root: &Path) -> PathBuf {
    root.join("archive")
}

/// Gateway that mutates the archived transcript the way the real runtime
/// would, without spawning any process.
pub struct FakeGateway {
    archive_root: PathBuf,
    append: String,
    fail_message: Option<String>,
}

impl FakeGateway {
    /// Appends `text` to the archived transcript and succeeds.
    pub fn appending(root: &Path, text: &str) -> Self {
        Self {
            archive_root: fixture_archive_root(root),
            append: text.to_string(),
            fail_message: None,
        }
    }

    /// Appends `text` to the archived transcript, then fails (an agent that
    /// did partial work before dying).
    pub fn failing_after_append(root: &Path, text: &str) -> Self {
        Self {
            archive_root: fixture_archive_root(root),
            append: text.to_string(),
            fail_message: Some("agent blew up".to_string()),
        }
    }
}

impl AgentGateway for FakeGateway {
    fn resume(&self, request: &ResumeRequest) -> Result<()> {
        let path = self
            .archive_root
            .join(request.session_id.archive_rel_path()?);
        let mut contents = fs::read_to_string(&path)?;
        contents.push_str(&self.append);
        fs::write(&path, contents)?;
        if let Some(message) = &self.fail_message {
            return Err(anyhow!("{message}"));
        }
        Ok(())
    }
}
