//! Catalog of repositories and their build/test sessions.
//!
//! The catalog is a directory tree: one entry per `owner/repo`, holding a
//! `build/` area (the session that prepares the repository) and a `test/`
//! area (one directory per test target, each backed by a fork of the build
//! session). Lifecycle state is carried by small marker files, so the state
//! machine survives crashes and is inspectable with `ls`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::session_id::SessionId;
use crate::instructions;
use crate::io::agent::AgentGateway;
use crate::session::{RepoSource, SessionStore};

const SESSION_ID_FILE: &str = "session_id";
const BUILT_MARKER: &str = "built";
const FINISHED_MARKER: &str = "finished";

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_dir(&self, source: &RepoSource) -> PathBuf {
        self.root.join(&source.owner).join(&source.repo)
    }

    fn build_dir(&self, source: &RepoSource) -> PathBuf {
        self.entry_dir(source).join("build")
    }

    /// Directory for one test target, mapping `path.c:symbol` to
    /// `test/path.c/symbol/`.
    fn target_dir(&self, source: &RepoSource, target: &str) -> Result<PathBuf> {
        if target.is_empty() {
            return Err(anyhow!("test target must not be empty"));
        }
        let rel = target.replace(':', "/");
        if Path::new(&rel)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(anyhow!("test target must be a relative path: '{target}'"));
        }
        Ok(self.entry_dir(source).join("test").join(rel))
    }

    /// Create a catalog entry and its build session.
    ///
    /// Fails if the entry already has a recorded build session.
    #[instrument(skip_all, fields(owner = %source.owner, repo = %source.repo))]
    pub fn catalog_new(&self, store: &SessionStore, source: &RepoSource) -> Result<SessionId> {
        let build_dir = self.build_dir(source);
        let id_file = build_dir.join(SESSION_ID_FILE);
        if id_file.exists() {
            return Err(anyhow!(
                "catalog entry already exists for {}/{}",
                source.owner,
                source.repo
            ));
        }

        let id = store.session_new(source)?;
        fs::create_dir_all(&build_dir)
            .with_context(|| format!("create build dir {}", build_dir.display()))?;
        write_marker(&id_file, &format!("{id}\n"))?;
        info!(session_id = %id, "created catalog entry");
        Ok(id)
    }

    /// Drive the build session through the agent until the repository is
    /// prepared, then mark the entry built.
    #[instrument(skip_all, fields(owner = %source.owner, repo = %source.repo))]
    pub fn catalog_build(
        &self,
        store: &SessionStore,
        gateway: &impl AgentGateway,
        source: &RepoSource,
    ) -> Result<SessionId> {
        let build_dir = self.build_dir(source);
        let id = read_session_id(&build_dir.join(SESSION_ID_FILE)).map_err(|_| {
            anyhow!(
                "catalog entry does not exist for {}/{} (run `stager new` first)",
                source.owner,
                source.repo
            )
        })?;
        let built = build_dir.join(BUILT_MARKER);
        if built.exists() {
            return Err(anyhow!(
                "catalog entry already built for {}/{}",
                source.owner,
                source.repo
            ));
        }

        let prompt = instructions::build_instructions()?;
        store.session_run(id, &prompt, gateway)?;
        write_marker(&built, "true\n")?;
        info!(session_id = %id, "catalog entry built");
        Ok(id)
    }

    /// Generate tests for one target in a fork of the build session.
    ///
    /// The child session id is recorded before the agent runs, so a crashed
    /// run is resumed on the next call instead of forking again. A target
    /// whose `finished` marker exists is refused.
    #[instrument(skip_all, fields(owner = %source.owner, repo = %source.repo, target))]
    pub fn catalog_test(
        &self,
        store: &SessionStore,
        gateway: &impl AgentGateway,
        source: &RepoSource,
        target: &str,
    ) -> Result<SessionId> {
        let build_dir = self.build_dir(source);
        if !build_dir.join(BUILT_MARKER).exists() {
            return Err(anyhow!(
                "catalog entry is not built for {}/{} (run `stager build` first)",
                source.owner,
                source.repo
            ));
        }
        let target_dir = self.target_dir(source, target)?;
        let id_file = target_dir.join(SESSION_ID_FILE);
        let finished = target_dir.join(FINISHED_MARKER);

        let id = if id_file.exists() {
            if finished.exists() {
                return Err(anyhow!(
                    "test target '{target}' is already finished for {}/{}",
                    source.owner,
                    source.repo
                ));
            }
            let id = read_session_id(&id_file)?;
            info!(session_id = %id, "resuming interrupted test target");
            id
        } else {
            let build_id = read_session_id(&build_dir.join(SESSION_ID_FILE))?;
            let child = store.session_clone(build_id)?;
            fs::create_dir_all(&target_dir)
                .with_context(|| format!("create target dir {}", target_dir.display()))?;
            // Recorded before the run so a crash leaves a resumable marker.
            write_marker(&id_file, &format!("{child}\n"))?;
            child
        };

        let prompt = instructions::test_instructions(target)?;
        store.session_run(id, &prompt, gateway)?;
        write_marker(&finished, "true\n")?;
        info!(session_id = %id, "test target finished");
        Ok(id)
    }
}

fn write_marker(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn read_session_id(path: &Path) -> Result<SessionId> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("parse session id in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::test_support::{FakeGateway, fixture_store, init_fixture_repo};

    struct Fixture {
        store: SessionStore,
        catalog: Catalog,
        source: RepoSource,
    }

    fn fixture(temp: &Path) -> Fixture {
        let origin = temp.join("origin-widget");
        init_fixture_repo(&origin);
        Fixture {
            store: fixture_store(temp),
            catalog: Catalog::new(temp.join("catalog")),
            source: RepoSource::local("acme", "widget", &origin),
        }
    }

    fn count_sessions(temp: &Path) -> usize {
        fs::read_dir(temp.join("sessions"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn new_records_build_session_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());

        let id = f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let recorded = fs::read_to_string(
            temp.path().join("catalog/acme/widget/build/session_id"),
        )
        .expect("read session_id");
        assert_eq!(recorded.trim(), id.to_string());
    }

    #[test]
    fn new_twice_is_a_collision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());

        f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let err = f.catalog.catalog_new(&f.store, &f.source).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn build_without_entry_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());

        let gateway = FakeGateway::appending(temp.path(), "build\n");
        let err = f
            .catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn build_marks_entry_and_refuses_second_build() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        let id = f.catalog.catalog_new(&f.store, &f.source).expect("new");

        let gateway = FakeGateway::appending(temp.path(), "build work\n");
        let built = f
            .catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("build");
        assert_eq!(built, id);
        assert!(temp
            .path()
            .join("catalog/acme/widget/build/built")
            .exists());

        let err = f
            .catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .unwrap_err();
        assert!(err.to_string().contains("already built"));
    }

    #[test]
    fn failed_build_leaves_entry_unbuilt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        f.catalog.catalog_new(&f.store, &f.source).expect("new");

        let gateway = FakeGateway::failing_after_append(temp.path(), "partial\n");
        let err = f
            .catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .unwrap_err();
        assert!(err.to_string().contains("agent blew up"));
        assert!(!temp
            .path()
            .join("catalog/acme/widget/build/built")
            .exists());

        // A retry completes the build.
        let gateway = FakeGateway::appending(temp.path(), "rest of build\n");
        f.catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("retry");
    }

    #[test]
    fn test_requires_built_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        f.catalog.catalog_new(&f.store, &f.source).expect("new");

        let gateway = FakeGateway::appending(temp.path(), "test\n");
        let err = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .unwrap_err();
        assert!(err.to_string().contains("not built"));
    }

    #[test]
    fn test_forks_build_session_and_marks_finished() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        let build_id = f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let gateway = FakeGateway::appending(temp.path(), "work\n");
        f.catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("build");

        let child = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .expect("test");
        assert_ne!(child, build_id);
        assert!(f.store.has_child(build_id));

        let target_dir = temp.path().join("catalog/acme/widget/test/src/lib.c/parse");
        assert_eq!(
            fs::read_to_string(target_dir.join("session_id"))
                .expect("read")
                .trim(),
            child.to_string()
        );
        assert!(target_dir.join("finished").exists());
    }

    #[test]
    fn finished_target_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let gateway = FakeGateway::appending(temp.path(), "work\n");
        f.catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("build");
        f.catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .expect("test");

        let err = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .unwrap_err();
        assert!(err.to_string().contains("already finished"));
    }

    #[test]
    fn interrupted_target_resumes_same_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let gateway = FakeGateway::appending(temp.path(), "work\n");
        f.catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("build");

        let failing = FakeGateway::failing_after_append(temp.path(), "half done\n");
        let err = f
            .catalog
            .catalog_test(&f.store, &failing, &f.source, "src/lib.c:parse")
            .unwrap_err();
        assert!(err.to_string().contains("agent blew up"));

        let target_dir = temp.path().join("catalog/acme/widget/test/src/lib.c/parse");
        assert!(target_dir.join("session_id").exists());
        assert!(!target_dir.join("finished").exists());
        let sessions_after_crash = count_sessions(temp.path());

        let child = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .expect("resume");
        assert_eq!(
            fs::read_to_string(target_dir.join("session_id"))
                .expect("read")
                .trim(),
            child.to_string()
        );
        // Resumed, not re-forked.
        assert_eq!(count_sessions(temp.path()), sessions_after_crash);
        assert!(target_dir.join("finished").exists());
    }

    #[test]
    fn two_targets_fork_independent_children() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        f.catalog.catalog_new(&f.store, &f.source).expect("new");
        let gateway = FakeGateway::appending(temp.path(), "work\n");
        f.catalog
            .catalog_build(&f.store, &gateway, &f.source)
            .expect("build");

        let a = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:parse")
            .expect("target a");
        let b = f
            .catalog
            .catalog_test(&f.store, &gateway, &f.source, "src/lib.c:format")
            .expect("target b");
        assert_ne!(a, b);
    }

    #[test]
    fn traversal_targets_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let f = fixture(temp.path());
        let catalog = &f.catalog;
        assert!(catalog.target_dir(&f.source, "").is_err());
        assert!(catalog.target_dir(&f.source, "../escape").is_err());
        assert!(catalog.target_dir(&f.source, "/abs/path").is_err());
        assert!(catalog.target_dir(&f.source, "src/lib.c:parse").is_ok());
    }
}
