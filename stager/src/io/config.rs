//! Stager configuration stored under `~/.stager/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Stager configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values derived from the
/// home directory at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagerConfig {
    /// Root directory holding one subdirectory per session.
    pub sessions_root: PathBuf,

    /// Root directory of the catalog (one subdirectory per owner/repo).
    pub catalog_root: PathBuf,

    /// Root under which the agent runtime keeps its archived transcripts
    /// (`<archive_root>/.codex/sessions/...`).
    pub archive_root: PathBuf,

    /// Root under which session checkouts appear inside the sandbox
    /// (`<apparent_root>/repo/<name>`).
    pub apparent_root: PathBuf,

    /// Wall-clock budget in seconds for one agent session run.
    pub run_timeout_secs: u64,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Model credential handed to the agent gateway. Left unset, the agent
    /// runtime's own login state is used.
    pub api_key: Option<String>,
}

impl StagerConfig {
    pub fn defaults_for_home(home: &Path) -> Self {
        Self {
            sessions_root: home.join("sessions"),
            catalog_root: home.join("catalog"),
            archive_root: home.to_path_buf(),
            apparent_root: home.to_path_buf(),
            run_timeout_secs: 60 * 60,
            agent: AgentConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        for (name, path) in [
            ("sessions_root", &self.sessions_root),
            ("catalog_root", &self.catalog_root),
            ("archive_root", &self.archive_root),
            ("apparent_root", &self.apparent_root),
        ] {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        Ok(())
    }
}

impl Default for StagerConfig {
    fn default() -> Self {
        // Serde's fill-in default for partial files; `load_config` swaps in
        // home-derived roots before validation.
        Self::defaults_for_home(Path::new("."))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StagerConfig::defaults_for_home(home)`.
pub fn load_config(path: &Path, home: &Path) -> Result<StagerConfig> {
    if !path.exists() {
        let cfg = StagerConfig::defaults_for_home(home);
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: StagerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    // Fields the file left out came back as the serde placeholder defaults;
    // swap those for home-derived roots.
    let placeholder = StagerConfig::default();
    let defaults = StagerConfig::defaults_for_home(home);
    for (field, placeholder, default) in [
        (
            &mut cfg.sessions_root,
            placeholder.sessions_root,
            defaults.sessions_root,
        ),
        (
            &mut cfg.catalog_root,
            placeholder.catalog_root,
            defaults.catalog_root,
        ),
        (
            &mut cfg.archive_root,
            placeholder.archive_root,
            defaults.archive_root,
        ),
        (
            &mut cfg.apparent_root,
            placeholder.apparent_root,
            defaults.apparent_root,
        ),
    ] {
        if *field == placeholder || field.as_os_str().is_empty() {
            *field = default;
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StagerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_home_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home");
        let cfg = load_config(&temp.path().join("missing.toml"), &home).expect("load");
        assert_eq!(cfg.sessions_root, home.join("sessions"));
        assert_eq!(cfg.catalog_root, home.join("catalog"));
        assert_eq!(cfg.archive_root, home);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = StagerConfig::defaults_for_home(&temp.path().join("home"));
        cfg.agent.api_key = Some("sk-test".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path, &temp.path().join("home")).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_home_roots() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home");
        let path = temp.path().join("config.toml");
        fs::write(&path, "run_timeout_secs = 120\n").expect("write");
        let cfg = load_config(&path, &home).expect("load");
        assert_eq!(cfg.run_timeout_secs, 120);
        assert_eq!(cfg.sessions_root, home.join("sessions"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "run_timeout_secs = 0\n").expect("write");
        let err = load_config(&path, temp.path()).unwrap_err();
        assert!(err.to_string().contains("run_timeout_secs"));
    }
}
