//! Append-only progress ledger for idempotent plan steps.
//!
//! Every plan step is recorded in `.stager/progress.ndjson` under a
//! deterministic event id derived from the plan hash, the step name, and the
//! step payload. The latest record per event id is authoritative: a step
//! whose latest status is `ok` is skipped entirely on replay, and a record
//! left at `begin` by a crash is simply re-attempted.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};

use crate::io::process::run_argv;

/// Directory under the repository root holding the plan artifact and ledger.
pub const PLAN_DIR: &str = ".stager";
pub const PLAN_FILE: &str = "plan.json";
pub const PROGRESS_FILE: &str = "progress.ndjson";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Begin,
    Ok,
    Fail,
}

/// One line of the progress ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub ts: String,
    pub event_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonfatal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: Value,
}

/// Ledger file plus the folded latest-record-per-event view.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    latest: BTreeMap<String, LedgerRecord>,
}

impl Ledger {
    /// Load the ledger for a repository root, folding to last-record-wins.
    /// Unparseable lines are ignored rather than poisoning resumption.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(PLAN_DIR).join(PROGRESS_FILE);
        let mut latest = BTreeMap::new();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read ledger {}", path.display()))?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<LedgerRecord>(line) else {
                    warn!(path = %path.display(), "skipping unparseable ledger line");
                    continue;
                };
                latest.insert(record.event_id.clone(), record);
            }
        }
        Ok(Self { path, latest })
    }

    /// True when the latest record for `event_id` is `ok`.
    pub fn step_done(&self, event_id: &str) -> bool {
        self.latest
            .get(event_id)
            .is_some_and(|record| record.status == StepStatus::Ok)
    }

    pub fn latest(&self, event_id: &str) -> Option<&LedgerRecord> {
        self.latest.get(event_id)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn append(&mut self, record: LedgerRecord) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("ledger path missing parent")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create ledger dir {}", parent.display()))?;
        let mut line = serde_json::to_string(&record).context("serialize ledger record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        self.latest.insert(record.event_id.clone(), record);
        Ok(())
    }
}

/// Deterministic, compact step identity: `<plan_hash>:<name>:<payload_hash>`.
pub fn event_id(plan_hash: &str, name: &str, payload: &Value) -> String {
    let canonical = json!({ "name": name, "payload": payload });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{plan_hash}:{name}:{}", &hex::encode(digest)[..12])
}

/// Run a step once per `(plan_hash, name, payload)`.
///
/// Skips when the latest record is `ok`. Otherwise appends `begin`, runs the
/// closure, and appends `ok`/`fail`. A non-fatal failure is recorded as `ok`
/// with the error attached, and execution continues.
pub fn run_recorded_step<T>(
    ledger: &mut Ledger,
    plan_hash: &str,
    name: &str,
    payload: Value,
    nonfatal: bool,
    step: impl FnOnce() -> Result<T>,
) -> Result<Option<T>> {
    let eid = event_id(plan_hash, name, &payload);
    if ledger.step_done(&eid) {
        info!(step = name, "skip (already ok)");
        return Ok(None);
    }

    ledger.append(LedgerRecord {
        ts: now_iso(),
        event_id: eid.clone(),
        name: name.to_string(),
        status: StepStatus::Begin,
        nonfatal: None,
        error: None,
        payload: payload.clone(),
    })?;

    match step() {
        Ok(value) => {
            ledger.append(LedgerRecord {
                ts: now_iso(),
                event_id: eid,
                name: name.to_string(),
                status: StepStatus::Ok,
                nonfatal: None,
                error: None,
                payload,
            })?;
            Ok(Some(value))
        }
        Err(err) if nonfatal => {
            warn!(step = name, err = %err, "nonfatal failure, marking ok");
            ledger.append(LedgerRecord {
                ts: now_iso(),
                event_id: eid,
                name: name.to_string(),
                status: StepStatus::Ok,
                nonfatal: Some(true),
                error: Some(format!("{err:#}")),
                payload,
            })?;
            Ok(None)
        }
        Err(err) => {
            ledger.append(LedgerRecord {
                ts: now_iso(),
                event_id: eid,
                name: name.to_string(),
                status: StepStatus::Fail,
                nonfatal: None,
                error: Some(format!("{err:#}")),
                payload,
            })?;
            Err(err)
        }
    }
}

/// Record and run one plan command as a named step.
pub fn run_recorded_cmd(
    ledger: &mut Ledger,
    plan_hash: &str,
    name: &str,
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
    nonfatal: bool,
) -> Result<()> {
    let payload = json!({
        "cmd": argv,
        "cwd": cwd.to_string_lossy(),
        "env": env,
        "timeout_secs": timeout.as_secs(),
        "check": true,
    });
    run_recorded_step(ledger, plan_hash, name, payload, nonfatal, || {
        info!(step = name, cmd = ?argv, "running plan command");
        run_argv(argv, cwd, env, timeout, true)
    })?;
    Ok(())
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .unwrap_or_default()
}
