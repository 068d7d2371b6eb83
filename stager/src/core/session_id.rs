//! Time-ordered session identifiers and their derived archive paths.
//!
//! A session id is a UUIDv7: the leading 48 bits embed the creation time in
//! milliseconds, so ids sort chronologically and the archive location of a
//! transcript can be recomputed from the id alone.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use time::OffsetDateTime;
use time::macros::format_description;
use uuid::Uuid;

/// Unique, time-ordered identifier for a session.
///
/// The same id names both the local session directory and the archived
/// transcript inside the agent runtime's own store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Mint a fresh id stamped with the current time.
    pub fn mint() -> Self {
        Self(Uuid::now_v7())
    }

    /// The creation instant embedded in the id.
    pub fn created_at(&self) -> Result<OffsetDateTime> {
        let ts = self
            .0
            .get_timestamp()
            .ok_or_else(|| anyhow!("session id {} carries no timestamp", self.0))?;
        let (secs, nanos) = ts.to_unix();
        let dt = OffsetDateTime::from_unix_timestamp(secs as i64)
            .context("session id timestamp out of range")?;
        Ok(dt + time::Duration::nanoseconds(nanos as i64))
    }

    /// Archive transcript path relative to the archive root.
    ///
    /// Date-partitioned, with both the timestamp and the full id in the
    /// filename: `.codex/sessions/YYYY/MM/DD/rollout-YYYY-MM-DDTHH-MM-SS-<id>.jsonl`.
    pub fn archive_rel_path(&self) -> Result<PathBuf> {
        let dt = self.created_at()?;
        let date_dir = dt
            .format(format_description!("[year]/[month]/[day]"))
            .context("format archive date dir")?;
        let stamp = dt
            .format(format_description!(
                "[year]-[month]-[day]T[hour]-[minute]-[second]"
            ))
            .context("format archive timestamp")?;
        let mut path = PathBuf::from(".codex/sessions");
        path.push(date_dir);
        path.push(format!("rollout-{stamp}-{self}.jsonl"));
        Ok(path)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s.trim()).with_context(|| format!("parse session id '{s}'"))?;
        Ok(Self(uuid))
    }
}
