//! Sandbox abstraction for isolated filesystem views.
//!
//! The [`SandboxRunner`] trait captures one capability: bind a directory
//! read-write over an apparent path inside an isolated filesystem view and
//! run a single command there. The production implementation uses a Linux
//! mount namespace; tests substitute fakes that never touch mounts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use std::process::Command;
use tracing::{info, instrument};

use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Parameters for a sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Directory bound over `apparent_dir` (the session's private checkout).
    pub source_dir: PathBuf,
    /// Fixed path at which the checkout appears inside the sandbox.
    pub apparent_dir: PathBuf,
    /// Command to run, with `apparent_dir` as its working directory.
    pub command: Vec<String>,
    /// Environment overlay applied to the command.
    pub env: BTreeMap<String, String>,
    /// Bytes fed to the command's stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock budget; exceeding it is a terminal failure.
    pub timeout: Duration,
}

/// Run one command inside an isolated filesystem view.
///
/// Blocking, single invocation, no retry: a timeout or non-zero exit is
/// reported to the caller as a terminal result.
pub trait SandboxRunner {
    fn run(&self, request: &SandboxRequest) -> Result<CommandOutput>;
}

/// SandboxRunner backed by `unshare --mount` and a bind mount.
pub struct MountNamespaceRunner;

impl SandboxRunner for MountNamespaceRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SandboxRequest) -> Result<CommandOutput> {
        if request.command.is_empty() {
            return Err(anyhow!("sandbox command is empty"));
        }
        let script = bind_script(request);
        info!(
            source = %request.source_dir.display(),
            apparent = %request.apparent_dir.display(),
            "entering mount namespace"
        );

        let mut cmd = Command::new("sudo");
        cmd.args(["unshare", "--mount", "bash", "-c", &script]);
        cmd.envs(&request.env);

        let output = run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
        .context("run sandboxed command")?;

        if output.timed_out {
            return Err(anyhow!(
                "sandboxed command timed out after {:?}",
                request.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "sandboxed command failed with status {:?}:\n{}",
                output.status.code(),
                output.combined_lossy()
            ));
        }
        Ok(output)
    }
}

/// Bash script executed inside the fresh mount namespace.
fn bind_script(request: &SandboxRequest) -> String {
    let source = shell_quote(&request.source_dir.to_string_lossy());
    let apparent = shell_quote(&request.apparent_dir.to_string_lossy());
    let command = request
        .command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!("set -e\nmount --bind {source} {apparent}\ncd {apparent}\nexec {command}\n")
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
