//! Agent gateway abstraction for resuming sessions.
//!
//! The [`AgentGateway`] trait decouples session orchestration from the
//! external coding-agent runtime (currently `codex exec resume`). The runtime
//! receives instruction text on stdin, resumes by session id, and mutates the
//! archived transcript in place. Tests use fake gateways that edit the
//! archive directly without spawning processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::session_id::SessionId;
use crate::io::sandbox::{SandboxRequest, SandboxRunner};

/// Parameters for one resume-by-id invocation.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: SessionId,
    /// The session's private checkout on the host.
    pub checkout_dir: PathBuf,
    /// Path at which the checkout must appear to the agent.
    pub apparent_dir: PathBuf,
    /// Instruction text fed to the agent on stdin.
    pub instructions: String,
    pub timeout: Duration,
}

/// Abstraction over the external agent runtime.
pub trait AgentGateway {
    /// Resume the session and consume the instructions. Must leave the
    /// archived transcript as the authoritative copy.
    fn resume(&self, request: &ResumeRequest) -> Result<()>;
}

/// Gateway that runs `codex exec resume` inside a sandbox.
pub struct CodexGateway<S: SandboxRunner> {
    sandbox: S,
    /// Model credential threaded in explicitly rather than read ambiently
    /// from the process environment.
    api_key: Option<String>,
}

impl<S: SandboxRunner> CodexGateway<S> {
    pub fn new(sandbox: S, api_key: Option<String>) -> Self {
        Self { sandbox, api_key }
    }
}

impl<S: SandboxRunner> AgentGateway for CodexGateway<S> {
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    fn resume(&self, request: &ResumeRequest) -> Result<()> {
        info!(apparent = %request.apparent_dir.display(), "resuming agent session");
        let command = vec![
            "codex".to_string(),
            "--ask-for-approval".to_string(),
            "never".to_string(),
            "exec".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "resume".to_string(),
            request.session_id.to_string(),
            "-".to_string(),
        ];

        let mut env = BTreeMap::new();
        if let Some(key) = &self.api_key {
            env.insert("OPENAI_API_KEY".to_string(), key.clone());
        }

        self.sandbox
            .run(&SandboxRequest {
                source_dir: request.checkout_dir.clone(),
                apparent_dir: request.apparent_dir.clone(),
                command,
                env,
                stdin: Some(request.instructions.clone().into_bytes()),
                timeout: request.timeout,
            })
            .context("agent resume")?;
        Ok(())
    }
}
