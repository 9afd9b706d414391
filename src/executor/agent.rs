//! Agent invocation.
//!
//! One `AgentInvoker` implementation per executor kind. Subprocess and LLM
//! agents spawn their declared command with the project root as working
//! directory; in-session agents write their instructions to a well-known
//! path and return the reserved exit code 2 so the operator can take over.
//!
//! A timeout covers a single invocation. Cancellation (run abort) and
//! timeout both terminate the child gracefully: SIGTERM, a grace period,
//! then SIGKILL.

use crate::errors::{ConductorError, Result};
use crate::workflow::{AgentConfig, ExecutorKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    /// The agent exited on its own; `exit_code` is set.
    Exited,
    /// The per-invocation timeout fired; subject to the retry policy.
    TimedOut,
    /// The run was aborted; never retried.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub exit_code: Option<i32>,
    pub notes: String,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Exited && self.exit_code == Some(0)
    }

    pub fn is_in_session(&self) -> bool {
        self.status == InvocationStatus::Exited && self.exit_code == Some(2)
    }
}

/// Everything an invoker needs to run one agent once.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent: AgentConfig,
    pub phase: String,
    pub run_id: String,
    pub project_root: PathBuf,
    pub timeout: Duration,
    pub grace: Duration,
    pub cancel: CancellationToken,
    pub in_session_dir: PathBuf,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<InvocationResult>;
}

/// Select the invoker for an agent's declared executor kind.
pub fn invoker_for(kind: ExecutorKind) -> Box<dyn AgentInvoker> {
    match kind {
        ExecutorKind::Subprocess | ExecutorKind::Llm => Box::new(SubprocessInvoker),
        ExecutorKind::InSession => Box::new(InSessionInvoker),
    }
}

/// Runs the agent's command as a child process.
pub struct SubprocessInvoker;

#[async_trait]
impl AgentInvoker for SubprocessInvoker {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<InvocationResult> {
        let agent = &invocation.agent;
        let (program, args) = agent.command.split_first().ok_or_else(|| {
            ConductorError::Config(format!(
                "agent '{}' has executor '{}' but no command",
                agent.name, agent.executor
            ))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&invocation.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONDUCTOR_RUN_ID", &invocation.run_id)
            .env("CONDUCTOR_PHASE", &invocation.phase)
            .env("CONDUCTOR_AGENT", &agent.name)
            .kill_on_drop(true);
        for (key, value) in &agent.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| ConductorError::SpawnFailed {
            agent: agent.name.clone(),
            source: e,
        })?;

        // Drain pipes concurrently so a chatty agent never blocks on a full
        // pipe while we wait for it.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let drain = tokio::spawn(async move {
            let mut out = String::new();
            let mut err = String::new();
            if let Some(ref mut s) = stdout {
                let _ = s.read_to_string(&mut out).await;
            }
            if let Some(ref mut s) = stderr {
                let _ = s.read_to_string(&mut err).await;
            }
            (out, err)
        });

        let status = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ConductorError::SpawnFailed {
                    agent: agent.name.clone(),
                    source: e,
                })?;
                InvocationEnd::Exited(status.code().unwrap_or(-1))
            }
            _ = invocation.cancel.cancelled() => {
                terminate(&mut child, invocation.grace).await;
                InvocationEnd::Cancelled
            }
            _ = tokio::time::sleep(invocation.timeout) => {
                terminate(&mut child, invocation.grace).await;
                InvocationEnd::TimedOut
            }
        };

        let (out, err) = drain.await.unwrap_or_default();
        let notes = summarize_output(&out, &err);

        Ok(match status {
            InvocationEnd::Exited(code) => InvocationResult {
                status: InvocationStatus::Exited,
                exit_code: Some(code),
                notes,
            },
            InvocationEnd::TimedOut => InvocationResult {
                status: InvocationStatus::TimedOut,
                exit_code: None,
                notes: format!("timed out after {}s", invocation.timeout.as_secs()),
            },
            InvocationEnd::Cancelled => InvocationResult {
                status: InvocationStatus::Cancelled,
                exit_code: None,
                notes: "cancelled by abort".to_string(),
            },
        })
    }
}

enum InvocationEnd {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    }
    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(grace) => {
            let _ = child.kill().await;
        }
    }
}

fn summarize_output(stdout: &str, stderr: &str) -> String {
    let pick = |s: &str| -> String {
        let trimmed = s.trim();
        let tail: Vec<&str> = trimmed.lines().rev().take(3).collect();
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    };
    let out = pick(stdout);
    let err = pick(stderr);
    match (out.is_empty(), err.is_empty()) {
        (true, true) => String::new(),
        (false, true) => out,
        (true, false) => err,
        (false, false) => format!("{out}\n{err}"),
    }
}

/// Hands the work to the operator's session: writes the agent's instructions
/// to a well-known path and reports the reserved exit code 2.
pub struct InSessionInvoker;

#[async_trait]
impl AgentInvoker for InSessionInvoker {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<InvocationResult> {
        let agent = &invocation.agent;
        let path = invocation.in_session_dir.join("INSTRUCTIONS.md");

        let mut body = String::new();
        body.push_str("# In-Session Work Required\n\n");
        body.push_str(&format!("**Phase:** {}\n", invocation.phase));
        body.push_str(&format!("**Agent:** {}\n\n", agent.name));
        match agent.instructions {
            Some(ref instructions) => {
                body.push_str(instructions);
                if !instructions.ends_with('\n') {
                    body.push('\n');
                }
            }
            None => {
                body.push_str("Perform this agent's work in the current session.\n");
            }
        }
        if !agent.checkpoint_artifacts.is_empty() {
            body.push_str("\n## Expected Artifacts\n\n");
            for pattern in &agent.checkpoint_artifacts {
                body.push_str(&format!("- `{pattern}`\n"));
            }
        }
        body.push_str("\nWhen done, run `conductor checkpoint` to validate and advance.\n");

        std::fs::create_dir_all(&invocation.in_session_dir).map_err(|e| {
            ConductorError::PersistFailed {
                what: "in-session instructions",
                path: invocation.in_session_dir.clone(),
                source: e,
            }
        })?;
        std::fs::write(&path, body).map_err(|e| ConductorError::PersistFailed {
            what: "in-session instructions",
            path: path.clone(),
            source: e,
        })?;

        Ok(InvocationResult {
            status: InvocationStatus::Exited,
            exit_code: Some(2),
            notes: format!("instructions written to {}", path.display()),
        })
    }
}
