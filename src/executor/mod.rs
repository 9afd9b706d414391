//! Phase execution.
//!
//! Given a phase declaration, the executor dispatches its agents (strictly in
//! declared order, or concurrently under a semaphore when the phase is
//! parallel), drives each agent's retry loop, and finally runs the checkpoint
//! validator over the union of the agents' declared artifact patterns.
//!
//! Within a phase, each agent's retries are serial. Across parallel agents
//! there are no ordering guarantees, but the phase does not return until
//! every agent has either succeeded or exhausted its retries.

pub mod agent;

use crate::checkpoint::{ValidationReport, validate_and_report};
use crate::errors::{ConductorError, Result};
use crate::runlog::{RunLog, RunRecord};
use crate::state::{AgentOutcome, ValidationVerdict};
use crate::workflow::{PhaseConfig, Settings, WorkflowProfile};
use agent::{AgentInvocation, InvocationStatus, invoker_for};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-invocation overrides supplied on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOverrides {
    /// Force parallel dispatch for a phase declared parallel-capable.
    pub force_parallel: bool,
    /// Cap concurrent workers; never exceeds the configured maximum.
    pub max_workers: Option<usize>,
    /// Override the per-invocation timeout, in seconds.
    pub timeout_secs: Option<u64>,
}

/// Result of executing one phase.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase_name: String,
    pub agent_outcomes: Vec<AgentOutcome>,
    pub validation: Option<ValidationReport>,
    /// Set by the state machine when the phase pauses for consensus.
    pub awaiting_consensus: bool,
    /// An agent returned exit code 2; the operator takes over.
    pub in_session: bool,
    pub success: bool,
    pub duration_s: f64,
}

impl PhaseOutcome {
    pub fn verdict(&self) -> Option<ValidationVerdict> {
        self.validation.as_ref().map(|v| v.status)
    }
}

/// Executes phases for one run.
pub struct PhaseExecutor {
    pub project_root: PathBuf,
    pub validation_dir: PathBuf,
    pub in_session_dir: PathBuf,
    pub run_id: String,
    pub settings: Settings,
    pub cancel: CancellationToken,
}

impl PhaseExecutor {
    /// Execute every agent of `phase`, then validate checkpoint artifacts.
    pub async fn execute_phase(
        &self,
        profile: &WorkflowProfile,
        phase: &PhaseConfig,
        overrides: ExecOverrides,
        log: &RunLog,
    ) -> Result<PhaseOutcome> {
        let started = Instant::now();
        log.append(RunRecord::PhaseStart {
            phase: phase.name.clone(),
        })?;

        let parallel = phase.parallel || overrides.force_parallel;
        let outcomes = if parallel {
            self.run_parallel(profile, phase, overrides, log).await?
        } else {
            self.run_sequential(profile, phase, overrides, log).await?
        };

        let in_session = outcomes.iter().any(AgentOutcome::is_in_session);
        let agents_ok = !outcomes.is_empty() && outcomes.iter().all(|o| o.success);

        // In-session suspension defers validation to the checkpoint command.
        let validation = if in_session {
            None
        } else {
            let patterns = profile.checkpoint_patterns(phase);
            if patterns.is_empty() {
                None
            } else {
                Some(validate_and_report(
                    &patterns,
                    &self.project_root,
                    &phase.name,
                    &self.validation_dir,
                )?)
            }
        };

        let validation_ok = validation
            .as_ref()
            .map(|v| v.status == ValidationVerdict::Pass)
            .unwrap_or(true);
        let success = agents_ok && validation_ok && !in_session;

        log.append(RunRecord::PhaseEnd {
            phase: phase.name.clone(),
            success,
        })?;

        Ok(PhaseOutcome {
            phase_name: phase.name.clone(),
            agent_outcomes: outcomes,
            validation,
            awaiting_consensus: false,
            in_session,
            success,
            duration_s: started.elapsed().as_secs_f64(),
        })
    }

    async fn run_sequential(
        &self,
        profile: &WorkflowProfile,
        phase: &PhaseConfig,
        overrides: ExecOverrides,
        log: &RunLog,
    ) -> Result<Vec<AgentOutcome>> {
        let mut outcomes = Vec::with_capacity(phase.agents.len());
        for agent_name in &phase.agents {
            if self.cancel.is_cancelled() {
                break;
            }
            let task = self.agent_task(profile, phase, agent_name, overrides)?;
            let outcome = run_agent_with_retries(task, log.clone()).await?;
            let suspended = outcome.is_in_session();
            outcomes.push(outcome);
            if suspended {
                // The operator finishes this phase; later agents wait for a
                // re-execution after the checkpoint.
                break;
            }
        }
        Ok(outcomes)
    }

    async fn run_parallel(
        &self,
        profile: &WorkflowProfile,
        phase: &PhaseConfig,
        overrides: ExecOverrides,
        log: &RunLog,
    ) -> Result<Vec<AgentOutcome>> {
        let cap = self
            .settings
            .max_parallel_agents
            .min(overrides.max_workers.unwrap_or(usize::MAX))
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));

        let mut handles = Vec::with_capacity(phase.agents.len());
        for agent_name in &phase.agents {
            let task = self.agent_task(profile, phase, agent_name, overrides)?;
            let log = log.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ConductorError::Config("agent semaphore closed".into()))?;
                run_agent_with_retries(task, log).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            let outcome = joined.map_err(|e| ConductorError::AgentFailed {
                agent: phase.name.clone(),
                attempts: 0,
                reason: format!("agent task panicked: {e}"),
            })??;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn agent_task(
        &self,
        profile: &WorkflowProfile,
        phase: &PhaseConfig,
        agent_name: &str,
        overrides: ExecOverrides,
    ) -> Result<AgentTask> {
        let agent = profile.agent(agent_name)?.clone();
        let retry = profile.effective_retry(phase, &agent);
        let timeout = overrides
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| profile.effective_timeout(phase, &agent));

        Ok(AgentTask {
            invocation: AgentInvocation {
                agent,
                phase: phase.name.clone(),
                run_id: self.run_id.clone(),
                project_root: self.project_root.clone(),
                timeout,
                grace: Duration::from_secs(self.settings.grace_period_secs),
                cancel: self.cancel.clone(),
                in_session_dir: self.in_session_dir.clone(),
            },
            retry,
        })
    }
}

struct AgentTask {
    invocation: AgentInvocation,
    retry: crate::workflow::RetryPolicy,
}

/// Drive one agent through its retry series. Retries are serial; the
/// per-invocation timeout restarts on each attempt.
async fn run_agent_with_retries(task: AgentTask, log: RunLog) -> Result<AgentOutcome> {
    let AgentTask { invocation, retry } = task;
    let agent_name = invocation.agent.name.clone();
    let phase = invocation.phase.clone();
    let invoker = invoker_for(invocation.agent.executor);

    let started_at = Utc::now();
    let mut last_exit = -1;
    let mut last_notes = String::new();
    let mut success = false;
    let mut attempts_used = 0;

    for attempt in 1..=retry.max_attempts.max(1) {
        attempts_used = attempt;
        log.append(RunRecord::AgentStart {
            phase: phase.clone(),
            agent: agent_name.clone(),
            attempt,
        })?;

        let result = invoker.invoke(&invocation).await?;
        last_exit = result.exit_code.unwrap_or(-1);
        last_notes = result.notes.clone();

        if result.is_success() {
            success = true;
            break;
        }
        if result.is_in_session() {
            break;
        }
        if result.status == InvocationStatus::Cancelled {
            break;
        }

        if attempt < retry.max_attempts {
            let delay = retry.backoff_delay(attempt);
            log.append(RunRecord::Retry {
                phase: phase.clone(),
                agent: agent_name.clone(),
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
            })?;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = invocation.cancel.cancelled() => break,
            }
        }
    }

    let retry_count = attempts_used.saturating_sub(1);
    log.append(RunRecord::AgentEnd {
        phase,
        agent: agent_name.clone(),
        exit_code: last_exit,
        success,
        retry_count,
    })?;

    Ok(AgentOutcome {
        agent_name,
        success,
        exit_code: last_exit,
        started_at,
        finished_at: Utc::now(),
        retry_count,
        notes: last_notes,
    })
}
