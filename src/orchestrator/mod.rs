//! The run state machine.
//!
//! A single `Orchestrator` value owns the workflow registry, the persistence
//! handles, the consensus gate, and the current run state, and exposes every
//! operation of the command surface. Operations issued in the wrong state
//! return a typed error and change nothing beyond a denial record in the run
//! log. Every successful mutation persists the state document before
//! returning.

use crate::checkpoint::{ValidationReport, validate_and_report};
use crate::config::Paths;
use crate::consensus::ConsensusGate;
use crate::errors::{ConductorError, Result};
use crate::executor::{ExecOverrides, PhaseExecutor, PhaseOutcome};
use crate::hygiene::{self, HygieneConfig};
use crate::metrics::{MetricsRecorder, RunMetrics};
use crate::runlog::{RunLog, RunRecord};
use crate::state::{
    PhaseStatus, RunMetadata, RunState, RunStatus, StateStore, ValidationVerdict,
};
use crate::workflow::{PhaseConfig, WorkflowProfile, WorkflowsFile};
use chrono::Utc;
use fs2::FileExt;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of the `checkpoint` command.
#[derive(Debug)]
pub enum CheckpointOutcome {
    /// The phase was committed and the cursor advanced (or the run completed).
    Advanced {
        report: Option<ValidationReport>,
        run_completed: bool,
        next_phase: Option<String>,
    },
    /// Verdict was `Fail` and `--force` was not given; nothing changed.
    Blocked { report: ValidationReport },
    /// Verdict was `Partial`; the operator must confirm before advancing.
    NeedsConfirmation { report: ValidationReport },
}

/// Read-only view assembled for the `status` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    pub awaiting_consensus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_phase: Option<String>,
    pub checkpoints: Vec<(String, ValidationVerdict)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanliness_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanliness_grade: Option<String>,
}

pub struct Orchestrator {
    pub paths: Paths,
    workflows: WorkflowsFile,
    store: StateStore,
    gate: ConsensusGate,
    cancel: CancellationToken,
    state: Option<RunState>,
    _lock: std::fs::File,
}

impl Orchestrator {
    /// Open the orchestrator for a project directory. Acquires the advisory
    /// lock (one process owns a run at a time) and loads the persisted state;
    /// an absent state document means `Idle`.
    pub fn open(project_root: impl AsRef<Path>) -> Result<Self> {
        let paths = Paths::new(project_root)
            .map_err(|e| ConductorError::Config(format!("invalid project directory: {e}")))?;
        paths
            .ensure_directories()
            .map_err(|e| ConductorError::Config(format!("cannot prepare .conductor: {e}")))?;

        let workflows = WorkflowsFile::load(&paths.workflows_file)?;

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_file)
            .map_err(|e| ConductorError::PersistFailed {
                what: "run lock",
                path: paths.lock_file.clone(),
                source: e,
            })?;
        lock.try_lock_exclusive()
            .map_err(|_| ConductorError::RunLocked {
                path: paths.lock_file.clone(),
            })?;

        let store = StateStore::new(paths.state_file.clone());
        let state = store.load()?;
        let gate = ConsensusGate::new(paths.consensus_dir.clone());

        Ok(Self {
            paths,
            workflows,
            store,
            gate,
            cancel: CancellationToken::new(),
            state,
            _lock: lock,
        })
    }

    pub fn status(&self) -> RunStatus {
        self.state.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn state(&self) -> Option<&RunState> {
        self.state.as_ref()
    }

    /// Token cancelled by `abort_run`; in-flight agents observe it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn profile(&self) -> Result<&WorkflowProfile> {
        let state = self.require_state("inspect")?;
        self.workflows.profile(&state.profile)
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Create a new run in `Running` at the first (or requested) phase.
    pub fn start_run(
        &mut self,
        profile_name: &str,
        intake_path: Option<&Path>,
        from_phase: Option<&str>,
    ) -> Result<&RunState> {
        let status = self.status();
        if !status.can_start() {
            return Err(self.deny("start", status));
        }

        let profile = self.workflows.profile(profile_name)?;
        let first_phase = match from_phase {
            Some(name) => profile.phase(name)?.name.clone(),
            None => profile
                .first_phase()
                .map(|p| p.name.clone())
                .ok_or_else(|| {
                    ConductorError::Config(format!("profile '{profile_name}' has no phases"))
                })?,
        };

        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let mut state = RunState::new(run_id.clone(), profile_name.to_string(), first_phase);
        if let Some(path) = intake_path {
            state.metadata = load_intake(path)?;
        }

        self.store.save(&state)?;
        let recorder = MetricsRecorder::new(self.paths.metrics_file(&run_id));
        recorder.save(&RunMetrics::new(&run_id, profile_name))?;

        self.cancel = CancellationToken::new();
        self.state = Some(state);
        Ok(self.state.as_ref().expect("state just set"))
    }

    /// Execute the current phase and advance per the transition rules.
    pub async fn next_phase(&mut self, overrides: ExecOverrides) -> Result<PhaseOutcome> {
        let status = self.status();
        if status != RunStatus::Running {
            return Err(self.deny("next", status));
        }

        let state = self.state.as_ref().expect("running implies state");
        let phase_name = state
            .current_phase
            .clone()
            .ok_or_else(|| ConductorError::Config("running with no current phase".into()))?;
        let profile = self.workflows.profile(&state.profile)?.clone();
        let phase = profile.phase(&phase_name)?.clone();
        let log = self.run_log().expect("running implies run id");

        {
            let state = self.state.as_mut().expect("checked");
            let phase_state = state.phase_state_mut(&phase_name);
            phase_state.status = PhaseStatus::InProgress;
            phase_state.started_at = Some(Utc::now());
            state.touch();
        }
        self.persist()?;

        let mut outcome = if phase.agents.iter().any(|a| a == hygiene::HYGIENE_AGENT) {
            self.run_hygiene_phase(&phase, &log)?
        } else {
            let executor = self.executor();
            executor
                .execute_phase(&profile, &phase, overrides, &log)
                .await?
        };

        self.absorb_outcome(&phase_name, &outcome)?;

        if outcome.in_session {
            // Cursor untouched; the operator resumes via `checkpoint`.
            self.persist()?;
            return Ok(outcome);
        }

        if !outcome.success {
            let state = self.state.as_mut().expect("checked");
            if phase.required {
                // The operator decides: re-run, force a checkpoint, or abort.
                state.phase_state_mut(&phase_name).status = PhaseStatus::Failed;
                state.touch();
            } else {
                // Optional phases are skipped on failure; they never enter
                // the completed list.
                state.phase_state_mut(&phase_name).status = PhaseStatus::Skipped;
                state.touch();
                self.advance_cursor(&phase_name)?;
            }
            self.persist()?;
            return Ok(outcome);
        }

        if phase.consensus_required {
            let state = self.state.as_mut().expect("checked");
            state.set_status(RunStatus::AwaitingConsensus);
            state.consensus_phase = Some(phase_name.clone());
            let state_ref = self.state.as_ref().expect("checked");
            self.gate
                .request(state_ref, &phase_name, outcome.validation.as_ref())?;
            log.append(RunRecord::ConsensusRequested {
                phase: phase_name.clone(),
            })?;
            self.persist()?;
            outcome.awaiting_consensus = true;
            return Ok(outcome);
        }

        self.commit_and_advance(&phase_name)?;
        self.persist()?;
        Ok(outcome)
    }

    /// Approve the pending consensus and advance.
    pub fn approve_consensus(&mut self) -> Result<()> {
        let status = self.status();
        if status != RunStatus::AwaitingConsensus {
            return Err(self.deny("approve", status));
        }
        let state = self.state.as_ref().expect("awaiting implies state");
        let phase = state
            .consensus_phase
            .clone()
            .ok_or_else(|| ConductorError::Config("awaiting consensus with no phase".into()))?;
        let run_id = state.run_id.clone();

        self.gate.approve(&run_id, &phase)?;
        if let Some(log) = self.run_log() {
            log.append(RunRecord::ConsensusApproved {
                phase: phase.clone(),
            })?;
        }

        {
            let state = self.state.as_mut().expect("checked");
            state.set_status(RunStatus::Running);
        }
        self.commit_and_advance(&phase)?;
        self.persist()
    }

    /// Reject the pending consensus; the run needs revision.
    pub fn reject_consensus(&mut self, reason: &str) -> Result<()> {
        let status = self.status();
        if status != RunStatus::AwaitingConsensus {
            return Err(self.deny("reject", status));
        }
        let state = self.state.as_ref().expect("awaiting implies state");
        let phase = state
            .consensus_phase
            .clone()
            .ok_or_else(|| ConductorError::Config("awaiting consensus with no phase".into()))?;
        let run_id = state.run_id.clone();

        self.gate.reject(&run_id, &phase, reason)?;
        if let Some(log) = self.run_log() {
            log.append(RunRecord::ConsensusRejected {
                phase: phase.clone(),
                reason: reason.to_string(),
            })?;
        }

        let state = self.state.as_mut().expect("checked");
        state.set_status(RunStatus::NeedsRevision);
        // The cursor stays on the rejected phase so `resume` re-runs it.
        state.current_phase = Some(phase);
        self.persist()
    }

    /// Abort the run, cancelling in-flight agents. Artifacts and logs stay.
    pub fn abort_run(&mut self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.deny("abort", status));
        }
        self.cancel.cancel();
        if let Some(log) = self.run_log() {
            log.append(RunRecord::Abort)?;
        }
        let state = self.state.as_mut().expect("non-terminal implies state");
        state.set_status(RunStatus::Aborted);
        self.persist()
    }

    /// Return an aborted or revision-bound run to `Running`.
    pub fn resume_run(&mut self) -> Result<()> {
        let status = self.status();
        if !matches!(status, RunStatus::Aborted | RunStatus::NeedsRevision) {
            return Err(self.deny("resume", status));
        }
        // A cancelled token stays cancelled; the resumed run needs its own.
        self.cancel = CancellationToken::new();
        let phase = self
            .state
            .as_ref()
            .and_then(|s| s.current_phase.clone());
        if let Some(log) = self.run_log() {
            log.append(RunRecord::Resume { phase })?;
        }
        let state = self.state.as_mut().expect("checked");
        state.set_status(RunStatus::Running);
        self.persist()
    }

    /// Admin-only unchecked cursor move. Emits a warning record.
    pub fn jump_to_phase(&mut self, phase: &str) -> Result<()> {
        let status = self.status();
        if status != RunStatus::Running {
            return Err(self.deny("jump", status));
        }
        let state = self.state.as_ref().expect("running implies state");
        let profile = self.workflows.profile(&state.profile)?;
        let target = profile.phase(phase)?.name.clone();
        let from = state.current_phase.clone();

        tracing::warn!(from = ?from, to = %target, "unchecked phase jump");
        if let Some(log) = self.run_log() {
            log.append(RunRecord::Jump {
                from,
                to: target.clone(),
            })?;
        }
        let state = self.state.as_mut().expect("checked");
        state.current_phase = Some(target);
        state.touch();
        self.persist()
    }

    /// Non-destructive rollback: advisory document, cursor reset, completed
    /// list truncated to phases declared before the target. No artifact is
    /// touched.
    pub fn rollback_to_phase(&mut self, phase: &str) -> Result<std::path::PathBuf> {
        let state = self.require_state("rollback")?;
        let profile = self.workflows.profile(&state.profile)?;
        let target = profile.phase(phase)?.name.clone();
        let target_idx = profile.phase_index(&target).expect("phase resolved");
        let keep: Vec<String> = state
            .completed_phases
            .iter()
            .filter(|p| profile.phase_index(p).map(|i| i < target_idx).unwrap_or(false))
            .cloned()
            .collect();
        let from = state.current_phase.clone();

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let advisory_path = self.paths.conductor_dir.join(format!("ROLLBACK_{stamp}.md"));
        let mut body = String::from("# Rollback Advisory\n\n");
        body.push_str(&format!("**Run:** {}\n", state.run_id));
        body.push_str(&format!(
            "**From phase:** {}\n",
            from.as_deref().unwrap_or("-")
        ));
        body.push_str(&format!("**To phase:** {target}\n\n"));
        body.push_str("## Completed phases before rollback\n\n");
        for p in &state.completed_phases {
            body.push_str(&format!("- {p}\n"));
        }
        body.push_str(
            "\nThis rollback is non-destructive: no artifacts were deleted and no\nversion-control operations were performed. Review later-phase artifacts\nmanually, then run `conductor next`.\n",
        );
        std::fs::write(&advisory_path, body).map_err(|e| ConductorError::PersistFailed {
            what: "rollback advisory",
            path: advisory_path.clone(),
            source: e,
        })?;

        if let Some(log) = self.run_log() {
            log.append(RunRecord::Rollback {
                from,
                to: target.clone(),
            })?;
        }

        let state = self.state.as_mut().expect("checked");
        state.completed_phases = keep;
        state.current_phase = Some(target);
        // A completed run gets a live cursor again; other statuses keep
        // their own resume paths.
        if state.status == RunStatus::Completed {
            state.set_status(RunStatus::Running);
        }
        state.touch();
        self.persist()?;
        Ok(advisory_path)
    }

    /// Re-execute a phase without moving the cursor. Outcomes are appended
    /// to the log and metrics like any other execution.
    pub async fn replay_phase(
        &mut self,
        phase: &str,
        overrides: ExecOverrides,
    ) -> Result<PhaseOutcome> {
        self.run_phase_inner(phase, None, overrides).await
    }

    /// Retry a failed phase, or one named agent inside it.
    pub async fn retry(
        &mut self,
        phase: &str,
        agent: Option<&str>,
        overrides: ExecOverrides,
    ) -> Result<PhaseOutcome> {
        self.run_phase_inner(phase, agent, overrides).await
    }

    async fn run_phase_inner(
        &mut self,
        phase: &str,
        only_agent: Option<&str>,
        overrides: ExecOverrides,
    ) -> Result<PhaseOutcome> {
        let state = self.require_state("replay")?;
        let profile = self.workflows.profile(&state.profile)?.clone();
        let mut phase_config = profile.phase(phase)?.clone();
        if let Some(agent) = only_agent {
            if !phase_config.agents.iter().any(|a| a == agent) {
                return Err(ConductorError::UnknownAgent(agent.to_string()));
            }
            phase_config.agents = vec![agent.to_string()];
        }
        let log = self.run_log().expect("state implies run id");

        let outcome = if phase_config.agents.iter().any(|a| a == hygiene::HYGIENE_AGENT) {
            self.run_hygiene_phase(&phase_config, &log)?
        } else {
            let executor = self.executor();
            executor
                .execute_phase(&profile, &phase_config, overrides, &log)
                .await?
        };

        self.absorb_outcome(phase, &outcome)?;
        self.persist()?;
        Ok(outcome)
    }

    /// Revalidate the current phase's artifacts without re-running agents,
    /// and advance when the verdict (or the operator) allows it.
    pub fn checkpoint(&mut self, force: bool, confirm_partial: bool) -> Result<CheckpointOutcome> {
        let status = self.status();
        if status != RunStatus::Running {
            return Err(self.deny("checkpoint", status));
        }
        let state = self.state.as_ref().expect("running implies state");
        let phase_name = state
            .current_phase
            .clone()
            .ok_or_else(|| ConductorError::Config("running with no current phase".into()))?;
        let profile = self.workflows.profile(&state.profile)?;
        let phase = profile.phase(&phase_name)?;
        let patterns = profile.checkpoint_patterns(phase);

        if patterns.is_empty() {
            self.commit_and_advance(&phase_name)?;
            self.persist()?;
            return Ok(self.advanced_outcome(None));
        }

        let report = validate_and_report(
            &patterns,
            &self.paths.project_root,
            &phase_name,
            &self.paths.validation_dir,
        )?;

        {
            let state = self.state.as_mut().expect("checked");
            let phase_state = state.phase_state_mut(&phase_name);
            phase_state.validation = Some(report.status);
            phase_state.artifact_paths = report.found.clone();
            state.touch();
        }

        match report.status {
            ValidationVerdict::Fail if !force => {
                let state = self.state.as_mut().expect("checked");
                state.phase_state_mut(&phase_name).status = PhaseStatus::Failed;
                self.persist()?;
                Ok(CheckpointOutcome::Blocked { report })
            }
            ValidationVerdict::Partial if !(force || confirm_partial) => {
                self.persist()?;
                Ok(CheckpointOutcome::NeedsConfirmation { report })
            }
            _ => {
                self.commit_and_advance(&phase_name)?;
                self.persist()?;
                Ok(self.advanced_outcome(Some(report)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Read-only surface
    // ------------------------------------------------------------------

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let checkpoints = self
            .state
            .as_ref()
            .map(|s| {
                s.phases
                    .iter()
                    .filter_map(|(name, ps)| ps.validation.map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let (score, grade) = self
            .read_hygiene_summary()
            .map(|(s, g)| (Some(s), Some(g)))
            .unwrap_or((None, None));

        StatusSnapshot {
            status: self.status(),
            run_id: self.state.as_ref().map(|s| s.run_id.clone()),
            profile: self.state.as_ref().map(|s| s.profile.clone()),
            current_phase: self.state.as_ref().and_then(|s| s.current_phase.clone()),
            completed_phases: self
                .state
                .as_ref()
                .map(|s| s.completed_phases.clone())
                .unwrap_or_default(),
            awaiting_consensus: self
                .state
                .as_ref()
                .map(|s| s.awaiting_consensus)
                .unwrap_or(false),
            consensus_phase: self.state.as_ref().and_then(|s| s.consensus_phase.clone()),
            checkpoints,
            cleanliness_score: score,
            cleanliness_grade: grade,
        }
    }

    pub fn log_tail(&self, lines: usize) -> Result<Vec<String>> {
        match self.run_log() {
            Some(log) => log.tail(lines),
            None => Ok(Vec::new()),
        }
    }

    pub fn metrics_document(&self) -> Result<Option<RunMetrics>> {
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };
        let recorder = MetricsRecorder::new(self.paths.metrics_file(&state.run_id));
        Ok(Some(recorder.load_or_new(&state.run_id, &state.profile)?))
    }

    /// Run the hygiene subsystem directly (outside any phase).
    pub fn run_hygiene(&self, config: &HygieneConfig, apply: bool) -> Result<hygiene::HygieneReport> {
        let report = hygiene::run_scan(&self.paths.project_root, config, apply)?;
        // Feed the metrics recorder when a run is active.
        if let Some(state) = self.state.as_ref() {
            let recorder = MetricsRecorder::new(self.paths.metrics_file(&state.run_id));
            let mut metrics = recorder.load_or_new(&state.run_id, &state.profile)?;
            metrics.record_cleanliness(report.score.score, &report.score.grade);
            recorder.save(&metrics)?;
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn executor(&self) -> PhaseExecutor {
        let state = self.state.as_ref().expect("caller checked state");
        PhaseExecutor {
            project_root: self.paths.project_root.clone(),
            validation_dir: self.paths.validation_dir.clone(),
            in_session_dir: self.paths.in_session_dir.clone(),
            run_id: state.run_id.clone(),
            settings: self.workflows.settings.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn run_hygiene_phase(&mut self, phase: &PhaseConfig, log: &RunLog) -> Result<PhaseOutcome> {
        let started = Instant::now();
        log.append(RunRecord::PhaseStart {
            phase: phase.name.clone(),
        })?;

        let config = HygieneConfig::load_or_default(&self.paths.hygiene_file)?;
        let report = hygiene::run_scan(&self.paths.project_root, &config, false)?;
        let success = report.passes_gate(&config);

        if let Some(state) = self.state.as_ref() {
            let recorder = MetricsRecorder::new(self.paths.metrics_file(&state.run_id));
            let mut metrics = recorder.load_or_new(&state.run_id, &state.profile)?;
            metrics.record_cleanliness(report.score.score, &report.score.grade);
            recorder.save(&metrics)?;
        }

        log.append(RunRecord::PhaseEnd {
            phase: phase.name.clone(),
            success,
        })?;

        Ok(PhaseOutcome {
            phase_name: phase.name.clone(),
            agent_outcomes: Vec::new(),
            validation: None,
            awaiting_consensus: false,
            in_session: false,
            success,
            duration_s: started.elapsed().as_secs_f64(),
        })
    }

    /// Fold an execution outcome into phase state and metrics.
    fn absorb_outcome(&mut self, phase_name: &str, outcome: &PhaseOutcome) -> Result<()> {
        let run_id;
        let profile_name;
        {
            let state = self.state.as_mut().expect("caller checked state");
            run_id = state.run_id.clone();
            profile_name = state.profile.clone();
            let phase_state = state.phase_state_mut(phase_name);
            phase_state.agent_outcomes = outcome.agent_outcomes.clone();
            phase_state.validation = outcome.verdict();
            if let Some(ref validation) = outcome.validation {
                phase_state.artifact_paths = validation.found.clone();
            }
            if !outcome.in_session {
                phase_state.status = if outcome.success {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Failed
                };
                phase_state.completed_at = Some(Utc::now());
            }
            state.touch();
        }

        let recorder = MetricsRecorder::new(self.paths.metrics_file(&run_id));
        let mut metrics = recorder.load_or_new(&run_id, &profile_name)?;
        metrics.record_phase(
            phase_name,
            outcome.duration_s,
            outcome.success,
            &outcome.agent_outcomes,
        );
        recorder.save(&metrics)
    }

    /// Commit a phase to the completed list and move the cursor (or finish
    /// the run when it was the last declared phase).
    fn commit_and_advance(&mut self, phase_name: &str) -> Result<()> {
        let state = self.state.as_mut().expect("caller checked state");
        state.mark_phase_completed(phase_name);
        self.advance_cursor(phase_name)
    }

    /// Move the cursor past `phase_name` without committing it.
    fn advance_cursor(&mut self, phase_name: &str) -> Result<()> {
        let state = self.state.as_ref().expect("caller checked state");
        let profile = self.workflows.profile(&state.profile)?;
        let next = profile.phase_after(phase_name).map(|p| p.name.clone());
        let state = self.state.as_mut().expect("checked");
        match next {
            Some(next_phase) => {
                state.current_phase = Some(next_phase);
                if state.status != RunStatus::Running {
                    state.set_status(RunStatus::Running);
                }
            }
            None => {
                state.current_phase = None;
                state.set_status(RunStatus::Completed);
            }
        }
        Ok(())
    }

    fn advanced_outcome(&self, report: Option<ValidationReport>) -> CheckpointOutcome {
        let state = self.state.as_ref().expect("caller checked state");
        CheckpointOutcome::Advanced {
            report,
            run_completed: state.status == RunStatus::Completed,
            next_phase: state.current_phase.clone(),
        }
    }

    fn require_state(&self, operation: &str) -> Result<&RunState> {
        self.state.as_ref().ok_or_else(|| ConductorError::InvalidState {
            operation: operation.to_string(),
            status: RunStatus::Idle.to_string(),
        })
    }

    fn run_log(&self) -> Option<RunLog> {
        self.state
            .as_ref()
            .map(|s| RunLog::new(self.paths.run_log_file(&s.run_id)))
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.as_ref().expect("persist requires state");
        self.store.save(state)
    }

    /// Record a denial in the run log and build the typed error. No state
    /// changes.
    fn deny(&self, operation: &str, status: RunStatus) -> ConductorError {
        if let Some(log) = self.run_log() {
            let _ = log.append(RunRecord::Denied {
                operation: operation.to_string(),
                reason: format!("status is {status}"),
            });
        }
        ConductorError::InvalidState {
            operation: operation.to_string(),
            status: status.to_string(),
        }
    }

    fn read_hygiene_summary(&self) -> Option<(f64, String)> {
        let path = self.paths.reports_dir.join("hygiene_summary.json");
        let content = std::fs::read_to_string(path).ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        let score = value.get("cleanliness_score")?.as_f64()?;
        let grade = value.get("grade")?.as_str()?.to_string();
        Some((score, grade))
    }
}

/// Read run metadata out of an intake YAML document. Recognizes
/// `project.name` / `project.client` (or the same keys at top level) and
/// keeps a short excerpt of the raw text.
fn load_intake(path: &Path) -> Result<RunMetadata> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConductorError::Config(format!("cannot read intake {}: {e}", path.display())))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| ConductorError::Config(format!("invalid intake {}: {e}", path.display())))?;

    let lookup = |key: &str| -> Option<String> {
        value
            .get("project")
            .and_then(|p| p.get(key))
            .or_else(|| value.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let excerpt: String = raw.chars().take(400).collect();
    Ok(RunMetadata {
        project_name: lookup("name"),
        client: lookup("client"),
        intake: Some(excerpt),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const WORKFLOWS: &str = r#"
profiles:
  default:
    workflow:
      phases:
        a:
          agents: [touch_a]
        b:
          agents: [touch_b]
        c:
          agents: [touch_c]
    subagents:
      touch_a:
        command: ["sh", "-c", "mkdir -p artifacts/a && echo done > artifacts/a/out.md"]
        checkpoint_artifacts: ["artifacts/a/out.md"]
      touch_b:
        command: ["sh", "-c", "mkdir -p artifacts/b && echo done > artifacts/b/out.md"]
        checkpoint_artifacts: ["artifacts/b/out.md"]
      touch_c:
        command: ["sh", "-c", "mkdir -p artifacts/c && echo done > artifacts/c/out.md"]
        checkpoint_artifacts: ["artifacts/c/out.md"]
settings:
  max_parallel_agents: 2
  grace_period_secs: 1
"#;

    fn project(workflows: &str) -> TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        std::fs::write(dir.path().join(".conductor/workflows.yaml"), workflows).unwrap();
        dir
    }

    fn open(dir: &TempDir) -> Orchestrator {
        Orchestrator::open(dir.path()).unwrap()
    }

    #[tokio::test]
    async fn linear_run_completes_through_all_phases() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();
        assert_eq!(orch.status(), RunStatus::Running);

        for expected in [RunStatus::Running, RunStatus::Running, RunStatus::Completed] {
            let outcome = orch.next_phase(ExecOverrides::default()).await.unwrap();
            assert!(outcome.success);
            assert_eq!(orch.status(), expected);
        }

        let state = orch.state().unwrap();
        assert_eq!(state.completed_phases, vec!["a", "b", "c"]);
        assert!(state.current_phase.is_none());
    }

    #[tokio::test]
    async fn start_is_rejected_while_running() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();

        let err = orch.start_run("default", None, None).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidState { .. }));
        // The denial left a record but changed nothing.
        assert_eq!(orch.status(), RunStatus::Running);
        let tail = orch.log_tail(10).unwrap();
        assert!(tail.iter().any(|l| l.contains("denied")));
    }

    #[tokio::test]
    async fn wrong_state_operations_are_denied_without_side_effects() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);

        // Idle rejects everything but start.
        assert!(orch.approve_consensus().is_err());
        assert!(orch.reject_consensus("no").is_err());
        assert!(orch.abort_run().is_err());
        assert!(orch.resume_run().is_err());
        assert_eq!(orch.status(), RunStatus::Idle);

        orch.start_run("default", None, None).unwrap();
        // Running rejects consensus decisions and resume.
        assert!(orch.approve_consensus().is_err());
        assert!(orch.reject_consensus("no").is_err());
        assert!(orch.resume_run().is_err());
        assert_eq!(orch.status(), RunStatus::Running);
    }

    #[tokio::test]
    async fn start_from_phase_skips_earlier_phases() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, Some("b")).unwrap();
        assert_eq!(orch.state().unwrap().current_phase.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn start_from_unknown_phase_is_rejected() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        let err = orch.start_run("default", None, Some("zzz")).unwrap_err();
        assert!(matches!(err, ConductorError::UnknownPhase(_)));
        assert_eq!(orch.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn abort_and_resume_round_trip() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();
        orch.next_phase(ExecOverrides::default()).await.unwrap();

        orch.abort_run().unwrap();
        assert_eq!(orch.status(), RunStatus::Aborted);
        // Aborting again is a violation.
        assert!(orch.abort_run().is_err());

        orch.resume_run().unwrap();
        assert_eq!(orch.status(), RunStatus::Running);
        assert_eq!(orch.state().unwrap().current_phase.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = project(WORKFLOWS);
        {
            let mut orch = open(&dir);
            orch.start_run("default", None, None).unwrap();
            orch.next_phase(ExecOverrides::default()).await.unwrap();
        }

        let orch = open(&dir);
        assert_eq!(orch.status(), RunStatus::Running);
        let state = orch.state().unwrap();
        assert_eq!(state.completed_phases, vec!["a"]);
        assert_eq!(state.current_phase.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn rollback_truncates_completed_and_keeps_artifacts() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();
        for _ in 0..3 {
            orch.next_phase(ExecOverrides::default()).await.unwrap();
        }
        assert_eq!(orch.state().unwrap().completed_phases, vec!["a", "b", "c"]);

        let advisory = orch.rollback_to_phase("b").unwrap();
        let state = orch.state().unwrap();
        assert_eq!(state.current_phase.as_deref(), Some("b"));
        assert_eq!(state.completed_phases, vec!["a"]);
        assert!(advisory.exists());
        // Artifacts from later phases were preserved.
        assert!(dir.path().join("artifacts/c/out.md").exists());
    }

    #[tokio::test]
    async fn rollback_from_completed_returns_to_running() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();
        for _ in 0..3 {
            orch.next_phase(ExecOverrides::default()).await.unwrap();
        }
        assert_eq!(orch.status(), RunStatus::Completed);

        orch.rollback_to_phase("c").unwrap();
        assert_eq!(orch.status(), RunStatus::Running);
        assert_eq!(orch.state().unwrap().current_phase.as_deref(), Some("c"));
        assert_eq!(orch.state().unwrap().completed_phases, vec!["a", "b"]);

        orch.next_phase(ExecOverrides::default()).await.unwrap();
        assert_eq!(orch.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn replay_does_not_move_the_cursor() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();
        orch.next_phase(ExecOverrides::default()).await.unwrap();
        let cursor_before = orch.state().unwrap().current_phase.clone();

        let outcome = orch
            .replay_phase("a", ExecOverrides::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(orch.state().unwrap().current_phase, cursor_before);
        assert_eq!(orch.state().unwrap().completed_phases, vec!["a"]);
    }

    #[tokio::test]
    async fn jump_requires_running_and_moves_cursor() {
        let dir = project(WORKFLOWS);
        let mut orch = open(&dir);
        assert!(orch.jump_to_phase("b").is_err());

        orch.start_run("default", None, None).unwrap();
        orch.jump_to_phase("c").unwrap();
        assert_eq!(orch.state().unwrap().current_phase.as_deref(), Some("c"));
        let tail = orch.log_tail(10).unwrap();
        assert!(tail.iter().any(|l| l.contains("\"event\":\"jump\"")));
    }

    #[tokio::test]
    async fn intake_metadata_is_captured() {
        let dir = project(WORKFLOWS);
        let intake = dir.path().join("intake.yaml");
        std::fs::write(
            &intake,
            "project:\n  name: Atlas Rebuild\n  client: acme\ngoals:\n  - ship\n",
        )
        .unwrap();

        let mut orch = open(&dir);
        orch.start_run("default", Some(&intake), None).unwrap();
        let metadata = &orch.state().unwrap().metadata;
        assert_eq!(metadata.project_name.as_deref(), Some("Atlas Rebuild"));
        assert_eq!(metadata.client.as_deref(), Some("acme"));
        assert!(metadata.intake.as_deref().unwrap().contains("ship"));
    }

    #[tokio::test]
    async fn failed_optional_phase_is_skipped_not_completed() {
        let workflows = r#"
profiles:
  default:
    workflow:
      phases:
        lint:
          required: false
          agents: [linter]
        ship:
          agents: [shipper]
    subagents:
      linter:
        command: ["sh", "-c", "exit 1"]
      shipper:
        command: ["sh", "-c", "true"]
"#;
        let dir = project(workflows);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();

        let outcome = orch.next_phase(ExecOverrides::default()).await.unwrap();
        assert!(!outcome.success);
        // The optional phase was skipped: cursor advanced, nothing committed.
        let state = orch.state().unwrap();
        assert_eq!(state.current_phase.as_deref(), Some("ship"));
        assert!(state.completed_phases.is_empty());
        assert_eq!(
            state.phase_state("lint").unwrap().status,
            crate::state::PhaseStatus::Skipped
        );

        orch.next_phase(ExecOverrides::default()).await.unwrap();
        assert_eq!(orch.status(), RunStatus::Completed);
        assert_eq!(orch.state().unwrap().completed_phases, vec!["ship"]);
    }

    #[tokio::test]
    async fn failed_required_phase_holds_the_cursor() {
        let workflows = r#"
profiles:
  default:
    workflow:
      phases:
        build:
          agents: [builder]
        after:
          agents: [noop]
    subagents:
      builder:
        command: ["sh", "-c", "exit 1"]
      noop:
        command: ["sh", "-c", "true"]
"#;
        let dir = project(workflows);
        let mut orch = open(&dir);
        orch.start_run("default", None, None).unwrap();

        let outcome = orch.next_phase(ExecOverrides::default()).await.unwrap();
        assert!(!outcome.success);
        // The run does not auto-abort; the operator decides what to do next.
        assert_eq!(orch.status(), RunStatus::Running);
        assert_eq!(orch.state().unwrap().current_phase.as_deref(), Some("build"));
        assert!(orch.state().unwrap().completed_phases.is_empty());
        assert_eq!(
            orch.state().unwrap().phase_state("build").unwrap().status,
            crate::state::PhaseStatus::Failed
        );
    }

    #[tokio::test]
    async fn second_process_cannot_take_the_lock() {
        let dir = project(WORKFLOWS);
        let _first = open(&dir);
        let second = Orchestrator::open(dir.path());
        assert!(matches!(second, Err(ConductorError::RunLocked { .. })));
    }
}
