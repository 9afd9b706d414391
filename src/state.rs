//! Durable run state.
//!
//! The state document is a single JSON record holding the full `RunState`.
//! It is rewritten atomically (write-temp-then-rename in the same directory)
//! on every mutation, so a reader never observes a partially updated object.
//! Reading the document alone is sufficient to resume a run after a restart.

use crate::errors::{ConductorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

/// Lifecycle status of a run. Exactly one variant at a time; only `Running`
/// permits phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    AwaitingConsensus,
    NeedsRevision,
    Aborted,
    Completed,
}

impl RunStatus {
    /// States from which a fresh run may be started.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Aborted)
    }

    /// Terminal states cannot be aborted again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Aborted | Self::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingConsensus => "awaiting_consensus",
            Self::NeedsRevision => "needs_revision",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Per-phase execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one agent invocation, including its retry series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_name: String,
    pub success: bool,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub notes: String,
}

impl AgentOutcome {
    /// Exit code 2 is reserved for in-session suspension.
    pub fn is_in_session(&self) -> bool {
        self.exit_code == 2
    }

    pub fn duration_s(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Checkpoint verdict recorded on the phase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Pass,
    Partial,
    Fail,
}

impl std::fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Partial => write!(f, "partial"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Per-run, per-phase bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    #[serde(default)]
    pub agent_outcomes: Vec<AgentOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationVerdict>,
}

/// Small metadata bag attached to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake: Option<String>,
}

/// The full durable state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub profile: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub metadata: RunMetadata,
    #[serde(default)]
    pub awaiting_consensus: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: String, profile: String, first_phase: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            profile,
            status: RunStatus::Running,
            current_phase: Some(first_phase),
            completed_phases: Vec::new(),
            phases: BTreeMap::new(),
            metadata: RunMetadata::default(),
            awaiting_consensus: false,
            consensus_phase: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status, keeping `awaiting_consensus` in lockstep.
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.awaiting_consensus = status == RunStatus::AwaitingConsensus;
        if !self.awaiting_consensus {
            self.consensus_phase = None;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_phase_completed(&mut self, phase: &str) {
        if !self.completed_phases.iter().any(|p| p == phase) {
            self.completed_phases.push(phase.to_string());
        }
        let entry = self.phases.entry(phase.to_string()).or_default();
        entry.status = PhaseStatus::Completed;
        entry.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn phase_state(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    pub fn phase_state_mut(&mut self, phase: &str) -> &mut PhaseState {
        self.phases.entry(phase.to_string()).or_default()
    }
}

/// Atomic persistence for the state document.
pub struct StateStore {
    state_file: PathBuf,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &PathBuf {
        &self.state_file
    }

    /// Load the state document, or None when no run has ever been persisted
    /// (the orchestrator is then `Idle`). A corrupt document is an error, not
    /// a silent reset.
    pub fn load(&self) -> Result<Option<RunState>> {
        let content = match std::fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConductorError::StateReadFailed {
                    path: self.state_file.clone(),
                    source: e,
                });
            }
        };
        let state = serde_json::from_str(&content).map_err(|e| ConductorError::StateCorrupt {
            path: self.state_file.clone(),
            source: e,
        })?;
        Ok(Some(state))
    }

    /// Write the state document atomically: serialize to a temp file in the
    /// same directory, fsync, then rename over the live document.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).map_err(|e| {
            ConductorError::PersistFailed {
                what: "state document",
                path: self.state_file.clone(),
                source: std::io::Error::other(e),
            }
        })?;

        let tmp_path = self.state_file.with_extension("json.tmp");
        let persist_err = |source: std::io::Error| ConductorError::PersistFailed {
            what: "state document",
            path: self.state_file.clone(),
            source,
        };

        let mut tmp = std::fs::File::create(&tmp_path).map_err(&persist_err)?;
        tmp.write_all(json.as_bytes()).map_err(&persist_err)?;
        tmp.sync_all().map_err(&persist_err)?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.state_file).map_err(&persist_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> RunState {
        let mut state = RunState::new("r1".into(), "default".into(), "planning".into());
        state.metadata.project_name = Some("demo".into());
        let ps = state.phase_state_mut("planning");
        ps.status = PhaseStatus::InProgress;
        ps.started_at = Some(Utc::now());
        ps.agent_outcomes.push(AgentOutcome {
            agent_name: "planner".into(),
            success: true,
            exit_code: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            retry_count: 1,
            notes: "ok".into(),
        });
        state
    }

    #[test]
    fn round_trip_is_deep_equal() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("run.json"));

        let state = sample_state();
        store.save(&state).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.profile, state.profile);
        assert_eq!(loaded.status, state.status);
        assert_eq!(loaded.current_phase, state.current_phase);
        assert_eq!(loaded.completed_phases, state.completed_phases);
        assert_eq!(loaded.metadata, state.metadata);
        assert_eq!(loaded.created_at, state.created_at);
        assert_eq!(loaded.updated_at, state.updated_at);
        let lp = loaded.phase_state("planning").unwrap();
        let sp = state.phase_state("planning").unwrap();
        assert_eq!(lp.status, sp.status);
        assert_eq!(lp.agent_outcomes, sp.agent_outcomes);
    }

    #[test]
    fn missing_file_means_idle() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("run.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn truncated_file_never_yields_partial_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        let store = StateStore::new(path.clone());
        store.save(&sample_state()).unwrap();

        let full = std::fs::read(&path).unwrap();
        for cut in [0, 1, full.len() / 2, full.len() - 1] {
            std::fs::write(&path, &full[..cut]).unwrap();
            match store.load() {
                // A prefix either fails to parse...
                Err(ConductorError::StateCorrupt { .. }) => {}
                // ...or (empty file edge) reads as absent. Never a partial
                // object: a successful parse implies the full document.
                Ok(Some(state)) => assert_eq!(state.run_id, "r1"),
                Ok(None) => panic!("file exists; must not read as absent"),
                Err(e) => panic!("unexpected error kind: {e}"),
            }
        }
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("run.json"));
        store.save(&sample_state()).unwrap();
        assert!(!dir.path().join("run.json.tmp").exists());
    }

    #[test]
    fn set_status_keeps_consensus_flag_in_lockstep() {
        let mut state = sample_state();
        state.consensus_phase = Some("planning".into());
        state.set_status(RunStatus::AwaitingConsensus);
        assert!(state.awaiting_consensus);

        state.set_status(RunStatus::Running);
        assert!(!state.awaiting_consensus);
        assert!(state.consensus_phase.is_none());
    }

    #[test]
    fn mark_phase_completed_never_duplicates() {
        let mut state = sample_state();
        state.mark_phase_completed("planning");
        state.mark_phase_completed("planning");
        assert_eq!(state.completed_phases, vec!["planning".to_string()]);
        assert_eq!(
            state.phase_state("planning").unwrap().status,
            PhaseStatus::Completed
        );
    }

    #[test]
    fn status_predicates() {
        assert!(RunStatus::Idle.can_start());
        assert!(RunStatus::Completed.can_start());
        assert!(RunStatus::Aborted.can_start());
        assert!(!RunStatus::Running.can_start());
        assert!(!RunStatus::AwaitingConsensus.can_start());
        assert!(!RunStatus::NeedsRevision.can_start());

        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::NeedsRevision.is_terminal());
    }

    #[test]
    fn in_session_detected_by_exit_code() {
        let outcome = AgentOutcome {
            agent_name: "writer".into(),
            success: false,
            exit_code: 2,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            retry_count: 0,
            notes: String::new(),
        };
        assert!(outcome.is_in_session());
    }
}
