//! Typed error hierarchy for the Conductor orchestrator.
//!
//! Every user-visible failure maps onto one of four kinds:
//! - `Agent`: transient agent failures (non-zero exit, timeout)
//! - `Validation`: checkpoint verdicts of `Partial` or `Fail`
//! - `StateViolation`: operation issued in the wrong state
//! - `Persistence`: state document or log writes failed (fatal)
//!
//! Configuration problems are reported as `Config`; they are a form of
//! state violation for classification purposes.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a failure, per the error-handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient agent error; recovered locally via the retry policy.
    Agent,
    /// Checkpoint validation did not pass.
    Validation,
    /// Operation issued in the wrong run state, or against an unknown name.
    StateViolation,
    /// State document or run log could not be written. Fatal.
    Persistence,
}

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("agent '{agent}' failed after {attempts} attempt(s): {reason}")]
    AgentFailed {
        agent: String,
        attempts: u32,
        reason: String,
    },

    #[error("agent '{agent}' timed out after {timeout_secs}s")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    #[error("agent '{agent}' was cancelled")]
    AgentCancelled { agent: String },

    #[error("validation for phase '{phase}' is {verdict}: {missing} pattern(s) unmatched")]
    ValidationFailed {
        phase: String,
        verdict: String,
        missing: usize,
    },

    #[error("cannot {operation} while run status is '{status}'")]
    InvalidState { operation: String, status: String },

    #[error("phase '{0}' is not declared in the workflow")]
    UnknownPhase(String),

    #[error("agent '{0}' is not declared in the agent registry")]
    UnknownAgent(String),

    #[error("workflow profile '{0}' not found")]
    UnknownProfile(String),

    #[error("invalid artifact pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to write {what} at {path}: {source}")]
    PersistFailed {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read state document at {path}: {source}")]
    StateReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state document at {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another orchestrator process owns this run (lock held at {path})")]
    RunLocked { path: PathBuf },

    #[error("failed to spawn agent '{agent}': {source}")]
    SpawnFailed {
        agent: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConductorError {
    /// Classify this error into one of the four policy kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentFailed { .. } | Self::AgentTimeout { .. } | Self::AgentCancelled { .. } => {
                ErrorKind::Agent
            }
            Self::SpawnFailed { .. } => ErrorKind::Agent,
            Self::ValidationFailed { .. } => ErrorKind::Validation,
            Self::InvalidState { .. }
            | Self::UnknownPhase(_)
            | Self::UnknownAgent(_)
            | Self::UnknownProfile(_)
            | Self::InvalidPattern { .. }
            | Self::Config(_) => ErrorKind::StateViolation,
            Self::PersistFailed { .. }
            | Self::StateReadFailed { .. }
            | Self::StateCorrupt { .. }
            | Self::RunLocked { .. } => ErrorKind::Persistence,
        }
    }

    /// Whether the orchestrator process should exit after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Persistence
    }
}

pub type Result<T, E = ConductorError> = std::result::Result<T, E>;
