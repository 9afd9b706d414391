//! Operator consensus gate.
//!
//! The gate holds no state beyond documents on disk: a `REQUEST.md` written
//! when a consensus-gated phase completes, and an append-only
//! `decisions.ndjson` retaining every approval and rejection over the life of
//! the run, across revision cycles.

use crate::checkpoint::ValidationReport;
use crate::errors::{ConductorError, Result};
use crate::state::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// One line of `decisions.ndjson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub phase: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct ConsensusGate {
    consensus_dir: PathBuf,
}

impl ConsensusGate {
    pub fn new(consensus_dir: PathBuf) -> Self {
        Self { consensus_dir }
    }

    pub fn request_path(&self) -> PathBuf {
        self.consensus_dir.join("REQUEST.md")
    }

    fn decisions_path(&self) -> PathBuf {
        self.consensus_dir.join("decisions.ndjson")
    }

    /// Write the consensus request document for a completed phase.
    pub fn request(
        &self,
        state: &RunState,
        phase: &str,
        validation: Option<&ValidationReport>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.consensus_dir).map_err(|e| {
            ConductorError::PersistFailed {
                what: "consensus request",
                path: self.consensus_dir.clone(),
                source: e,
            }
        })?;

        let mut body = String::new();
        body.push_str("# Consensus Request\n\n");
        body.push_str(&format!("**Run:** {}\n", state.run_id));
        body.push_str(&format!("**Phase:** {phase}\n"));
        body.push_str(&format!("**Requested:** {}\n\n", Utc::now().to_rfc3339()));

        if let Some(phase_state) = state.phase_state(phase) {
            if !phase_state.artifact_paths.is_empty() {
                body.push_str("## Artifacts Produced\n\n");
                for artifact in &phase_state.artifact_paths {
                    body.push_str(&format!("- `{artifact}`\n"));
                }
                body.push('\n');
            }
        }

        if let Some(report) = validation {
            body.push_str("## Validation\n\n");
            body.push_str(&format!("Status: **{}**\n\n", report.status));
            for missing in &report.missing {
                body.push_str(&format!("- missing: `{missing}`\n"));
            }
            if !report.missing.is_empty() {
                body.push('\n');
            }
        }

        body.push_str("## Decide\n\n");
        body.push_str("- `conductor approve` to accept this phase and continue\n");
        body.push_str("- `conductor reject --reason \"...\"` to send it back for revision\n");

        let path = self.request_path();
        std::fs::write(&path, body).map_err(|e| ConductorError::PersistFailed {
            what: "consensus request",
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// Record an approval: archive the request and append a decision record.
    pub fn approve(&self, run_id: &str, phase: &str) -> Result<()> {
        self.archive_request()?;
        self.append_decision(DecisionRecord {
            ts: Utc::now(),
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            decision: Decision::Approved,
            reason: None,
        })
    }

    /// Record a rejection with the operator's reason.
    pub fn reject(&self, run_id: &str, phase: &str, reason: &str) -> Result<()> {
        self.archive_request()?;
        self.append_decision(DecisionRecord {
            ts: Utc::now(),
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            decision: Decision::Rejected,
            reason: Some(reason.to_string()),
        })
    }

    /// All decisions recorded so far, oldest first.
    pub fn decisions(&self) -> Result<Vec<DecisionRecord>> {
        let path = self.decisions_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConductorError::StateReadFailed { path, source: e });
            }
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn archive_request(&self) -> Result<()> {
        let request = self.request_path();
        if !request.exists() {
            return Ok(());
        }
        let archive_dir = self.consensus_dir.join("archive");
        std::fs::create_dir_all(&archive_dir).map_err(|e| ConductorError::PersistFailed {
            what: "consensus archive",
            path: archive_dir.clone(),
            source: e,
        })?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let target = archive_dir.join(format!("REQUEST_{stamp}.md"));
        std::fs::rename(&request, &target).map_err(|e| ConductorError::PersistFailed {
            what: "consensus archive",
            path: target,
            source: e,
        })
    }

    fn append_decision(&self, record: DecisionRecord) -> Result<()> {
        let path = self.decisions_path();
        let mut line =
            serde_json::to_string(&record).map_err(|e| ConductorError::PersistFailed {
                what: "consensus decision",
                path: path.clone(),
                source: std::io::Error::other(e),
            })?;
        line.push('\n');
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| ConductorError::PersistFailed {
                what: "consensus decision",
                path,
                source: e,
            })
    }
}

/// Summarize decision history for a phase, most recent last.
pub fn decisions_for_phase<'a>(
    decisions: &'a [DecisionRecord],
    phase: &str,
) -> Vec<&'a DecisionRecord> {
    decisions.iter().filter(|d| d.phase == phase).collect()
}
