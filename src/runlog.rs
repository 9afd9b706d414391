//! Append-only run log.
//!
//! One NDJSON record per line, each tagged with an event name and an
//! embedded UTC timestamp. The log is the authoritative audit trail; the
//! state document is a convenience snapshot. Append order matches wall-clock
//! order within a single process; consumers ordering across restarts must use
//! the `ts` field.

use crate::errors::{ConductorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Tagged log record payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunRecord {
    PhaseStart {
        phase: String,
    },
    PhaseEnd {
        phase: String,
        success: bool,
    },
    AgentStart {
        phase: String,
        agent: String,
        attempt: u32,
    },
    AgentEnd {
        phase: String,
        agent: String,
        exit_code: i32,
        success: bool,
        retry_count: u32,
    },
    Retry {
        phase: String,
        agent: String,
        attempt: u32,
        delay_ms: u64,
    },
    ConsensusRequested {
        phase: String,
    },
    ConsensusApproved {
        phase: String,
    },
    ConsensusRejected {
        phase: String,
        reason: String,
    },
    Rollback {
        from: Option<String>,
        to: String,
    },
    Jump {
        from: Option<String>,
        to: String,
    },
    Abort,
    Resume {
        phase: Option<String>,
    },
    /// An operation was refused in the current state. Nothing else changed.
    Denied {
        operation: String,
        reason: String,
    },
}

/// A record as it appears on disk: timestamp envelope plus tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub record: RunRecord,
}

/// Writer/reader for one run's log file.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a record. The whole line is written with a single `write_all`
    /// so records stay atomic at NDJSON granularity.
    pub fn append(&self, record: RunRecord) -> Result<()> {
        let entry = LogEntry {
            ts: Utc::now(),
            record,
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| {
            ConductorError::PersistFailed {
                what: "run log",
                path: self.path.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        line.push('\n');

        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| ConductorError::PersistFailed {
                what: "run log",
                path: self.path.clone(),
                source: e,
            })
    }

    /// Last `lines` raw records, oldest first.
    pub fn tail(&self, lines: usize) -> Result<Vec<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConductorError::StateReadFailed {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| s.to_string()).collect())
    }

    /// Parse every record in append order, skipping unparseable lines.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self
            .tail(usize::MAX)?
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
