//! Per-run metrics document.
//!
//! One JSON document per run accumulates phase durations, per-agent retry
//! counts and last exit codes, an opaque token-usage bag, and the most recent
//! cleanliness snapshot. Other keys are permitted and preserved through the
//! `extra` map. A Prometheus text rendering is written alongside for
//! scrape-style consumers.

use crate::errors::{ConductorError, Result};
use crate::state::AgentOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_name: String,
    pub duration_s: f64,
    pub retry_count: u32,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub duration_s: f64,
    pub success: bool,
    #[serde(default)]
    pub agents: Vec<AgentMetrics>,
}

/// Snapshot of the latest hygiene score attached to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanlinessSnapshot {
    pub score: f64,
    pub grade: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseMetrics>,
    /// Opaque token-usage counters keyed by agent or model name.
    #[serde(default)]
    pub tokens: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanliness: Option<CleanlinessSnapshot>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RunMetrics {
    pub fn new(run_id: &str, profile: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            profile: profile.to_string(),
            started_at: now,
            updated_at: now,
            phases: BTreeMap::new(),
            tokens: BTreeMap::new(),
            cleanliness: None,
            extra: BTreeMap::new(),
        }
    }

    /// Record (or overwrite, on replay) a phase's metrics from its outcomes.
    pub fn record_phase(&mut self, phase: &str, duration_s: f64, success: bool, outcomes: &[AgentOutcome]) {
        let agents = outcomes
            .iter()
            .map(|o| AgentMetrics {
                agent_name: o.agent_name.clone(),
                duration_s: o.duration_s(),
                retry_count: o.retry_count,
                exit_code: o.exit_code,
            })
            .collect();
        self.phases.insert(
            phase.to_string(),
            PhaseMetrics {
                duration_s,
                success,
                agents,
            },
        );
        self.updated_at = Utc::now();
    }

    pub fn record_cleanliness(&mut self, score: f64, grade: &str) {
        self.cleanliness = Some(CleanlinessSnapshot {
            score,
            grade: grade.to_string(),
            recorded_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn add_tokens(&mut self, key: &str, count: u64) {
        *self.tokens.entry(key.to_string()).or_insert(0) += count;
        self.updated_at = Utc::now();
    }

    /// Prometheus text exposition of the headline numbers.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# TYPE conductor_phase_duration_seconds gauge\n");
        for (phase, metrics) in &self.phases {
            out.push_str(&format!(
                "conductor_phase_duration_seconds{{run=\"{}\",phase=\"{}\"}} {:.3}\n",
                self.run_id, phase, metrics.duration_s
            ));
        }
        out.push_str("# TYPE conductor_agent_retries_total counter\n");
        for (phase, metrics) in &self.phases {
            for agent in &metrics.agents {
                out.push_str(&format!(
                    "conductor_agent_retries_total{{run=\"{}\",phase=\"{}\",agent=\"{}\"}} {}\n",
                    self.run_id, phase, agent.agent_name, agent.retry_count
                ));
            }
        }
        if let Some(ref snapshot) = self.cleanliness {
            out.push_str("# TYPE conductor_cleanliness_score gauge\n");
            out.push_str(&format!(
                "conductor_cleanliness_score{{run=\"{}\"}} {:.1}\n",
                self.run_id, snapshot.score
            ));
        }
        out
    }
}

/// Loads, mutates, and persists the metrics document for a run.
pub struct MetricsRecorder {
    path: PathBuf,
    prom_path: PathBuf,
}

impl MetricsRecorder {
    pub fn new(path: PathBuf) -> Self {
        let prom_path = path
            .parent()
            .map(|p| p.join("metrics.prom"))
            .unwrap_or_else(|| PathBuf::from("metrics.prom"));
        Self { path, prom_path }
    }

    pub fn load_or_new(&self, run_id: &str, profile: &str) -> Result<RunMetrics> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let metrics: RunMetrics =
                    serde_json::from_str(&content).map_err(|e| ConductorError::StateCorrupt {
                        path: self.path.clone(),
                        source: e,
                    })?;
                Ok(metrics)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(RunMetrics::new(run_id, profile))
            }
            Err(e) => Err(ConductorError::StateReadFailed {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    pub fn save(&self, metrics: &RunMetrics) -> Result<()> {
        let json = serde_json::to_string_pretty(metrics).map_err(|e| {
            ConductorError::PersistFailed {
                what: "metrics document",
                path: self.path.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        std::fs::write(&self.path, json).map_err(|e| ConductorError::PersistFailed {
            what: "metrics document",
            path: self.path.clone(),
            source: e,
        })?;
        std::fs::write(&self.prom_path, metrics.to_prometheus()).map_err(|e| {
            ConductorError::PersistFailed {
                what: "metrics document",
                path: self.prom_path.clone(),
                source: e,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn outcome(agent: &str, exit_code: i32, retries: u32) -> AgentOutcome {
        let now = Utc::now();
        AgentOutcome {
            agent_name: agent.into(),
            success: exit_code == 0,
            exit_code,
            started_at: now,
            finished_at: now,
            retry_count: retries,
            notes: String::new(),
        }
    }

    #[test]
    fn record_phase_captures_agent_details() {
        let mut metrics = RunMetrics::new("r1", "default");
        metrics.record_phase(
            "build",
            12.5,
            true,
            &[outcome("builder", 0, 1), outcome("tester", 0, 0)],
        );

        let phase = &metrics.phases["build"];
        assert!(phase.success);
        assert_eq!(phase.agents.len(), 2);
        assert_eq!(phase.agents[0].retry_count, 1);
        assert_eq!(phase.agents[1].exit_code, 0);
    }

    #[test]
    fn replay_overwrites_phase_entry() {
        let mut metrics = RunMetrics::new("r1", "default");
        metrics.record_phase("qa", 5.0, false, &[outcome("tester", 1, 2)]);
        metrics.record_phase("qa", 3.0, true, &[outcome("tester", 0, 0)]);

        let phase = &metrics.phases["qa"];
        assert!(phase.success);
        assert_eq!(phase.agents[0].exit_code, 0);
        assert_eq!(metrics.phases.len(), 1);
    }

    #[test]
    fn recorder_round_trips_document() {
        let dir = tempdir().unwrap();
        let recorder = MetricsRecorder::new(dir.path().join("run-r1.json"));

        let mut metrics = recorder.load_or_new("r1", "default").unwrap();
        metrics.record_phase("plan", 1.0, true, &[outcome("planner", 0, 0)]);
        metrics.add_tokens("planner", 1200);
        metrics.record_cleanliness(96.0, "A+");
        recorder.save(&metrics).unwrap();

        let loaded = recorder.load_or_new("r1", "default").unwrap();
        assert_eq!(loaded.phases.len(), 1);
        assert_eq!(loaded.tokens["planner"], 1200);
        assert_eq!(loaded.cleanliness.as_ref().unwrap().grade, "A+");
    }

    #[test]
    fn prometheus_rendering_includes_each_series() {
        let mut metrics = RunMetrics::new("r1", "default");
        metrics.record_phase("plan", 2.0, true, &[outcome("planner", 0, 3)]);
        metrics.record_cleanliness(88.5, "B+");

        let prom = metrics.to_prometheus();
        assert!(prom.contains("conductor_phase_duration_seconds{run=\"r1\",phase=\"plan\"} 2.000"));
        assert!(
            prom.contains("conductor_agent_retries_total{run=\"r1\",phase=\"plan\",agent=\"planner\"} 3")
        );
        assert!(prom.contains("conductor_cleanliness_score{run=\"r1\"} 88.5"));
    }

    #[test]
    fn extra_keys_survive_round_trip() {
        let dir = tempdir().unwrap();
        let recorder = MetricsRecorder::new(dir.path().join("run-r1.json"));

        let mut metrics = RunMetrics::new("r1", "default");
        metrics
            .extra
            .insert("custom_counter".into(), serde_json::json!(42));
        recorder.save(&metrics).unwrap();

        let loaded = recorder.load_or_new("r1", "default").unwrap();
        assert_eq!(loaded.extra["custom_counter"], serde_json::json!(42));
    }
}
