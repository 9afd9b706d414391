//! Runtime path layout for the orchestrator.
//!
//! Everything the orchestrator owns lives under `.conductor/` in the project
//! root; hygiene reports land in `reports/` so they are visible next to the
//! code they describe.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved filesystem layout for one project.
#[derive(Debug, Clone)]
pub struct Paths {
    pub project_root: PathBuf,
    pub conductor_dir: PathBuf,
    pub workflows_file: PathBuf,
    pub hygiene_file: PathBuf,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub consensus_dir: PathBuf,
    pub validation_dir: PathBuf,
    pub in_session_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl Paths {
    pub fn new(project_root: impl AsRef<Path>) -> Result<Self> {
        let project_root = project_root
            .as_ref()
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_root.join(".conductor");

        Ok(Self {
            workflows_file: conductor_dir.join("workflows.yaml"),
            hygiene_file: conductor_dir.join("hygiene.yaml"),
            state_dir: conductor_dir.join("state"),
            state_file: conductor_dir.join("state/run.json"),
            lock_file: conductor_dir.join("state/.lock"),
            log_dir: conductor_dir.join("log"),
            metrics_dir: conductor_dir.join("metrics"),
            consensus_dir: conductor_dir.join("consensus"),
            validation_dir: conductor_dir.join("validation"),
            in_session_dir: conductor_dir.join("in-session"),
            reports_dir: project_root.join("reports"),
            artifacts_dir: project_root.join("artifacts"),
            conductor_dir,
            project_root,
        })
    }

    /// Create every directory the orchestrator writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.log_dir,
            &self.metrics_dir,
            &self.consensus_dir,
            &self.consensus_dir.join("archive"),
            &self.validation_dir,
            &self.in_session_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Path of the run log for a given run id.
    pub fn run_log_file(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("run-{run_id}.ndjson"))
    }

    /// Path of the metrics document for a given run id.
    pub fn metrics_file(&self, run_id: &str) -> PathBuf {
        self.metrics_dir.join(format!("run-{run_id}.json"))
    }

    /// Whether the project has been initialized for conductor.
    pub fn is_initialized(&self) -> bool {
        self.workflows_file.exists()
    }
}
