//! Repository hygiene and cleanliness scoring.
//!
//! Invokable directly (`conductor hygiene`) and as the named workflow phase
//! `repo-hygiene`. Scanners run in sequence (large files, orphans, dead
//! code, notebooks, secrets), each writing its own report under `reports/`;
//! the aggregate step computes the cleanliness score and the PR plan.

pub mod config;
pub mod dead_code;
pub mod notebooks;
pub mod report;
pub mod scanner;
pub mod score;
pub mod secrets;

pub use config::HygieneConfig;
pub use report::{ApplySafety, HygieneFindings};
pub use score::CleanlinessScore;

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Agent name that routes a workflow phase into this subsystem.
pub const HYGIENE_AGENT: &str = "repo-hygiene";

/// Aggregate result of one hygiene run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneReport {
    pub orphans: usize,
    pub large_files: usize,
    pub whitelisted_large_files: usize,
    pub dead_functions: usize,
    pub dead_types: usize,
    pub dead_imports: usize,
    pub notebooks_with_outputs: usize,
    pub notebooks_needing_cleanup: usize,
    pub notebooks_cleared: usize,
    pub secret_findings: usize,
    pub score: CleanlinessScore,
    pub apply_requested: bool,
    pub apply_blocked: bool,
    pub files_removed: Vec<String>,
}

impl HygieneReport {
    /// Whether this run passes the configured quality gate.
    pub fn passes_gate(&self, config: &HygieneConfig) -> bool {
        self.score.score >= config.quality.min_cleanliness_score
    }
}

/// Run every scanner, aggregate, and (optionally) apply cleanup.
///
/// Apply mode clears notebook outputs and removes orphaned and oversized
/// files, but only when the safety thresholds allow it; a blocked apply
/// removes nothing and stamps the PR plan instead.
pub fn run_scan(root: &Path, config: &HygieneConfig, apply: bool) -> Result<HygieneReport> {
    let large_files = scanner::scan_large_files(root, config)?;
    let orphans = scanner::scan_orphans(root, config)?;
    let dead_code = dead_code::analyze_dead_code(root, config)?;
    let notebook_findings = notebooks::check_notebooks(root, config, apply)?;
    let secret_findings = secrets::scan_secrets(root, config)?;

    let findings = HygieneFindings {
        large_files,
        orphans,
        dead_code,
        notebooks: notebook_findings,
        secrets: secret_findings,
    };

    let (score, safety) = report::aggregate_reports(root, &findings, config)?;

    let mut files_removed = Vec::new();
    let apply_blocked = apply && !safety.is_safe;
    if apply && safety.is_safe {
        files_removed = report::apply_cleanup(root, &findings, config)?;
    }

    let whitelisted_large = findings.large_files.iter().filter(|f| f.whitelisted).count();
    Ok(HygieneReport {
        orphans: findings.orphans.len(),
        large_files: findings.large_files.len() - whitelisted_large,
        whitelisted_large_files: whitelisted_large,
        dead_functions: findings.dead_code.functions.len(),
        dead_types: findings.dead_code.types.len(),
        dead_imports: findings.dead_code.imports.len(),
        notebooks_with_outputs: findings.notebooks.len(),
        notebooks_needing_cleanup: notebooks::needs_cleanup(&findings.notebooks),
        notebooks_cleared: findings.notebooks.iter().filter(|f| f.cleared).count(),
        secret_findings: findings.secrets.len(),
        score,
        apply_requested: apply,
        apply_blocked,
        files_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clean_repository_scores_perfect() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();

        let report = run_scan(dir.path(), &HygieneConfig::default(), false).unwrap();
        assert_eq!(report.score.score, 100.0);
        assert_eq!(report.score.grade, "A+");
        assert!(report.passes_gate(&HygieneConfig::default()));
        assert!(!report.apply_blocked);
    }

    #[test]
    fn dry_run_never_removes_files() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.orphan_detection.min_age_days = 0;

        std::fs::write(dir.path().join("stale.csv"), "a,b\n").unwrap();
        let report = run_scan(dir.path(), &config, false).unwrap();

        assert!(report.orphans >= 1);
        assert!(report.files_removed.is_empty());
        assert!(dir.path().join("stale.csv").exists());
    }

    #[test]
    fn blocked_apply_removes_nothing() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.orphan_detection.min_age_days = 0;
        config.safety.max_apply_deletions = 0;

        std::fs::write(dir.path().join("stale.csv"), "a,b\n").unwrap();
        let report = run_scan(dir.path(), &config, true).unwrap();

        assert!(report.apply_blocked);
        assert!(report.files_removed.is_empty());
        assert!(dir.path().join("stale.csv").exists());
        let plan = std::fs::read_to_string(dir.path().join("reports/PR_PLAN.md")).unwrap();
        assert!(plan.contains("APPLY BLOCKED"));
    }

    #[test]
    fn safe_apply_removes_orphans() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.orphan_detection.min_age_days = 0;

        std::fs::write(dir.path().join("stale.csv"), "a,b\n").unwrap();
        let report = run_scan(dir.path(), &config, true).unwrap();

        assert!(!report.apply_blocked);
        assert!(report.files_removed.contains(&"stale.csv".to_string()));
        assert!(!dir.path().join("stale.csv").exists());
    }

    #[test]
    fn scan_writes_every_report() {
        let dir = tempdir().unwrap();
        run_scan(dir.path(), &HygieneConfig::default(), false).unwrap();

        for report in [
            "reports/large_files.csv",
            "reports/orphans.csv",
            "reports/dead_code.md",
            "reports/notebook_sanitizer.md",
            "reports/secrets.md",
            "reports/hygiene_summary.json",
            "reports/repo_hygiene_report.md",
            "reports/PR_PLAN.md",
        ] {
            assert!(dir.path().join(report).exists(), "missing {report}");
        }
    }
}
