//! Report aggregation and the apply safety gate.
//!
//! Produces the machine-readable `hygiene_summary.json`, the executive
//! `repo_hygiene_report.md`, and the actionable `PR_PLAN.md`. When cleanup
//! would exceed the configured safety caps, apply mode is blocked: the PR
//! plan is stamped `APPLY BLOCKED` and nothing is removed.

use super::config::HygieneConfig;
use super::dead_code::DeadCodeResults;
use super::notebooks::{self, NotebookFinding};
use super::scanner::{LargeFileFinding, OrphanFinding, write_report};
use super::score::{CleanlinessScore, ComponentStats, compute_cleanliness_score};
use super::secrets::SecretFinding;
use crate::errors::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the scanners found, aggregated for scoring and reporting.
#[derive(Debug, Clone)]
pub struct HygieneFindings {
    pub large_files: Vec<LargeFileFinding>,
    pub orphans: Vec<OrphanFinding>,
    pub dead_code: DeadCodeResults,
    pub notebooks: Vec<NotebookFinding>,
    pub secrets: Vec<SecretFinding>,
}

impl HygieneFindings {
    pub fn non_whitelisted_large_files(&self) -> Vec<&LargeFileFinding> {
        self.large_files.iter().filter(|f| !f.whitelisted).collect()
    }

    pub fn component_stats(&self) -> ComponentStats {
        ComponentStats {
            orphans: self.orphans.len(),
            large_files: self.non_whitelisted_large_files().len(),
            dead_functions: self.dead_code.functions.len(),
            dead_types: self.dead_code.types.len(),
            dead_imports: self.dead_code.imports.len(),
            notebooks_needing_cleanup: notebooks::needs_cleanup(&self.notebooks),
            secret_findings: self.secrets.len(),
        }
    }
}

/// Verdict of the apply safety check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySafety {
    pub is_safe: bool,
    pub deletions: usize,
    pub bytes_to_remove: u64,
    pub blocked_reasons: Vec<String>,
}

/// Deletions = orphans plus non-whitelisted large files. Exceeding either
/// cap blocks apply entirely.
pub fn check_apply_safety(findings: &HygieneFindings, config: &HygieneConfig) -> ApplySafety {
    let large = findings.non_whitelisted_large_files();
    let deletions = findings.orphans.len() + large.len();
    let bytes_to_remove: u64 = findings.orphans.iter().map(|o| o.size_bytes).sum::<u64>()
        + large
            .iter()
            .map(|f| (f.size_mb * 1024.0 * 1024.0) as u64)
            .sum::<u64>();

    let mut blocked_reasons = Vec::new();
    if deletions > config.safety.max_apply_deletions {
        blocked_reasons.push(format!(
            "too many deletions: {deletions} > {} max",
            config.safety.max_apply_deletions
        ));
    }
    if bytes_to_remove > config.safety.max_apply_bytes_removed {
        blocked_reasons.push(format!(
            "too much data to remove: {:.1}MB > {:.1}MB max",
            bytes_to_remove as f64 / (1024.0 * 1024.0),
            config.safety.max_apply_bytes_removed as f64 / (1024.0 * 1024.0)
        ));
    }

    ApplySafety {
        is_safe: blocked_reasons.is_empty(),
        deletions,
        bytes_to_remove,
        blocked_reasons,
    }
}

/// Remove orphans and non-whitelisted large files. Callers must have passed
/// the safety check; this function re-checks and refuses otherwise.
pub fn apply_cleanup(
    root: &Path,
    findings: &HygieneFindings,
    config: &HygieneConfig,
) -> Result<Vec<String>> {
    let safety = check_apply_safety(findings, config);
    if !safety.is_safe {
        return Err(ConductorError::Config(format!(
            "apply blocked: {}",
            safety.blocked_reasons.join("; ")
        )));
    }

    let mut removed = Vec::new();
    for orphan in &findings.orphans {
        let path = root.join(&orphan.path);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| ConductorError::PersistFailed {
                what: "cleanup",
                path,
                source: e,
            })?;
            removed.push(orphan.path.clone());
        }
    }
    for large in findings.non_whitelisted_large_files() {
        let path = root.join(&large.path);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| ConductorError::PersistFailed {
                what: "cleanup",
                path,
                source: e,
            })?;
            removed.push(large.path.clone());
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneSummary {
    pub cleanliness_score: f64,
    pub grade: String,
    pub stats: SummaryStats,
    pub thresholds: SummaryThresholds,
    pub quality_gates: QualityGates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStats {
    pub orphans: usize,
    pub large_files: usize,
    pub dead_code_functions: usize,
    pub dead_code_types: usize,
    pub dead_code_imports: usize,
    pub notebooks_needing_cleanup: usize,
    pub secrets_findings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryThresholds {
    pub max_orphans_warn: usize,
    pub max_orphans_block: usize,
    pub min_cleanliness_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGates {
    pub orphans_warn: bool,
    pub orphans_block: bool,
    pub score_pass: bool,
}

/// Score the findings and write all three aggregate documents.
pub fn aggregate_reports(
    root: &Path,
    findings: &HygieneFindings,
    config: &HygieneConfig,
) -> Result<(CleanlinessScore, ApplySafety)> {
    let stats = findings.component_stats();
    let score = compute_cleanliness_score(stats, &config.quality.score_weights);
    let safety = check_apply_safety(findings, config);

    let summary = HygieneSummary {
        cleanliness_score: score.score,
        grade: score.grade.clone(),
        stats: SummaryStats {
            orphans: stats.orphans,
            large_files: stats.large_files,
            dead_code_functions: stats.dead_functions,
            dead_code_types: stats.dead_types,
            dead_code_imports: stats.dead_imports,
            notebooks_needing_cleanup: stats.notebooks_needing_cleanup,
            secrets_findings: stats.secret_findings,
        },
        thresholds: SummaryThresholds {
            max_orphans_warn: config.quality.max_orphans_warn,
            max_orphans_block: config.quality.max_orphans_block,
            min_cleanliness_score: config.quality.min_cleanliness_score,
        },
        quality_gates: QualityGates {
            orphans_warn: stats.orphans >= config.quality.max_orphans_warn,
            orphans_block: stats.orphans >= config.quality.max_orphans_block,
            score_pass: score.score >= config.quality.min_cleanliness_score,
        },
    };

    let summary_json = serde_json::to_string_pretty(&summary).map_err(|e| {
        ConductorError::PersistFailed {
            what: "hygiene report",
            path: root.join("reports/hygiene_summary.json"),
            source: std::io::Error::other(e),
        }
    })?;
    write_report(&root.join("reports/hygiene_summary.json"), &summary_json)?;
    write_report(
        &root.join("reports/repo_hygiene_report.md"),
        &render_hygiene_report(findings, &score),
    )?;
    write_report(
        &root.join("reports/PR_PLAN.md"),
        &render_pr_plan(findings, &safety),
    )?;

    Ok((score, safety))
}

fn render_hygiene_report(findings: &HygieneFindings, score: &CleanlinessScore) -> String {
    let stats = findings.component_stats();
    let mut out = String::from("# Repository Hygiene Report\n\n");

    out.push_str("## Cleanliness Score\n\n");
    out.push_str(&format!(
        "**Score:** {}/100 (Grade: {})\n\n**Breakdown:**\n",
        score.score, score.grade
    ));
    out.push_str(&format!("- Orphans: {}/100\n", score.breakdown.orphans));
    out.push_str(&format!(
        "- Large Files: {}/100\n",
        score.breakdown.large_files
    ));
    out.push_str(&format!("- Dead Code: {}/100\n", score.breakdown.dead_code));
    out.push_str(&format!("- Notebooks: {}/100\n", score.breakdown.notebooks));
    out.push_str(&format!("- Secrets: {}/100\n\n", score.breakdown.secrets));

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- **Orphaned files**: {}\n", stats.orphans));
    out.push_str(&format!(
        "- **Large binaries**: {} (plus {} whitelisted)\n",
        stats.large_files,
        findings.large_files.len() - stats.large_files
    ));
    out.push_str(&format!(
        "- **Dead code**: {} functions, {} types, {} imports\n",
        stats.dead_functions, stats.dead_types, stats.dead_imports
    ));
    out.push_str(&format!(
        "- **Notebooks needing cleanup**: {}\n",
        stats.notebooks_needing_cleanup
    ));
    out.push_str(&format!("- **Secret findings**: {}\n\n", stats.secret_findings));

    out.push_str("## Detailed Reports\n\n");
    out.push_str("- [Large Files](large_files.csv)\n");
    out.push_str("- [Orphaned Files](orphans.csv)\n");
    out.push_str("- [Dead Code Analysis](dead_code.md)\n");
    out.push_str("- [Notebook Hygiene](notebook_sanitizer.md)\n");
    out.push_str("- [Secret Scan](secrets.md)\n");
    out.push_str("- [Cleanup Plan](PR_PLAN.md)\n");
    out
}

fn render_pr_plan(findings: &HygieneFindings, safety: &ApplySafety) -> String {
    let mut out = String::from("# Cleanup Plan for Approval\n\n");

    if !safety.is_safe {
        out.push_str("## APPLY BLOCKED - Safety Thresholds Exceeded\n\n");
        out.push_str("This cleanup cannot be applied automatically:\n\n");
        for reason in &safety.blocked_reasons {
            out.push_str(&format!("- {reason}\n"));
        }
        out.push_str(
            "\n**Action required:** split the cleanup into smaller batches or raise the caps in `.conductor/hygiene.yaml`.\n\n---\n\n",
        );
    }

    let mut action = 1;
    if !findings.orphans.is_empty() {
        out.push_str("## Safe Actions (Low Risk)\n\n");
        for orphan in findings.orphans.iter().take(10) {
            out.push_str(&format!(
                "- [ ] **{action}.** Remove orphaned file `{}` (last modified {}, no references)\n",
                orphan.path, orphan.last_modified
            ));
            action += 1;
        }
        if findings.orphans.len() > 10 {
            out.push_str(&format!(
                "\n... and {} more (see [orphans.csv](orphans.csv))\n",
                findings.orphans.len() - 10
            ));
        }
        out.push('\n');
    }

    let large = findings.non_whitelisted_large_files();
    if !large.is_empty() {
        out.push_str("## Needs Review (Medium Risk)\n\n");
        for file in large.iter().take(5) {
            out.push_str(&format!(
                "- [ ] **{action}.** Delete large binary `{}` ({} MB, not whitelisted)\n",
                file.path, file.size_mb
            ));
            action += 1;
        }
        if large.len() > 5 {
            out.push_str(&format!(
                "\n... and {} more (see [large_files.csv](large_files.csv))\n",
                large.len() - 5
            ));
        }
        out.push('\n');
    }

    let dead_total = findings.dead_code.functions.len()
        + findings.dead_code.types.len()
        + findings.dead_code.imports.len();
    if dead_total > 0 {
        out.push_str("## Informational (Manual Review)\n\n");
        out.push_str(&format!(
            "- [ ] **{action}.** Review {dead_total} dead-code findings in [dead_code.md](dead_code.md)\n\n"
        ));
    }

    if action == 1 && dead_total == 0 {
        out.push_str("## No Actions Required\n\nRepository hygiene is excellent.\n");
    }
    out
}
