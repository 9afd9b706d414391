//! Checkpoint artifact validation.
//!
//! A checkpoint pattern is either a shell-style glob rooted at the project
//! root, or `re:<regex>` treated as an anchored regular expression on the
//! relative path. Both forms are case-sensitive. Matching walks the project
//! tree in lexicographic order and never follows symbolic links, so the same
//! inputs always produce the same report.

use crate::errors::{ConductorError, Result};
use crate::state::ValidationVerdict;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A compiled checkpoint pattern.
#[derive(Debug, Clone)]
pub enum ArtifactPattern {
    Glob { raw: String, pattern: glob::Pattern },
    Regex { raw: String, regex: regex::Regex },
}

impl ArtifactPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix("re:") {
            let anchored = format!("^(?:{expr})$");
            let regex = regex::Regex::new(&anchored).map_err(|e| {
                ConductorError::InvalidPattern {
                    pattern: raw.to_string(),
                    message: e.to_string(),
                }
            })?;
            Ok(Self::Regex {
                raw: raw.to_string(),
                regex,
            })
        } else {
            let pattern =
                glob::Pattern::new(raw).map_err(|e| ConductorError::InvalidPattern {
                    pattern: raw.to_string(),
                    message: e.to_string(),
                })?;
            Ok(Self::Glob {
                raw: raw.to_string(),
                pattern,
            })
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            Self::Glob { raw, .. } | Self::Regex { raw, .. } => raw,
        }
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        match self {
            Self::Glob { pattern, .. } => pattern.matches_with(
                rel_path,
                glob::MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            ),
            Self::Regex { regex, .. } => regex.is_match(rel_path),
        }
    }
}

/// Outcome of validating one phase's required patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: ValidationVerdict,
    pub required: Vec<String>,
    pub found: Vec<String>,
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.status == ValidationVerdict::Pass
    }
}

/// List every regular file under `root` as a relative path, lexicographically
/// sorted. Symlinks are not followed; `.git` and `.conductor` are skipped.
fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.depth() > 0 && (name == ".git" || name == ".conductor"))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort_unstable();
    files
}

/// Validate `required` patterns against the project root. Every pattern ends
/// up in exactly one of `found` (via at least one matching file) or
/// `missing`.
pub fn validate_artifacts(required: &[String], project_root: &Path) -> Result<ValidationReport> {
    let patterns: Vec<ArtifactPattern> = required
        .iter()
        .map(|raw| ArtifactPattern::parse(raw))
        .collect::<Result<_>>()?;

    let files = list_files(project_root);

    let mut found: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();

    for pattern in &patterns {
        let mut matched = false;
        for file in &files {
            if pattern.matches(file) {
                matched = true;
                if !found.contains(file) {
                    found.push(file.clone());
                }
            }
        }
        if !matched {
            missing.push(pattern.raw().to_string());
        }
    }

    let status = if missing.is_empty() {
        ValidationVerdict::Pass
    } else if missing.len() == required.len() {
        ValidationVerdict::Fail
    } else {
        ValidationVerdict::Partial
    };

    Ok(ValidationReport {
        status,
        required: required.to_vec(),
        found,
        missing,
        report_path: None,
    })
}

/// Validate and write a report document under `validation_dir`. Reports are
/// named per phase and timestamp so replays accumulate instead of
/// overwriting; the body itself is deterministic for identical inputs.
pub fn validate_and_report(
    required: &[String],
    project_root: &Path,
    phase: &str,
    validation_dir: &Path,
) -> Result<ValidationReport> {
    let mut report = validate_artifacts(required, project_root)?;

    std::fs::create_dir_all(validation_dir).map_err(|e| ConductorError::PersistFailed {
        what: "validation report",
        path: validation_dir.to_path_buf(),
        source: e,
    })?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let mut path = validation_dir.join(format!("{phase}_{stamp}.md"));
    let mut counter = 1;
    while path.exists() {
        counter += 1;
        path = validation_dir.join(format!("{phase}_{stamp}_{counter}.md"));
    }

    std::fs::write(&path, render_report(phase, &report)).map_err(|e| {
        ConductorError::PersistFailed {
            what: "validation report",
            path: path.clone(),
            source: e,
        }
    })?;

    report.report_path = Some(path);
    Ok(report)
}

fn render_report(phase: &str, report: &ValidationReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Checkpoint Validation: {phase}\n\n"));
    out.push_str(&format!("**Status:** {}\n\n", report.status));
    out.push_str(&format!(
        "- Required patterns: {}\n- Found files: {}\n- Missing patterns: {}\n\n",
        report.required.len(),
        report.found.len(),
        report.missing.len()
    ));
    if !report.found.is_empty() {
        out.push_str("## Found\n\n");
        for file in &report.found {
            out.push_str(&format!("- `{file}`\n"));
        }
        out.push('\n');
    }
    if !report.missing.is_empty() {
        out.push_str("## Missing\n\n");
        for pattern in &report.missing {
            out.push_str(&format!("- `{pattern}`\n"));
        }
        out.push('\n');
    }
    out
}
