//! Hygiene scanner configuration.
//!
//! Loaded from `.conductor/hygiene.yaml` when present; every field has a
//! default so an absent or partial file works. Serde fills missing fields,
//! so a user file only needs the keys it overrides.

use crate::errors::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneConfig {
    /// Threshold above which a binary file counts as "large", in MB.
    #[serde(default = "default_large_file_mb")]
    pub large_file_mb: f64,
    /// Extensions considered binary for the large-file scan.
    #[serde(default = "default_binary_exts")]
    pub binary_exts: Vec<String>,
    /// Glob patterns exempt from every scan.
    #[serde(default = "default_whitelist_globs")]
    pub whitelist_globs: Vec<String>,
    #[serde(default)]
    pub dead_code: DeadCodeConfig,
    #[serde(default)]
    pub orphan_detection: OrphanConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub quality: QualityConfig,
}

fn default_large_file_mb() -> f64 {
    1.0
}

fn default_binary_exts() -> Vec<String> {
    [".png", ".jpg", ".jpeg", ".gif", ".pdf", ".zip", ".tar", ".gz", ".parquet", ".bin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_whitelist_globs() -> Vec<String> {
    ["data/external/**", "docs/**", ".github/**", "models/**", "data/processed/**"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            large_file_mb: default_large_file_mb(),
            binary_exts: default_binary_exts(),
            whitelist_globs: default_whitelist_globs(),
            dead_code: DeadCodeConfig::default(),
            orphan_detection: OrphanConfig::default(),
            safety: SafetyConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl HygieneConfig {
    /// Load from a YAML file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content)
                .map_err(|e| ConductorError::Config(format!("invalid hygiene config: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConductorError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadCodeConfig {
    /// Relative-path regexes to skip entirely (tests, generated code).
    #[serde(default = "default_dead_code_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// Item names never reported, no matter how unused they look.
    #[serde(default = "default_dead_code_exclude_names")]
    pub exclude_names: Vec<String>,
    /// File basenames whose unused imports are ignored (re-export hubs).
    #[serde(default = "default_ignore_unused_imports")]
    pub ignore_unused_imports: Vec<String>,
}

fn default_dead_code_exclude_patterns() -> Vec<String> {
    vec!["^tests/".to_string(), "_test\\.rs$".to_string()]
}

fn default_dead_code_exclude_names() -> Vec<String> {
    vec!["main".to_string(), "new".to_string(), "default".to_string()]
}

fn default_ignore_unused_imports() -> Vec<String> {
    vec!["lib.rs".to_string(), "mod.rs".to_string()]
}

impl Default for DeadCodeConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_dead_code_exclude_patterns(),
            exclude_names: default_dead_code_exclude_names(),
            ignore_unused_imports: default_ignore_unused_imports(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanConfig {
    /// Files younger than this never count as orphans.
    #[serde(default = "default_min_age_days")]
    pub min_age_days: i64,
    /// Extensions of files searched for references.
    #[serde(default = "default_reference_extensions")]
    pub reference_extensions: Vec<String>,
    /// Name fragments that protect a file from orphan reporting.
    #[serde(default = "default_protected_patterns")]
    pub protected_patterns: Vec<String>,
}

fn default_min_age_days() -> i64 {
    30
}

fn default_reference_extensions() -> Vec<String> {
    [".rs", ".md", ".yaml", ".yml", ".toml", ".json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_protected_patterns() -> Vec<String> {
    ["example", "template", "fixture", "sample"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            min_age_days: default_min_age_days(),
            reference_extensions: default_reference_extensions(),
            protected_patterns: default_protected_patterns(),
        }
    }
}

/// Caps on destructive cleanup; exceeding either blocks `--apply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_apply_deletions")]
    pub max_apply_deletions: usize,
    #[serde(default = "default_max_apply_bytes_removed")]
    pub max_apply_bytes_removed: u64,
}

fn default_max_apply_deletions() -> usize {
    50
}

fn default_max_apply_bytes_removed() -> u64 {
    10 * 1024 * 1024
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_apply_deletions: default_max_apply_deletions(),
            max_apply_bytes_removed: default_max_apply_bytes_removed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_max_orphans_warn")]
    pub max_orphans_warn: usize,
    #[serde(default = "default_max_orphans_block")]
    pub max_orphans_block: usize,
    #[serde(default = "default_min_cleanliness_score")]
    pub min_cleanliness_score: f64,
    #[serde(default)]
    pub score_weights: ScoreWeights,
}

fn default_max_orphans_warn() -> usize {
    10
}

fn default_max_orphans_block() -> usize {
    50
}

fn default_min_cleanliness_score() -> f64 {
    85.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_orphans_warn: default_max_orphans_warn(),
            max_orphans_block: default_max_orphans_block(),
            min_cleanliness_score: default_min_cleanliness_score(),
            score_weights: ScoreWeights::default(),
        }
    }
}

/// Component weights for the cleanliness score; sum to 100 by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_orphans")]
    pub no_orphans: f64,
    #[serde(default = "default_weight_large_files")]
    pub no_large_files: f64,
    #[serde(default = "default_weight_dead_code")]
    pub no_dead_code: f64,
    #[serde(default = "default_weight_notebooks")]
    pub no_notebook_outputs: f64,
    #[serde(default = "default_weight_secrets")]
    pub no_secrets: f64,
}

fn default_weight_orphans() -> f64 {
    30.0
}

fn default_weight_large_files() -> f64 {
    25.0
}

fn default_weight_dead_code() -> f64 {
    20.0
}

fn default_weight_notebooks() -> f64 {
    15.0
}

fn default_weight_secrets() -> f64 {
    10.0
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            no_orphans: default_weight_orphans(),
            no_large_files: default_weight_large_files(),
            no_dead_code: default_weight_dead_code(),
            no_notebook_outputs: default_weight_notebooks(),
            no_secrets: default_weight_secrets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = HygieneConfig::default();
        assert_eq!(config.large_file_mb, 1.0);
        assert!(config.binary_exts.contains(&".png".to_string()));
        assert_eq!(config.orphan_detection.min_age_days, 30);
        assert_eq!(config.safety.max_apply_deletions, 50);
        assert_eq!(config.quality.score_weights.no_orphans, 30.0);
        let w = &config.quality.score_weights;
        assert_eq!(
            w.no_orphans + w.no_large_files + w.no_dead_code + w.no_notebook_outputs + w.no_secrets,
            100.0
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = HygieneConfig::load_or_default(&dir.path().join("hygiene.yaml")).unwrap();
        assert_eq!(config.large_file_mb, 1.0);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hygiene.yaml");
        std::fs::write(
            &path,
            "large_file_mb: 5\nsafety:\n  max_apply_deletions: 3\n",
        )
        .unwrap();

        let config = HygieneConfig::load_or_default(&path).unwrap();
        assert_eq!(config.large_file_mb, 5.0);
        assert_eq!(config.safety.max_apply_deletions, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.safety.max_apply_bytes_removed, 10 * 1024 * 1024);
        assert_eq!(config.quality.max_orphans_warn, 10);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hygiene.yaml");
        std::fs::write(&path, "large_file_mb: [not a number").unwrap();
        assert!(matches!(
            HygieneConfig::load_or_default(&path),
            Err(ConductorError::Config(_))
        ));
    }
}
