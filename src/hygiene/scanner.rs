//! Large-file and orphan scans.
//!
//! Both scans walk the repository (skipping `.git`, `.conductor`, `target`,
//! `node_modules`, and hidden directories), honor the configured whitelist
//! globs plus a per-repo `.tidyignore`, and write CSV reports under
//! `reports/`.

use super::config::HygieneConfig;
use crate::errors::{ConductorError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeFileFinding {
    pub path: String,
    pub size_mb: f64,
    pub ext: String,
    pub whitelisted: bool,
    pub recommendation: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanFinding {
    pub path: String,
    pub last_modified: String,
    pub references_found: usize,
    pub size_bytes: u64,
}

/// True when `rel_path` matches any of the glob patterns. A bare pattern also
/// matches at any depth, mirroring gitignore-style expectations.
pub fn matches_any_glob(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|raw| {
        let direct = glob::Pattern::new(raw).map(|p| p.matches(rel_path));
        let nested = glob::Pattern::new(&format!("**/{raw}")).map(|p| p.matches(rel_path));
        direct.unwrap_or(false) || nested.unwrap_or(false)
    })
}

/// Patterns from an ignore-style file: one per line, `#` comments skipped.
pub fn read_ignore_file(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whitelist = configured globs plus `.tidyignore` entries.
pub fn effective_whitelist(root: &Path, config: &HygieneConfig) -> Vec<String> {
    let mut patterns = config.whitelist_globs.clone();
    patterns.extend(read_ignore_file(&root.join(".tidyignore")));
    patterns
}

const SKIP_DIRS: &[&str] = &["target", "node_modules", "venv", "dist", "build"];

fn is_scannable(entry: &walkdir::DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') && name != ".tidyignore" {
        return false;
    }
    !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
}

/// Every visible regular file under `root` as (relative path, absolute path),
/// lexicographically sorted for reproducible reports.
pub fn walk_repository(root: &Path) -> Vec<(String, PathBuf)> {
    let mut files: Vec<(String, PathBuf)> = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(is_scannable)
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry
                .path()
                .strip_prefix(root)
                .ok()?
                .to_string_lossy()
                .replace('\\', "/");
            Some((rel, entry.path().to_path_buf()))
        })
        .collect();
    files.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    files
}

/// Scan for binary files above the size threshold.
pub fn scan_large_files(root: &Path, config: &HygieneConfig) -> Result<Vec<LargeFileFinding>> {
    let whitelist = effective_whitelist(root, config);
    let threshold_bytes = (config.large_file_mb * 1024.0 * 1024.0) as u64;

    let mut findings = Vec::new();
    for (rel, abs) in walk_repository(root) {
        let ext = match abs.extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy()),
            None => continue,
        };
        if !config.binary_exts.iter().any(|e| e == &ext) {
            continue;
        }
        let size = match abs.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if size < threshold_bytes {
            continue;
        }
        let whitelisted = matches_any_glob(&rel, &whitelist);
        findings.push(LargeFileFinding {
            path: rel,
            size_mb: (size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            ext,
            whitelisted,
            recommendation: if whitelisted { "KEEP" } else { "REVIEW" },
        });
    }

    findings.sort_by(|a, b| b.size_mb.partial_cmp(&a.size_mb).unwrap_or(std::cmp::Ordering::Equal));
    write_large_files_csv(&root.join("reports/large_files.csv"), &findings)?;
    Ok(findings)
}

/// Scan for files nothing references.
pub fn scan_orphans(root: &Path, config: &HygieneConfig) -> Result<Vec<OrphanFinding>> {
    let whitelist = effective_whitelist(root, config);
    let gitignore = read_ignore_file(&root.join(".gitignore"));
    let min_age = Duration::days(config.orphan_detection.min_age_days);
    let now = Utc::now();

    let files = walk_repository(root);

    // Load reference-bearing file contents once; every candidate is then a
    // substring search over this set.
    let reference_sources: Vec<(String, String)> = files
        .iter()
        // Generated reports mention the paths they flag; counting those as
        // references would make every finding disappear on the next scan.
        .filter(|(rel, _)| !rel.starts_with("reports/"))
        .filter(|(rel, _)| {
            config
                .orphan_detection
                .reference_extensions
                .iter()
                .any(|ext| rel.ends_with(ext.as_str()))
        })
        .filter_map(|(rel, abs)| {
            std::fs::read_to_string(abs).ok().map(|c| (rel.clone(), c))
        })
        .collect();

    let mut orphans = Vec::new();
    for (rel, abs) in &files {
        if rel.starts_with("reports/") {
            continue;
        }
        if matches_any_glob(rel, &whitelist) || matches_any_glob(rel, &gitignore) {
            continue;
        }
        let file_name = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if config
            .orphan_detection
            .protected_patterns
            .iter()
            .any(|p| file_name.contains(p.as_str()))
        {
            continue;
        }

        let meta = match abs.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let mtime: DateTime<Utc> = match meta.modified() {
            Ok(t) => t.into(),
            Err(_) => continue,
        };
        if now - mtime < min_age {
            continue;
        }

        let needle_name = abs.file_name().map(|n| n.to_string_lossy().to_string());
        let references = reference_sources
            .iter()
            .filter(|(source_rel, _)| source_rel != rel)
            .filter(|(_, content)| {
                content.contains(rel.as_str())
                    || needle_name
                        .as_ref()
                        .map(|name| content.contains(name.as_str()))
                        .unwrap_or(false)
            })
            .count();

        if references == 0 {
            orphans.push(OrphanFinding {
                path: rel.clone(),
                last_modified: mtime.format("%Y-%m-%d").to_string(),
                references_found: 0,
                size_bytes: meta.len(),
            });
        }
    }

    write_orphans_csv(&root.join("reports/orphans.csv"), &orphans)?;
    Ok(orphans)
}

fn write_large_files_csv(path: &Path, findings: &[LargeFileFinding]) -> Result<()> {
    let mut out = String::from("path,size_mb,type,whitelisted,recommendation\n");
    for f in findings {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            f.path, f.size_mb, f.ext, f.whitelisted, f.recommendation
        ));
    }
    write_report(path, &out)
}

fn write_orphans_csv(path: &Path, findings: &[OrphanFinding]) -> Result<()> {
    let mut out = String::from("path,last_modified,references_found,size_bytes\n");
    for f in findings {
        out.push_str(&format!(
            "{},{},{},{}\n",
            f.path, f.last_modified, f.references_found, f.size_bytes
        ));
    }
    write_report(path, &out)
}

pub(crate) fn write_report(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConductorError::PersistFailed {
            what: "hygiene report",
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, content).map_err(|e| ConductorError::PersistFailed {
        what: "hygiene report",
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_with_no_age_gate() -> HygieneConfig {
        let mut config = HygieneConfig::default();
        config.orphan_detection.min_age_days = 0;
        config
    }

    fn write_file(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn large_files_above_threshold_are_reported() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.large_file_mb = 0.001; // ~1 KB

        write_file(dir.path(), "assets/big.png", &vec![0u8; 4096]);
        write_file(dir.path(), "assets/small.png", &[0u8; 10]);
        write_file(dir.path(), "notes.txt", &vec![0u8; 4096]);

        let findings = scan_large_files(dir.path(), &config).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].path, "assets/big.png");
        assert!(!findings[0].whitelisted);
        assert_eq!(findings[0].recommendation, "REVIEW");
        assert!(dir.path().join("reports/large_files.csv").exists());
    }

    #[test]
    fn whitelisted_large_files_are_marked_keep() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.large_file_mb = 0.001;

        write_file(dir.path(), "docs/diagram.png", &vec![0u8; 4096]);
        let findings = scan_large_files(dir.path(), &config).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].whitelisted);
        assert_eq!(findings[0].recommendation, "KEEP");
    }

    #[test]
    fn tidyignore_extends_the_whitelist() {
        let dir = tempdir().unwrap();
        let mut config = HygieneConfig::default();
        config.large_file_mb = 0.001;

        write_file(dir.path(), ".tidyignore", b"assets/**\n# comment\n");
        write_file(dir.path(), "assets/big.png", &vec![0u8; 4096]);

        let findings = scan_large_files(dir.path(), &config).unwrap();
        assert!(findings[0].whitelisted);
    }

    #[test]
    fn unreferenced_old_file_is_an_orphan() {
        let dir = tempdir().unwrap();
        let config = config_with_no_age_gate();

        write_file(dir.path(), "stale.csv", b"a,b\n");
        write_file(dir.path(), "README.md", b"Entry point: src/main.rs\n");
        write_file(dir.path(), "src/main.rs", b"fn main() {}\n");

        let orphans = scan_orphans(dir.path(), &config).unwrap();
        let paths: Vec<&str> = orphans.iter().map(|o| o.path.as_str()).collect();
        assert!(paths.contains(&"stale.csv"));
        // main.rs is referenced from the README and must not be flagged.
        assert!(!paths.contains(&"src/main.rs"));
        assert!(dir.path().join("reports/orphans.csv").exists());
    }

    #[test]
    fn referenced_file_is_not_an_orphan() {
        let dir = tempdir().unwrap();
        let config = config_with_no_age_gate();

        write_file(dir.path(), "data.csv", b"a,b\n");
        write_file(
            dir.path(),
            "src/loader.rs",
            b"const PATH: &str = \"data.csv\";\n",
        );

        let orphans = scan_orphans(dir.path(), &config).unwrap();
        assert!(orphans.iter().all(|o| o.path != "data.csv"));
    }

    #[test]
    fn protected_names_are_never_orphans() {
        let dir = tempdir().unwrap();
        let config = config_with_no_age_gate();

        write_file(dir.path(), "config.example.yaml", b"x: 1\n");
        write_file(dir.path(), "src/main.rs", b"fn main() {}\n");

        let orphans = scan_orphans(dir.path(), &config).unwrap();
        assert!(orphans.iter().all(|o| o.path != "config.example.yaml"));
    }

    #[test]
    fn recent_files_are_skipped_by_age_gate() {
        let dir = tempdir().unwrap();
        let config = HygieneConfig::default(); // min_age_days = 30

        write_file(dir.path(), "fresh.csv", b"a,b\n");
        let orphans = scan_orphans(dir.path(), &config).unwrap();
        assert!(orphans.is_empty());
    }

    #[test]
    fn gitignored_files_are_skipped() {
        let dir = tempdir().unwrap();
        let config = config_with_no_age_gate();

        write_file(dir.path(), ".gitignore", b"*.tmp\n");
        write_file(dir.path(), "scratch.tmp", b"x\n");

        let orphans = scan_orphans(dir.path(), &config).unwrap();
        assert!(orphans.iter().all(|o| o.path != "scratch.tmp"));
    }

    #[test]
    fn hidden_and_vendor_directories_are_not_walked() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), ".git/objects/blob", b"x");
        write_file(dir.path(), "target/debug/artifact", b"x");
        write_file(dir.path(), "src/lib.rs", b"x");

        let files = walk_repository(dir.path());
        let rels: Vec<&str> = files.iter().map(|(rel, _)| rel.as_str()).collect();
        assert!(rels.contains(&"src/lib.rs"));
        assert!(rels.iter().all(|rel| !rel.starts_with(".git/")));
        assert!(rels.iter().all(|rel| !rel.starts_with("target/")));
    }
}
