//! Jupyter notebook hygiene.
//!
//! A notebook "has outputs" when any code cell carries a non-empty `outputs`
//! array or a non-null `execution_count`. In apply mode, outputs of
//! non-whitelisted notebooks are cleared and the file is rewritten in place.

use super::config::HygieneConfig;
use super::scanner::{effective_whitelist, matches_any_glob, walk_repository, write_report};
use crate::errors::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookFinding {
    pub path: String,
    pub cells_with_outputs: usize,
    pub whitelisted: bool,
    pub cleared: bool,
}

/// Scan all notebooks; clear outputs when `apply` is set.
pub fn check_notebooks(
    root: &Path,
    config: &HygieneConfig,
    apply: bool,
) -> Result<Vec<NotebookFinding>> {
    let whitelist = effective_whitelist(root, config);
    let mut findings = Vec::new();

    for (rel, abs) in walk_repository(root) {
        if !rel.ends_with(".ipynb") || rel.contains(".ipynb_checkpoints") {
            continue;
        }
        let content = match std::fs::read_to_string(&abs) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let mut notebook: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let cells_with_outputs = count_cells_with_outputs(&notebook);
        if cells_with_outputs == 0 {
            continue;
        }

        let whitelisted = matches_any_glob(&rel, &whitelist);
        let mut cleared = false;
        if apply && !whitelisted {
            clear_outputs(&mut notebook);
            let rewritten = serde_json::to_string_pretty(&notebook).map_err(|e| {
                ConductorError::PersistFailed {
                    what: "notebook",
                    path: abs.clone(),
                    source: std::io::Error::other(e),
                }
            })?;
            std::fs::write(&abs, rewritten + "\n").map_err(|e| ConductorError::PersistFailed {
                what: "notebook",
                path: abs.clone(),
                source: e,
            })?;
            cleared = true;
        }

        findings.push(NotebookFinding {
            path: rel,
            cells_with_outputs,
            whitelisted,
            cleared,
        });
    }

    write_report(
        &root.join("reports/notebook_sanitizer.md"),
        &render_report(&findings),
    )?;
    Ok(findings)
}

fn code_cells(notebook: &serde_json::Value) -> Vec<&serde_json::Value> {
    notebook
        .get("cells")
        .and_then(|c| c.as_array())
        .map(|cells| {
            cells
                .iter()
                .filter(|cell| cell.get("cell_type").and_then(|t| t.as_str()) == Some("code"))
                .collect()
        })
        .unwrap_or_default()
}

fn count_cells_with_outputs(notebook: &serde_json::Value) -> usize {
    code_cells(notebook)
        .iter()
        .filter(|cell| {
            let has_outputs = cell
                .get("outputs")
                .and_then(|o| o.as_array())
                .map(|o| !o.is_empty())
                .unwrap_or(false);
            let has_counter = cell
                .get("execution_count")
                .map(|c| !c.is_null())
                .unwrap_or(false);
            has_outputs || has_counter
        })
        .count()
}

fn clear_outputs(notebook: &mut serde_json::Value) {
    if let Some(cells) = notebook.get_mut("cells").and_then(|c| c.as_array_mut()) {
        for cell in cells {
            if cell.get("cell_type").and_then(|t| t.as_str()) != Some("code") {
                continue;
            }
            if let Some(obj) = cell.as_object_mut() {
                obj.insert("outputs".to_string(), serde_json::json!([]));
                obj.insert("execution_count".to_string(), serde_json::Value::Null);
            }
        }
    }
}

fn render_report(findings: &[NotebookFinding]) -> String {
    let whitelisted = findings.iter().filter(|f| f.whitelisted).count();
    let cleared = findings.iter().filter(|f| f.cleared).count();
    let needs_cleanup = findings.len() - whitelisted;

    let mut out = String::from("# Notebook Hygiene Report\n\n## Summary\n\n");
    out.push_str(&format!(
        "- **Notebooks with outputs**: {}\n- **Whitelisted**: {}\n- **Requiring cleanup**: {}\n",
        findings.len(),
        whitelisted,
        needs_cleanup
    ));
    if cleared > 0 {
        out.push_str(&format!("- **Cleared**: {cleared}\n"));
    }
    out.push('\n');

    if findings.is_empty() {
        out.push_str("All notebooks are clean.\n");
    } else {
        out.push_str("| Path | Cells with Outputs | Whitelisted |\n");
        out.push_str("|------|--------------------|-------------|\n");
        for f in findings {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                f.path,
                f.cells_with_outputs,
                if f.whitelisted { "yes" } else { "no" }
            ));
        }
    }
    out
}

/// Count of non-whitelisted notebooks, the score's input.
pub fn needs_cleanup(findings: &[NotebookFinding]) -> usize {
    findings.iter().filter(|f| !f.whitelisted).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn notebook_json(with_outputs: bool) -> String {
        let outputs = if with_outputs {
            serde_json::json!([{"output_type": "stream", "text": ["hi\n"]}])
        } else {
            serde_json::json!([])
        };
        let execution_count = if with_outputs {
            serde_json::json!(3)
        } else {
            serde_json::Value::Null
        };
        serde_json::to_string(&serde_json::json!({
            "cells": [
                {"cell_type": "markdown", "source": ["# Title"]},
                {"cell_type": "code", "source": ["print(1)"], "outputs": outputs,
                 "execution_count": execution_count}
            ],
            "nbformat": 4
        }))
        .unwrap()
    }

    fn write_notebook(root: &Path, rel: &str, with_outputs: bool) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, notebook_json(with_outputs)).unwrap();
    }

    #[test]
    fn notebooks_with_outputs_are_detected() {
        let dir = tempdir().unwrap();
        write_notebook(dir.path(), "analysis/run.ipynb", true);
        write_notebook(dir.path(), "analysis/clean.ipynb", false);

        let findings = check_notebooks(dir.path(), &HygieneConfig::default(), false).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].path, "analysis/run.ipynb");
        assert_eq!(findings[0].cells_with_outputs, 1);
        assert!(!findings[0].cleared);
        assert!(dir.path().join("reports/notebook_sanitizer.md").exists());
    }

    #[test]
    fn execution_count_alone_counts_as_outputs() {
        let dir = tempdir().unwrap();
        let nb = serde_json::json!({
            "cells": [{"cell_type": "code", "source": [], "outputs": [], "execution_count": 7}],
            "nbformat": 4
        });
        fs::write(dir.path().join("probe.ipynb"), nb.to_string()).unwrap();

        let findings = check_notebooks(dir.path(), &HygieneConfig::default(), false).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn apply_clears_non_whitelisted_notebooks() {
        let dir = tempdir().unwrap();
        write_notebook(dir.path(), "analysis/run.ipynb", true);

        let findings = check_notebooks(dir.path(), &HygieneConfig::default(), true).unwrap();
        assert!(findings[0].cleared);

        let rewritten: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("analysis/run.ipynb")).unwrap())
                .unwrap();
        assert_eq!(count_cells_with_outputs(&rewritten), 0);
    }

    #[test]
    fn apply_leaves_whitelisted_notebooks_alone() {
        let dir = tempdir().unwrap();
        write_notebook(dir.path(), "docs/demo.ipynb", true);

        let findings = check_notebooks(dir.path(), &HygieneConfig::default(), true).unwrap();
        assert!(findings[0].whitelisted);
        assert!(!findings[0].cleared);

        let untouched: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("docs/demo.ipynb")).unwrap())
                .unwrap();
        assert_eq!(count_cells_with_outputs(&untouched), 1);
    }

    #[test]
    fn needs_cleanup_excludes_whitelisted() {
        let findings = vec![
            NotebookFinding {
                path: "a.ipynb".into(),
                cells_with_outputs: 1,
                whitelisted: false,
                cleared: false,
            },
            NotebookFinding {
                path: "docs/b.ipynb".into(),
                cells_with_outputs: 2,
                whitelisted: true,
                cleared: false,
            },
        ];
        assert_eq!(needs_cleanup(&findings), 1);
    }
}
