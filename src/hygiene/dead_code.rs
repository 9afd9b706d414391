//! Dead-code detection over Rust sources.
//!
//! Each `.rs` file is parsed into a syntax tree; defined names (free
//! functions, structs and enums, private `use` imports) are compared against
//! every name referenced in the same file. Defined-but-unreferenced items are
//! reported. Public re-exports are never counted as unused imports, and
//! underscore-prefixed names are ignored by convention.
//!
//! Test code is excluded at the AST level: `#[cfg(test)]` modules are not
//! walked at all, and a `#[test]`-attributed function (including
//! `#[tokio::test]` and friends) is invoked by the harness, never by name,
//! so it is not a definition candidate.

use super::config::HygieneConfig;
use super::scanner::{walk_repository, write_report};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use syn::visit::Visit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadCodeFinding {
    pub name: String,
    pub file: String,
    pub line: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadCodeResults {
    pub functions: Vec<DeadCodeFinding>,
    pub types: Vec<DeadCodeFinding>,
    pub imports: Vec<DeadCodeFinding>,
}

impl DeadCodeResults {
    /// Weighted total used by the cleanliness score: functions and types
    /// count three times an import.
    pub fn weighted_total(&self) -> usize {
        self.functions.len() * 3 + self.types.len() * 3 + self.imports.len()
    }
}

#[derive(Default)]
struct NameCollector {
    defined_fns: Vec<String>,
    defined_types: Vec<String>,
    imports: Vec<String>,
    used: HashSet<String>,
}

impl NameCollector {
    fn collect_use_leaves(&mut self, tree: &syn::UseTree) {
        match tree {
            syn::UseTree::Path(path) => self.collect_use_leaves(&path.tree),
            syn::UseTree::Name(name) => self.imports.push(name.ident.to_string()),
            syn::UseTree::Rename(rename) => self.imports.push(rename.rename.to_string()),
            syn::UseTree::Group(group) => {
                for item in &group.items {
                    self.collect_use_leaves(item);
                }
            }
            syn::UseTree::Glob(_) => {}
        }
    }

    fn collect_macro_idents(&mut self, tokens: proc_macro2::TokenStream) {
        for token in tokens {
            match token {
                proc_macro2::TokenTree::Ident(ident) => {
                    self.used.insert(ident.to_string());
                }
                proc_macro2::TokenTree::Group(group) => {
                    self.collect_macro_idents(group.stream());
                }
                _ => {}
            }
        }
    }
}

/// Whether any attribute's path ends in `test`; covers `#[test]`,
/// `#[tokio::test]`, and similar harness attributes.
fn has_test_attribute(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        attr.path()
            .segments
            .last()
            .map(|segment| segment.ident == "test")
            .unwrap_or(false)
    })
}

/// Whether the item carries `#[cfg(test)]` (or `#[cfg(all(test, ...))]`).
fn is_cfg_test(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident("cfg") {
            return false;
        }
        match &attr.meta {
            syn::Meta::List(list) => tokens_contain_test(list.tokens.clone()),
            _ => false,
        }
    })
}

fn tokens_contain_test(tokens: proc_macro2::TokenStream) -> bool {
    tokens.into_iter().any(|token| match token {
        proc_macro2::TokenTree::Ident(ident) => ident == "test",
        proc_macro2::TokenTree::Group(group) => tokens_contain_test(group.stream()),
        _ => false,
    })
}

impl<'ast> Visit<'ast> for NameCollector {
    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        // Test modules mirror the original's whole-file test exclusion:
        // neither their definitions nor their references count.
        if is_cfg_test(&node.attrs) {
            return;
        }
        syn::visit::visit_item_mod(self, node);
    }

    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        // The harness calls test functions by attribute, not by name.
        if !has_test_attribute(&node.attrs) && !is_cfg_test(&node.attrs) {
            self.defined_fns.push(node.sig.ident.to_string());
        }
        syn::visit::visit_item_fn(self, node);
    }

    fn visit_item_struct(&mut self, node: &'ast syn::ItemStruct) {
        if !is_cfg_test(&node.attrs) {
            self.defined_types.push(node.ident.to_string());
        }
        syn::visit::visit_item_struct(self, node);
    }

    fn visit_item_enum(&mut self, node: &'ast syn::ItemEnum) {
        if !is_cfg_test(&node.attrs) {
            self.defined_types.push(node.ident.to_string());
        }
        syn::visit::visit_item_enum(self, node);
    }

    fn visit_item_use(&mut self, node: &'ast syn::ItemUse) {
        // A public use is a re-export, not a candidate for "unused"; a
        // cfg(test) use belongs to the excluded test code.
        if !matches!(node.vis, syn::Visibility::Public(_)) && !is_cfg_test(&node.attrs) {
            self.collect_use_leaves(&node.tree);
        }
    }

    fn visit_path(&mut self, node: &'ast syn::Path) {
        for segment in &node.segments {
            self.used.insert(segment.ident.to_string());
        }
        syn::visit::visit_path(self, node);
    }

    fn visit_macro(&mut self, node: &'ast syn::Macro) {
        for segment in &node.path.segments {
            self.used.insert(segment.ident.to_string());
        }
        self.collect_macro_idents(node.tokens.clone());
    }
}

/// Find the 1-based line of a definition by scanning the source text.
fn definition_line(source: &str, pattern: &regex::Regex) -> Option<usize> {
    source
        .lines()
        .position(|line| pattern.is_match(line))
        .map(|idx| idx + 1)
}

fn fn_line(source: &str, name: &str) -> Option<usize> {
    let pattern = regex::Regex::new(&format!(
        r"^\s*(pub(\([^)]*\))?\s+)?(async\s+)?(const\s+)?(unsafe\s+)?fn\s+{}\b",
        regex::escape(name)
    ))
    .ok()?;
    definition_line(source, &pattern)
}

fn type_line(source: &str, name: &str) -> Option<usize> {
    let pattern = regex::Regex::new(&format!(
        r"^\s*(pub(\([^)]*\))?\s+)?(struct|enum)\s+{}\b",
        regex::escape(name)
    ))
    .ok()?;
    definition_line(source, &pattern)
}

fn import_line(source: &str, name: &str) -> Option<usize> {
    source
        .lines()
        .position(|line| line.trim_start().starts_with("use ") && line.contains(name))
        .map(|idx| idx + 1)
}

/// Analyze every Rust source under `root` and write `reports/dead_code.md`.
pub fn analyze_dead_code(root: &Path, config: &HygieneConfig) -> Result<DeadCodeResults> {
    let exclude_patterns: Vec<regex::Regex> = config
        .dead_code
        .exclude_patterns
        .iter()
        .filter_map(|raw| regex::Regex::new(raw).ok())
        .collect();
    let exclude_names: HashSet<&str> = config
        .dead_code
        .exclude_names
        .iter()
        .map(String::as_str)
        .collect();

    let mut results = DeadCodeResults::default();

    for (rel, abs) in walk_repository(root) {
        if !rel.ends_with(".rs") {
            continue;
        }
        if exclude_patterns.iter().any(|p| p.is_match(&rel)) {
            continue;
        }
        let source = match std::fs::read_to_string(&abs) {
            Ok(s) => s,
            Err(_) => continue,
        };
        // Files that fail to parse are skipped, same as unreadable ones.
        let file = match syn::parse_file(&source) {
            Ok(f) => f,
            Err(_) => continue,
        };

        let mut collector = NameCollector::default();
        collector.visit_file(&file);

        for name in &collector.defined_fns {
            if name.starts_with('_') || exclude_names.contains(name.as_str()) {
                continue;
            }
            if !collector.used.contains(name) {
                results.functions.push(DeadCodeFinding {
                    name: name.clone(),
                    file: rel.clone(),
                    line: fn_line(&source, name),
                });
            }
        }
        for name in &collector.defined_types {
            if name.starts_with('_') || exclude_names.contains(name.as_str()) {
                continue;
            }
            if !collector.used.contains(name) {
                results.types.push(DeadCodeFinding {
                    name: name.clone(),
                    file: rel.clone(),
                    line: type_line(&source, name),
                });
            }
        }

        let basename = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !config
            .dead_code
            .ignore_unused_imports
            .iter()
            .any(|ignored| ignored == &basename)
        {
            for name in &collector.imports {
                if name.starts_with('_') || collector.used.contains(name) {
                    continue;
                }
                results.imports.push(DeadCodeFinding {
                    name: name.clone(),
                    file: rel.clone(),
                    line: import_line(&source, name),
                });
            }
        }
    }

    results.functions.sort_by(|a, b| a.file.cmp(&b.file));
    results.types.sort_by(|a, b| a.file.cmp(&b.file));
    results.imports.sort_by(|a, b| a.file.cmp(&b.file));

    write_report(
        &root.join("reports/dead_code.md"),
        &render_report(&results),
    )?;
    Ok(results)
}

fn render_report(results: &DeadCodeResults) -> String {
    let mut out = String::from("# Dead Code Analysis Report\n\n## Summary\n\n");
    out.push_str(&format!(
        "- **Unused functions**: {}\n- **Unused types**: {}\n- **Unused imports**: {}\n\n",
        results.functions.len(),
        results.types.len(),
        results.imports.len()
    ));

    let section = |title: &str, findings: &[DeadCodeFinding]| -> String {
        if findings.is_empty() {
            return String::new();
        }
        let mut s = format!("## {title}\n\n");
        for f in findings {
            match f.line {
                Some(line) => s.push_str(&format!("- `{}` in {}:{}\n", f.name, f.file, line)),
                None => s.push_str(&format!("- `{}` in {}\n", f.name, f.file)),
            }
        }
        s.push('\n');
        s
    };

    out.push_str(&section("Unused Functions", &results.functions));
    out.push_str(&section("Unused Types", &results.types));
    out.push_str(&section("Unused Imports", &results.imports));

    if results.functions.is_empty() && results.types.is_empty() && results.imports.is_empty() {
        out.push_str("No dead code detected.\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_source(root: &Path, rel: &str, source: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, source).unwrap();
    }

    #[test]
    fn unreferenced_function_is_reported_with_line() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/util.rs",
            "pub fn used() { helper(); }\nfn helper() {}\nfn forgotten() {}\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        let names: Vec<&str> = results.functions.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"forgotten"));
        assert!(!names.contains(&"helper"));
        let forgotten = results
            .functions
            .iter()
            .find(|f| f.name == "forgotten")
            .unwrap();
        assert_eq!(forgotten.line, Some(3));
        assert!(dir.path().join("reports/dead_code.md").exists());
    }

    #[test]
    fn unreferenced_type_is_reported() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/types.rs",
            "struct Orphaned { x: u32 }\nstruct Wanted;\npub fn build() -> Wanted { Wanted }\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        let names: Vec<&str> = results.types.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"Orphaned"));
        assert!(!names.contains(&"Wanted"));
    }

    #[test]
    fn unused_private_import_is_reported() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/io.rs",
            "use std::collections::HashMap;\nuse std::path::PathBuf;\npub fn touch(p: PathBuf) { let _ = p; }\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        let names: Vec<&str> = results.imports.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"HashMap"));
        assert!(!names.contains(&"PathBuf"));
    }

    #[test]
    fn public_reexports_are_not_unused_imports() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/api.rs",
            "pub use std::collections::HashMap;\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.imports.is_empty());
    }

    #[test]
    fn inline_test_module_is_not_dead_code() {
        let dir = tempdir().unwrap();
        // The dominant Rust convention: unit tests live in a #[cfg(test)]
        // module inside the production source file.
        write_source(
            dir.path(),
            "src/math.rs",
            r#"
pub fn double(x: u32) -> u32 { x * 2 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn fixture() -> u32 { 21 }

    #[test]
    fn doubles_the_input() {
        let _unused: Option<HashMap<u32, u32>> = None;
        assert_eq!(double(fixture()), 42);
    }

    #[tokio::test]
    async fn doubles_async_too() {
        assert_eq!(double(2), 4);
    }
}
"#,
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        // Nothing inside the test module is reported: not the #[test] fns,
        // not the fixture helper, not the test-only import.
        let names: Vec<&str> = results.functions.iter().map(|f| f.name.as_str()).collect();
        assert!(!names.contains(&"doubles_the_input"), "got: {names:?}");
        assert!(!names.contains(&"doubles_async_too"), "got: {names:?}");
        assert!(!names.contains(&"fixture"), "got: {names:?}");
        assert!(results.imports.is_empty(), "got: {:?}", results.imports);
    }

    #[test]
    fn test_attributed_functions_outside_a_test_module_are_skipped() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/probe.rs",
            "#[test]\nfn bare_test() { assert!(true); }\n\
             #[tokio::test]\nasync fn bare_async_test() {}\n\
             fn genuinely_dead() {}\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        let names: Vec<&str> = results.functions.iter().map(|f| f.name.as_str()).collect();
        assert!(!names.contains(&"bare_test"));
        assert!(!names.contains(&"bare_async_test"));
        assert!(names.contains(&"genuinely_dead"));
    }

    #[test]
    fn production_dead_code_next_to_a_test_module_is_still_reported() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/mixed.rs",
            r#"
pub fn entry() { helper(); }
fn helper() { let f = entry; let _ = f; }
fn forgotten() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exercises_entry() { entry(); }
}
"#,
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        let names: Vec<&str> = results.functions.iter().map(|f| f.name.as_str()).collect();
        // The test module neither hides production dead code nor adds its own.
        assert_eq!(names, vec!["forgotten"]);
    }

    #[test]
    fn cfg_test_items_outside_a_module_are_skipped() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/support.rs",
            "#[cfg(test)]\nfn test_only_helper() {}\n\
             #[cfg(test)]\nstruct TestHarness;\n\
             #[cfg(all(test, unix))]\nfn unix_test_helper() {}\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.functions.is_empty());
        assert!(results.types.is_empty());
    }

    #[test]
    fn excluded_names_and_underscores_are_ignored() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/entry.rs",
            "fn main() {}\nfn _scratch() {}\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.functions.is_empty());
    }

    #[test]
    fn excluded_paths_are_skipped() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), "tests/helpers.rs", "fn unused_helper() {}\n");

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.functions.is_empty());
    }

    #[test]
    fn ignore_unused_imports_respects_basenames() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/lib.rs",
            "use std::collections::HashMap;\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.imports.is_empty());
    }

    #[test]
    fn macro_bodies_count_as_references() {
        let dir = tempdir().unwrap();
        write_source(
            dir.path(),
            "src/log.rs",
            "fn emit() {}\npub fn run() { println!(\"{:?}\", emit); }\n",
        );

        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.functions.iter().all(|f| f.name != "emit"));
    }

    #[test]
    fn unparseable_files_are_skipped() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), "src/broken.rs", "fn oops( {\n");
        let results = analyze_dead_code(dir.path(), &HygieneConfig::default()).unwrap();
        assert!(results.functions.is_empty());
    }

    #[test]
    fn weighted_total_counts_items_over_imports() {
        let mut results = DeadCodeResults::default();
        let finding = |name: &str| DeadCodeFinding {
            name: name.into(),
            file: "src/x.rs".into(),
            line: None,
        };
        results.functions.push(finding("a"));
        results.types.push(finding("B"));
        results.imports.push(finding("c"));
        results.imports.push(finding("d"));
        assert_eq!(results.weighted_total(), 3 + 3 + 2);
    }
}
