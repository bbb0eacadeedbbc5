//! Files an R script pulls in through `source()` and `r_script()` calls
//!
//! `source("x.R")` and `r_script("x.R")` resolve against the calling
//! script's directory. `source(here("x.R"))` resolves against the nearest
//! ancestor holding a `.here` marker, or the project root when there is none.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::HashingError;

/// Where an import path is resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Script,
    Here,
}

fn patterns() -> &'static [(Regex, Anchor)] {
    static PATTERNS: OnceLock<Vec<(Regex, Anchor)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r#"source\("(.*?)"\)"#, Anchor::Script),
            (r#"source\(.*here\("(.*?)"\)\)"#, Anchor::Here),
            (r#"r_script\("(.*?)"\)"#, Anchor::Script),
        ]
        .into_iter()
        .map(|(pattern, anchor)| (Regex::new(pattern).expect("valid import pattern"), anchor))
        .collect()
    })
}

/// Whether imports of `path` are followed
pub fn is_r_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("r"))
}

/// Directory of the nearest `.here` marker above `script`
fn here_root(script: &Path, project_root: &Path) -> PathBuf {
    script
        .parent()
        .into_iter()
        .flat_map(Path::ancestors)
        .find(|dir| dir.join(".here").exists())
        .map_or_else(|| project_root.to_path_buf(), Path::to_path_buf)
}

/// Import targets named in `contents`, resolved but not checked for existence
pub fn direct_imports(script: &Path, contents: &str, project_root: &Path) -> Vec<PathBuf> {
    let script_dir = script.parent().unwrap_or(project_root);
    let mut here = None;

    let mut imports = Vec::new();
    for (pattern, anchor) in patterns() {
        for captures in pattern.captures_iter(contents) {
            let target = &captures[1];
            let base = match anchor {
                Anchor::Script => script_dir.to_path_buf(),
                Anchor::Here => here
                    .get_or_insert_with(|| here_root(script, project_root))
                    .clone(),
            };
            imports.push(normalize(&base.join(target)));
        }
    }
    imports
}

/// Every file reachable from `script` through imports, excluding `script`
/// itself, sorted. Targets that do not exist are skipped with a warning.
pub fn import_closure(script: &Path, project_root: &Path) -> Result<Vec<PathBuf>, HashingError> {
    let script = normalize(script);
    let mut visited = BTreeSet::from([script.clone()]);
    let mut pending = vec![script.clone()];

    while let Some(current) = pending.pop() {
        let contents = fs::read(&current).map_err(|source| HashingError::Unreadable {
            path: current.clone(),
            source,
        })?;
        let contents = String::from_utf8_lossy(&contents);

        for import in direct_imports(&current, &contents, project_root) {
            if visited.contains(&import) {
                continue;
            }
            if !import.is_file() {
                warn!(script = %current.display(), import = %import.display(), "sourced file does not exist");
                continue;
            }
            visited.insert(import.clone());
            pending.push(import);
        }
    }

    visited.remove(&script);
    Ok(visited.into_iter().collect())
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_direct_imports_resolve_per_call_form() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("r/tasks")).unwrap();
        std::fs::write(root.join("r/.here"), "").unwrap();
        let script = root.join("r/tasks/main.R");
        let contents = r#"
source("helpers.R")
source(here("lib/shared.R"))
r_script("../other/step.R")
"#;

        let imports = direct_imports(&script, contents, root);
        assert_eq!(
            imports,
            vec![
                root.join("r/tasks/helpers.R"),
                root.join("r/lib/shared.R"),
                root.join("r/other/step.R"),
            ]
        );
    }

    #[test]
    fn test_here_falls_back_to_project_root() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("tasks/main.R");
        let imports = direct_imports(&script, r#"source(here::here("util.R"))"#, temp.path());
        assert_eq!(imports, vec![temp.path().join("util.R")]);
    }

    #[test]
    fn test_closure_follows_chains_and_cycles() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::write(root.join("main.R"), r#"source("a.R")"#).unwrap();
        std::fs::write(root.join("a.R"), r#"source("b.R"); source("gone.R")"#).unwrap();
        std::fs::write(root.join("b.R"), r#"source("a.R")"#).unwrap();

        let closure = import_closure(&root.join("main.R"), root).unwrap();
        assert_eq!(closure, vec![root.join("a.R"), root.join("b.R")]);
    }

    #[test]
    fn test_is_r_script() {
        assert!(is_r_script(Path::new("tasks/run.R")));
        assert!(is_r_script(Path::new("tasks/run.r")));
        assert!(!is_r_script(Path::new("tasks/run.py")));
        assert!(!is_r_script(Path::new("tasks/R")));
    }
}
