//! Content fingerprints for task code and declared arguments
//!
//! Code is fingerprinted per file (SHA-256 of the contents) into a map keyed
//! by the path relative to the project root, so the set is independent of
//! discovery order. Arguments are serialized canonically (sorted object keys,
//! integral floats written as integers) before hashing, so `{"a":1,"b":2}`
//! and `{"b":2,"a":1.0}` produce the same hash.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use kptn_core::TaskConfig;

use crate::error::HashingError;
use crate::imports;

/// Source path (relative to the project root) to content hash
pub type CodeHashes = BTreeMap<String, String>;

/// Argument name to canonical value hash
pub type InputHashes = BTreeMap<String, String>;

/// Hex SHA-256 of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> Result<String, HashingError> {
    let contents = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            HashingError::Missing(path.to_path_buf())
        } else {
            HashingError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(hash_bytes(&contents))
}

/// Combined digest over sorted (path, hash) pairs
pub fn combined_digest(hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, hash) in hashes {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON text of a value
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hash of a value's canonical JSON text
pub fn hash_value(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => out.push_str(&value.to_string()),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// 2^53: beyond this an f64 no longer represents every integer
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

fn canonical_number(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

/// Computes code and argument fingerprints relative to a project root
#[derive(Debug, Clone)]
pub struct ContentHasher {
    root: PathBuf,
}

impl ContentHasher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash every file implementing a task: its `file` (a single file or a
    /// whole directory), every file an R script there sources, plus
    /// anything matched by `include`.
    ///
    /// A missing `file` is an error; an `include` pattern matching nothing
    /// is not, and neither is a sourced file that does not exist.
    #[instrument(skip_all, fields(file = task.file.as_deref().unwrap_or("-")))]
    pub fn code_hashes(&self, task: &TaskConfig) -> Result<CodeHashes, HashingError> {
        let mut hashes = CodeHashes::new();

        if let Some(source) = task.source_path() {
            let path = self.root.join(source);
            let mut scripts = Vec::new();
            if path.is_dir() {
                self.hash_directory(&path, &mut hashes, &mut scripts)?;
            } else {
                hashes.insert(self.relative(&path), hash_file(&path)?);
                if imports::is_r_script(&path) {
                    scripts.push(path);
                }
            }
            for script in &scripts {
                for import in imports::import_closure(script, &self.root)? {
                    hashes.insert(self.relative(&import), hash_file(&import)?);
                }
            }
        }

        for pattern in &task.include {
            let full_pattern = self.root.join(pattern).to_string_lossy().to_string();
            let paths = glob::glob(&full_pattern).map_err(|e| HashingError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            for entry in paths {
                let entry = entry.map_err(|e| HashingError::Unreadable {
                    path: e.path().to_path_buf(),
                    source: e.into(),
                })?;
                if entry.is_file() {
                    hashes.insert(self.relative(&entry), hash_file(&entry)?);
                }
            }
        }

        debug!(files = hashes.len(), "code hashed");
        Ok(hashes)
    }

    fn hash_directory(
        &self,
        dir: &Path,
        hashes: &mut CodeHashes,
        scripts: &mut Vec<PathBuf>,
    ) -> Result<(), HashingError> {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                HashingError::Unreadable {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory loop")),
                }
            })?;
            if entry.file_type().is_file() {
                hashes.insert(self.relative(entry.path()), hash_file(entry.path())?);
                if imports::is_r_script(entry.path()) {
                    scripts.push(entry.into_path());
                }
            }
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Hash each declared argument canonically
    pub fn input_hashes(args: &BTreeMap<String, Value>) -> InputHashes {
        args.iter()
            .map(|(name, value)| (name.clone(), hash_value(value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_is_content_based() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.py");
        let b = temp.path().join("b.py");
        std::fs::write(&a, "print('hi')").unwrap();
        std::fs::write(&b, "print('hi')").unwrap();

        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        std::fs::write(&b, "print('bye')").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let temp = TempDir::new().unwrap();
        let hasher = ContentHasher::new(temp.path());
        let task = TaskConfig::new().with_file("tasks/missing.py");

        let err = hasher.code_hashes(&task).unwrap_err();
        assert!(matches!(err, HashingError::Missing(_)));
        assert_eq!(err.path().unwrap(), temp.path().join("tasks/missing.py"));
    }

    #[test]
    fn test_code_hashes_relative_and_sorted() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("tasks/lib")).unwrap();
        std::fs::write(temp.path().join("tasks/main.py"), "main").unwrap();
        std::fs::write(temp.path().join("tasks/lib/b.py"), "b").unwrap();
        std::fs::write(temp.path().join("tasks/lib/a.py"), "a").unwrap();

        let hasher = ContentHasher::new(temp.path());
        let task = TaskConfig::new()
            .with_file("tasks/main.py:run")
            .with_include("tasks/lib/*.py");
        let hashes = hasher.code_hashes(&task).unwrap();

        assert_eq!(
            hashes.keys().cloned().collect::<Vec<_>>(),
            vec!["tasks/lib/a.py", "tasks/lib/b.py", "tasks/main.py"]
        );
        assert_eq!(hashes["tasks/lib/a.py"], hash_bytes(b"a"));
    }

    #[test]
    fn test_directory_source() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("pkg/sub")).unwrap();
        std::fs::write(temp.path().join("pkg/one.R"), "1").unwrap();
        std::fs::write(temp.path().join("pkg/sub/two.R"), "2").unwrap();

        let hasher = ContentHasher::new(temp.path());
        let hashes = hasher.code_hashes(&TaskConfig::new().with_file("pkg")).unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains_key("pkg/sub/two.R"));
    }

    #[test]
    fn test_sourced_files_are_hashed() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("R/lib")).unwrap();
        std::fs::write(temp.path().join("R/main.R"), r#"source("lib/clean.R")"#).unwrap();
        std::fs::write(temp.path().join("R/lib/clean.R"), r#"source("format.R")"#).unwrap();
        std::fs::write(temp.path().join("R/lib/format.R"), "fmt <- 1").unwrap();

        let hasher = ContentHasher::new(temp.path());
        let task = TaskConfig::new().with_file("R/main.R");
        let before = hasher.code_hashes(&task).unwrap();
        assert_eq!(
            before.keys().cloned().collect::<Vec<_>>(),
            vec!["R/lib/clean.R", "R/lib/format.R", "R/main.R"]
        );

        std::fs::write(temp.path().join("R/lib/format.R"), "fmt <- 2").unwrap();
        let after = hasher.code_hashes(&task).unwrap();
        assert_ne!(before["R/lib/format.R"], after["R/lib/format.R"]);
        assert_eq!(before["R/main.R"], after["R/main.R"]);
    }

    #[test]
    fn test_unmatched_include_is_empty() {
        let temp = TempDir::new().unwrap();
        let hasher = ContentHasher::new(temp.path());
        let hashes = hasher
            .code_hashes(&TaskConfig::new().with_include("nothing/**/*.sql"))
            .unwrap();
        assert!(hashes.is_empty());
    }

    #[test]
    fn test_combined_digest_depends_on_paths() {
        let mut first = CodeHashes::new();
        first.insert("a.py".to_string(), "h1".to_string());
        let mut renamed = CodeHashes::new();
        renamed.insert("b.py".to_string(), "h1".to_string());

        assert_ne!(combined_digest(&first), combined_digest(&renamed));
        assert_eq!(combined_digest(&first), combined_digest(&first.clone()));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value: Value = serde_json::from_str(r#"{"b":{"y":1,"x":[2,{"k":true}]},"a":"s"}"#).unwrap();
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":{"x":[2,{"k":true}],"y":1}}"#
        );
    }

    #[test]
    fn test_integral_float_matches_integer() {
        assert_eq!(hash_value(&json!(1.0)), hash_value(&json!(1)));
        assert_ne!(hash_value(&json!(1.5)), hash_value(&json!(1)));
        assert_ne!(hash_value(&json!("1")), hash_value(&json!(1)));
    }

    #[test]
    fn test_input_hashes_per_argument() {
        let mut args = BTreeMap::new();
        args.insert("region".to_string(), json!("eu"));
        args.insert("limits".to_string(), json!({"max": 10, "min": 1}));

        let hashes = ContentHasher::input_hashes(&args);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes["region"], hash_value(&json!("eu")));
    }

    proptest! {
        #[test]
        fn prop_key_order_does_not_change_hash(
            entries in proptest::collection::btree_map("[a-z]{1,6}", -1000i64..1000, 1..8)
        ) {
            let forward = entries
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            let backward = entries
                .iter()
                .rev()
                .map(|(k, v)| format!("\"{}\":{}.0", k, v))
                .collect::<Vec<_>>()
                .join(",");
            let a: Value = serde_json::from_str(&format!("{{{}}}", forward)).unwrap();
            let b: Value = serde_json::from_str(&format!("{{{}}}", backward)).unwrap();
            prop_assert_eq!(hash_value(&a), hash_value(&b));
        }
    }
}
