//! Storage key resolution
//!
//! Every cached task record lives under a storage key, normally derived from
//! the git branch so that branches keep independent caches. The key is
//! resolved once at the edge (CLI or orchestrator entry point) and passed
//! explicitly into every store call afterwards.

use std::path::Path;

use git2::{ErrorCode, Repository};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{validate_name, Settings};
use crate::error::{ConfigError, Result};

/// Used when nothing else yields a key (no git repository, detached HEAD)
pub const DEFAULT_STORAGE_KEY: &str = "local";

/// Directory holding per-branch overrides (`branch_conf/<branch>.yaml`)
pub const BRANCH_CONF_DIR: &str = "branch_conf";

#[derive(Debug, Deserialize)]
struct BranchConf {
    storage_key: Option<String>,
}

/// Resolve the storage key for a project.
///
/// Order: explicit value, `settings.storage_key` (which already carries
/// `KPTN_STORAGE_KEY`), `branch_conf/<branch>.yaml`, the branch name itself,
/// then [`DEFAULT_STORAGE_KEY`].
pub fn resolve_storage_key(
    explicit: Option<&str>,
    settings: &Settings,
    project_root: &Path,
) -> Result<String> {
    if let Some(key) = explicit.or(settings.storage_key.as_deref()) {
        validate_name("storage_key", key)?;
        return Ok(key.to_string());
    }

    let Some(branch) = current_branch(project_root)? else {
        debug!("no branch found, using default storage key");
        return Ok(DEFAULT_STORAGE_KEY.to_string());
    };

    if let Some(key) = read_branch_storage_key(project_root, &branch)? {
        info!(branch = %branch, storage_key = %key, "storage key from branch_conf");
        validate_name("storage_key", &key)?;
        return Ok(key);
    }

    let key = sanitize_branch(&branch);
    info!(branch = %branch, storage_key = %key, "storage key from git branch");
    Ok(key)
}

/// Current branch of the repository containing `start`, if any.
///
/// Returns `None` outside a repository, on an unborn branch or with a
/// detached HEAD.
pub fn current_branch(start: &Path) -> Result<Option<String>> {
    let repo = match Repository::discover(start) {
        Ok(repo) => repo,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if head.is_branch() {
        Ok(head.shorthand().map(|s| s.to_string()))
    } else {
        Ok(None)
    }
}

/// Read `branch_conf/<branch>.yaml` and return its `storage_key`
pub fn read_branch_storage_key(project_root: &Path, branch: &str) -> Result<Option<String>> {
    let path = project_root
        .join(BRANCH_CONF_DIR)
        .join(format!("{}.yaml", sanitize_branch(branch)));
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
    let conf: BranchConf = serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?;
    Ok(conf.storage_key.filter(|k| !k.trim().is_empty()))
}

/// Branch names may contain `/`, which is not allowed in keys
fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
