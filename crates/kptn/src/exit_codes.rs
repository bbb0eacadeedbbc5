//! Exit codes for the CLI

use kptn_cache::{CacheError, StoreError};
use kptn_core::KptnError;

/// Success
#[allow(dead_code)]
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration or graph error
pub const CONFIG_ERROR: i32 = 2;

/// Source file or upstream state needed for a decision is unavailable
pub const UNRESOLVED: i32 = 3;

/// Stored payload failed its integrity check
pub const INTEGRITY_ERROR: i32 = 4;

/// Version bump kept losing races
pub const CONTENTION: i32 = 5;

/// Map an error to the exit code the orchestrator sees
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<KptnError>().is_some() {
        return CONFIG_ERROR;
    }
    match err.downcast_ref::<CacheError>() {
        Some(CacheError::Graph(_)) | Some(CacheError::UnknownTask(_)) => CONFIG_ERROR,
        Some(CacheError::Hashing(_)) | Some(CacheError::UnresolvedDependency { .. }) => UNRESOLVED,
        Some(CacheError::Store(e)) if e.is_integrity_failure() => INTEGRITY_ERROR,
        Some(CacheError::Store(StoreError::StaleBackingStore { .. })) => CONTENTION,
        _ => ERROR,
    }
}
