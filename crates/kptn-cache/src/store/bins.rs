//! Splitting large payloads into bins and putting them back together

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::hasher::hash_bytes;
use crate::record::{BinManifest, BinType};
use crate::task::TaskKey;

/// Split `payload` into chunks of at most `max_bin_bytes`.
///
/// Always yields at least one bin; an empty payload becomes one empty bin.
pub fn partition(payload: &[u8], max_bin_bytes: usize) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![payload];
    }
    payload.chunks(max_bin_bytes.max(1)).collect()
}

/// Manifest describing `payload` split into `count` bins
pub fn manifest_for(payload: &[u8], count: usize) -> BinManifest {
    BinManifest {
        count: count as u32,
        digest: hash_bytes(payload),
    }
}

/// Rebuild a payload from bins keyed by bin id.
///
/// Every id in `0..manifest.count` must be present and the concatenation
/// must match the manifest digest. Bins beyond the count are leftovers of
/// an older, larger payload and are ignored.
pub fn reassemble(
    key: &TaskKey,
    bin_type: BinType,
    manifest: &BinManifest,
    bins: BTreeMap<u32, Vec<u8>>,
) -> Result<Vec<u8>, StoreError> {
    let incomplete = |detail: String| StoreError::IncompleteBinSet {
        key: key.to_string(),
        bin_type,
        detail,
    };

    let mut payload = Vec::new();
    for id in 0..manifest.count {
        let chunk = bins
            .get(&id)
            .ok_or_else(|| incomplete(format!("bin {} of {} missing", id, manifest.count)))?;
        payload.extend_from_slice(chunk);
    }

    if hash_bytes(&payload) != manifest.digest {
        return Err(incomplete("digest mismatch".to_string()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new("main", "etl", "extract")
    }

    fn bins_of(payload: &[u8], max: usize) -> (BinManifest, BTreeMap<u32, Vec<u8>>) {
        let chunks = partition(payload, max);
        let manifest = manifest_for(payload, chunks.len());
        let bins = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| (i as u32, c.to_vec()))
            .collect();
        (manifest, bins)
    }

    #[test]
    fn test_partition_sizes() {
        assert_eq!(partition(b"", 4).len(), 1);
        assert_eq!(partition(b"abcd", 4).len(), 1);
        assert_eq!(partition(b"abcde", 4).len(), 2);
        let expected: Vec<&[u8]> = vec![b"abcd", b"efgh", b"i"];
        assert_eq!(partition(b"abcdefghi", 4), expected);
    }

    #[test]
    fn test_reassemble_multiple_bins() {
        let payload = b"[\"a\",\"b\",\"c\",\"d\"]";
        let (manifest, bins) = bins_of(payload, 3);
        assert_eq!(manifest.count, 6);
        assert_eq!(reassemble(&key(), BinType::TaskData, &manifest, bins).unwrap(), payload);
    }

    #[test]
    fn test_missing_bin_is_reported() {
        let (manifest, mut bins) = bins_of(b"0123456789", 4);
        bins.remove(&1);
        let err = reassemble(&key(), BinType::Subtask, &manifest, bins).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(err.to_string().contains("bin 1 of 3 missing"));
    }

    #[test]
    fn test_stale_bin_detected_by_digest() {
        let (manifest, mut bins) = bins_of(b"0123456789", 4);
        bins.insert(2, b"zz".to_vec());
        let err = reassemble(&key(), BinType::TaskData, &manifest, bins).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_leftover_bins_ignored() {
        let (manifest, mut bins) = bins_of(b"short", 4);
        bins.insert(7, b"leftover".to_vec());
        assert_eq!(
            reassemble(&key(), BinType::TaskData, &manifest, bins).unwrap(),
            b"short"
        );
    }
}
