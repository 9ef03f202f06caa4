// Content integrity verification.

use anyhow::{bail, Context, Result};
use log::info;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Expected digests by bundle-relative path, as declared in `checksums.json`.
pub type ChecksumMap = BTreeMap<String, String>;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Strip an optional case-insensitive `sha256:` prefix from an expected value.
pub fn normalize_checksum(expected: &str) -> &str {
    const PREFIX: &str = "sha256:";
    if expected.len() > PREFIX.len() && expected[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        &expected[PREFIX.len()..]
    } else {
        expected
    }
}

/// Read and parse `checksums.json` from `base_dir`.
pub fn load_checksums(base_dir: &Path) -> Result<ChecksumMap> {
    let data =
        fs::read(base_dir.join("checksums.json")).context("failed to read checksums.json")?;
    serde_json::from_slice(&data).context("failed to parse checksums.json")
}

/// Verify that every listed file hashes to its expected digest.
///
/// Files present in the bundle but absent from the map are ignored.
pub fn verify_checksums(base_dir: &Path, checksums: &ChecksumMap) -> Result<()> {
    for (rel_path, expected) in checksums {
        let data = fs::read(base_dir.join(rel_path))
            .with_context(|| format!("failed to read {} for checksum", rel_path))?;
        let actual = sha256_hex(&data);
        let expected_norm = normalize_checksum(expected);
        if actual != expected_norm {
            bail!(
                "checksum mismatch for {}: expected={} actual={}",
                rel_path,
                expected_norm,
                actual
            );
        }
    }
    info!(
        "[PHASE: setup] [STEP: VERIFY_CHECKSUM] All checksums verified (files={})",
        checksums.len()
    );
    Ok(())
}
