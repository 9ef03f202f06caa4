// Bundle manifest: what to apply, and in what order.

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

use super::checksum::ChecksumMap;

/// Declarative description of the bundle contents. The order of `migrations`
/// is authoritative: it is the application order. Versions are opaque strings;
/// nothing here parses or sorts them.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(deserialize_with = "deserialize_baseline")]
    pub baseline: String,
    #[serde(default)]
    pub migrations: Vec<Migration>,
    #[serde(default)]
    pub checks: Checks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub transaction: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Checks {
    #[serde(default)]
    pub smoke: String,
}

/// `baseline` accepts a plain string or an object with a `file` or `path`
/// key; it is normalized to a string on load.
fn deserialize_baseline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BaselineField {
        Plain(String),
        Keyed {
            #[serde(default)]
            file: Option<String>,
            #[serde(default)]
            path: Option<String>,
        },
    }

    Ok(match BaselineField::deserialize(deserializer)? {
        BaselineField::Plain(s) => s,
        BaselineField::Keyed { file, path } => file
            .filter(|f| !f.is_empty())
            .or(path)
            .unwrap_or_default(),
    })
}

/// Read and parse `manifest.json` from `base_dir`.
pub fn load_manifest(base_dir: &Path) -> Result<Manifest> {
    let data = fs::read(base_dir.join("manifest.json")).context("failed to read manifest.json")?;
    let manifest: Manifest =
        serde_json::from_slice(&data).context("failed to parse manifest.json")?;
    info!(
        "[PHASE: setup] [STEP: PARSE_MANIFEST] Manifest parsed (baseline={}, migrations={}, smoke={})",
        manifest.baseline,
        manifest.migrations.len(),
        manifest.checks.smoke
    );
    Ok(manifest)
}

impl Manifest {
    /// Structural validation: versions must be unique, and every referenced
    /// path must be listed in the checksum map and resolve inside the bundle.
    pub fn validate(&self, checksums: &ChecksumMap) -> Result<()> {
        let mut referenced: Vec<&str> = vec![self.baseline.as_str()];
        referenced.extend(self.migrations.iter().map(|m| m.file.as_str()));
        if !self.checks.smoke.is_empty() {
            referenced.push(self.checks.smoke.as_str());
        }

        for rel_path in referenced {
            if rel_path.is_empty() {
                bail!("manifest references an empty path");
            }
            let path = Path::new(rel_path);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
            if escapes {
                bail!("manifest path escapes the bundle: {}", rel_path);
            }
            if !checksums.contains_key(rel_path) {
                bail!("manifest path missing from checksums.json: {}", rel_path);
            }
        }

        let mut seen = HashSet::new();
        for migration in &self.migrations {
            if !seen.insert(migration.version.as_str()) {
                bail!(
                    "duplicate migration version in manifest: {}",
                    migration.version
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::checksum::sha256_hex;

    fn parse(json: &str) -> Manifest {
        serde_json::from_str(json).unwrap()
    }

    fn checksums_for(paths: &[&str]) -> ChecksumMap {
        paths
            .iter()
            .map(|p| (p.to_string(), sha256_hex(p.as_bytes())))
            .collect()
    }

    #[test]
    fn baseline_accepts_plain_string() {
        let m = parse(r#"{"baseline": "base.sql", "migrations": []}"#);
        assert_eq!(m.baseline, "base.sql");
    }

    #[test]
    fn baseline_accepts_object_with_file_key() {
        let m = parse(r#"{"baseline": {"file": "sql/base.sql"}, "migrations": []}"#);
        assert_eq!(m.baseline, "sql/base.sql");
    }

    #[test]
    fn baseline_accepts_object_with_path_key() {
        let m = parse(r#"{"baseline": {"path": "sql/base.sql"}, "migrations": []}"#);
        assert_eq!(m.baseline, "sql/base.sql");
    }

    #[test]
    fn baseline_prefers_file_over_path() {
        let m = parse(r#"{"baseline": {"file": "a.sql", "path": "b.sql"}, "migrations": []}"#);
        assert_eq!(m.baseline, "a.sql");
    }

    #[test]
    fn migration_order_is_preserved_as_declared() {
        // INTENT: manifest order is the application order; versions are
        // opaque, so a lexically "later" version may legally come first.
        let m = parse(
            r#"{
                "baseline": "base.sql",
                "migrations": [
                    {"version": "010", "name": "tables", "file": "m_tables.sql", "transaction": true},
                    {"version": "002", "name": "index", "file": "m_index.sql"}
                ]
            }"#,
        );
        let versions: Vec<&str> = m.migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, ["010", "002"]);
        assert!(m.migrations[0].transaction);
        assert!(!m.migrations[1].transaction, "transaction defaults to false");
    }

    #[test]
    fn smoke_check_is_optional() {
        let m = parse(r#"{"baseline": "base.sql", "migrations": []}"#);
        assert!(m.checks.smoke.is_empty());

        let m = parse(
            r#"{"baseline": "base.sql", "migrations": [], "checks": {"smoke": "smoke.sql"}}"#,
        );
        assert_eq!(m.checks.smoke, "smoke.sql");
    }

    #[test]
    fn load_fails_when_manifest_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(dir.path()).unwrap_err();
        assert!(err.to_string().contains("failed to read manifest.json"));
    }

    #[test]
    fn load_fails_on_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"{not json").unwrap();
        let err = load_manifest(dir.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse manifest.json"));
    }

    #[test]
    fn validate_rejects_duplicate_versions() {
        let m = parse(
            r#"{
                "baseline": "base.sql",
                "migrations": [
                    {"version": "001", "file": "a.sql"},
                    {"version": "001", "file": "b.sql"}
                ]
            }"#,
        );
        let checksums = checksums_for(&["base.sql", "a.sql", "b.sql"]);
        let err = m.validate(&checksums).unwrap_err();
        assert!(err.to_string().contains("duplicate migration version"));
    }

    #[test]
    fn validate_rejects_path_not_listed_in_checksums() {
        let m = parse(r#"{"baseline": "base.sql", "migrations": [{"version": "001", "file": "a.sql"}]}"#);
        let checksums = checksums_for(&["base.sql"]);
        let err = m.validate(&checksums).unwrap_err();
        assert!(err
            .to_string()
            .contains("manifest path missing from checksums.json: a.sql"));
    }

    #[test]
    fn validate_rejects_escaping_paths() {
        let m = parse(r#"{"baseline": "../outside.sql", "migrations": []}"#);
        let checksums = checksums_for(&["../outside.sql"]);
        let err = m.validate(&checksums).unwrap_err();
        assert!(err.to_string().contains("escapes the bundle"));
    }
}
