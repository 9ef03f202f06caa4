// Bundle archive extraction with zip-slip protection.

use anyhow::{bail, Context, Result};
use log::info;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

/// Extract `src` into `dest`.
///
/// Every entry name is validated before anything touches the filesystem: an
/// entry whose cleaned target would land outside `dest` aborts the whole
/// extraction with an "illegal path" error. Symlinks are not preserved.
pub fn extract_zip(src: &Path, dest: &Path) -> Result<()> {
    info!(
        "[PHASE: setup] [STEP: EXTRACT_BUNDLE] Extracting bundle (src={:?}, dest={:?})",
        src, dest
    );

    let file = File::open(src).with_context(|| format!("failed to open zip {:?}", src))?;
    let mut archive = ZipArchive::new(file).context("failed to read zip archive")?;

    // Validate all entry names up front so a crafted path aborts before any
    // file is written.
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .with_context(|| format!("failed to read zip entry {}", i))?;
        safe_join(dest, entry.name())?;
    }

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("failed to read zip entry {}", i))?;
        let name = entry.name().to_string();
        let target = safe_join(dest, &name)?;

        if entry.is_dir() {
            create_dir_0755(&target)
                .with_context(|| format!("failed to create dir for {}", name))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            create_dir_0755(parent).with_context(|| format!("failed to create dir for {}", name))?;
        }

        let mut out =
            File::create(&target).with_context(|| format!("failed to create {:?}", target))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("failed to extract {}", name))?;
    }

    info!(
        "[PHASE: setup] [STEP: EXTRACT_BUNDLE] Bundle extracted (dest={:?}, entries={})",
        dest,
        archive.len()
    );
    Ok(())
}

/// Locate the directory containing `manifest.json`.
///
/// Handles zips with files at the root or inside a single top-level folder.
pub fn resolve_base_dir(extract_dir: &Path) -> Result<PathBuf> {
    if extract_dir.join("manifest.json").is_file() {
        return Ok(extract_dir.to_path_buf());
    }

    let entries = fs::read_dir(extract_dir).context("failed to read extract dir")?;
    for entry in entries {
        let entry = entry.context("failed to read extract dir entry")?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let candidate = entry.path();
            if candidate.join("manifest.json").is_file() {
                return Ok(candidate);
            }
        }
    }
    bail!("manifest.json not found in extracted bundle")
}

/// Join an entry name onto `dest`, rejecting absolute paths and any `..`
/// component. The surviving path is by construction inside `dest`.
fn safe_join(dest: &Path, entry_name: &str) -> Result<PathBuf> {
    let rel = Path::new(entry_name);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        bail!("illegal path in zip: {}", entry_name);
    }
    Ok(dest.join(rel))
}

fn create_dir_0755(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::zip_bytes;

    #[test]
    fn extracts_entries_under_destination() {
        let bytes = zip_bytes(&[
            ("manifest.json", b"{}".as_slice()),
            ("sql/base.sql", b"CREATE SCHEMA app;".as_slice()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bundle.zip");
        std::fs::write(&src, bytes).unwrap();

        let dest = dir.path().join("out");
        extract_zip(&src, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("manifest.json")).unwrap(), b"{}");
        assert_eq!(
            std::fs::read(dest.join("sql/base.sql")).unwrap(),
            b"CREATE SCHEMA app;"
        );
    }

    #[test]
    fn rejects_zip_slip_before_writing_anything() {
        // INTENT: a crafted `../` entry must abort extraction with no file
        // written, even when benign entries precede it.
        let bytes = zip_bytes(&[
            ("ok.sql", b"SELECT 1;".as_slice()),
            ("../evil.sql", b"DROP TABLE users;".as_slice()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bundle.zip");
        std::fs::write(&src, bytes).unwrap();

        let dest = dir.path().join("out");
        let err = extract_zip(&src, &dest).unwrap_err();

        assert!(
            err.to_string().contains("illegal path in zip"),
            "unexpected error: {err:#}"
        );
        assert!(!dir.path().join("evil.sql").exists());
        assert!(
            !dest.join("ok.sql").exists(),
            "nothing should be written when any entry is unsafe"
        );
    }

    #[test]
    fn rejects_absolute_entry_paths() {
        let bytes = zip_bytes(&[("/etc/cron.d/evil", b"boom".as_slice())]);
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bundle.zip");
        std::fs::write(&src, bytes).unwrap();

        let err = extract_zip(&src, &dir.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("illegal path in zip"));
    }

    #[test]
    fn resolve_base_dir_finds_manifest_at_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();

        assert_eq!(resolve_base_dir(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn resolve_base_dir_descends_into_single_top_level_folder() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("db-bundle-v3");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join("manifest.json"), "{}").unwrap();

        assert_eq!(resolve_base_dir(dir.path()).unwrap(), inner);
    }

    #[test]
    fn resolve_base_dir_fails_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_base_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("manifest.json not found"));
    }
}
