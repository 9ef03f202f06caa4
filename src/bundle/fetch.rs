// Bundle download.

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stream the artifact at `url` to `dest`, creating parent directories.
///
/// Fails on a non-success status and on I/O errors. Does not retry; a failed
/// download is recovered by re-triggering the installation.
pub async fn download_bundle(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    info!(
        "[PHASE: setup] [STEP: DOWNLOAD_BUNDLE] Downloading bundle (url={}, dest={:?})",
        url, dest
    );

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    let mut response = client
        .get(url)
        .send()
        .await
        .context("failed to download bundle")?;

    if !response.status().is_success() {
        anyhow::bail!(
            "unexpected status {} from bundle URL",
            response.status().as_u16()
        );
    }

    let mut out = fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create file {:?}", dest))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("failed to read bundle body")?
    {
        out.write_all(&chunk)
            .await
            .context("failed to write bundle")?;
        written += chunk.len() as u64;
    }
    out.flush().await.context("failed to flush bundle file")?;

    info!(
        "[PHASE: setup] [STEP: DOWNLOAD_BUNDLE] Bundle downloaded (dest={:?}, bytes={})",
        dest, written
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_bytes;

    #[tokio::test]
    async fn download_streams_body_to_destination() {
        let payload = b"-- baseline\nCREATE TABLE t (id INT);\n".to_vec();
        let base = serve_bytes(payload.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("db-bundle.zip");

        let client = reqwest::Client::new();
        download_bundle(&client, &format!("{}/bundle.zip", base), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn download_fails_on_non_success_status() {
        let base = serve_bytes(vec![]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db-bundle.zip");

        let client = reqwest::Client::new();
        let err = download_bundle(&client, &format!("{}/missing.zip", base), &dest)
            .await
            .unwrap_err();

        assert!(
            err.to_string().contains("unexpected status 404"),
            "unexpected error: {err:#}"
        );
        assert!(!dest.exists(), "no file should be written on HTTP failure");
    }
}
