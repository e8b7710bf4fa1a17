//! Launcher download.
//!
//! The QEMU backend is driven by `anyvm.py`, pinned per release through
//! `ANYVM_VERSION` and fetched fresh on every run.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::HostError;
use crate::Result;

/// Release URL of the pinned launcher script.
pub fn anyvm_url(version: &str) -> String {
    format!("https://raw.githubusercontent.com/anyvm-org/anyvm/v{version}/anyvm.py")
}

/// HTTP client used for every download.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("vmrun/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Download `url` to `dest`. Redirects are followed; any final status other
/// than success is an error and leaves nothing at `dest`.
pub async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    info!("Downloading {} to {:?}", url, dest);

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HostError::Download {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = dest.with_extension("part");
    tokio::fs::write(&partial, &body).await?;
    tokio::fs::rename(&partial, dest).await?;

    debug!(bytes = body.len(), "download complete");
    Ok(())
}

/// Fetch `anyvm.py` at `version` into `action_dir`.
pub async fn fetch_launcher(
    client: &reqwest::Client,
    version: &str,
    action_dir: &Path,
) -> Result<PathBuf> {
    let dest = action_dir.join("anyvm.py");
    download_file(client, &anyvm_url(version), &dest).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_launcher_url_is_pinned() {
        assert_eq!(
            anyvm_url("0.1.9"),
            "https://raw.githubusercontent.com/anyvm-org/anyvm/v0.1.9/anyvm.py"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_leaves_no_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("anyvm.py");
        let client = http_client().unwrap();

        let err = download_file(&client, "http://127.0.0.1:9/anyvm.py", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Http(_)));
        assert!(!dest.exists());
    }
}
