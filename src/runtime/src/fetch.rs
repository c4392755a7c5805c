//! Remote stemcell download.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use stemcell_core::error::{Result, StemcellError};
use tokio::io::AsyncWriteExt;

/// Resource kind used for stemcell downloads.
pub const STEMCELL_RESOURCE: &str = "stemcell";

/// Materializes a remote resource at a local path.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Download `url` to `dest`. `resource` names what is being fetched and
    /// only appears in errors and logs.
    async fn fetch(&self, resource: &str, url: &str, dest: &Path) -> Result<()>;
}

/// Fetcher for `http://`, `https://` and `file://` URLs.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, resource: &str, url: &str, dest: &Path) -> Result<u64> {
        let fail = |message: String| fetch_error(resource, url, message);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("unexpected HTTP status {}", status)));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| fail(format!("failed to create {}: {}", dest.display(), e)))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("failed to write {}: {}", dest.display(), e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| fail(format!("failed to write {}: {}", dest.display(), e)))?;

        Ok(written)
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, resource: &str, url: &str, dest: &Path) -> Result<()> {
        tracing::info!(resource, url, dest = %dest.display(), "Downloading remote resource");

        let bytes = if let Some(local) = url.strip_prefix("file://") {
            tokio::fs::copy(local, dest)
                .await
                .map_err(|e| fetch_error(resource, url, e.to_string()))?
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.download(resource, url, dest).await?
        } else {
            return Err(fetch_error(resource, url, "unsupported URL scheme".to_string()));
        };

        tracing::debug!(resource, url, bytes, "Downloaded remote resource");
        Ok(())
    }
}

fn fetch_error(resource: &str, url: &str, message: String) -> StemcellError {
    StemcellError::FetchError {
        resource: resource.to_string(),
        url: url.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_file_url() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("stemcell.tgz");
        std::fs::write(&source, b"tarball").unwrap();
        let dest = tmp.path().join("downloaded.tgz");

        let url = format!("file://{}", source.display());
        HttpFetcher::new()
            .fetch(STEMCELL_RESOURCE, &url, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = HttpFetcher::new()
            .fetch(STEMCELL_RESOURCE, "file:///nonexistent/stemcell.tgz", &tmp.path().join("x"))
            .await
            .unwrap_err();
        match err {
            StemcellError::FetchError { resource, url, .. } => {
                assert_eq!(resource, "stemcell");
                assert_eq!(url, "file:///nonexistent/stemcell.tgz");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_unsupported_scheme() {
        let tmp = TempDir::new().unwrap();
        let err = HttpFetcher::new()
            .fetch(STEMCELL_RESOURCE, "ftp://example.com/stemcell.tgz", &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }
}
