//! Stemcell image integrity verification.
//!
//! Expected digests use the multi-digest notation accepted by the
//! `verify-multidigest` tool: `sha1:<hex>;sha256:<hex>`. A bare value
//! without an algorithm prefix is a sha1 digest.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use stemcell_core::error::{Result, StemcellError};
use tokio::process::Command;

use crate::archive::StemcellArchive;

/// One algorithm/value pair of an expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub algorithm: String,
    pub value: String,
}

/// A caller-supplied expected digest, possibly listing several algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    raw: String,
    entries: Vec<DigestEntry>,
}

impl ExpectedDigest {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(mismatch(raw, "expected digest is empty"));
        }

        let mut entries = Vec::new();
        for part in raw.split(';') {
            let (algorithm, value) = match part.split_once(':') {
                Some((algorithm, value)) => (algorithm.trim(), value.trim()),
                None => ("sha1", part.trim()),
            };
            if algorithm.is_empty() || value.is_empty() {
                return Err(mismatch(raw, &format!("malformed digest entry '{}'", part)));
            }
            entries.push(DigestEntry {
                algorithm: algorithm.to_ascii_lowercase(),
                value: value.to_string(),
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            entries,
        })
    }

    /// The digest string as handed to the digest tool.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn entries(&self) -> &[DigestEntry] {
        &self.entries
    }

    pub fn algorithms(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.algorithm.as_str()).collect()
    }
}

/// Outcome of verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDigest {
    /// Digest recorded in the catalog
    pub recorded: String,
    /// Whether an expected digest was checked
    pub verified: bool,
}

/// External digest checker.
#[async_trait]
pub trait DigestTool: Send + Sync {
    /// Succeeds only if `blob` matches `expected`.
    async fn verify(&self, blob: &Path, expected: &ExpectedDigest) -> Result<()>;
}

/// Runs `<tool> verify-multi-digest <blob> <expected>`; exit status 0 means
/// the digest matched.
#[derive(Debug, Clone)]
pub struct MultiDigestTool {
    path: PathBuf,
    timeout: Duration,
}

impl MultiDigestTool {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DigestTool for MultiDigestTool {
    async fn verify(&self, blob: &Path, expected: &ExpectedDigest) -> Result<()> {
        tracing::debug!(
            tool = %self.path.display(),
            blob = %blob.display(),
            algorithms = ?expected.algorithms(),
            "Running digest tool"
        );

        let output = Command::new(&self.path)
            .arg("verify-multi-digest")
            .arg(blob)
            .arg(expected.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(mismatch(
                    expected.as_str(),
                    &format!("failed to run {}: {}", self.path.display(), e),
                ))
            }
            Err(_) => {
                return Err(mismatch(
                    expected.as_str(),
                    &format!("digest tool timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(mismatch(
            expected.as_str(),
            &format!(
                "digest tool exited with status {}: {}",
                status,
                stderr.trim()
            ),
        ))
    }
}

/// Checks the extracted image against an expected digest and decides which
/// digest is recorded in the catalog.
#[derive(Clone)]
pub struct IntegrityVerifier {
    tool: Arc<dyn DigestTool>,
}

impl IntegrityVerifier {
    pub fn new(tool: Arc<dyn DigestTool>) -> Self {
        Self { tool }
    }

    /// Verify `archive` against `expected`, if given.
    ///
    /// The recorded digest is the archive's embedded digest, or a locally
    /// computed `sha256:<hex>` of the image when the manifest has none.
    pub async fn verify(
        &self,
        archive: &StemcellArchive,
        expected: Option<&str>,
    ) -> Result<VerifiedDigest> {
        let verified = match expected {
            Some(raw) => {
                let expected = ExpectedDigest::parse(raw)?;
                self.tool.verify(archive.image_path(), &expected).await?;
                tracing::info!(
                    stemcell = %archive.name,
                    version = %archive.version,
                    algorithms = ?expected.algorithms(),
                    "Stemcell digest verified"
                );
                true
            }
            None => {
                tracing::debug!(stemcell = %archive.name, "No expected digest, skipping verification");
                false
            }
        };

        let recorded = match &archive.embedded_digest {
            Some(digest) => digest.clone(),
            None => sha256_file(archive.image_path()).await?,
        };

        Ok(VerifiedDigest { recorded, verified })
    }
}

/// Compute `sha256:<hex>` of a file.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| StemcellError::Other(format!("digest task failed: {}", e)))?
}

fn mismatch(expected: &str, message: &str) -> StemcellError {
    StemcellError::DigestMismatch {
        expected: expected.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write_test_stemcell;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FakeTool {
        matches: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTool {
        fn new(matches: bool) -> Arc<Self> {
            Arc::new(Self {
                matches,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DigestTool for FakeTool {
        async fn verify(&self, _blob: &Path, expected: &ExpectedDigest) -> Result<()> {
            self.calls.lock().push(expected.as_str().to_string());
            if self.matches {
                Ok(())
            } else {
                Err(mismatch(expected.as_str(), "mismatch"))
            }
        }
    }

    fn extract(tmp: &TempDir, manifest: &str) -> StemcellArchive {
        let tarball = tmp.path().join("stemcell.tgz");
        write_test_stemcell(&tarball, manifest, b"image contents");
        StemcellArchive::extract(&tarball, tmp.path()).unwrap()
    }

    #[test]
    fn test_parse_multi_digest() {
        let digest = ExpectedDigest::parse("sha1:abcd;sha256:ef01").unwrap();
        assert_eq!(digest.as_str(), "sha1:abcd;sha256:ef01");
        assert_eq!(digest.algorithms(), vec!["sha1", "sha256"]);
        assert_eq!(digest.entries()[1].value, "ef01");
    }

    #[test]
    fn test_parse_bare_digest_is_sha1() {
        let digest = ExpectedDigest::parse("eeaec4f77e2014966f7f01e949c636b9f9992757").unwrap();
        assert_eq!(digest.algorithms(), vec!["sha1"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ExpectedDigest::parse("   "),
            Err(StemcellError::DigestMismatch { .. })
        ));
        assert!(ExpectedDigest::parse("sha1:").is_err());
        assert!(ExpectedDigest::parse(":abcd").is_err());
        assert!(ExpectedDigest::parse("sha1:abcd;").is_err());
    }

    #[tokio::test]
    async fn test_no_expected_digest_records_embedded() {
        let tmp = TempDir::new().unwrap();
        let archive = extract(
            &tmp,
            "name: jeos\nversion: 5\ncloud_properties: {}\nsha1: shawone\n",
        );
        let tool = FakeTool::new(false);
        let verifier = IntegrityVerifier::new(tool.clone());

        let result = verifier.verify(&archive, None).await.unwrap();
        assert_eq!(
            result,
            VerifiedDigest {
                recorded: "shawone".to_string(),
                verified: false
            }
        );
        assert!(tool.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_embedded_digest_records_sha256() {
        let tmp = TempDir::new().unwrap();
        let archive = extract(&tmp, "name: jeos\nversion: 5\ncloud_properties: {}\n");
        let verifier = IntegrityVerifier::new(FakeTool::new(true));

        let result = verifier.verify(&archive, None).await.unwrap();
        let expected = format!("sha256:{}", hex::encode(Sha256::digest(b"image contents")));
        assert_eq!(result.recorded, expected);
    }

    #[tokio::test]
    async fn test_matching_digest_keeps_embedded() {
        let tmp = TempDir::new().unwrap();
        let archive = extract(
            &tmp,
            "name: jeos\nversion: 5\ncloud_properties: {}\nsha1: shawone\n",
        );
        let tool = FakeTool::new(true);
        let verifier = IntegrityVerifier::new(tool.clone());

        let result = verifier.verify(&archive, Some("sha1:abcd")).await.unwrap();
        assert_eq!(result.recorded, "shawone");
        assert!(result.verified);
        assert_eq!(*tool.calls.lock(), vec!["sha1:abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_mismatching_digest_fails() {
        let tmp = TempDir::new().unwrap();
        let archive = extract(&tmp, "name: jeos\nversion: 5\ncloud_properties: {}\n");
        let verifier = IntegrityVerifier::new(FakeTool::new(false));

        let err = verifier.verify(&archive, Some("abcd1234")).await.unwrap_err();
        assert!(matches!(err, StemcellError::DigestMismatch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multi_digest_tool_exit_status() {
        let tmp = TempDir::new().unwrap();
        let blob = tmp.path().join("image");
        std::fs::write(&blob, b"image contents").unwrap();
        let expected = ExpectedDigest::parse("sha1:abcd").unwrap();

        let ok = MultiDigestTool::new("true", Duration::from_secs(10));
        assert!(ok.verify(&blob, &expected).await.is_ok());

        let failing = MultiDigestTool::new("false", Duration::from_secs(10));
        let err = failing.verify(&blob, &expected).await.unwrap_err();
        assert!(err.to_string().contains("exited with status 1"));
    }

    #[tokio::test]
    async fn test_multi_digest_tool_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let tool = MultiDigestTool::new(tmp.path().join("no-such-tool"), Duration::from_secs(10));
        let expected = ExpectedDigest::parse("sha1:abcd").unwrap();

        let err = tool.verify(&tmp.path().join("image"), &expected).await.unwrap_err();
        assert!(matches!(err, StemcellError::DigestMismatch { .. }));
        assert!(err.to_string().contains("failed to run"));
    }
}
