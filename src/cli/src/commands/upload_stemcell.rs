//! `stemcell-director upload-stemcell` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use stemcell_core::{DirectorConfig, EventLog};
use stemcell_runtime::{
    CloudFactory, ExternalCpiProvider, FileCatalog, IntegrityVerifier, MultiDigestTool,
    UpdateStemcell, UpdateStemcellOptions,
};
use tokio::sync::broadcast::error::RecvError;

use crate::output;

#[derive(Args)]
pub struct UploadStemcellArgs {
    /// Stemcell tarball path, or an http://, https:// or file:// URL
    pub stemcell: String,

    /// Expected digest ("sha1:<hex>;sha256:<hex>", a bare value is SHA-1)
    #[arg(long)]
    pub sha1: Option<String>,

    /// Upload again to CPIs that already have this stemcell
    #[arg(long)]
    pub fix: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: UploadStemcellArgs,
    config: &DirectorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = Arc::new(FileCatalog::open(&config.store_dir).await?);
    let provider = ExternalCpiProvider::new(
        config.director_uuid.clone(),
        config.preferred_cpi_api_version,
        Duration::from_secs(config.cpi_timeout_secs),
    );
    let clouds = CloudFactory::from_config(config, Arc::new(provider));
    let digest_tool = MultiDigestTool::new(
        &config.verify_multidigest_path,
        Duration::from_secs(config.digest_timeout_secs),
    );

    // The job deletes its input, so hand it a scratch copy once setup is done
    let mut options = if is_url(&args.stemcell) {
        UpdateStemcellOptions::remote(&args.stemcell)
    } else {
        UpdateStemcellOptions::local(stage_copy(Path::new(&args.stemcell), &config.tmp_dir).await?)
    };
    options = options.with_fix(args.fix);
    if let Some(sha1) = &args.sha1 {
        options = options.with_expected_digest(sha1);
    }

    tracing::debug!(
        source = %args.stemcell,
        fix = args.fix,
        cpis = config.cpis.len(),
        "Starting stemcell upload"
    );

    let events = EventLog::new(256);
    let printer = (!args.quiet).then(|| {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => println!("{}", output::format_event(&event)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let job = UpdateStemcell::new(
        options,
        clouds,
        catalog,
        IntegrityVerifier::new(Arc::new(digest_tool)),
    )
    .with_progress(Arc::new(events))
    .with_tmp_dir(&config.tmp_dir);

    let result = job.perform().await;
    // Closes the event channel so the printer drains and exits
    drop(job);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let path = result?;
    if !args.quiet {
        println!("Uploaded stemcell: {path}");
    } else {
        println!("{path}");
    }
    Ok(())
}

fn is_url(source: &str) -> bool {
    ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| source.starts_with(scheme))
}

/// Copy `source` into a fresh file under `tmp_dir`.
async fn stage_copy(source: &Path, tmp_dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if !source.is_file() {
        return Err(format!("stemcell file not found: {}", source.display()).into());
    }
    tokio::fs::create_dir_all(tmp_dir).await?;
    let dest = tmp_dir.join(format!("stemcell-upload-{}.tgz", std::process::id()));
    tokio::fs::copy(source, &dest).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/stemcell.tgz"));
        assert!(is_url("http://example.com/stemcell.tgz"));
        assert!(is_url("file:///tmp/stemcell.tgz"));
        assert!(!is_url("/tmp/stemcell.tgz"));
        assert!(!is_url("stemcell.tgz"));
    }

    #[tokio::test]
    async fn test_stage_copy_keeps_source() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("stemcell.tgz");
        std::fs::write(&source, b"tarball").unwrap();

        let staged = stage_copy(&source, &tmp.path().join("work")).await.unwrap();
        assert_ne!(staged, source);
        assert!(source.exists());
        assert_eq!(std::fs::read(&staged).unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn test_failed_setup_leaves_no_staged_copy() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("stemcell.tgz");
        std::fs::write(&source, b"tarball").unwrap();
        // A plain file where the store directory should be
        let store_dir = tmp.path().join("store");
        std::fs::write(&store_dir, b"").unwrap();

        let config = DirectorConfig {
            store_dir,
            tmp_dir: tmp.path().join("work"),
            ..DirectorConfig::default()
        };
        let args = UploadStemcellArgs {
            stemcell: source.display().to_string(),
            sha1: None,
            fix: false,
            quiet: true,
        };

        assert!(execute(args, &config).await.is_err());
        assert!(source.exists());
        let staged = std::fs::read_dir(&config.tmp_dir).map_or(0, |dir| dir.count());
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_stage_copy_missing_source() {
        let tmp = TempDir::new().unwrap();
        let err = stage_copy(&tmp.path().join("missing.tgz"), tmp.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stemcell file not found"));
    }
}
