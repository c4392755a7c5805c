//! Update stemcell job.
//!
//! Admits one stemcell archive into every configured CPI:
//!
//! ```text
//! [Fetching] -> Extracting -> Verifying -> Negotiating -> PerBackendProcessing -> Committing -> Done
//!                                                                            any state -> Failed
//! ```
//!
//! CPIs are processed one at a time in alias order. Catalog rows produced by
//! the run are buffered in a [`CatalogTransaction`] and committed once at the
//! end, so a CPI failure leaves the catalog exactly as it was before the run.
//! Stemcells already created in earlier CPIs of a failed run are not deleted.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use stemcell_core::error::{Result, StemcellError};
use stemcell_core::event::{NoopProgress, ProgressReporter};
use stemcell_core::{stemcell_path, CatalogEntry, EvaluationRecord, StemcellKey};

use crate::archive::StemcellArchive;
use crate::catalog::{CatalogStore, CatalogTransaction};
use crate::digest::IntegrityVerifier;
use crate::fetch::{HttpFetcher, RemoteFetcher, STEMCELL_RESOURCE};
use crate::negotiate::{negotiate, Negotiation};
use crate::registry::{BackendHandle, CloudFactory};

/// Event stage announced by the job.
pub const STAGE_NAME: &str = "Update stemcell";

/// Name of the downloaded archive inside the download directory.
const DOWNLOAD_FILE: &str = "stemcell.tgz";

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    InvalidArchive,
    DigestMismatch,
    BackendUnavailable,
    BackendCreation,
    Catalog,
    Internal,
}

impl FailureKind {
    pub fn of(err: &StemcellError) -> Self {
        match err {
            StemcellError::FetchError { .. } => FailureKind::Fetch,
            StemcellError::InvalidArchive(_) => FailureKind::InvalidArchive,
            StemcellError::DigestMismatch { .. } => FailureKind::DigestMismatch,
            StemcellError::BackendUnavailable { .. } => FailureKind::BackendUnavailable,
            StemcellError::BackendCreation { .. } => FailureKind::BackendCreation,
            StemcellError::CatalogError(_) => FailureKind::Catalog,
            _ => FailureKind::Internal,
        }
    }
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Job built, not yet performed
    Pending,

    /// Downloading a remote archive
    Fetching,

    /// Unpacking the archive and reading its manifest
    Extracting,

    /// Checking the image digest
    Verifying,

    /// Resolving CPI aliases
    Negotiating,

    /// Evaluating and uploading to each CPI
    PerBackendProcessing,

    /// Writing catalog rows
    Committing,

    /// Stemcell admitted
    Done,

    /// Run aborted
    Failed(FailureKind),
}

/// Where the stemcell archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StemcellSource {
    /// Archive already on local disk; deleted once extraction was attempted
    Local(PathBuf),
    /// Archive URL (`http://`, `https://` or `file://`)
    Remote(String),
}

/// Options for one upload.
#[derive(Debug, Clone)]
pub struct UpdateStemcellOptions {
    pub source: StemcellSource,
    /// Expected digest, `sha1:<hex>;sha256:<hex>` or a bare sha1
    pub expected_digest: Option<String>,
    /// Re-upload to CPIs that were already evaluated
    pub fix: bool,
}

impl UpdateStemcellOptions {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            source: StemcellSource::Local(path.into()),
            expected_digest: None,
            fix: false,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            source: StemcellSource::Remote(url.into()),
            expected_digest: None,
            fix: false,
        }
    }

    pub fn with_expected_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }

    pub fn with_fix(mut self, fix: bool) -> Self {
        self.fix = fix;
        self
    }

    fn is_remote(&self) -> bool {
        matches!(self.source, StemcellSource::Remote(_))
    }
}

/// What happened for one CPI alias.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AliasOutcome {
    AlreadyEvaluated,
    Incompatible,
    AlreadyExists { cid: String },
    Created { cid: String },
}

impl AliasOutcome {
    fn cid(&self) -> Option<&str> {
        match self {
            AliasOutcome::AlreadyExists { cid } | AliasOutcome::Created { cid } => Some(cid),
            _ => None,
        }
    }
}

/// Uploads a stemcell to every configured CPI.
pub struct UpdateStemcell {
    options: UpdateStemcellOptions,
    clouds: CloudFactory,
    catalog: Arc<dyn CatalogStore>,
    verifier: IntegrityVerifier,
    fetcher: Arc<dyn RemoteFetcher>,
    progress: Arc<dyn ProgressReporter>,
    tmp_dir: PathBuf,
    state: Mutex<ProvisionState>,
}

impl UpdateStemcell {
    pub fn new(
        options: UpdateStemcellOptions,
        clouds: CloudFactory,
        catalog: Arc<dyn CatalogStore>,
        verifier: IntegrityVerifier,
    ) -> Self {
        Self {
            options,
            clouds,
            catalog,
            verifier,
            fetcher: Arc::new(HttpFetcher::new()),
            progress: Arc::new(NoopProgress),
            tmp_dir: std::env::temp_dir(),
            state: Mutex::new(ProvisionState::Pending),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Directory for downloads and extracted archives.
    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    pub fn state(&self) -> ProvisionState {
        *self.state.lock()
    }

    /// Number of progress steps the run announces.
    pub fn total_steps(&self) -> usize {
        // extract + verify manifest
        let mut steps = 2;
        if self.options.is_remote() {
            steps += 1;
        }
        if self.options.expected_digest.is_some() {
            steps += 1;
        }
        steps + 3 * self.clouds.all_names().len()
    }

    /// Run the upload and return the stemcell path `/stemcells/<name>/<version>`.
    pub async fn perform(&self) -> Result<String> {
        let result = self.run().await;
        match &result {
            Ok(path) => {
                self.set_state(ProvisionState::Done);
                tracing::info!(stemcell = %path, "Stemcell update finished");
            }
            Err(e) => {
                let kind = FailureKind::of(e);
                self.set_state(ProvisionState::Failed(kind));
                tracing::warn!(error = %e, kind = ?kind, "Stemcell update failed");
            }
        }
        result
    }

    async fn run(&self) -> Result<String> {
        self.progress.begin_stage(STAGE_NAME, self.total_steps());

        // Holds the remote download until the run ends
        let mut download_dir = None;
        let archive_path = match &self.options.source {
            StemcellSource::Local(path) => path.clone(),
            StemcellSource::Remote(url) => {
                self.set_state(ProvisionState::Fetching);
                tokio::fs::create_dir_all(&self.tmp_dir).await?;
                let dir = tempfile::Builder::new()
                    .prefix("stemcell-download")
                    .tempdir_in(&self.tmp_dir)?;
                let dest = dir.path().join(DOWNLOAD_FILE);
                download_dir = Some(dir);

                self.fetcher.fetch(STEMCELL_RESOURCE, url, &dest).await?;
                self.step("Downloading remote stemcell");
                dest
            }
        };

        self.set_state(ProvisionState::Extracting);
        let archive = self.extract(archive_path).await?;
        self.step("Extracting stemcell archive");
        tracing::info!(
            stemcell = %archive.name,
            version = %archive.version,
            operating_system = archive.operating_system.as_deref().unwrap_or(""),
            formats = ?archive.formats,
            "Verified stemcell manifest"
        );
        self.step("Verifying stemcell manifest");

        self.set_state(ProvisionState::Verifying);
        let digest = self
            .verifier
            .verify(&archive, self.options.expected_digest.as_deref())
            .await?;
        if digest.verified {
            self.step("Verifying stemcell digest");
        }

        self.set_state(ProvisionState::Negotiating);
        let handles = self.clouds.handles()?;

        self.set_state(ProvisionState::PerBackendProcessing);
        let mut tx = CatalogTransaction::new();
        for handle in &handles {
            let outcome = self
                .process_alias(&archive, &digest.recorded, handle, &mut tx)
                .await?;
            tracing::debug!(
                cpi = %handle.alias(),
                outcome = ?outcome,
                cid = outcome.cid().unwrap_or(""),
                "Processed CPI"
            );
        }

        self.set_state(ProvisionState::Committing);
        let summary = self.catalog.commit(tx).await?;
        tracing::info!(
            stemcell = %archive.name,
            version = %archive.version,
            stemcells = summary.stemcells,
            evaluations = summary.evaluations,
            "Committed stemcell catalog"
        );

        drop(download_dir);
        Ok(stemcell_path(&archive.name, &archive.version))
    }

    /// Unpack the archive, then delete the input file whatever the outcome.
    async fn extract(&self, archive_path: PathBuf) -> Result<StemcellArchive> {
        let path = archive_path.clone();
        let tmp_root = self.tmp_dir.clone();
        let extracted =
            match tokio::task::spawn_blocking(move || StemcellArchive::extract(&path, &tmp_root))
                .await
            {
                Ok(result) => result,
                Err(e) => Err(StemcellError::Other(format!("extraction task failed: {}", e))),
            };

        match tokio::fs::remove_file(&archive_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    archive = %archive_path.display(),
                    error = %e,
                    "Failed to delete stemcell archive"
                );
            }
        }

        extracted
    }

    async fn process_alias(
        &self,
        archive: &StemcellArchive,
        digest: &str,
        handle: &BackendHandle,
        tx: &mut CatalogTransaction,
    ) -> Result<AliasOutcome> {
        let alias = handle.alias();
        let suffix = cpi_suffix(alias);
        let stemcell = format!("{}/{}", archive.name, archive.version);
        let key = StemcellKey::new(&archive.name, &archive.version, alias);

        if !self.options.fix && self.catalog.has_evaluation(key).await? {
            tracing::debug!(cpi = %alias, stemcell = %stemcell, "Stemcell already evaluated for CPI, skipping");
            self.step(format!("Skipping check of stemcell {}: already evaluated{}", stemcell, suffix));
            self.step(format!("Skipping upload of stemcell {}: already evaluated{}", stemcell, suffix));
            self.step(format!("Skipping save of stemcell {}: already evaluated{}", stemcell, suffix));
            return Ok(AliasOutcome::AlreadyEvaluated);
        }

        self.step(format!("Checking if this stemcell already exists{}", suffix));
        let constraint = handle.capabilities().await?;
        match negotiate(archive.formats.as_ref(), &constraint) {
            Negotiation::Incompatible {
                declared,
                supported,
            } => {
                tracing::warn!(
                    cpi = %alias,
                    stemcell = %stemcell,
                    declared = ?declared,
                    supported = ?supported,
                    "Stemcell formats not supported by CPI, skipping"
                );
                tx.record_evaluation(EvaluationRecord::new(&archive.name, &archive.version, alias));
                self.step(format!("Skipping upload of stemcell {}: format mismatch{}", stemcell, suffix));
                self.step(format!("Recording evaluation of {}{}", stemcell, suffix));
                return Ok(AliasOutcome::Incompatible);
            }
            Negotiation::Compatible { shared } => {
                tracing::debug!(cpi = %alias, formats = ?shared, "Stemcell format supported by CPI");
            }
            Negotiation::Unconstrained => {
                tracing::debug!(cpi = %alias, "No stemcell format constraint");
            }
        }

        if !self.options.fix {
            if let Some(existing) = self.catalog.find_stemcell(key).await? {
                tracing::debug!(cpi = %alias, cid = %existing.cid, "Stemcell already exists in CPI");
                tx.record_evaluation(EvaluationRecord::new(&archive.name, &archive.version, alias));
                self.step(format!("Skipping upload of stemcell {}: already exists{}", stemcell, suffix));
                self.step(format!("Recording evaluation of {}{}", stemcell, suffix));
                return Ok(AliasOutcome::AlreadyExists { cid: existing.cid });
            }
        }

        self.step(format!("Uploading stemcell {} to the cloud{}", stemcell, suffix));
        let cid = handle
            .cpi()
            .create_stemcell(archive.image_path(), &archive.cloud_properties)
            .await
            .map_err(|source| StemcellError::BackendCreation {
                alias: alias.to_string(),
                source,
            })?;
        tracing::info!(cpi = %alias, stemcell = %stemcell, cid = %cid, "Created stemcell in CPI");

        tx.record_stemcell(CatalogEntry {
            name: archive.name.clone(),
            version: archive.version.clone(),
            cpi: alias.to_string(),
            cid: cid.clone(),
            digest: digest.to_string(),
            operating_system: archive.operating_system.clone(),
            api_version: archive.api_version,
            created_at: chrono::Utc::now(),
        });
        tx.record_evaluation(EvaluationRecord::new(&archive.name, &archive.version, alias));
        self.step(format!("Save stemcell {} ({}){}", stemcell, cid, suffix));

        Ok(AliasOutcome::Created { cid })
    }

    fn set_state(&self, state: ProvisionState) {
        *self.state.lock() = state;
    }

    fn step(&self, label: impl AsRef<str>) {
        self.progress.advance(Some(label.as_ref()));
    }
}

/// Label suffix naming the CPI; empty for the default CPI.
fn cpi_suffix(alias: &str) -> String {
    if alias.is_empty() {
        String::new()
    } else {
        format!(" (cpi: {})", alias)
    }
}
