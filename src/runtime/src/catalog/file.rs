//! File-backed catalog.
//!
//! The catalog is stored as JSON in `<store_dir>/catalog.json`. Commits write
//! the whole document to `catalog.json.tmp` and rename it over the original,
//! so readers never see a partially applied transaction. Writers serialize on
//! `<store_dir>/catalog.lock`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::FileExt;
use stemcell_core::error::{Result, StemcellError};
use stemcell_core::{CatalogEntry, EvaluationRecord, StemcellKey};

use super::{CatalogDocument, CatalogStore, CatalogTransaction, CommitSummary};

const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "catalog.lock";

/// Catalog persisted to a JSON file.
///
/// Reads load the file as it is on disk. Commits hold an exclusive lock on
/// `catalog.lock` while they re-read, apply and replace the document, so
/// several director processes can share one store directory.
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileCatalog {
    /// Open the catalog under `store_dir`, creating the directory if needed.
    pub async fn open(store_dir: impl AsRef<Path>) -> Result<Self> {
        let store_dir = store_dir.as_ref();
        tokio::fs::create_dir_all(store_dir).await.map_err(|e| {
            StemcellError::CatalogError(format!(
                "failed to create catalog directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let path = store_dir.join(CATALOG_FILE);
        let document = load(&path).await?;
        tracing::debug!(
            path = %path.display(),
            stemcells = document.stemcells.len(),
            evaluations = document.evaluations.len(),
            "Opened stemcell catalog"
        );

        Ok(Self {
            path,
            lock_path: store_dir.join(LOCK_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until this process holds the store lock.
    ///
    /// The lock is released when the returned file is dropped.
    async fn lock(&self) -> Result<File> {
        let lock_path = self.lock_path.clone();
        let acquired = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StemcellError::CatalogError(format!("catalog lock task failed: {}", e)))?;

        acquired.map_err(|e| {
            StemcellError::CatalogError(format!(
                "failed to lock {}: {}",
                self.lock_path.display(),
                e
            ))
        })
    }

    async fn save(&self, document: &CatalogDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(document)
            .map_err(|e| StemcellError::CatalogError(format!("failed to serialize catalog: {}", e)))?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await.map_err(|e| {
            StemcellError::CatalogError(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            StemcellError::CatalogError(format!(
                "failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })
    }
}

async fn load(path: &Path) -> Result<CatalogDocument> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CatalogDocument::default()),
        Err(e) => {
            return Err(StemcellError::CatalogError(format!(
                "failed to read catalog {}: {}",
                path.display(),
                e
            )))
        }
    };

    serde_json::from_str(&data).map_err(|e| {
        StemcellError::CatalogError(format!("failed to parse catalog {}: {}", path.display(), e))
    })
}

#[async_trait]
impl CatalogStore for FileCatalog {
    async fn find_stemcell(&self, key: StemcellKey<'_>) -> Result<Option<CatalogEntry>> {
        Ok(load(&self.path).await?.find_stemcell(key).cloned())
    }

    async fn has_evaluation(&self, key: StemcellKey<'_>) -> Result<bool> {
        Ok(load(&self.path).await?.has_evaluation(key))
    }

    async fn stemcells(&self, name: &str, version: &str) -> Result<Vec<CatalogEntry>> {
        Ok(load(&self.path).await?.stemcells_for(name, version))
    }

    async fn evaluations(&self, name: &str, version: &str) -> Result<Vec<EvaluationRecord>> {
        Ok(load(&self.path).await?.evaluations_for(name, version))
    }

    async fn list(&self) -> Result<Vec<CatalogEntry>> {
        Ok(load(&self.path).await?.stemcells)
    }

    async fn commit(&self, tx: CatalogTransaction) -> Result<CommitSummary> {
        let _lock = self.lock().await?;

        // Apply to the document as it is now, not as it was at open
        let mut document = load(&self.path).await?;
        let summary = document.apply(tx);
        self.save(&document).await?;

        tracing::debug!(
            path = %self.path.display(),
            stemcells = summary.stemcells,
            evaluations = summary.evaluations,
            "Committed catalog transaction"
        );
        Ok(summary)
    }
}
