//! Stemcell catalog storage.
//!
//! The catalog holds two record kinds: [`CatalogEntry`] for every stemcell
//! created in a CPI and [`EvaluationRecord`] for every CPI a stemcell upload
//! has examined. A run buffers its rows in a [`CatalogTransaction`] and hands
//! it to [`CatalogStore::commit`] once; either every row becomes visible or
//! none does.

mod file;
mod memory;

pub use file::FileCatalog;
pub use memory::MemoryCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stemcell_core::error::Result;
use stemcell_core::{CatalogEntry, EvaluationRecord, StemcellKey};

/// Rows buffered by one run, committed together.
#[derive(Debug, Default, Clone)]
pub struct CatalogTransaction {
    stemcells: Vec<CatalogEntry>,
    evaluations: Vec<EvaluationRecord>,
}

impl CatalogTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a stemcell row. A later row for the same key replaces an
    /// earlier one.
    pub fn record_stemcell(&mut self, entry: CatalogEntry) {
        match self.stemcells.iter_mut().find(|e| e.key() == entry.key()) {
            Some(existing) => *existing = entry,
            None => self.stemcells.push(entry),
        }
    }

    /// Buffer an evaluation row. Re-recording a key is a no-op.
    pub fn record_evaluation(&mut self, record: EvaluationRecord) {
        if !self.evaluations.iter().any(|e| e.key() == record.key()) {
            self.evaluations.push(record);
        }
    }

    pub fn stemcells(&self) -> &[CatalogEntry] {
        &self.stemcells
    }

    pub fn evaluations(&self) -> &[EvaluationRecord] {
        &self.evaluations
    }

    pub fn is_empty(&self) -> bool {
        self.stemcells.is_empty() && self.evaluations.is_empty()
    }
}

/// Rows written by a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub stemcells: usize,
    pub evaluations: usize,
}

/// Backend for the stemcell catalog.
///
/// Implementations must apply [`CatalogTransaction`]s atomically.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Get the stemcell for `(name, version, cpi)`, if any.
    async fn find_stemcell(&self, key: StemcellKey<'_>) -> Result<Option<CatalogEntry>>;

    /// Whether `(name, version, cpi)` has been evaluated before.
    async fn has_evaluation(&self, key: StemcellKey<'_>) -> Result<bool>;

    /// All stemcells for `name`/`version` across CPIs, in insertion order.
    async fn stemcells(&self, name: &str, version: &str) -> Result<Vec<CatalogEntry>>;

    /// All evaluation records for `name`/`version`.
    async fn evaluations(&self, name: &str, version: &str) -> Result<Vec<EvaluationRecord>>;

    /// Every stemcell in the catalog.
    async fn list(&self) -> Result<Vec<CatalogEntry>>;

    /// Apply all rows of `tx` as one unit.
    async fn commit(&self, tx: CatalogTransaction) -> Result<CommitSummary>;
}

/// Serialized catalog contents shared by the store implementations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    stemcells: Vec<CatalogEntry>,
    #[serde(default)]
    evaluations: Vec<EvaluationRecord>,
}

impl CatalogDocument {
    fn find_stemcell(&self, key: StemcellKey<'_>) -> Option<&CatalogEntry> {
        self.stemcells.iter().find(|e| e.key() == key)
    }

    fn has_evaluation(&self, key: StemcellKey<'_>) -> bool {
        self.evaluations.iter().any(|e| e.key() == key)
    }

    fn stemcells_for(&self, name: &str, version: &str) -> Vec<CatalogEntry> {
        self.stemcells
            .iter()
            .filter(|e| e.name == name && e.version == version)
            .cloned()
            .collect()
    }

    fn evaluations_for(&self, name: &str, version: &str) -> Vec<EvaluationRecord> {
        self.evaluations
            .iter()
            .filter(|e| e.name == name && e.version == version)
            .cloned()
            .collect()
    }

    /// Stemcell rows replace existing rows with the same key; evaluation
    /// rows are only added when missing.
    fn apply(&mut self, tx: CatalogTransaction) -> CommitSummary {
        let summary = CommitSummary {
            stemcells: tx.stemcells.len(),
            evaluations: tx.evaluations.len(),
        };

        for entry in tx.stemcells {
            match self.stemcells.iter_mut().find(|e| e.key() == entry.key()) {
                Some(existing) => *existing = entry,
                None => self.stemcells.push(entry),
            }
        }
        for record in tx.evaluations {
            if !self.has_evaluation(record.key()) {
                self.evaluations.push(record);
            }
        }

        summary
    }
}

#[cfg(test)]
pub(crate) fn test_entry(name: &str, version: &str, cpi: &str, cid: &str) -> CatalogEntry {
    CatalogEntry {
        name: name.to_string(),
        version: version.to_string(),
        cpi: cpi.to_string(),
        cid: cid.to_string(),
        digest: "shawone".to_string(),
        operating_system: Some(format!("{}-{}", name, version)),
        api_version: None,
        created_at: chrono::Utc::now(),
    }
}
