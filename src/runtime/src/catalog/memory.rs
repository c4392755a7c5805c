//! In-memory catalog for tests and embedding.

use async_trait::async_trait;
use parking_lot::RwLock;
use stemcell_core::error::Result;
use stemcell_core::{CatalogEntry, EvaluationRecord, StemcellKey};

use super::{CatalogDocument, CatalogStore, CatalogTransaction, CommitSummary};

/// Catalog kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    document: RwLock<CatalogDocument>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of evaluation records across all stemcells.
    pub fn evaluation_count(&self) -> usize {
        self.document.read().evaluations.len()
    }

    /// Number of stemcell rows across all stemcells.
    pub fn stemcell_count(&self) -> usize {
        self.document.read().stemcells.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find_stemcell(&self, key: StemcellKey<'_>) -> Result<Option<CatalogEntry>> {
        Ok(self.document.read().find_stemcell(key).cloned())
    }

    async fn has_evaluation(&self, key: StemcellKey<'_>) -> Result<bool> {
        Ok(self.document.read().has_evaluation(key))
    }

    async fn stemcells(&self, name: &str, version: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self.document.read().stemcells_for(name, version))
    }

    async fn evaluations(&self, name: &str, version: &str) -> Result<Vec<EvaluationRecord>> {
        Ok(self.document.read().evaluations_for(name, version))
    }

    async fn list(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.document.read().stemcells.clone())
    }

    async fn commit(&self, tx: CatalogTransaction) -> Result<CommitSummary> {
        Ok(self.document.write().apply(tx))
    }
}
