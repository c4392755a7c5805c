//! Compute provider interfaces.
//!
//! Backends are reached through the [`Cpi`] trait. [`CpiProvider`] builds a
//! handle for an alias; the director's default provider spawns external CPI
//! executables ([`ExternalCpiProvider`]).

mod external;

pub use external::{ExternalCpi, ExternalCpiProvider};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stemcell_core::error::{CpiError, Result};
use stemcell_core::CpiInfo;

/// Cloud properties handed to `create_stemcell`.
pub type CloudProperties = serde_json::Map<String, serde_json::Value>;

/// Trait for compute provider implementations.
#[async_trait]
pub trait Cpi: Send + Sync {
    /// Report capabilities. Returns `CpiError::NotImplemented` if the CPI
    /// predates the `info` method.
    async fn info(&self) -> std::result::Result<CpiInfo, CpiError>;

    /// Upload an image and return the CPI-assigned content id.
    async fn create_stemcell(
        &self,
        image_path: &Path,
        cloud_properties: &CloudProperties,
    ) -> std::result::Result<String, CpiError>;
}

/// Physical CPI settings an alias resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct CpiTarget {
    /// Configured CPI name ("" for the default CPI)
    pub name: String,
    pub exec_path: PathBuf,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Builds CPI handles.
pub trait CpiProvider: Send + Sync {
    /// Create a handle for `alias`. Each call returns a new handle.
    fn connect(&self, alias: &str, target: &CpiTarget) -> Result<Arc<dyn Cpi>>;
}
