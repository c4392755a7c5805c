//! Stemcell Runtime - stemcell upload pipeline.
//!
//! This crate extracts and verifies stemcell archives, negotiates formats with
//! every configured CPI, uploads the image and records the result in the
//! stemcell catalog.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod catalog;
pub mod cpi;
pub mod digest;
pub mod fetch;
pub mod negotiate;
pub mod registry;
pub mod update_stemcell;

// Re-export common types
pub use archive::{StemcellArchive, IMAGE_FILE, MANIFEST_FILE};
pub use catalog::{CatalogStore, CatalogTransaction, CommitSummary, FileCatalog, MemoryCatalog};
pub use cpi::{CloudProperties, Cpi, CpiProvider, CpiTarget, ExternalCpi, ExternalCpiProvider};
pub use digest::{DigestTool, ExpectedDigest, IntegrityVerifier, MultiDigestTool, VerifiedDigest};
pub use fetch::{HttpFetcher, RemoteFetcher, STEMCELL_RESOURCE};
pub use negotiate::{negotiate, Negotiation};
pub use registry::{BackendHandle, CloudFactory};
pub use update_stemcell::{
    FailureKind, ProvisionState, StemcellSource, UpdateStemcell, UpdateStemcellOptions, STAGE_NAME,
};

/// Stemcell Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
