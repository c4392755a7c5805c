//! Stemcell Core - Foundational Types for the Stemcell Director
//!
//! This crate provides the errors, configuration, catalog records and
//! progress events shared by the director runtime and its CLI.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod stemcell;

// Re-export commonly used types
pub use agent::{normalize_reply, AgentReply, RawReply};
pub use config::{CpiConfig, DefaultCpiConfig, DirectorConfig, LogFormat};
pub use error::{CpiError, Result, StemcellError};
pub use event::{EventLog, NoopProgress, ProgressReporter, StageEvent, StageEventKind};
pub use stemcell::{
    stemcell_path, CatalogEntry, CpiInfo, EvaluationRecord, FormatConstraint, StemcellKey,
    DEFAULT_CPI_ALIAS,
};

/// Stemcell Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
