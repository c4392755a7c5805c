//! Catalog records and backend capability types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Alias used when no CPI is explicitly configured.
pub const DEFAULT_CPI_ALIAS: &str = "";

/// A stemcell provisioned into one CPI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    /// CPI alias the stemcell was created in ("" for the default CPI)
    pub cpi: String,
    /// Content id assigned by the CPI
    pub cid: String,
    pub digest: String,
    pub operating_system: Option<String>,
    pub api_version: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn key(&self) -> StemcellKey<'_> {
        StemcellKey::new(&self.name, &self.version, &self.cpi)
    }
}

/// Marker that a CPI was evaluated for a stemcell, whether or not a
/// stemcell was created in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub name: String,
    pub version: String,
    pub cpi: String,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, cpi: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            cpi: cpi.into(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> StemcellKey<'_> {
        StemcellKey::new(&self.name, &self.version, &self.cpi)
    }
}

/// Borrowed `(name, version, cpi)` lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StemcellKey<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub cpi: &'a str,
}

impl<'a> StemcellKey<'a> {
    pub fn new(name: &'a str, version: &'a str, cpi: &'a str) -> Self {
        Self { name, version, cpi }
    }
}

/// Identifier returned for a stemcell upload.
pub fn stemcell_path(name: &str, version: &str) -> String {
    format!("/stemcells/{}/{}", name, version)
}

/// Capability info returned by a CPI `info` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpiInfo {
    #[serde(default)]
    pub stemcell_formats: Option<Vec<String>>,
    #[serde(default)]
    pub api_version: Option<u32>,
}

/// Image formats a CPI accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatConstraint {
    /// The CPI does not restrict stemcell formats
    Unconstrained,
    /// The CPI only accepts these formats
    Constrained(BTreeSet<String>),
}

impl FormatConstraint {
    /// An absent or empty format list imposes no constraint.
    pub fn from_info(info: &CpiInfo) -> Self {
        match &info.stemcell_formats {
            Some(formats) if !formats.is_empty() => {
                FormatConstraint::Constrained(formats.iter().cloned().collect())
            }
            _ => FormatConstraint::Unconstrained,
        }
    }

    pub fn constrained<I, S>(formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FormatConstraint::Constrained(formats.into_iter().map(Into::into).collect())
    }
}
