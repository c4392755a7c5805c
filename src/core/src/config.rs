use crate::error::{Result, StemcellError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable naming the director configuration file.
pub const CONFIG_ENV_VAR: &str = "STEMCELL_DIRECTOR_CONFIG";

/// Director configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    /// UUID sent to CPIs in the request context
    pub director_uuid: String,

    /// Directory holding the stemcell catalog
    pub store_dir: PathBuf,

    /// Scratch directory for downloads and extraction
    pub tmp_dir: PathBuf,

    /// Path to the multi-digest verification tool
    pub verify_multidigest_path: PathBuf,

    /// CPI API version requested from CPIs
    pub preferred_cpi_api_version: u32,

    /// Timeout for a single CPI call in seconds
    pub cpi_timeout_secs: u64,

    /// Timeout for the digest tool in seconds
    pub digest_timeout_secs: u64,

    /// Log output format
    pub log_format: LogFormat,

    /// Named CPIs. Empty means the single default CPI is used.
    pub cpis: Vec<CpiConfig>,

    /// Settings for the default CPI (alias "")
    pub default_cpi: Option<DefaultCpiConfig>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        let home = base_dir();
        Self {
            director_uuid: uuid::Uuid::new_v4().to_string(),
            store_dir: home.join("catalog"),
            tmp_dir: std::env::temp_dir(),
            verify_multidigest_path: PathBuf::from("verify-multidigest"),
            preferred_cpi_api_version: 2,
            cpi_timeout_secs: 600,
            digest_timeout_secs: 300,
            log_format: LogFormat::Text,
            cpis: Vec::new(),
            default_cpi: None,
        }
    }
}

impl DirectorConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StemcellError::ConfigError(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_yaml(&data)?;
        tracing::debug!(path = %path.display(), cpis = config.cpis.len(), "Loaded director config");
        Ok(config)
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: DirectorConfig = serde_yaml::from_str(data)
            .map_err(|e| StemcellError::ConfigError(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file path: explicit path, then
    /// `$STEMCELL_DIRECTOR_CONFIG`, then `~/.stemcell/director.yml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        base_dir().join("director.yml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.verify_multidigest_path.as_os_str().is_empty() {
            return Err(StemcellError::ConfigError(
                "verify_multidigest_path must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for cpi in &self.cpis {
            if cpi.name.is_empty() {
                return Err(StemcellError::ConfigError(
                    "CPI name must not be empty".to_string(),
                ));
            }
            if cpi.exec_path.as_os_str().is_empty() {
                return Err(StemcellError::ConfigError(format!(
                    "CPI '{}' has an empty exec_path",
                    cpi.name
                )));
            }
            for alias in cpi.all_aliases() {
                if !seen.insert(alias) {
                    return Err(StemcellError::ConfigError(format!(
                        "CPI alias '{}' is configured more than once",
                        alias
                    )));
                }
            }
        }

        if let Some(default_cpi) = &self.default_cpi {
            if default_cpi.exec_path.as_os_str().is_empty() {
                return Err(StemcellError::ConfigError(
                    "default_cpi has an empty exec_path".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// A named CPI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpiConfig {
    pub name: String,

    /// CPI executable
    pub exec_path: PathBuf,

    /// Additional names resolving to the same CPI
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Properties passed to the CPI in the request context
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl CpiConfig {
    /// The CPI name followed by its extra aliases.
    pub fn all_aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// The CPI used when no named CPIs are configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultCpiConfig {
    pub exec_path: PathBuf,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Base directory for director state (~/.stemcell).
fn base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".stemcell"))
        .unwrap_or_else(|| PathBuf::from(".stemcell"))
}
