use thiserror::Error;

/// Error type name an external CPI reports for unsupported methods.
pub const NOT_IMPLEMENTED_ERROR_TYPE: &str = "Bosh::Clouds::NotImplemented";

/// Stemcell director error types
#[derive(Error, Debug)]
pub enum StemcellError {
    /// Archive could not be unpacked or its manifest is unusable
    #[error("Invalid stemcell archive: {0}")]
    InvalidArchive(String),

    /// Integrity check of the stemcell image failed
    #[error("Stemcell digest does not match: {message}")]
    DigestMismatch {
        expected: String,
        message: String,
    },

    /// A configured backend cannot be constructed or reached
    #[error("CPI unavailable: {alias} - {message}")]
    BackendUnavailable { alias: String, message: String },

    /// A backend failed while creating the stemcell image
    #[error("CPI '{alias}' failed to create stemcell: {source}")]
    BackendCreation {
        alias: String,
        #[source]
        source: CpiError,
    },

    /// Remote stemcell could not be downloaded
    #[error("Failed to fetch {resource} from {url}: {message}")]
    FetchError {
        resource: String,
        url: String,
        message: String,
    },

    /// Catalog storage error
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StemcellError {
    /// The backend error behind a creation failure, if any.
    pub fn cpi_error(&self) -> Option<&CpiError> {
        match self {
            StemcellError::BackendCreation { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StemcellError {
    fn from(err: serde_json::Error) -> Self {
        StemcellError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StemcellError {
    fn from(err: serde_yaml::Error) -> Self {
        StemcellError::SerializationError(err.to_string())
    }
}

/// Errors reported by a compute provider interface.
///
/// The orchestrator treats everything except `NotImplemented` opaquely.
#[derive(Error, Debug)]
pub enum CpiError {
    /// The CPI does not support the requested method
    #[error("CPI method not implemented: {method}")]
    NotImplemented { method: String },

    /// The CPI ran the method and reported a failure
    #[error("{error_type}: {message}")]
    Failed {
        error_type: String,
        message: String,
        ok_to_retry: bool,
    },

    /// The CPI did not answer in time
    #[error("CPI call '{method}' timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },

    /// The CPI answered with something that is not a valid response
    #[error("CPI protocol error: {0}")]
    Protocol(String),

    /// The CPI process could not be run
    #[error("CPI I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CpiError {
    /// Build a failure from an arbitrary message, as test doubles and
    /// in-process backends do.
    pub fn failed(message: impl Into<String>) -> Self {
        CpiError::Failed {
            error_type: "Bosh::Clouds::CloudError".to_string(),
            message: message.into(),
            ok_to_retry: false,
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, CpiError::NotImplemented { .. })
    }
}

/// Result type alias for stemcell director operations
pub type Result<T> = std::result::Result<T, StemcellError>;
