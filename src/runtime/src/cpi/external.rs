//! External CPI client.
//!
//! Each call spawns the CPI executable, writes one JSON request to its
//! stdin and reads one JSON response from its stdout:
//!
//! ```text
//! request:  {"method": "info", "arguments": [], "context": {...}, "api_version": 2}
//! response: {"result": {...}, "error": null, "log": "..."}
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stemcell_core::error::{CpiError, Result, StemcellError, NOT_IMPLEMENTED_ERROR_TYPE};
use stemcell_core::CpiInfo;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CloudProperties, Cpi, CpiProvider, CpiTarget};

#[derive(Debug, Serialize)]
struct CpiRequest<'a> {
    method: &'a str,
    arguments: Vec<Value>,
    context: Value,
    api_version: u32,
}

#[derive(Debug, Deserialize)]
struct CpiResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<CpiResponseError>,
    #[serde(default)]
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CpiResponseError {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    ok_to_retry: bool,
}

/// CPI reached by spawning an executable.
#[derive(Debug, Clone)]
pub struct ExternalCpi {
    alias: String,
    exec_path: PathBuf,
    director_uuid: String,
    properties: serde_json::Map<String, Value>,
    api_version: u32,
    timeout: Duration,
}

impl ExternalCpi {
    pub fn new(
        alias: impl Into<String>,
        target: &CpiTarget,
        director_uuid: impl Into<String>,
        api_version: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            alias: alias.into(),
            exec_path: target.exec_path.clone(),
            director_uuid: director_uuid.into(),
            properties: target.properties.clone(),
            api_version,
            timeout,
        }
    }

    fn context(&self) -> Value {
        let mut context = self.properties.clone();
        context.insert("director_uuid".to_string(), json!(self.director_uuid));
        context.insert(
            "request_id".to_string(),
            json!(format!("cpi-{}", uuid::Uuid::new_v4().simple())),
        );
        Value::Object(context)
    }

    async fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> std::result::Result<Value, CpiError> {
        let request = CpiRequest {
            method,
            arguments,
            context: self.context(),
            api_version: self.api_version,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| CpiError::Protocol(format!("failed to encode request: {}", e)))?;

        tracing::debug!(
            cpi = %self.alias,
            method,
            exec = %self.exec_path.display(),
            "Invoking external CPI"
        );

        let exchange = async {
            let mut child = Command::new(&self.exec_path)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(CpiError::Timeout {
                    method: method.to_string(),
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        let response: CpiResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
            CpiError::Protocol(format!(
                "invalid response from {} (exit status {}): {}; stderr: {}",
                self.exec_path.display(),
                output.status,
                e,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        })?;

        if let Some(log) = response.log.as_deref().filter(|l| !l.is_empty()) {
            tracing::debug!(cpi = %self.alias, method, log, "CPI log");
        }

        match response.error {
            Some(error) if error.error_type == NOT_IMPLEMENTED_ERROR_TYPE => {
                Err(CpiError::NotImplemented {
                    method: method.to_string(),
                })
            }
            Some(error) => Err(CpiError::Failed {
                error_type: error.error_type,
                message: error.message,
                ok_to_retry: error.ok_to_retry,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait]
impl Cpi for ExternalCpi {
    async fn info(&self) -> std::result::Result<CpiInfo, CpiError> {
        let result = self.invoke("info", Vec::new()).await?;
        if result.is_null() {
            return Ok(CpiInfo::default());
        }
        serde_json::from_value(result)
            .map_err(|e| CpiError::Protocol(format!("invalid info result: {}", e)))
    }

    async fn create_stemcell(
        &self,
        image_path: &Path,
        cloud_properties: &CloudProperties,
    ) -> std::result::Result<String, CpiError> {
        let arguments = vec![
            json!(image_path.to_string_lossy()),
            Value::Object(cloud_properties.clone()),
        ];
        match self.invoke("create_stemcell", arguments).await? {
            Value::String(cid) if !cid.is_empty() => Ok(cid),
            other => Err(CpiError::Protocol(format!(
                "create_stemcell returned no stemcell id: {}",
                other
            ))),
        }
    }
}

/// Provider spawning external CPI executables.
#[derive(Debug, Clone)]
pub struct ExternalCpiProvider {
    director_uuid: String,
    api_version: u32,
    timeout: Duration,
}

impl ExternalCpiProvider {
    pub fn new(director_uuid: impl Into<String>, api_version: u32, timeout: Duration) -> Self {
        Self {
            director_uuid: director_uuid.into(),
            api_version,
            timeout,
        }
    }
}

impl CpiProvider for ExternalCpiProvider {
    fn connect(&self, alias: &str, target: &CpiTarget) -> Result<Arc<dyn Cpi>> {
        if !target.exec_path.is_file() {
            return Err(StemcellError::BackendUnavailable {
                alias: alias.to_string(),
                message: format!("CPI executable not found: {}", target.exec_path.display()),
            });
        }
        Ok(Arc::new(ExternalCpi::new(
            alias,
            target,
            self.director_uuid.clone(),
            self.api_version,
            self.timeout,
        )))
    }
}
