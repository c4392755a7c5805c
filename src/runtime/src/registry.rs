//! CPI alias resolution.
//!
//! Resolves the configured CPI aliases in configuration order and hands out
//! one [`BackendHandle`] per alias. Aliases sharing a physical CPI still get
//! separate handles.

use std::collections::HashMap;
use std::sync::Arc;

use stemcell_core::config::DirectorConfig;
use stemcell_core::error::{Result, StemcellError};
use stemcell_core::{FormatConstraint, DEFAULT_CPI_ALIAS};

use crate::cpi::{Cpi, CpiProvider, CpiTarget};

/// Handle to the CPI behind one alias, created fresh for each run.
#[derive(Clone)]
pub struct BackendHandle {
    alias: String,
    cpi: Arc<dyn Cpi>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    pub fn new(alias: impl Into<String>, cpi: Arc<dyn Cpi>) -> Self {
        Self {
            alias: alias.into(),
            cpi,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn cpi(&self) -> &Arc<dyn Cpi> {
        &self.cpi
    }

    /// Query the CPI's stemcell format constraint.
    ///
    /// A CPI without an `info` method imposes no constraint. Any other
    /// failure means the CPI is unusable for this run.
    pub async fn capabilities(&self) -> Result<FormatConstraint> {
        match self.cpi.info().await {
            Ok(info) => Ok(FormatConstraint::from_info(&info)),
            Err(e) if e.is_not_implemented() => {
                tracing::debug!(cpi = %self.alias, "CPI does not implement info, assuming no format constraint");
                Ok(FormatConstraint::Unconstrained)
            }
            Err(e) => Err(StemcellError::BackendUnavailable {
                alias: self.alias.clone(),
                message: format!("info failed: {}", e),
            }),
        }
    }
}

/// Resolves CPI aliases to handles.
pub struct CloudFactory {
    aliases: Vec<String>,
    targets: HashMap<String, CpiTarget>,
    provider: Arc<dyn CpiProvider>,
}

impl CloudFactory {
    /// Build from explicit targets. Aliases are kept in the given order,
    /// with duplicates dropped.
    pub fn new(targets: Vec<(String, CpiTarget)>, provider: Arc<dyn CpiProvider>) -> Self {
        let mut aliases = Vec::new();
        let mut map = HashMap::new();
        for (alias, target) in targets {
            if map.contains_key(&alias) {
                continue;
            }
            aliases.push(alias.clone());
            map.insert(alias, target);
        }
        Self {
            aliases,
            targets: map,
            provider,
        }
    }

    /// Build from director configuration.
    ///
    /// With no named CPIs the single default alias `""` is used; it resolves
    /// to `default_cpi` when configured.
    pub fn from_config(config: &DirectorConfig, provider: Arc<dyn CpiProvider>) -> Self {
        if config.cpis.is_empty() {
            let mut factory = Self::new(Vec::new(), provider);
            factory.aliases.push(DEFAULT_CPI_ALIAS.to_string());
            if let Some(default_cpi) = &config.default_cpi {
                factory.targets.insert(
                    DEFAULT_CPI_ALIAS.to_string(),
                    CpiTarget {
                        name: DEFAULT_CPI_ALIAS.to_string(),
                        exec_path: default_cpi.exec_path.clone(),
                        properties: default_cpi.properties.clone(),
                    },
                );
            }
            return factory;
        }

        let targets = config
            .cpis
            .iter()
            .flat_map(|cpi| {
                let target = CpiTarget {
                    name: cpi.name.clone(),
                    exec_path: cpi.exec_path.clone(),
                    properties: cpi.properties.clone(),
                };
                cpi.all_aliases()
                    .map(move |alias| (alias.to_string(), target.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::new(targets, provider)
    }

    /// All aliases, unique, in configuration order.
    pub fn all_names(&self) -> &[String] {
        &self.aliases
    }

    /// Build a fresh handle for `alias`.
    pub fn get(&self, alias: &str) -> Result<BackendHandle> {
        let target = self
            .targets
            .get(alias)
            .ok_or_else(|| StemcellError::BackendUnavailable {
                alias: alias.to_string(),
                message: if alias == DEFAULT_CPI_ALIAS {
                    "no default CPI configured".to_string()
                } else {
                    "no CPI configured for this alias".to_string()
                },
            })?;
        let cpi = self.provider.connect(alias, target)?;
        Ok(BackendHandle::new(alias, cpi))
    }

    /// Build handles for every alias. Fails on the first alias that cannot
    /// be resolved.
    pub fn handles(&self) -> Result<Vec<BackendHandle>> {
        self.aliases.iter().map(|alias| self.get(alias)).collect()
    }
}
