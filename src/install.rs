//! Validated, atomic publication of rendered configuration
//!
//! The rendered text is written to a staging file next to the live one,
//! checked with the proxy's own syntax checker, and only then renamed over
//! the live path. A failure at any step leaves the live file untouched; a
//! rejected staging file is kept for inspection.

use crate::error::InstallError;
use crate::render::RenderedConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Checks a candidate configuration file before it goes live
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// `Ok(())` when the file at `path` is a valid configuration, otherwise
    /// `InstallError::ValidationFailed`
    async fn check(&self, path: &Path) -> Result<(), InstallError>;
}

/// A configuration that passed validation and is now live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub path: PathBuf,
}

pub struct Installer {
    live_path: PathBuf,
    staging_path: PathBuf,
    validator: Arc<dyn ConfigValidator>,
}

impl Installer {
    pub fn new(
        live_path: impl Into<PathBuf>,
        staging_path: impl Into<PathBuf>,
        validator: Arc<dyn ConfigValidator>,
    ) -> Self {
        Self {
            live_path: live_path.into(),
            staging_path: staging_path.into(),
            validator,
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Stage, validate and atomically publish `config`
    pub async fn install(&self, config: &RenderedConfig) -> Result<Installed, InstallError> {
        tokio::fs::write(&self.staging_path, config.as_bytes())
            .await
            .map_err(|source| InstallError::WriteFailed {
                path: self.staging_path.clone(),
                source,
            })?;
        debug!(path = %self.staging_path.display(), bytes = config.as_str().len(), "Staged configuration");

        self.validator.check(&self.staging_path).await?;

        tokio::fs::rename(&self.staging_path, &self.live_path)
            .await
            .map_err(|source| InstallError::WriteFailed {
                path: self.live_path.clone(),
                source,
            })?;

        info!(path = %self.live_path.display(), "Configuration installed");
        Ok(Installed {
            path: self.live_path.clone(),
        })
    }
}
