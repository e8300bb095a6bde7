//! Supervision of the local proxy process
//!
//! The supervisor tracks the pid of the proxy instance currently serving
//! traffic. The first activation starts a fresh instance; every later one
//! starts a new instance and hands it the old pid so it can take over the
//! listening sockets while the old one drains and exits.

use crate::error::{InstallError, SupervisorError};
use crate::install::ConfigValidator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The proxy instance currently tracked by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Starts proxy instances
pub trait ProxyLauncher: Send + Sync {
    /// Start an instance reading `config_path`. With `handoff_from`, the new
    /// instance takes over from that pid gracefully. Returns the new pid.
    fn launch(&self, config_path: &Path, handoff_from: Option<u32>) -> Result<u32, SupervisorError>;
}

/// The `haproxy` executable, used both to check and to run configurations
#[derive(Debug, Clone)]
pub struct ProxyBinary {
    binary: PathBuf,
}

impl ProxyBinary {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn name(&self) -> String {
        self.binary.display().to_string()
    }
}

#[async_trait]
impl ConfigValidator for ProxyBinary {
    async fn check(&self, path: &Path) -> Result<(), InstallError> {
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| InstallError::ValidationFailed {
                path: path.to_path_buf(),
                detail: format!("could not run {}: {}", self.name(), e),
            })?;

        if output.status.success() {
            debug!(path = %path.display(), "Configuration check passed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let diagnostics = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };

        Err(InstallError::ValidationFailed {
            path: path.to_path_buf(),
            detail: if diagnostics.is_empty() {
                output.status.to_string()
            } else {
                format!("{}: {}", output.status, diagnostics)
            },
        })
    }
}

impl ProxyLauncher for ProxyBinary {
    fn launch(&self, config_path: &Path, handoff_from: Option<u32>) -> Result<u32, SupervisorError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f").arg(config_path).arg("-db");
        if let Some(old_pid) = handoff_from {
            cmd.arg("-sf").arg(old_pid.to_string());
        }
        // Proxy output goes straight to ours for operators
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let spawn_error = |source| SupervisorError::Spawn {
            binary: self.name(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before reporting a pid",
            ))
        })?;

        // Reap the instance whenever it exits (replaced ones exit after draining)
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(pid, %status, "Proxy process exited"),
                Ok(status) => warn!(pid, %status, "Proxy process exited with failure"),
                Err(e) => warn!(pid, error = %e, "Failed to wait for proxy process"),
            }
        });

        Ok(pid)
    }
}

/// Owns the tracked [`ProcessHandle`]
///
/// Activations are serialized by an internal lock held across the whole
/// read-launch-record sequence, so concurrent callers can never hand off
/// from the same old pid twice.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProxyLauncher>,
    handle: Mutex<Option<ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn ProxyLauncher>) -> Self {
        Self {
            launcher,
            handle: Mutex::new(None),
        }
    }

    /// The instance currently serving traffic, if any
    pub fn current(&self) -> Option<ProcessHandle> {
        *self.handle.lock()
    }

    /// Start (or gracefully replace) the proxy on `config_path`
    ///
    /// On error the tracked handle is unchanged; callers treat the error as
    /// fatal.
    pub fn activate(&self, config_path: &Path) -> Result<ProcessHandle, SupervisorError> {
        let mut tracked = self.handle.lock();
        let previous = tracked.map(|h| h.pid);

        match previous {
            Some(old_pid) => info!(old_pid, "Gracefully reloading proxy"),
            None => info!("Starting proxy for the first time"),
        }

        let pid = self.launcher.launch(config_path, previous)?;
        let handle = ProcessHandle { pid };
        *tracked = Some(handle);

        info!(pid, config = %config_path.display(), "Proxy running");
        Ok(handle)
    }
}
