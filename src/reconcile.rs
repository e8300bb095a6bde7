//! Full-state reconciliation
//!
//! Every trigger re-reads the whole backend set; watch events are never
//! used to decide what to render. Failures below this layer are logged and
//! absorbed so the previous configuration and process stay in charge. The
//! one exception is a proxy that cannot be started, which is returned to
//! the caller.

use crate::backend::BackendSet;
use crate::error::{StartupError, SupervisorError};
use crate::install::Installer;
use crate::process::ProcessSupervisor;
use crate::registry::{with_timeout, Registry, Revision, Snapshot};
use crate::render::{render, RenderSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New configuration installed and the proxy (re)started on it
    Activated { pid: u32, backends: usize },
    /// Registry had no backends; nothing touched
    SkippedEmpty,
    /// Snapshot read failed or timed out; nothing touched
    FetchFailed,
    /// Validation or file publication failed; live configuration unchanged
    InstallFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Revision of the snapshot acted on, when one was read
    pub revision: Option<Revision>,
    pub outcome: Outcome,
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    prefix: String,
    fetch_timeout: Duration,
    settings: RenderSettings,
    installer: Installer,
    supervisor: Arc<ProcessSupervisor>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        prefix: impl Into<String>,
        fetch_timeout: Duration,
        settings: RenderSettings,
        installer: Installer,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            fetch_timeout,
            settings,
            installer,
            supervisor,
        }
    }

    /// Read the current backend set and converge the proxy onto it
    pub async fn reconcile(&self) -> Result<ReconcileReport, SupervisorError> {
        let snapshot =
            match with_timeout(self.fetch_timeout, self.registry.snapshot(&self.prefix)).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch backends, keeping current configuration");
                    return Ok(ReconcileReport {
                        revision: None,
                        outcome: Outcome::FetchFailed,
                    });
                }
            };

        self.apply(snapshot).await
    }

    /// Initial fetch and activation at startup
    ///
    /// Unlike [`reconcile`](Self::reconcile), a failed fetch is an error here:
    /// there is no previous configuration to fall back to. Returns the
    /// revision the watch should resume from, one past the snapshot.
    pub async fn first_activation(&self) -> Result<(Revision, ReconcileReport), StartupError> {
        let snapshot = with_timeout(self.fetch_timeout, self.registry.snapshot(&self.prefix))
            .await
            .map_err(StartupError::Fetch)?;

        info!(
            backends = snapshot.kvs.len(),
            revision = %snapshot.revision,
            "Found {} backend(s)",
            snapshot.kvs.len()
        );

        let start = snapshot.revision.next();
        let report = self.apply(snapshot).await?;
        if report.outcome == Outcome::SkippedEmpty {
            info!("Waiting for backends to register");
        }

        Ok((start, report))
    }

    /// Converge onto an already fetched snapshot
    pub async fn apply(&self, snapshot: Snapshot) -> Result<ReconcileReport, SupervisorError> {
        let revision = Some(snapshot.revision);
        let backends = BackendSet::from_kvs(&self.prefix, &snapshot.kvs);

        if backends.is_empty() {
            warn!(revision = %snapshot.revision, "No backends registered, keeping current configuration");
            return Ok(ReconcileReport {
                revision,
                outcome: Outcome::SkippedEmpty,
            });
        }

        let config = render(&backends, &self.settings);
        let installed = match self.installer.install(&config).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(error = %e, "Configuration not installed, keeping current configuration");
                return Ok(ReconcileReport {
                    revision,
                    outcome: Outcome::InstallFailed,
                });
            }
        };

        let handle = self.supervisor.activate(&installed.path)?;
        info!(
            pid = handle.pid,
            backends = backends.len(),
            revision = %snapshot.revision,
            "Proxy reloaded"
        );

        Ok(ReconcileReport {
            revision,
            outcome: Outcome::Activated {
                pid: handle.pid,
                backends: backends.len(),
            },
        })
    }
}
