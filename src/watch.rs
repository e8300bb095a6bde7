//! The watch loop: change stream in, serialized reconciliations out
//!
//! ```text
//! Bootstrapping -> Streaming -> (stream error / end) -> Restarting -> Streaming
//!                      |
//!                      +-> (compacted / undecodable / operator resync) -> Resyncing -> Streaming
//! ```
//!
//! Batches are handled one at a time and each reconciliation completes
//! before the stream is polled again. Resync requests and shutdown are only
//! looked at between batches or while backing off.

use crate::backoff::Backoff;
use crate::error::SupervisorError;
use crate::reconcile::Reconciler;
use crate::registry::{EventKind, Registry, Revision, WatchBatch};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Bootstrapping,
    Streaming,
    Restarting,
    Resyncing,
}

pub struct WatchLoop {
    registry: Arc<dyn Registry>,
    reconciler: Arc<Reconciler>,
    prefix: String,
    cursor: Revision,
    state: WatchState,
    backoff: Box<dyn Backoff>,
    resync_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WatchLoop {
    /// `start` is the first revision to stream (one past the snapshot
    /// used for the initial activation).
    pub fn new(
        registry: Arc<dyn Registry>,
        reconciler: Arc<Reconciler>,
        prefix: impl Into<String>,
        start: Revision,
        backoff: Box<dyn Backoff>,
        resync_rx: mpsc::Receiver<()>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            reconciler,
            prefix: prefix.into(),
            cursor: start,
            state: WatchState::Bootstrapping,
            backoff,
            resync_rx,
            shutdown_rx,
        }
    }

    pub fn cursor(&self) -> Revision {
        self.cursor
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Run until shutdown is requested
    ///
    /// Returns the final cursor, or the fatal error if the proxy could not
    /// be started during a reconciliation.
    pub async fn run(mut self) -> Result<Revision, SupervisorError> {
        loop {
            if self.shutdown_requested() {
                return Ok(self.stop());
            }

            self.transition(WatchState::Streaming);
            info!(cursor = %self.cursor, prefix = %self.prefix, "Watching for backend changes");

            let opened = self.registry.watch(&self.prefix, self.cursor).await;
            let failure = match opened {
                Ok(mut stream) => loop {
                    tokio::select! {
                        biased;
                        changed = self.shutdown_rx.changed() => {
                            if changed.is_err() || *self.shutdown_rx.borrow() {
                                return Ok(self.stop());
                            }
                        }
                        Some(()) = self.resync_rx.recv() => {
                            info!("Resync requested");
                            self.resync().await?;
                            self.transition(WatchState::Streaming);
                        }
                        item = stream.next() => match item {
                            Some(Ok(batch)) => self.handle_batch(batch).await?,
                            Some(Err(e)) => break Some(e),
                            None => break None,
                        },
                    }
                },
                Err(e) => Some(e),
            };

            match failure {
                Some(e) if e.needs_resync() => {
                    warn!(error = %e, cursor = %self.cursor, "Watch cannot resume here, resynchronizing");
                    let stuck_at = self.cursor;
                    // Reopen right away only if the snapshot moved us past it
                    if self.resync().await? && self.cursor > stuck_at {
                        continue;
                    }
                }
                Some(e) => warn!(error = %e, cursor = %self.cursor, "Watch stream failed"),
                None => warn!(cursor = %self.cursor, "Watch stream closed"),
            }

            self.transition(WatchState::Restarting);
            let delay = self.backoff.next_delay();
            info!(retry_in = ?delay, cursor = %self.cursor, "Restarting watch stream");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return Ok(self.stop());
                    }
                }
            }
        }
    }

    async fn handle_batch(&mut self, batch: WatchBatch) -> Result<(), SupervisorError> {
        for event in &batch.events {
            match event.kind {
                EventKind::Put => {
                    info!(key = %event.key, value = %event.value, "Backend registered or updated")
                }
                EventKind::Delete => info!(key = %event.key, "Backend removed"),
            }
        }

        self.advance(batch.revision.next());
        self.backoff.reset();

        self.reconciler.reconcile().await?;
        Ok(())
    }

    /// Full reconcile outside the stream. Returns whether a snapshot was
    /// read; on success the cursor moves past it.
    async fn resync(&mut self) -> Result<bool, SupervisorError> {
        self.transition(WatchState::Resyncing);
        let report = self.reconciler.reconcile().await?;
        match report.revision {
            Some(revision) => {
                self.advance(revision.next());
                self.backoff.reset();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Never moves the cursor backwards
    fn advance(&mut self, next: Revision) {
        if next > self.cursor {
            debug!(from = %self.cursor, to = %next, "Cursor advanced");
            self.cursor = next;
        }
    }

    fn transition(&mut self, next: WatchState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Watch state changed");
            self.state = next;
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        *self.shutdown_rx.borrow_and_update()
    }

    fn stop(&self) -> Revision {
        info!(cursor = %self.cursor, "Watch loop stopped");
        self.cursor
    }
}
