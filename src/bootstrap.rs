//! Blocking startup until the registry answers

use crate::backoff::Backoff;
use crate::error::RegistryError;
use crate::registry::{with_timeout, Registry};
use std::time::Duration;
use tracing::{info, warn};

/// Connect to the registry, retrying forever
///
/// `connect` builds a client (bounded by its own dial timeout); the client
/// is then probed with a status call bounded by `probe_timeout`. Any
/// failure drops the client and sleeps for the backoff's next delay.
pub async fn wait_for_registry<R, F>(
    mut connect: F,
    probe_timeout: Duration,
    backoff: &mut dyn Backoff,
) -> R
where
    R: Registry,
    F: FnMut() -> Result<R, RegistryError>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        let failure = match connect() {
            Ok(client) => match with_timeout(probe_timeout, client.status()).await {
                Ok(()) => {
                    backoff.reset();
                    info!(attempt, "Connected to registry");
                    return client;
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        warn!(attempt, error = %failure, retry_in = ?delay, "Registry not reachable, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use crate::registry::{Revision, Snapshot, WatchStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Registry whose status probe fails a fixed number of times
    struct Flaky {
        failures_left: Arc<AtomicU32>,
        hang: bool,
    }

    #[async_trait]
    impl Registry for Flaky {
        async fn status(&self) -> Result<(), RegistryError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RegistryError::Status {
                    status: 503,
                    message: "not ready".to_string(),
                });
            }
            Ok(())
        }

        async fn snapshot(&self, _prefix: &str) -> Result<Snapshot, RegistryError> {
            Ok(Snapshot::default())
        }

        async fn watch(&self, _prefix: &str, _start: Revision) -> Result<WatchStream, RegistryError> {
            Err(RegistryError::Cancelled("unused".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_registry_connects_immediately() {
        let start = Instant::now();
        let mut backoff = ConstantBackoff::default();
        let failures = Arc::new(AtomicU32::new(0));

        wait_for_registry(
            || {
                Ok(Flaky {
                    failures_left: failures.clone(),
                    hang: false,
                })
            },
            Duration::from_secs(2),
            &mut backoff,
        )
        .await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connect_and_probe_failures() {
        let start = Instant::now();
        let mut backoff = ConstantBackoff::new(Duration::from_secs(1));
        let failures = Arc::new(AtomicU32::new(2));
        let mut connects = 0u32;

        wait_for_registry(
            || {
                connects += 1;
                if connects == 1 {
                    return Err(RegistryError::InvalidEndpoint {
                        endpoint: "http://etcd1:2379".to_string(),
                        reason: "dial failed".to_string(),
                    });
                }
                Ok(Flaky {
                    failures_left: failures.clone(),
                    hang: false,
                })
            },
            Duration::from_secs(2),
            &mut backoff,
        )
        .await;

        // one failed dial + two failed probes, one second apart each
        assert_eq!(connects, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_is_bounded() {
        let start = Instant::now();
        let mut backoff = ConstantBackoff::new(Duration::from_secs(1));
        let failures = Arc::new(AtomicU32::new(0));
        let mut connects = 0u32;

        wait_for_registry(
            || {
                connects += 1;
                Ok(Flaky {
                    failures_left: failures.clone(),
                    hang: connects == 1,
                })
            },
            Duration::from_secs(2),
            &mut backoff,
        )
        .await;

        // 2s probe timeout, then 1s backoff, then success
        assert_eq!(connects, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
