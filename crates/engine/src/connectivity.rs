//! Startup wait for the storage backend.

use visitstat_storage::{HealthProbe, StorageError, VisitStore};

use crate::{
    config::ConnectivityConfig,
    error::{EngineError, EngineResult},
};

/// Polls the store with startup probes until it is reachable.
///
/// Each probe is bounded by `probe_timeout` and failed probes are spaced
/// by `interval`. Degraded stores count as reachable. Returns the number
/// of probes made.
///
/// # Errors
///
/// Returns [`EngineError::Unavailable`] once `max_attempts` probes have
/// failed. Callers treat this as fatal at startup.
#[tracing::instrument(skip_all, fields(max_attempts = config.max_attempts))]
pub async fn wait_for_connectivity<S: VisitStore + ?Sized>(
    store: &S,
    config: &ConnectivityConfig,
) -> EngineResult<u32> {
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match tokio::time::timeout(config.probe_timeout, store.health_check(HealthProbe::Startup)).await {
            Ok(Ok(status)) if status.is_available() => {
                tracing::info!(attempt, "storage reachable");
                return Ok(attempt);
            },
            Ok(Ok(status)) => {
                tracing::debug!(attempt, reason = status.reason(), "storage unhealthy");
                last_error = None;
            },
            Ok(Err(err)) => {
                tracing::debug!(attempt, error = %err, "connectivity probe failed");
                last_error = Some(err);
            },
            Err(_) => {
                tracing::debug!(
                    attempt,
                    timeout_ms = config.probe_timeout.as_millis() as u64,
                    "connectivity probe timed out"
                );
                last_error = Some(StorageError::timeout());
            },
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    tracing::warn!(attempts = config.max_attempts, "storage unreachable, giving up");
    Err(EngineError::Unavailable { attempts: config.max_attempts, source: last_error })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use visitstat_storage::{MemoryVisitStore, testutil::FlakyStore};

    use super::*;

    fn config(max_attempts: u32) -> ConnectivityConfig {
        ConnectivityConfig::builder()
            .interval(Duration::from_millis(10))
            .probe_timeout(Duration::from_millis(100))
            .max_attempts(max_attempts)
            .build()
            .expect("valid config")
    }

    #[tokio::test]
    async fn test_reachable_store_needs_one_probe() {
        let store = MemoryVisitStore::new();
        assert_eq!(wait_for_connectivity(&store, &config(3)).await.expect("reachable"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failed_probes() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_health_times(2);

        let attempts = wait_for_connectivity(&store, &config(5)).await.expect("reachable");
        assert_eq!(attempts, 3);
        assert_eq!(store.health_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_health_times(u32::MAX);

        let err = wait_for_connectivity(&store, &config(4)).await.expect_err("unreachable");
        assert!(matches!(
            err,
            EngineError::Unavailable { attempts: 4, source: Some(StorageError::Connection { .. }) }
        ));
        assert_eq!(store.health_calls(), 4);
    }
}
