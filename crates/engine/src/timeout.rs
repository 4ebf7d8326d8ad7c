//! Time limits around storage calls.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use visitstat_storage::{Metrics, StorageError, StorageResult};

/// Runs `fut` for at most `limit`.
///
/// An elapsed limit becomes [`StorageError::Timeout`]. Timeouts and
/// errors are both counted in `metrics`.
pub(crate) async fn bounded<T, F>(limit: Duration, metrics: &Metrics, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    bounded_until(Instant::now() + limit, metrics, fut).await
}

/// Like [`bounded`] but against an absolute deadline shared by several calls.
pub(crate) async fn bounded_until<T, F>(deadline: Instant, metrics: &Metrics, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            metrics.record_error();
            Err(err)
        },
        Err(_) => {
            metrics.record_timeout();
            Err(StorageError::timeout())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_limit_is_a_timeout() {
        let metrics = Metrics::new();
        let result: StorageResult<()> = bounded(Duration::from_secs(1), &metrics, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StorageError::Timeout)));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timeout_count, 1);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_error_is_passed_through_and_counted() {
        let metrics = Metrics::new();
        let result: StorageResult<()> =
            bounded(Duration::from_secs(1), &metrics, async { Err(StorageError::internal("boom")) }).await;

        assert!(matches!(result, Err(StorageError::Internal { .. })));
        assert_eq!(metrics.snapshot().error_count, 1);
        assert_eq!(metrics.snapshot().timeout_count, 0);
    }

    #[tokio::test]
    async fn test_success_is_not_counted() {
        let metrics = Metrics::new();
        let value = bounded(Duration::from_secs(1), &metrics, async { Ok(7) }).await;
        assert!(matches!(value, Ok(7)));
        assert_eq!(metrics.snapshot().error_count, 0);
    }
}
