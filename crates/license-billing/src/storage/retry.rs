use crate::error::Result;
use crate::metrics::BillingMetrics;
use std::future::Future;
use tracing::warn;

/// Runs `attempt`, retrying it once when it fails with a concurrency
/// conflict. The retry re-reads all state, so `attempt` must not capture
/// anything read by the failed run. A second conflict is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(
    operation: &str,
    metrics: Option<&BillingMetrics>,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Err(err) if err.is_conflict() => {
            warn!("Conflict during {}, retrying once: {}", operation, err);
            if let Some(metrics) = metrics {
                metrics.record_conflict_retry(operation);
            }
            attempt().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BillingCycle, OwnerId};
    use crate::error::BillingError;
    use crate::storage::cycles::{BillingCycleRepository, MockBillingCycleRepository};
    use chrono::{TimeZone, Utc};
    use mockall::Sequence;

    fn conflict() -> BillingError {
        BillingError::ConcurrencyConflict {
            operation: "find_or_create_billing_cycle".to_string(),
            message: "duplicate key value violates unique constraint".to_string(),
        }
    }

    fn cycle() -> BillingCycle {
        BillingCycle::new(
            "monthly".to_string(),
            OwnerId::new("owner-1"),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once() {
        let expected = cycle();
        let returned = expected.clone();
        let mut repo = MockBillingCycleRepository::new();
        let mut seq = Sequence::new();
        repo.expect_find_or_create_billing_cycle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(conflict()));
        repo.expect_find_or_create_billing_cycle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(returned.clone()));

        let metrics = BillingMetrics::new().unwrap();
        let stored = retry_on_conflict("find_or_create_billing_cycle", Some(&metrics), || {
            repo.find_or_create_billing_cycle(&expected)
        })
        .await
        .unwrap();

        assert_eq!(stored, expected);
        let expected_metric =
            "billing_conflicts_retried_total{operation=\"find_or_create_billing_cycle\"} 1";
        assert!(metrics.render().unwrap().contains(expected_metric));
    }

    #[tokio::test]
    async fn test_second_conflict_is_surfaced() {
        let requested = cycle();
        let mut repo = MockBillingCycleRepository::new();
        repo.expect_find_or_create_billing_cycle()
            .times(2)
            .returning(|_| Err(conflict()));

        let result = retry_on_conflict("find_or_create_billing_cycle", None, || {
            repo.find_or_create_billing_cycle(&requested)
        })
        .await;

        assert!(matches!(
            result,
            Err(BillingError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let requested = cycle();
        let mut repo = MockBillingCycleRepository::new();
        repo.expect_find_or_create_billing_cycle()
            .times(1)
            .returning(|_| Err(BillingError::validation("start", "after end")));

        let result = retry_on_conflict("find_or_create_billing_cycle", None, || {
            repo.find_or_create_billing_cycle(&requested)
        })
        .await;

        assert!(matches!(result, Err(BillingError::ValidationError { .. })));
    }
}
