use crate::domain::clock::Clock;
use crate::domain::types::{License, LicenseSnapshot, LicenseStatus, RevisionId};
use crate::domain::usage::gauge::take_over;
use crate::domain::usage::{GaugeUsageGroup, UsageContext, UsageGroup};
use crate::error::Result;
use crate::metrics::BillingMetrics;
use crate::storage::usage::UsageFilter;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

/// What a revision change means for the gauge usage of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// Nothing to record
    None,
    /// First activation: register the initial usage
    RegisterInitialUsage,
    /// The previous revision was active: close its open usage and, when
    /// `reopen` is set, carry the quantity over to the new revision
    CloseOpenUsage { reopen: bool },
    /// Unsuspended: reopen the last closed quantity
    Resume,
}

impl TransitionAction {
    pub fn for_change(previous: &LicenseSnapshot, current: &License) -> Self {
        let new_status = current.status;
        match previous.status {
            status if status.is_pre_active() && new_status.is_active() => {
                TransitionAction::RegisterInitialUsage
            }
            LicenseStatus::Active => {
                if new_status.is_active() && previous.revision_id == current.revision_id {
                    TransitionAction::None
                } else {
                    TransitionAction::CloseOpenUsage {
                        reopen: new_status.is_active(),
                    }
                }
            }
            LicenseStatus::Suspended if new_status.is_active() => TransitionAction::Resume,
            _ => TransitionAction::None,
        }
    }
}

/// Result of applying a transition to one gauge group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Unchanged,
    InitialUsage(Option<Decimal>),
    Closed {
        closed: u64,
        reopened: Option<Decimal>,
    },
    Resumed(Decimal),
}

/// Keeps gauge usage in step with license revisions: registers initial
/// usage on activation, closes usage of the replaced revision, and reopens
/// it under the new one.
pub struct RevisionTransitionController {
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<BillingMetrics>>,
}

impl RevisionTransitionController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            metrics: None,
        }
    }

    pub fn from_context(context: &UsageContext) -> Self {
        Self {
            clock: context.clock.clone(),
            metrics: context.metrics.clone(),
        }
    }

    /// Applies the change from `license.previous` to `license` to the gauge.
    pub async fn on_license_change(&self, gauge: &GaugeUsageGroup) -> Result<TransitionOutcome> {
        let license = gauge.ledger().license();
        let Some(previous) = license.previous.as_ref() else {
            return Ok(TransitionOutcome::Unchanged);
        };

        let action = TransitionAction::for_change(previous, license);
        let now = self.clock.now();
        debug!(
            "License {} group {}: {} -> {} is {:?}",
            license.id,
            gauge.definition().name,
            previous.status,
            license.status,
            action
        );

        let outcome = match action {
            TransitionAction::None => return Ok(TransitionOutcome::Unchanged),
            TransitionAction::RegisterInitialUsage => {
                if self.has_revision_usage(gauge).await? {
                    return Ok(TransitionOutcome::Unchanged);
                }
                let initial = gauge.initial_usage();
                if let Some(quantity) = initial {
                    gauge
                        .add_usage(license.revision_id, quantity, now, None)
                        .await?;
                }
                TransitionOutcome::InitialUsage(initial)
            }
            TransitionAction::CloseOpenUsage { reopen } => {
                self.close_open_usage(gauge, previous.revision_id, reopen, now)
                    .await?
            }
            TransitionAction::Resume => match self.resume(gauge, now).await? {
                Some(quantity) => TransitionOutcome::Resumed(quantity),
                None => return Ok(TransitionOutcome::Unchanged),
            },
        };
        if outcome == TransitionOutcome::Unchanged {
            return Ok(outcome);
        }

        info!(
            "Applied {} -> {} to {} of license {}: {:?}",
            previous.status,
            license.status,
            gauge.definition().name,
            license.id,
            outcome
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(&previous.status.to_string(), &license.status.to_string());
        }
        Ok(outcome)
    }

    /// Closes the open usage of a group the new revision's plan no longer
    /// offers. Nothing is reopened.
    pub async fn on_group_removed(&self, gauge: &GaugeUsageGroup) -> Result<TransitionOutcome> {
        let license = gauge.ledger().license();
        let Some(previous) = license.previous.as_ref() else {
            return Ok(TransitionOutcome::Unchanged);
        };

        let outcome = self
            .close_open_usage(gauge, previous.revision_id, false, self.clock.now())
            .await?;
        if outcome == TransitionOutcome::Unchanged {
            return Ok(outcome);
        }
        info!(
            "Closed {} of license {} dropped by plan {}: {:?}",
            gauge.definition().name,
            license.id,
            license.plan_id,
            outcome
        );
        Ok(outcome)
    }

    /// Whether anything was already recorded under the license's current
    /// revision, meaning its transition has been applied.
    async fn has_revision_usage(&self, gauge: &GaugeUsageGroup) -> Result<bool> {
        let ledger = gauge.ledger();
        let license = ledger.license();
        let records = ledger
            .context()
            .usage
            .query_usage_records(
                &license.id,
                &ledger.group().name,
                &UsageFilter {
                    revision_id: Some(license.revision_id),
                    ..UsageFilter::default()
                },
            )
            .await?;
        Ok(!records.is_empty())
    }

    /// Ends the open usage of `previous_revision` one second before `now`.
    /// Returns `Unchanged` when the previous revision has nothing open, so
    /// applying the same change twice is harmless.
    async fn close_open_usage(
        &self,
        gauge: &GaugeUsageGroup,
        previous_revision: RevisionId,
        reopen: bool,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let ledger = gauge.ledger();
        let revision_id = ledger.license().revision_id;
        let metrics = self.metrics.as_deref();

        ledger
            .context()
            .mutate("close_open_usage", move || async move {
                let mut tx = ledger.begin().await?;

                let Some(carried) = tx
                    .query_usage_records(&UsageFilter::open_for_revision(previous_revision))
                    .await?
                    .last()
                    .map(|r| r.quantity)
                else {
                    return Ok(TransitionOutcome::Unchanged);
                };

                // Usage opened this very second cannot end a second earlier
                let removed = tx
                    .delete_usage_records(&UsageFilter {
                        start_at_or_after: Some(now),
                        ..UsageFilter::open_for_revision(previous_revision)
                    })
                    .await?;
                let closed = tx
                    .update_record_end(
                        &UsageFilter::open_for_revision(previous_revision),
                        now - Duration::seconds(1),
                    )
                    .await?;

                let reopened = if reopen {
                    let record = ledger.new_record(revision_id, carried, now, None);
                    take_over(tx.as_mut(), &record, metrics).await?;
                    Some(carried)
                } else {
                    None
                };

                tx.commit().await?;
                Ok(TransitionOutcome::Closed {
                    closed: closed + removed,
                    reopened,
                })
            })
            .await
    }

    /// Reopens the last closed quantity under the current revision. `None`
    /// when the current revision already has open usage.
    async fn resume(
        &self,
        gauge: &GaugeUsageGroup,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let ledger = gauge.ledger();
        let revision_id = ledger.license().revision_id;
        let metrics = self.metrics.as_deref();

        ledger
            .context()
            .mutate("resume_usage", move || async move {
                let mut tx = ledger.begin().await?;
                let resumed = tx
                    .query_usage_records(&UsageFilter::open_for_revision(revision_id))
                    .await?;
                if !resumed.is_empty() {
                    return Ok(None);
                }

                // Nothing was ever recorded: resume at zero
                let quantity = tx
                    .query_usage_records(&UsageFilter::closed())
                    .await?
                    .last()
                    .map(|r| r.quantity)
                    .unwrap_or(Decimal::ZERO);

                let record = ledger.new_record(revision_id, quantity, now, None);
                take_over(tx.as_mut(), &record, metrics).await?;
                tx.commit().await?;
                Ok(Some(quantity))
            })
            .await
    }
}
