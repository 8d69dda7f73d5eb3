use crate::domain::types::{
    BillingCycle, ChargeableUsage, NewUsageRecord, RevisionId, UsageGroupDefinition, UsageRecord,
};
use crate::domain::usage::{UsageGroup, UsageLedger};
use crate::error::Result;
use crate::metrics::BillingMetrics;
use crate::storage::usage::{UsageFilter, UsageTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;

/// Point-in-time levels (environments, seats) held over time intervals.
///
/// Stored intervals of one scope never overlap and at most one of them is
/// open. A new record takes over its interval from whatever was stored.
#[derive(Clone)]
pub struct GaugeUsageGroup {
    ledger: UsageLedger,
}

impl GaugeUsageGroup {
    pub fn new(ledger: UsageLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Quantity to register when the license is first activated: the first
    /// resolver answer, else the group's configured initial quantity.
    pub fn initial_usage(&self) -> Option<Decimal> {
        let group = self.ledger.group();
        self.ledger
            .context()
            .resolvers
            .resolve(self.ledger.license(), &group.name)
            .or(group.initial_quantity)
    }
}

/// Inserts `record` into the locked scope of `tx`, trimming and deleting
/// the stored records it overlaps. Returns the stored record and the number
/// of records it fully superseded.
pub(crate) async fn take_over(
    tx: &mut dyn UsageTransaction,
    record: &NewUsageRecord,
    metrics: Option<&BillingMetrics>,
) -> Result<(UsageRecord, u64)> {
    let start = record.start;

    // Overlap from the start side ends right before the new record
    let right_trimmed = tx
        .update_record_end(
            &UsageFilter {
                start_before: Some(start),
                open_or_end_at_or_after: Some(start),
                ..UsageFilter::default()
            },
            start - Duration::seconds(1),
        )
        .await?;

    let superseded = match record.end {
        None => {
            tx.delete_usage_records(&UsageFilter {
                start_at_or_after: Some(start),
                ..UsageFilter::default()
            })
            .await?
        }
        Some(end) => {
            let deleted = tx
                .delete_usage_records(&UsageFilter {
                    start_at_or_after: Some(start),
                    end_at_or_before: Some(end),
                    ..UsageFilter::default()
                })
                .await?;

            // The one record overlapping from the end side starts right after
            let left_trimmed = tx
                .update_record_start(
                    &UsageFilter {
                        start_at_or_after: Some(start),
                        start_at_or_before: Some(end),
                        open_or_end_after: Some(end),
                        ..UsageFilter::default()
                    },
                    end + Duration::seconds(1),
                )
                .await?;
            debug!("Left-trimmed {} record(s) to {}", left_trimmed, end);
            deleted
        }
    };

    debug!(
        "Takeover of {} from {}: right-trimmed {}, superseded {}",
        record.usage_group, start, right_trimmed, superseded
    );
    if let Some(metrics) = metrics {
        if superseded > 0 {
            metrics.record_superseded(superseded);
        }
    }

    let stored = tx.create_usage_record(record).await?;
    Ok((stored, superseded))
}

#[async_trait]
impl UsageGroup for GaugeUsageGroup {
    fn definition(&self) -> &UsageGroupDefinition {
        self.ledger.group()
    }

    async fn add_usage(
        &self,
        revision_id: RevisionId,
        quantity: Decimal,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<UsageRecord> {
        UsageLedger::validate(quantity, start, end)?;
        let record = &self.ledger.new_record(revision_id, quantity, start, end);
        let ledger = &self.ledger;
        let metrics = ledger.context().metrics.as_deref();

        let stored = ledger
            .context()
            .mutate("gauge_takeover", move || async move {
                let mut tx = ledger.begin().await?;
                let (stored, _) = take_over(tx.as_mut(), record, metrics).await?;
                tx.commit().await?;
                Ok(stored)
            })
            .await?;

        ledger.record_added();
        Ok(stored)
    }

    async fn usage_history(&self, cycle: &BillingCycle) -> Result<Vec<UsageRecord>> {
        self.ledger.usage_history(cycle).await
    }

    async fn current_usage(&self, cycle: Option<&BillingCycle>) -> Result<Decimal> {
        let Some(cycle) = self.ledger.resolve_cycle(cycle).await? else {
            return Ok(Decimal::ZERO);
        };

        // History is ordered by id, so the last record is the latest setpoint
        Ok(self
            .ledger
            .usage_history(&cycle)
            .await?
            .last()
            .map(|r| r.quantity)
            .unwrap_or(Decimal::ZERO))
    }

    async fn chargeable_usage(&self, cycle: &BillingCycle) -> Result<Vec<ChargeableUsage>> {
        let group = self.ledger.group();
        if group.not_charged {
            return Ok(Vec::new());
        }

        let history = self.ledger.usage_history(cycle).await?;
        if history.is_empty() {
            return Ok(Vec::new());
        }
        let free = self.ledger.free_quantities(cycle).await?;

        Ok(history
            .iter()
            .filter(|record| {
                let allowance = UsageLedger::free_for(&free, record)
                    .map(|f| f.quantity)
                    .unwrap_or(Decimal::ZERO);
                record.quantity > allowance
            })
            .map(|record| ChargeableUsage {
                usage_group: group.name.clone(),
                product: group.product.clone(),
                revision_id: Some(record.revision_id),
                quantity: record.quantity,
                start: record.start.max(cycle.start),
                end: record.end.map_or(cycle.end, |end| end.min(cycle.end)),
            })
            .collect())
    }
}
