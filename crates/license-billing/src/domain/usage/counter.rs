use crate::domain::types::{
    BillingCycle, ChargeableUsage, FreeQuantity, RevisionId, UsageGroupDefinition, UsageRecord,
};
use crate::domain::usage::{UsageGroup, UsageLedger};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

/// Additive usage such as bandwidth or API calls. Records are never
/// superseded, and chargeable usage is the sum over the cycle minus the
/// prorated free allowance of each revision.
#[derive(Clone)]
pub struct CounterUsageGroup {
    ledger: UsageLedger,
}

impl CounterUsageGroup {
    pub fn new(ledger: UsageLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }
}

/// Free allowance scaled by the share of the cycle the revision covered,
/// rounded half away from zero.
pub fn prorated_allowance(free: &FreeQuantity, cycle: &BillingCycle) -> Decimal {
    let cycle_seconds = cycle.duration_seconds();
    if cycle_seconds <= 0 {
        return Decimal::ZERO;
    }

    let share = Decimal::from(free.duration_seconds()) / Decimal::from(cycle_seconds);
    (free.quantity * share).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

#[async_trait]
impl UsageGroup for CounterUsageGroup {
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
        // Without an end the event is a single instant, never an open interval
        let end = end.or(Some(start));
        self.ledger.append(revision_id, quantity, start, end).await
    }

    async fn usage_history(&self, cycle: &BillingCycle) -> Result<Vec<UsageRecord>> {
        self.ledger.usage_history(cycle).await
    }

    async fn current_usage(&self, cycle: Option<&BillingCycle>) -> Result<Decimal> {
        let Some(cycle) = self.ledger.resolve_cycle(cycle).await? else {
            return Ok(Decimal::ZERO);
        };

        let current_revision = self.ledger.license().revision_id;
        Ok(self
            .ledger
            .usage_history(&cycle)
            .await?
            .iter()
            .filter(|r| r.revision_id <= current_revision)
            .map(|r| r.quantity)
            .sum())
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

        let mut totals: BTreeMap<RevisionId, Decimal> = BTreeMap::new();
        for record in &history {
            *totals.entry(record.revision_id).or_default() += record.quantity;
        }

        let mut total = Decimal::ZERO;
        for (revision_id, quantity) in totals {
            let allowance = free
                .get(&revision_id)
                .map(|f| prorated_allowance(f, cycle))
                .unwrap_or(Decimal::ZERO);
            if quantity > allowance {
                total += quantity - allowance;
            }
        }

        if total <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        Ok(vec![ChargeableUsage {
            usage_group: group.name.clone(),
            product: group.product.clone(),
            revision_id: None,
            quantity: total,
            start: cycle.start,
            end: cycle.end,
        }])
    }
}
