pub mod counter;
pub mod gauge;
pub mod ledger;
pub mod resolvers;

pub use counter::CounterUsageGroup;
pub use gauge::GaugeUsageGroup;
pub use ledger::{UsageContext, UsageLedger};
pub use resolvers::{InitialUsageResolver, InitialUsageResolvers};

use crate::domain::types::{
    BillingCycle, ChargeableUsage, License, RevisionId, UsageGroupDefinition, UsageGroupKind,
    UsageRecord,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Usage accounting for one group of one license
#[async_trait]
pub trait UsageGroup: Send + Sync {
    fn definition(&self) -> &UsageGroupDefinition;

    async fn add_usage(
        &self,
        revision_id: RevisionId,
        quantity: Decimal,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<UsageRecord>;

    async fn usage_history(&self, cycle: &BillingCycle) -> Result<Vec<UsageRecord>>;

    /// Usage in `cycle`, or in the stored cycle covering now when `None`.
    /// Zero when no cycle exists yet.
    async fn current_usage(&self, cycle: Option<&BillingCycle>) -> Result<Decimal>;

    async fn chargeable_usage(&self, cycle: &BillingCycle) -> Result<Vec<ChargeableUsage>>;
}

/// Builds the accumulator matching the group's kind.
pub fn usage_group(
    context: UsageContext,
    license: License,
    definition: UsageGroupDefinition,
) -> Box<dyn UsageGroup> {
    let ledger = UsageLedger::new(context, license, definition);
    match ledger.group().kind {
        UsageGroupKind::Counter => Box::new(CounterUsageGroup::new(ledger)),
        UsageGroupKind::Gauge => Box::new(GaugeUsageGroup::new(ledger)),
    }
}
