use crate::domain::clock::Clock;
use crate::domain::cycles::BillingCycleCalculator;
use crate::domain::plans::PlanDefinition;
use crate::domain::types::{
    BillingCycle, FreeQuantity, License, NewUsageRecord, RevisionId, RevisionSpan,
    UsageGroupDefinition, UsageRecord,
};
use crate::domain::usage::resolvers::InitialUsageResolvers;
use crate::error::{BillingError, Result};
use crate::metrics::BillingMetrics;
use crate::storage::licenses::LicenseRepository;
use crate::storage::retry::retry_on_conflict;
use crate::storage::usage::{UsageFilter, UsageRepository, UsageTransaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collaborators shared by every usage group of every license
#[derive(Clone)]
pub struct UsageContext {
    pub usage: Arc<dyn UsageRepository>,
    pub licenses: Arc<dyn LicenseRepository>,
    pub plans: Arc<dyn PlanDefinition>,
    pub cycles: Arc<BillingCycleCalculator>,
    pub clock: Arc<dyn Clock>,
    pub resolvers: InitialUsageResolvers,
    pub metrics: Option<Arc<BillingMetrics>>,
    pub conflict_retries: bool,
}

impl UsageContext {
    pub fn new(
        usage: Arc<dyn UsageRepository>,
        licenses: Arc<dyn LicenseRepository>,
        plans: Arc<dyn PlanDefinition>,
        cycles: Arc<BillingCycleCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            usage,
            licenses,
            plans,
            cycles,
            clock,
            resolvers: InitialUsageResolvers::new(),
            metrics: None,
            conflict_retries: true,
        }
    }

    pub fn with_resolvers(mut self, resolvers: InitialUsageResolvers) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_conflict_retries(mut self, enabled: bool) -> Self {
        self.conflict_retries = enabled;
        self
    }

    /// Runs a mutation, retrying it once on a concurrency conflict when
    /// retries are enabled.
    pub(crate) async fn mutate<T, F, Fut>(&self, operation: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.conflict_retries {
            retry_on_conflict(operation, self.metrics.as_deref(), attempt).await
        } else {
            let mut attempt = attempt;
            attempt().await
        }
    }
}

/// Usage records of one (license, usage group) scope.
///
/// Holds the behaviour shared by counters and gauges: validated appends,
/// history lookup and free quota resolution per cycle.
#[derive(Clone)]
pub struct UsageLedger {
    pub(crate) context: UsageContext,
    pub(crate) license: License,
    pub(crate) group: UsageGroupDefinition,
}

impl UsageLedger {
    pub fn new(context: UsageContext, license: License, group: UsageGroupDefinition) -> Self {
        Self {
            context,
            license,
            group,
        }
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    pub fn group(&self) -> &UsageGroupDefinition {
        &self.group
    }

    pub fn context(&self) -> &UsageContext {
        &self.context
    }

    pub(crate) fn validate(
        quantity: Decimal,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if quantity < Decimal::ZERO {
            return Err(BillingError::validation(
                "quantity",
                format!("usage quantity {} is negative", quantity),
            ));
        }
        if let Some(end) = end {
            if end < start {
                return Err(BillingError::validation(
                    "end",
                    format!("usage ends at {} before it starts at {}", end, start),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn new_record(
        &self,
        revision_id: RevisionId,
        quantity: Decimal,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> NewUsageRecord {
        NewUsageRecord {
            license_id: self.license.id,
            revision_id,
            usage_group: self.group.name.clone(),
            quantity,
            start,
            end,
        }
    }

    pub(crate) async fn begin(&self) -> Result<Box<dyn UsageTransaction>> {
        self.context
            .usage
            .begin(&self.license.id, &self.group.name)
            .await
    }

    /// Appends a record without touching existing ones.
    pub async fn append(
        &self,
        revision_id: RevisionId,
        quantity: Decimal,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<UsageRecord> {
        Self::validate(quantity, start, end)?;
        let record = &self.new_record(revision_id, quantity, start, end);

        let stored = self
            .context
            .mutate("add_usage", move || async move {
                let mut tx = self.begin().await?;
                let stored = tx.create_usage_record(record).await?;
                tx.commit().await?;
                Ok(stored)
            })
            .await?;

        self.record_added();
        Ok(stored)
    }

    pub(crate) fn record_added(&self) {
        if let Some(metrics) = &self.context.metrics {
            metrics.record_usage_added(&self.group.kind.to_string());
        }
    }

    /// Records intersecting the cycle, in insertion order.
    pub async fn usage_history(&self, cycle: &BillingCycle) -> Result<Vec<UsageRecord>> {
        let records = self
            .context
            .usage
            .query_usage_records(
                &self.license.id,
                &self.group.name,
                &UsageFilter::intersecting(cycle.start, cycle.end),
            )
            .await?;

        debug!(
            "Loaded {} {} records of license {} for cycle {}",
            records.len(),
            self.group.name,
            self.license.id,
            cycle.id
        );
        Ok(records)
    }

    /// Free allowance of this group for every revision in effect during the
    /// cycle, with the part of the cycle each revision covered.
    pub async fn free_quantities(
        &self,
        cycle: &BillingCycle,
    ) -> Result<HashMap<RevisionId, FreeQuantity>> {
        let revisions = self.context.licenses.list_revisions(&self.license.id).await?;
        let mut free = HashMap::new();

        for span in RevisionSpan::from_revisions(&revisions) {
            let Some((start, end)) = span.clip(cycle.start, cycle.end) else {
                continue;
            };

            let plan = self
                .context
                .plans
                .plan(&span.plan_id)
                .ok_or_else(|| BillingError::PlanNotFound {
                    id: span.plan_id.clone(),
                })?;
            let quantity = plan
                .usage_group(&self.group.name)
                .map(|g| g.free_quantity)
                .unwrap_or(Decimal::ZERO);

            free.insert(
                span.revision_id,
                FreeQuantity {
                    quantity,
                    start,
                    end,
                },
            );
        }

        Ok(free)
    }

    /// The cycle to report on: the given one, or the stored cycle covering
    /// the current time. `None` when the license has no cycle yet.
    pub async fn resolve_cycle(
        &self,
        cycle: Option<&BillingCycle>,
    ) -> Result<Option<BillingCycle>> {
        if let Some(cycle) = cycle {
            return Ok(Some(cycle.clone()));
        }

        let now = self.context.clock.now();
        let found = self
            .context
            .cycles
            .find_cycle(&self.license.owner_id, now)
            .await?;
        if found.is_none() {
            debug!(
                "No billing cycle for owner {} at {}",
                self.license.owner_id, now
            );
        }
        Ok(found)
    }

    pub(crate) fn free_for(
        free: &HashMap<RevisionId, FreeQuantity>,
        record: &UsageRecord,
    ) -> Option<FreeQuantity> {
        let found = free.get(&record.revision_id).copied();
        if found.is_none() {
            warn!(
                "Usage record {} references revision {} outside the cycle's revisions",
                record.id, record.revision_id
            );
        }
        found
    }
}
