use crate::config::CycleConfig;
use crate::domain::clock::{Clock, FixedClock};
use crate::domain::cycles::BillingCycleCalculator;
use crate::domain::plans::{Plan, PlanCatalog, PlanDefinition};
use crate::domain::types::{
    BillingCycle, BillingPeriod, License, LicenseId, LicenseStatus, OwnerId, RevisionId,
    UsageGroupDefinition,
};
use crate::domain::usage::{InitialUsageResolver, UsageContext, UsageLedger};
use crate::metrics::BillingMetrics;
use crate::storage::licenses::LicenseRepository;
use crate::storage::memory::InMemoryStore;
use chrono::{TimeZone, Utc, Weekday};
use rust_decimal_macros::dec;
use std::sync::Arc;

/// In-memory collaborators wired the way the service wires them, with a
/// clock fixed at 2024-03-01 00:00:00 and monthly cycles.
pub(crate) struct TestEnv {
    pub store: Arc<InMemoryStore>,
    pub plans: PlanCatalog,
    pub clock: Arc<FixedClock>,
    pub metrics: Arc<BillingMetrics>,
    pub context: UsageContext,
}

pub(crate) fn plans() -> PlanCatalog {
    let catalog = PlanCatalog::new();

    let mut environments = UsageGroupDefinition::gauge("environments", dec!(1));
    environments.product = Some("environment".to_string());
    environments.initial_quantity = Some(dec!(1));
    let mut bandwidth = UsageGroupDefinition::counter("bandwidth", dec!(10));
    bandwidth.product = Some("bandwidth-gb".to_string());
    let mut api_calls = UsageGroupDefinition::counter("api_calls", dec!(0));
    api_calls.not_charged = true;

    catalog.insert(Plan::new(
        "basic",
        vec![
            environments.clone(),
            bandwidth.clone(),
            api_calls,
            UsageGroupDefinition::gauge("seats", dec!(0)),
        ],
    ));

    environments.free_quantity = dec!(3);
    bandwidth.free_quantity = dec!(100);
    catalog.insert(Plan::new("pro", vec![environments, bandwidth]));
    catalog
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let plans = plans();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ));
        let metrics = Arc::new(BillingMetrics::new().unwrap());
        let cycles = Arc::new(
            BillingCycleCalculator::new(
                store.clone(),
                CycleConfig {
                    cycle_type: "monthly".to_string(),
                    period: BillingPeriod::Month,
                    asynchronous: false,
                    week_start: Weekday::Mon,
                },
            )
            .with_metrics(metrics.clone()),
        );
        let context = UsageContext::new(
            store.clone(),
            store.clone(),
            Arc::new(plans.clone()),
            cycles,
            clock.clone(),
        )
        .with_metrics(metrics.clone());

        Self {
            store,
            plans,
            clock,
            metrics,
            context,
        }
    }

    /// Same collaborators with one initial usage resolver installed
    pub fn with_resolver(&self, resolver: impl InitialUsageResolver + 'static) -> Self {
        let resolvers = self.context.resolvers.clone().with(resolver);
        Self {
            store: self.store.clone(),
            plans: self.plans.clone(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            context: self.context.clone().with_resolvers(resolvers),
        }
    }

    /// A license that exists only in memory, for tests that never hit storage
    pub fn detached_license(&self, plan_id: &str) -> License {
        License {
            id: LicenseId::new(),
            owner_id: OwnerId::new("owner-1"),
            revision_id: RevisionId::new(1),
            plan_id: plan_id.to_string(),
            status: LicenseStatus::Active,
            previous: None,
        }
    }

    /// Created then activated at the current clock time
    pub async fn active_license(&self, plan_id: &str) -> License {
        let now = self.clock.now();
        let created = self
            .store
            .create_license(
                &LicenseId::new(),
                &OwnerId::new("owner-1"),
                plan_id,
                LicenseStatus::Created,
                now,
            )
            .await
            .unwrap();
        self.store
            .add_revision(&created, plan_id, LicenseStatus::Active, now)
            .await
            .unwrap()
    }

    pub async fn cycle(&self, license: &License) -> BillingCycle {
        self.context
            .cycles
            .get_or_create_cycle(&license.owner_id, self.clock.now(), true)
            .await
            .unwrap()
    }

    pub fn ledger(&self, license: &License, group: &str) -> UsageLedger {
        let definition = self
            .plans
            .plan(&license.plan_id)
            .and_then(|plan| plan.usage_group(group).cloned())
            .unwrap_or_else(|| panic!("plan {} has no group {}", license.plan_id, group));
        UsageLedger::new(self.context.clone(), license.clone(), definition)
    }
}
