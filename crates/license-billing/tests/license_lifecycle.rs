use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use license_billing::config::CycleConfig;
use license_billing::domain::{
    BillingCycleCalculator, BillingPeriod, Clock, FixedClock, LicenseManager, LicenseOperations,
    LicenseStatus, OwnerId, Plan, PlanCatalog, UsageContext, UsageGroupDefinition,
};
use license_billing::metrics::BillingMetrics;
use license_billing::storage::InMemoryStore;
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use std::sync::Arc;

struct Harness {
    store: Arc<InMemoryStore>,
    clock: Arc<FixedClock>,
    cycles: Arc<BillingCycleCalculator>,
    metrics: Arc<BillingMetrics>,
    manager: LicenseManager,
}

fn at(month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, hour, 0, 0).unwrap()
}

fn catalog() -> PlanCatalog {
    let mut storage = UsageGroupDefinition::gauge("storage_tb", dec!(2));
    storage.product = Some("storage-tb".to_string());
    storage.initial_quantity = Some(dec!(1));
    let mut egress = UsageGroupDefinition::counter("egress_gb", dec!(300));
    egress.product = Some("egress-gb".to_string());

    let catalog = PlanCatalog::new();
    catalog.insert(Plan::new("team", vec![storage.clone(), egress.clone()]));

    storage.free_quantity = dec!(10);
    egress.free_quantity = dec!(3000);
    catalog.insert(Plan::new("business", vec![storage, egress]));
    catalog
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(at(1, 1, 0)));
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
            Arc::new(catalog()),
            cycles.clone(),
            clock.clone(),
        )
        .with_metrics(metrics.clone());

        Self {
            store,
            clock,
            cycles,
            metrics,
            manager: LicenseManager::new(context),
        }
    }
}

#[tokio::test]
async fn test_license_lifecycle_through_a_billing_cycle() {
    let h = Harness::new();
    let owner = OwnerId::new("acme");

    let license = h.manager.create_license(owner.clone(), "team").await.unwrap();
    h.clock.set(at(1, 5, 0));
    let license = h
        .manager
        .update_status(&license.id, LicenseStatus::Active)
        .await
        .unwrap();
    let cycle = h
        .cycles
        .get_or_create_cycle(&owner, h.clock.now(), true)
        .await
        .unwrap();
    assert_eq!(cycle.start, at(1, 1, 0));
    assert_eq!(cycle.end, at(2, 1, 0) - Duration::seconds(1));
    assert_eq!(h.cycles.label(cycle.start, cycle.end), "January 2024");

    let usage = h.manager.usage(&license).unwrap();
    usage
        .group("storage_tb")
        .unwrap()
        .add_usage(license.revision_id, dec!(5), at(1, 10, 0), None)
        .await
        .unwrap();
    usage
        .group("egress_gb")
        .unwrap()
        .add_usage(license.revision_id, dec!(450), at(1, 12, 0), None)
        .await
        .unwrap();

    let details = usage.usage_details().await.unwrap();
    let current: Vec<_> = details
        .iter()
        .map(|d| (d.usage_group.as_str(), d.quantity))
        .collect();
    assert_eq!(current, vec![("storage_tb", dec!(5)), ("egress_gb", dec!(450))]);

    // Suspended over a week, then resumed at the same level
    h.clock.set(at(1, 15, 0));
    let suspended = h
        .manager
        .update_status(&license.id, LicenseStatus::Suspended)
        .await
        .unwrap();
    h.clock.set(at(1, 22, 0));
    let resumed = h
        .manager
        .update_status(&suspended.id, LicenseStatus::Active)
        .await
        .unwrap();

    let mut records = h.store.all_usage_records().await;
    records.retain(|r| r.usage_group == "storage_tb");
    records.sort_by_key(|r| r.id);
    let intervals: Vec<_> = records
        .iter()
        .map(|r| (r.start, r.end, r.quantity))
        .collect();
    assert_eq!(
        intervals,
        vec![
            (at(1, 5, 0), Some(at(1, 10, 0) - Duration::seconds(1)), dec!(1)),
            (at(1, 10, 0), Some(at(1, 15, 0) - Duration::seconds(1)), dec!(5)),
            (at(1, 22, 0), None, dec!(5)),
        ]
    );
    assert_eq!(records[2].revision_id, resumed.revision_id);

    let usage = h.manager.usage(&resumed).unwrap();
    let items = usage.chargeable_usage(&cycle).await.unwrap();
    let summary: Vec<_> = items
        .iter()
        .map(|i| (i.usage_group.as_str(), i.quantity, i.start, i.end))
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                "storage_tb",
                dec!(5),
                at(1, 10, 0),
                at(1, 15, 0) - Duration::seconds(1)
            ),
            ("storage_tb", dec!(5), at(1, 22, 0), cycle.end),
            // Used under the revision active Jan 5 to Jan 15: 300 free
            // prorated over 10 of 31 days is 97
            ("egress_gb", dec!(353), cycle.start, cycle.end),
        ]
    );

    let rendered = h.metrics.render().unwrap();
    assert!(rendered.contains("billing_cycles_created_total{cycle_type=\"monthly\"} 1"));
}

#[tokio::test]
async fn test_upgrade_carries_gauge_level_into_the_next_cycle() {
    let h = Harness::new();
    let owner = OwnerId::new("globex");

    let license = h.manager.create_license(owner.clone(), "team").await.unwrap();
    let license = h
        .manager
        .update_status(&license.id, LicenseStatus::Active)
        .await
        .unwrap();
    h.manager
        .usage(&license)
        .unwrap()
        .group("storage_tb")
        .unwrap()
        .add_usage(license.revision_id, dec!(6), h.clock.now(), None)
        .await
        .unwrap();

    h.clock.set(at(1, 20, 0));
    let upgraded = h.manager.change_plan(&license.id, "business").await.unwrap();
    assert_eq!(upgraded.previous.as_ref().unwrap().plan_id, "team");

    let january = h
        .cycles
        .get_or_create_cycle(&owner, at(1, 1, 0), true)
        .await
        .unwrap();
    let february = h.cycles.get_next_cycle(&january, true).await.unwrap();
    assert_eq!(february.start, at(2, 1, 0));

    let usage = h.manager.usage(&upgraded).unwrap();
    let storage = usage.group("storage_tb").unwrap();
    assert_eq!(storage.current_usage(Some(&february)).await.unwrap(), dec!(6));

    // 6 is within the business allowance of 10
    assert!(usage.chargeable_usage(&february).await.unwrap().is_empty());

    // January still charges the team interval
    let january_items = usage.chargeable_usage(&january).await.unwrap();
    assert_eq!(january_items.len(), 1);
    assert_eq!(january_items[0].revision_id, Some(license.revision_id));
    assert_eq!(january_items[0].end, at(1, 20, 0) - Duration::seconds(1));
}

#[tokio::test]
async fn test_canceled_license_stops_accruing() {
    let h = Harness::new();
    let license = h
        .manager
        .create_license(OwnerId::new("initech"), "team")
        .await
        .unwrap();
    h.manager
        .update_status(&license.id, LicenseStatus::Active)
        .await
        .unwrap();

    h.clock.advance(Duration::days(3));
    let canceled = h
        .manager
        .update_status(&license.id, LicenseStatus::Canceled)
        .await
        .unwrap();
    assert!(h
        .store
        .all_usage_records()
        .await
        .iter()
        .all(|r| !r.is_open()));
    assert!(h
        .manager
        .update_status(&canceled.id, LicenseStatus::Active)
        .await
        .is_err());
}
