//! Prometheus counters for ledger and billing cycle activity.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct BillingMetrics {
    registry: Registry,
    usage_records_added: IntCounterVec,
    usage_records_superseded: IntCounter,
    cycles_created: IntCounterVec,
    conflicts_retried: IntCounterVec,
    license_transitions: IntCounterVec,
}

impl BillingMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let usage_records_added = IntCounterVec::new(
            Opts::new(
                "billing_usage_records_added_total",
                "Usage records appended to the ledger by group kind",
            ),
            &["kind"],
        )?;
        let usage_records_superseded = IntCounter::new(
            "billing_usage_records_superseded_total",
            "Gauge records deleted because a later record fully covered them",
        )?;
        let cycles_created = IntCounterVec::new(
            Opts::new(
                "billing_cycles_created_total",
                "Billing cycles resolved or created by cycle type",
            ),
            &["cycle_type"],
        )?;
        let conflicts_retried = IntCounterVec::new(
            Opts::new(
                "billing_conflicts_retried_total",
                "Operations retried after a concurrency conflict",
            ),
            &["operation"],
        )?;
        let license_transitions = IntCounterVec::new(
            Opts::new(
                "billing_license_transitions_total",
                "License revision transitions applied to usage groups",
            ),
            &["from", "to"],
        )?;

        registry.register(Box::new(usage_records_added.clone()))?;
        registry.register(Box::new(usage_records_superseded.clone()))?;
        registry.register(Box::new(cycles_created.clone()))?;
        registry.register(Box::new(conflicts_retried.clone()))?;
        registry.register(Box::new(license_transitions.clone()))?;

        Ok(Self {
            registry,
            usage_records_added,
            usage_records_superseded,
            cycles_created,
            conflicts_retried,
            license_transitions,
        })
    }

    pub fn record_usage_added(&self, kind: &str) {
        self.usage_records_added.with_label_values(&[kind]).inc();
    }

    pub fn record_superseded(&self, count: u64) {
        self.usage_records_superseded.inc_by(count);
    }

    pub fn record_cycle_created(&self, cycle_type: &str) {
        self.cycles_created.with_label_values(&[cycle_type]).inc();
    }

    pub fn record_conflict_retry(&self, operation: &str) {
        self.conflicts_retried.with_label_values(&[operation]).inc();
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.license_transitions.with_label_values(&[from, to]).inc();
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
