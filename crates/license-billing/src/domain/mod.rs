pub mod clock;
pub mod cycles;
pub mod licenses;
pub mod plans;
pub mod transitions;
pub mod types;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

pub use clock::{Clock, FixedClock, SystemClock};
pub use cycles::BillingCycleCalculator;
pub use licenses::{LicenseManager, LicenseOperations, LicenseUsage, UsageDetail};
pub use plans::{Plan, PlanCatalog, PlanDefinition};
pub use transitions::{RevisionTransitionController, TransitionAction, TransitionOutcome};
pub use types::{
    BillingCycle, BillingPeriod, ChargeableUsage, License, LicenseId, LicenseStatus, OwnerId,
    RevisionId, UsageGroupDefinition, UsageGroupKind, UsageRecord,
};
pub use usage::{
    CounterUsageGroup, GaugeUsageGroup, InitialUsageResolver, InitialUsageResolvers,
    UsageContext, UsageGroup, UsageLedger,
};
