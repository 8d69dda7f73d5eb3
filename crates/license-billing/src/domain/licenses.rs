use crate::domain::plans::Plan;
use crate::domain::transitions::{RevisionTransitionController, TransitionOutcome};
use crate::domain::types::{
    BillingCycle, ChargeableUsage, License, LicenseId, LicenseStatus, OwnerId,
    UsageGroupDefinition, UsageGroupKind,
};
use crate::domain::usage::{usage_group, GaugeUsageGroup, UsageContext, UsageGroup, UsageLedger};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Current usage of one group, as shown to the license owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDetail {
    pub usage_group: String,
    pub title: String,
    pub kind: UsageGroupKind,
    pub quantity: Decimal,
}

/// License lifecycle operations
#[async_trait]
pub trait LicenseOperations: Send + Sync {
    /// Creates a license in the `Created` status.
    async fn create_license(&self, owner_id: OwnerId, plan_id: &str) -> Result<License>;

    async fn get_license(&self, license_id: &LicenseId) -> Result<License>;

    async fn update_status(&self, license_id: &LicenseId, status: LicenseStatus)
        -> Result<License>;

    async fn change_plan(&self, license_id: &LicenseId, plan_id: &str) -> Result<License>;
}

/// Records license revisions and keeps gauge usage in step with them.
pub struct LicenseManager {
    context: UsageContext,
    controller: RevisionTransitionController,
}

impl LicenseManager {
    pub fn new(context: UsageContext) -> Self {
        let controller = RevisionTransitionController::from_context(&context);
        Self {
            context,
            controller,
        }
    }

    pub fn context(&self) -> &UsageContext {
        &self.context
    }

    /// Usage accounting for every group of the license's plan
    pub fn usage(&self, license: &License) -> Result<LicenseUsage> {
        LicenseUsage::new(self.context.clone(), license.clone())
    }

    /// Line items of the license for the stored cycle covering `at`. An
    /// owner without a cycle there has nothing to charge.
    pub async fn chargeable_usage_at(
        &self,
        license_id: &LicenseId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ChargeableUsage>> {
        let license = self.get_license(license_id).await?;
        let Some(cycle) = self.context.cycles.find_cycle(&license.owner_id, at).await? else {
            info!(
                "No billing cycle for {} at {}, nothing to charge",
                license.owner_id, at
            );
            return Ok(Vec::new());
        };

        self.usage(&license)?.chargeable_usage(&cycle).await
    }

    fn plan(&self, plan_id: &str) -> Result<Plan> {
        self.context
            .plans
            .plan(plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                id: plan_id.to_string(),
            })
    }

    async fn revise(
        &self,
        license_id: &LicenseId,
        plan_id: Option<&str>,
        status: Option<LicenseStatus>,
    ) -> Result<License> {
        let now = self.context.clock.now();

        let revised = self
            .context
            .mutate("add_revision", move || async move {
                let license = self.get_license(license_id).await?;
                let next_plan = plan_id.unwrap_or(license.plan_id.as_str()).to_string();
                let next_status = status.unwrap_or(license.status);

                if next_plan == license.plan_id && next_status == license.status {
                    debug!("License {} already {} on {}", license.id, next_status, next_plan);
                    return Ok(None);
                }

                if !license.status.can_transition_to(next_status) {
                    return Err(BillingError::InvalidStateTransition {
                        from: license.status.to_string(),
                        to: next_status.to_string(),
                    });
                }
                self.plan(&next_plan)?;

                self.context
                    .licenses
                    .add_revision(&license, &next_plan, next_status, now)
                    .await
                    .map(Some)
            })
            .await?;

        let Some(license) = revised else {
            // Finishes whatever a failed attempt at this change left open
            let license = self.get_license(license_id).await?;
            self.apply_transitions(&license).await?;
            return Ok(license);
        };

        info!(
            "License {} moved to revision {} ({} on plan {})",
            license.id, license.revision_id, license.status, license.plan_id
        );
        self.apply_transitions(&license).await?;
        Ok(license)
    }

    /// Runs the transition controller for every gauge group of the new plan,
    /// and closes usage of gauge groups the new plan no longer offers.
    async fn apply_transitions(&self, license: &License) -> Result<Vec<TransitionOutcome>> {
        let plan = self.plan(&license.plan_id)?;
        let mut outcomes = Vec::new();

        for definition in gauge_groups(&plan) {
            let gauge = self.gauge(license, definition.clone());
            outcomes.push(self.controller.on_license_change(&gauge).await?);
        }

        let dropped = license
            .previous
            .as_ref()
            .filter(|previous| previous.plan_id != license.plan_id)
            .and_then(|previous| self.context.plans.plan(&previous.plan_id));
        if let Some(previous_plan) = dropped {
            for definition in gauge_groups(&previous_plan) {
                if plan.usage_group(&definition.name).is_some() {
                    continue;
                }
                let gauge = self.gauge(license, definition.clone());
                outcomes.push(self.controller.on_group_removed(&gauge).await?);
            }
        }

        Ok(outcomes)
    }

    fn gauge(&self, license: &License, definition: UsageGroupDefinition) -> GaugeUsageGroup {
        GaugeUsageGroup::new(UsageLedger::new(
            self.context.clone(),
            license.clone(),
            definition,
        ))
    }
}

fn gauge_groups(plan: &Plan) -> impl Iterator<Item = &UsageGroupDefinition> {
    plan.usage_groups
        .iter()
        .filter(|group| group.kind == UsageGroupKind::Gauge)
}

#[async_trait]
impl LicenseOperations for LicenseManager {
    async fn create_license(&self, owner_id: OwnerId, plan_id: &str) -> Result<License> {
        self.plan(plan_id)?;

        let license = self
            .context
            .licenses
            .create_license(
                &LicenseId::new(),
                &owner_id,
                plan_id,
                LicenseStatus::Created,
                self.context.clock.now(),
            )
            .await?;

        info!(
            "Created license {} for {} on plan {}",
            license.id, owner_id, plan_id
        );
        Ok(license)
    }

    async fn get_license(&self, license_id: &LicenseId) -> Result<License> {
        self.context
            .licenses
            .get_license(license_id)
            .await?
            .ok_or_else(|| BillingError::LicenseNotFound {
                id: license_id.to_string(),
            })
    }

    async fn update_status(
        &self,
        license_id: &LicenseId,
        status: LicenseStatus,
    ) -> Result<License> {
        self.revise(license_id, None, Some(status)).await
    }

    async fn change_plan(&self, license_id: &LicenseId, plan_id: &str) -> Result<License> {
        self.revise(license_id, Some(plan_id), None).await
    }
}

/// The usage groups of one license, resolved against its plan
pub struct LicenseUsage {
    context: UsageContext,
    license: License,
    plan: Plan,
}

impl LicenseUsage {
    pub fn new(context: UsageContext, license: License) -> Result<Self> {
        let plan = context
            .plans
            .plan(&license.plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                id: license.plan_id.clone(),
            })?;
        Ok(Self {
            context,
            license,
            plan,
        })
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    pub fn groups(&self) -> Vec<Box<dyn UsageGroup>> {
        self.plan
            .usage_groups
            .iter()
            .map(|definition| {
                usage_group(
                    self.context.clone(),
                    self.license.clone(),
                    definition.clone(),
                )
            })
            .collect()
    }

    pub fn group(&self, name: &str) -> Result<Box<dyn UsageGroup>> {
        let definition =
            self.plan
                .usage_group(name)
                .ok_or_else(|| BillingError::UsageGroupNotFound {
                    license: self.license.id.to_string(),
                    group: name.to_string(),
                })?;
        Ok(usage_group(
            self.context.clone(),
            self.license.clone(),
            definition.clone(),
        ))
    }

    /// Current usage of every group in the cycle covering now.
    pub async fn usage_details(&self) -> Result<Vec<UsageDetail>> {
        let mut details = Vec::with_capacity(self.plan.usage_groups.len());
        for group in self.groups() {
            let definition = group.definition();
            let title = if definition.title.is_empty() {
                definition.name.clone()
            } else {
                definition.title.clone()
            };
            details.push(UsageDetail {
                usage_group: definition.name.clone(),
                title,
                kind: definition.kind,
                quantity: group.current_usage(None).await?,
            });
        }
        Ok(details)
    }

    /// Line items of every group for the cycle, in plan order.
    pub async fn chargeable_usage(&self, cycle: &BillingCycle) -> Result<Vec<ChargeableUsage>> {
        let mut items = Vec::new();
        for group in self.groups() {
            items.extend(group.chargeable_usage(cycle).await?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::Clock;
    use crate::domain::test_support::TestEnv;
    use crate::domain::types::UsageRecord;
    use crate::storage::cycles::BillingCycleRepository;
    use crate::storage::licenses::LicenseRepository;
    use crate::storage::usage::MockUsageRepository;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn open_records(env: &TestEnv, group: &str) -> Vec<UsageRecord> {
        env.store
            .all_usage_records()
            .await
            .into_iter()
            .filter(|r| r.usage_group == group && r.is_open())
            .collect()
    }

    #[tokio::test]
    async fn test_activation_registers_initial_environment() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());

        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        assert_eq!(created.status, LicenseStatus::Created);
        assert!(open_records(&env, "environments").await.is_empty());

        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();
        assert_eq!(active.previous_status(), Some(LicenseStatus::Created));

        let open = open_records(&env, "environments").await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].quantity, dec!(1));
        assert_eq!(open[0].revision_id, active.revision_id);
        assert!(open_records(&env, "seats").await.is_empty());
    }

    #[tokio::test]
    async fn test_plan_change_carries_usage_and_closes_dropped_groups() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());
        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();
        let usage = manager.usage(&active).unwrap();
        usage
            .group("seats")
            .unwrap()
            .add_usage(active.revision_id, dec!(2), env.clock.now(), None)
            .await
            .unwrap();

        env.clock.advance(Duration::days(10));
        let upgraded = manager.change_plan(&active.id, "pro").await.unwrap();
        assert_eq!(upgraded.plan_id, "pro");
        assert_eq!(upgraded.status, LicenseStatus::Active);

        let environments = open_records(&env, "environments").await;
        assert_eq!(environments.len(), 1);
        assert_eq!(environments[0].revision_id, upgraded.revision_id);
        assert_eq!(environments[0].start, env.clock.now());

        // The pro plan has no seats
        assert!(open_records(&env, "seats").await.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_revision_is_not_recorded() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());
        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();

        let again = manager
            .update_status(&active.id, LicenseStatus::Active)
            .await
            .unwrap();
        assert_eq!(again.revision_id, active.revision_id);
        assert_eq!(env.store.list_revisions(&active.id).await.unwrap().len(), 2);

        // Repeating the activation does not register initial usage twice
        let environments: Vec<_> = env
            .store
            .all_usage_records()
            .await
            .into_iter()
            .filter(|r| r.usage_group == "environments")
            .collect();
        assert_eq!(environments.len(), 1);
        assert_eq!(environments[0].quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_repeating_a_change_finishes_failed_transitions() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());
        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();
        assert_eq!(open_records(&env, "environments").await.len(), 1);

        // Every attempt to lock the usage scope times out
        let mut usage = MockUsageRepository::new();
        usage.expect_begin().times(2).returning(|_, _| {
            Err(BillingError::ConcurrencyConflict {
                operation: "begin".to_string(),
                message: "canceling statement due to lock timeout".to_string(),
            })
        });
        let mut context = env.context.clone();
        context.usage = Arc::new(usage);
        let locked_out = LicenseManager::new(context);

        env.clock.advance(Duration::days(2));
        let err = locked_out
            .update_status(&active.id, LicenseStatus::Suspended)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // The revision is stored but its usage is still open
        let stored = manager.get_license(&active.id).await.unwrap();
        assert_eq!(stored.status, LicenseStatus::Suspended);
        assert_eq!(open_records(&env, "environments").await.len(), 1);

        env.clock.advance(Duration::hours(1));
        let suspended = manager
            .update_status(&active.id, LicenseStatus::Suspended)
            .await
            .unwrap();
        assert_eq!(suspended.revision_id, stored.revision_id);
        assert!(open_records(&env, "environments").await.is_empty());
        assert_eq!(env.store.list_revisions(&active.id).await.unwrap().len(), 3);

        let closed = env.store.all_usage_records().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].end, Some(env.clock.now() - Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_rejected_changes() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());

        let err = manager
            .create_license(OwnerId::new("owner-1"), "enterprise")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound { .. }));

        let err = manager.get_license(&LicenseId::new()).await.unwrap_err();
        assert!(matches!(err, BillingError::LicenseNotFound { .. }));

        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let err = manager.change_plan(&created.id, "enterprise").await.unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound { .. }));

        let canceled = manager
            .update_status(&created.id, LicenseStatus::Canceled)
            .await
            .unwrap();
        let err = manager
            .update_status(&canceled.id, LicenseStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_usage_details_and_chargeable_usage() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());
        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();
        let cycle = env.cycle(&active).await;
        let usage = manager.usage(&active).unwrap();

        usage
            .group("bandwidth")
            .unwrap()
            .add_usage(active.revision_id, dec!(25), env.clock.now(), None)
            .await
            .unwrap();
        usage
            .group("environments")
            .unwrap()
            .add_usage(active.revision_id, dec!(3), env.clock.now(), None)
            .await
            .unwrap();

        let details = usage.usage_details().await.unwrap();
        let quantities: Vec<(&str, Decimal)> = details
            .iter()
            .map(|d| (d.title.as_str(), d.quantity))
            .collect();
        assert_eq!(
            quantities,
            vec![
                ("environments", dec!(3)),
                ("bandwidth", dec!(25)),
                ("api_calls", dec!(0)),
                ("seats", dec!(0)),
            ]
        );

        let items = usage.chargeable_usage(&cycle).await.unwrap();
        let summary: Vec<(&str, Decimal)> = items
            .iter()
            .map(|i| (i.usage_group.as_str(), i.quantity))
            .collect();
        assert_eq!(summary, vec![("environments", dec!(3)), ("bandwidth", dec!(15))]);

        assert!(matches!(
            usage.group("gpus"),
            Err(BillingError::UsageGroupNotFound { .. })
        ));

        let at = manager
            .chargeable_usage_at(&active.id, env.clock.now())
            .await
            .unwrap();
        assert_eq!(at, items);
    }

    #[tokio::test]
    async fn test_no_cycle_means_nothing_to_charge() {
        let env = TestEnv::new();
        let manager = LicenseManager::new(env.context.clone());
        let created = manager
            .create_license(OwnerId::new("owner-1"), "basic")
            .await
            .unwrap();
        let active = manager
            .update_status(&created.id, LicenseStatus::Active)
            .await
            .unwrap();

        let items = manager
            .chargeable_usage_at(&active.id, env.clock.now())
            .await
            .unwrap();
        assert!(items.is_empty());
        assert!(env
            .store
            .find_cycle_containing(&active.owner_id, "monthly", env.clock.now())
            .await
            .unwrap()
            .is_none());
    }
}
