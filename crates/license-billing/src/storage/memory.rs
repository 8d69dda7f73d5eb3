//! In-memory storage for tests, estimation and local development.
//!
//! Implements every storage contract over a single mutex-guarded state.
//! A usage transaction holds the lock for its whole lifetime and works on a
//! copy of the records, so uncommitted changes vanish when it is dropped.

use crate::domain::types::{
    BillingCycle, License, LicenseId, LicenseRevision, LicenseStatus, NewUsageRecord, OwnerId,
    RevisionId, UsageRecord, UsageRecordId,
};
use crate::error::{BillingError, Result};
use crate::storage::cycles::BillingCycleRepository;
use crate::storage::licenses::LicenseRepository;
use crate::storage::usage::{UsageFilter, UsageRepository, UsageTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    usage: Vec<UsageRecord>,
    last_usage_id: i64,
    cycles: Vec<BillingCycle>,
    licenses: HashMap<LicenseId, License>,
    revisions: Vec<LicenseRevision>,
    last_revision_id: i64,
}

impl MemoryState {
    fn next_revision(
        &mut self,
        license_id: LicenseId,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> RevisionId {
        self.last_revision_id += 1;
        let revision_id = RevisionId::new(self.last_revision_id);
        self.revisions.push(LicenseRevision {
            revision_id,
            license_id,
            plan_id: plan_id.to_string(),
            status,
            created_at,
        });
        revision_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored usage record, for assertions.
    pub async fn all_usage_records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.usage.clone()
    }
}

#[async_trait]
impl UsageRepository for InMemoryStore {
    async fn query_usage_records(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
        filter: &UsageFilter,
    ) -> Result<Vec<UsageRecord>> {
        let state = self.state.lock().await;
        Ok(scope_matches(&state.usage, license_id, usage_group, filter))
    }

    async fn begin(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
    ) -> Result<Box<dyn UsageTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.usage.clone();
        let last_usage_id = guard.last_usage_id;

        Ok(Box::new(InMemoryUsageTransaction {
            guard,
            working,
            last_usage_id,
            license_id: *license_id,
            usage_group: usage_group.to_string(),
        }))
    }
}

fn in_scope(record: &UsageRecord, license_id: &LicenseId, usage_group: &str) -> bool {
    record.license_id == *license_id && record.usage_group == usage_group
}

fn scope_matches(
    records: &[UsageRecord],
    license_id: &LicenseId,
    usage_group: &str,
    filter: &UsageFilter,
) -> Vec<UsageRecord> {
    let mut matches: Vec<UsageRecord> = records
        .iter()
        .filter(|r| in_scope(r, license_id, usage_group) && filter.matches(r))
        .cloned()
        .collect();
    matches.sort_by_key(|r| r.id);
    matches
}

pub struct InMemoryUsageTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: Vec<UsageRecord>,
    last_usage_id: i64,
    license_id: LicenseId,
    usage_group: String,
}

impl InMemoryUsageTransaction {
    fn targets<'a>(
        &'a mut self,
        filter: &'a UsageFilter,
    ) -> impl Iterator<Item = &'a mut UsageRecord> + 'a {
        let license_id = self.license_id;
        let usage_group = self.usage_group.as_str();
        self.working
            .iter_mut()
            .filter(move |r| in_scope(r, &license_id, usage_group) && filter.matches(r))
    }
}

#[async_trait]
impl UsageTransaction for InMemoryUsageTransaction {
    async fn query_usage_records(&mut self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        Ok(scope_matches(
            &self.working,
            &self.license_id,
            &self.usage_group,
            filter,
        ))
    }

    async fn create_usage_record(&mut self, record: &NewUsageRecord) -> Result<UsageRecord> {
        if record.license_id != self.license_id || record.usage_group != self.usage_group {
            return Err(BillingError::validation(
                "usage_group",
                "record is outside the locked usage scope",
            ));
        }

        self.last_usage_id += 1;
        let stored = UsageRecord {
            id: UsageRecordId::new(self.last_usage_id),
            license_id: record.license_id,
            revision_id: record.revision_id,
            usage_group: record.usage_group.clone(),
            quantity: record.quantity,
            start: record.start,
            end: record.end,
        };
        self.working.push(stored.clone());
        Ok(stored)
    }

    async fn update_record_end(&mut self, filter: &UsageFilter, end: DateTime<Utc>) -> Result<u64> {
        let mut touched = 0;
        for record in self.targets(filter) {
            record.end = Some(end);
            touched += 1;
        }
        Ok(touched)
    }

    async fn update_record_start(
        &mut self,
        filter: &UsageFilter,
        start: DateTime<Utc>,
    ) -> Result<u64> {
        let mut touched = 0;
        for record in self.targets(filter) {
            record.start = start;
            touched += 1;
        }
        Ok(touched)
    }

    async fn delete_usage_records(&mut self, filter: &UsageFilter) -> Result<u64> {
        let before = self.working.len();
        let license_id = self.license_id;
        let usage_group = self.usage_group.clone();
        self.working
            .retain(|r| !(in_scope(r, &license_id, &usage_group) && filter.matches(r)));
        Ok((before - self.working.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut transaction = *self;
        transaction.guard.usage = std::mem::take(&mut transaction.working);
        transaction.guard.last_usage_id = transaction.last_usage_id;
        Ok(())
    }
}

#[async_trait]
impl BillingCycleRepository for InMemoryStore {
    async fn find_billing_cycle(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>> {
        let state = self.state.lock().await;
        Ok(state
            .cycles
            .iter()
            .find(|c| {
                c.owner_id == *owner_id
                    && c.cycle_type == cycle_type
                    && c.start == start
                    && c.end == end
            })
            .cloned())
    }

    async fn find_or_create_billing_cycle(&self, cycle: &BillingCycle) -> Result<BillingCycle> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.cycles.iter().find(|c| {
            c.owner_id == cycle.owner_id
                && c.cycle_type == cycle.cycle_type
                && c.start == cycle.start
                && c.end == cycle.end
        }) {
            return Ok(existing.clone());
        }

        state.cycles.push(cycle.clone());
        Ok(cycle.clone())
    }

    async fn find_cycle_containing(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>> {
        let state = self.state.lock().await;
        Ok(state
            .cycles
            .iter()
            .filter(|c| {
                c.owner_id == *owner_id && c.cycle_type == cycle_type && c.active && c.contains(at)
            })
            .max_by_key(|c| c.start)
            .cloned())
    }
}

#[async_trait]
impl LicenseRepository for InMemoryStore {
    async fn create_license(
        &self,
        id: &LicenseId,
        owner_id: &OwnerId,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License> {
        let mut state = self.state.lock().await;
        if state.licenses.contains_key(id) {
            return Err(BillingError::ConcurrencyConflict {
                operation: "create_license".to_string(),
                message: format!("license {} already exists", id),
            });
        }

        let revision_id = state.next_revision(*id, plan_id, status, created_at);
        let license = License {
            id: *id,
            owner_id: owner_id.clone(),
            revision_id,
            plan_id: plan_id.to_string(),
            status,
            previous: None,
        };
        state.licenses.insert(*id, license.clone());
        Ok(license)
    }

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>> {
        let state = self.state.lock().await;
        Ok(state.licenses.get(id).cloned())
    }

    async fn add_revision(
        &self,
        license: &License,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License> {
        let mut state = self.state.lock().await;
        let current_revision = state
            .licenses
            .get(&license.id)
            .map(|l| l.revision_id)
            .ok_or_else(|| BillingError::LicenseNotFound {
                id: license.id.to_string(),
            })?;

        if current_revision != license.revision_id {
            return Err(BillingError::ConcurrencyConflict {
                operation: "add_revision".to_string(),
                message: format!(
                    "license {} is no longer at revision {}",
                    license.id, license.revision_id
                ),
            });
        }

        let revision_id = state.next_revision(license.id, plan_id, status, created_at);
        let updated = License {
            id: license.id,
            owner_id: license.owner_id.clone(),
            revision_id,
            plan_id: plan_id.to_string(),
            status,
            previous: Some(license.snapshot()),
        };
        state.licenses.insert(license.id, updated.clone());
        Ok(updated)
    }

    async fn list_revisions(&self, id: &LicenseId) -> Result<Vec<LicenseRevision>> {
        let state = self.state.lock().await;
        let mut revisions: Vec<LicenseRevision> = state
            .revisions
            .iter()
            .filter(|r| r.license_id == *id)
            .cloned()
            .collect();
        revisions.sort_by_key(|r| r.revision_id);
        Ok(revisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn new_record(license_id: LicenseId, start: i64) -> NewUsageRecord {
        NewUsageRecord {
            license_id,
            revision_id: RevisionId::new(1),
            usage_group: "environments".to_string(),
            quantity: Decimal::from(2),
            start: ts(start),
            end: None,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let license_id = LicenseId::new();

        {
            let mut tx = store.begin(&license_id, "environments").await.unwrap();
            tx.create_usage_record(&new_record(license_id, 100))
                .await
                .unwrap();
        }
        assert!(store.all_usage_records().await.is_empty());

        let mut tx = store.begin(&license_id, "environments").await.unwrap();
        let created = tx
            .create_usage_record(&new_record(license_id, 100))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(created.id, UsageRecordId::new(1));
        assert_eq!(store.all_usage_records().await, vec![created]);
    }

    #[tokio::test]
    async fn test_filters_stay_inside_scope() {
        let store = InMemoryStore::new();
        let license_id = LicenseId::new();
        let other_license = LicenseId::new();

        for (license, start) in [(license_id, 100), (other_license, 100)] {
            let mut tx = store.begin(&license, "environments").await.unwrap();
            tx.create_usage_record(&new_record(license, start))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let mut tx = store.begin(&license_id, "environments").await.unwrap();
        let deleted = tx.delete_usage_records(&UsageFilter::all()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(deleted, 1);
        let remaining = store.all_usage_records().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].license_id, other_license);
    }

    #[tokio::test]
    async fn test_cycle_creation_is_idempotent() {
        let store = InMemoryStore::new();
        let owner = OwnerId::new("owner-1");
        let first = BillingCycle::new("monthly".to_string(), owner.clone(), ts(0), ts(99));
        let second = BillingCycle::new("monthly".to_string(), owner.clone(), ts(0), ts(99));

        let stored_first = store.find_or_create_billing_cycle(&first).await.unwrap();
        let stored_second = store.find_or_create_billing_cycle(&second).await.unwrap();
        assert_eq!(stored_first.id, stored_second.id);

        let containing = store
            .find_cycle_containing(&owner, "monthly", ts(50))
            .await
            .unwrap();
        assert_eq!(containing.map(|c| c.id), Some(first.id));
        assert!(store
            .find_cycle_containing(&owner, "monthly", ts(100))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = InMemoryStore::new();
        let license = store
            .create_license(
                &LicenseId::new(),
                &OwnerId::new("owner-1"),
                "basic",
                LicenseStatus::Created,
                ts(0),
            )
            .await
            .unwrap();

        let activated = store
            .add_revision(&license, "basic", LicenseStatus::Active, ts(10))
            .await
            .unwrap();
        assert_eq!(activated.previous_status(), Some(LicenseStatus::Created));

        let stale = store
            .add_revision(&license, "pro", LicenseStatus::Active, ts(20))
            .await;
        assert!(matches!(
            stale,
            Err(BillingError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.list_revisions(&license.id).await.unwrap().len(), 2);
    }
}
