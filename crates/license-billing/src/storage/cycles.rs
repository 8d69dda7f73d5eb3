use crate::domain::types::{BillingCycle, BillingCycleId, OwnerId};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BillingCycleRepository: Send + Sync {
    /// Exact lookup on (owner, cycle type, start, end).
    async fn find_billing_cycle(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>>;

    /// Persists `cycle` unless a cycle with the same (owner, cycle type,
    /// start, end) exists, and returns whichever row is stored.
    async fn find_or_create_billing_cycle(&self, cycle: &BillingCycle) -> Result<BillingCycle>;

    /// The active cycle of `cycle_type` covering `at`, if one was created.
    async fn find_cycle_containing(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>>;
}

pub struct SqlBillingCycleRepository {
    pool: PgPool,
}

impl SqlBillingCycleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn cycle_from_row(row: &PgRow) -> std::result::Result<BillingCycle, sqlx::Error> {
        Ok(BillingCycle {
            id: BillingCycleId::from_uuid(row.try_get("cycle_id")?),
            cycle_type: row.try_get("cycle_type")?,
            owner_id: OwnerId::new(row.try_get::<String, _>("owner_id")?),
            start: row.try_get("start_at")?,
            end: row.try_get("end_at")?,
            active: row.try_get("active")?,
        })
    }
}

#[async_trait]
impl BillingCycleRepository for SqlBillingCycleRepository {
    async fn find_billing_cycle(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>> {
        let row = sqlx::query(
            r#"
            SELECT cycle_id, cycle_type, owner_id, start_at, end_at, active
            FROM billing.billing_cycles
            WHERE owner_id = $1 AND cycle_type = $2 AND start_at = $3 AND end_at = $4
            "#,
        )
        .bind(owner_id.as_str())
        .bind(cycle_type)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::from_sqlx("find_billing_cycle", e))?;

        row.as_ref()
            .map(Self::cycle_from_row)
            .transpose()
            .map_err(|e| BillingError::from_sqlx("find_billing_cycle", e))
    }

    async fn find_or_create_billing_cycle(&self, cycle: &BillingCycle) -> Result<BillingCycle> {
        sqlx::query(
            r#"
            INSERT INTO billing.billing_cycles
                (cycle_id, cycle_type, owner_id, start_at, end_at, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (owner_id, cycle_type, start_at, end_at) DO NOTHING
            "#,
        )
        .bind(cycle.id.as_uuid())
        .bind(&cycle.cycle_type)
        .bind(cycle.owner_id.as_str())
        .bind(cycle.start)
        .bind(cycle.end)
        .bind(cycle.active)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::from_sqlx("find_or_create_billing_cycle", e))?;

        // Re-read so that a concurrent creator's row wins consistently
        self.find_billing_cycle(&cycle.owner_id, &cycle.cycle_type, cycle.start, cycle.end)
            .await?
            .ok_or_else(|| BillingError::ConcurrencyConflict {
                operation: "find_or_create_billing_cycle".to_string(),
                message: format!(
                    "cycle for owner {} starting {} vanished after insert",
                    cycle.owner_id, cycle.start
                ),
            })
    }

    async fn find_cycle_containing(
        &self,
        owner_id: &OwnerId,
        cycle_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>> {
        let row = sqlx::query(
            r#"
            SELECT cycle_id, cycle_type, owner_id, start_at, end_at, active
            FROM billing.billing_cycles
            WHERE owner_id = $1 AND cycle_type = $2 AND active
                AND start_at <= $3 AND end_at >= $3
            ORDER BY start_at DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id.as_str())
        .bind(cycle_type)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::from_sqlx("find_cycle_containing", e))?;

        row.as_ref()
            .map(Self::cycle_from_row)
            .transpose()
            .map_err(|e| BillingError::from_sqlx("find_cycle_containing", e))
    }
}
