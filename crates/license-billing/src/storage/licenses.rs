use crate::domain::types::{
    License, LicenseId, LicenseRevision, LicenseSnapshot, LicenseStatus, OwnerId, RevisionId,
};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[async_trait]
pub trait LicenseRepository: Send + Sync {
    /// Creates a license together with its first revision.
    async fn create_license(
        &self,
        id: &LicenseId,
        owner_id: &OwnerId,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License>;

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>>;

    /// Appends a revision and makes it current. The returned license carries
    /// the replaced revision as its previous snapshot.
    async fn add_revision(
        &self,
        license: &License,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License>;

    /// All revisions of a license ordered by revision id.
    async fn list_revisions(&self, id: &LicenseId) -> Result<Vec<LicenseRevision>>;
}

pub struct SqlLicenseRepository {
    pool: PgPool,
}

impl SqlLicenseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unknown statuses are decode errors, never a guessed status.
    fn parse_status(value: &str) -> std::result::Result<LicenseStatus, sqlx::Error> {
        value.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))
    }

    fn license_from_row(row: &PgRow) -> std::result::Result<License, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let previous_revision: Option<i64> = row.try_get("previous_revision_id")?;
        let previous = match previous_revision {
            Some(revision_id) => {
                let previous_status: String = row.try_get("previous_status")?;
                Some(LicenseSnapshot {
                    revision_id: RevisionId::new(revision_id),
                    plan_id: row.try_get("previous_plan_id")?,
                    status: Self::parse_status(&previous_status)?,
                })
            }
            None => None,
        };

        Ok(License {
            id: LicenseId::from_uuid(row.try_get("license_id")?),
            owner_id: OwnerId::new(row.try_get::<String, _>("owner_id")?),
            revision_id: RevisionId::new(row.try_get("revision_id")?),
            plan_id: row.try_get("plan_id")?,
            status: Self::parse_status(&status)?,
            previous,
        })
    }
}

#[async_trait]
impl LicenseRepository for SqlLicenseRepository {
    async fn create_license(
        &self,
        id: &LicenseId,
        owner_id: &OwnerId,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::from_sqlx("create_license", e))?;

        sqlx::query(
            r#"
            INSERT INTO billing.licenses
                (license_id, owner_id, revision_id, plan_id, status, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $4, $5, $5)
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner_id.as_str())
        .bind(plan_id)
        .bind(status.to_string())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::from_sqlx("create_license", e))?;

        let revision_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO billing.license_revisions (license_id, plan_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING revision_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(plan_id)
        .bind(status.to_string())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::from_sqlx("create_license", e))?;

        sqlx::query("UPDATE billing.licenses SET revision_id = $2 WHERE license_id = $1")
            .bind(id.as_uuid())
            .bind(revision_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::from_sqlx("create_license", e))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::from_sqlx("create_license", e))?;

        Ok(License {
            id: *id,
            owner_id: owner_id.clone(),
            revision_id: RevisionId::new(revision_id),
            plan_id: plan_id.to_string(),
            status,
            previous: None,
        })
    }

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>> {
        let row = sqlx::query(
            r#"
            SELECT l.license_id, l.owner_id, l.revision_id, l.plan_id, l.status,
                   l.previous_revision_id,
                   p.plan_id AS previous_plan_id, p.status AS previous_status
            FROM billing.licenses l
            LEFT JOIN billing.license_revisions p ON p.revision_id = l.previous_revision_id
            WHERE l.license_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::from_sqlx("get_license", e))?;

        row.as_ref()
            .map(Self::license_from_row)
            .transpose()
            .map_err(|e| BillingError::from_sqlx("get_license", e))
    }

    async fn add_revision(
        &self,
        license: &License,
        plan_id: &str,
        status: LicenseStatus,
        created_at: DateTime<Utc>,
    ) -> Result<License> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::from_sqlx("add_revision", e))?;

        let revision_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO billing.license_revisions (license_id, plan_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING revision_id
            "#,
        )
        .bind(license.id.as_uuid())
        .bind(plan_id)
        .bind(status.to_string())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::from_sqlx("add_revision", e))?;

        // Guarded on the revision we read so that concurrent revisions conflict
        let result = sqlx::query(
            r#"
            UPDATE billing.licenses
            SET revision_id = $2, plan_id = $3, status = $4,
                previous_revision_id = $5, updated_at = $6
            WHERE license_id = $1 AND revision_id = $5
            "#,
        )
        .bind(license.id.as_uuid())
        .bind(revision_id)
        .bind(plan_id)
        .bind(status.to_string())
        .bind(license.revision_id.value())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::from_sqlx("add_revision", e))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrencyConflict {
                operation: "add_revision".to_string(),
                message: format!(
                    "license {} is no longer at revision {}",
                    license.id, license.revision_id
                ),
            });
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::from_sqlx("add_revision", e))?;

        Ok(License {
            id: license.id,
            owner_id: license.owner_id.clone(),
            revision_id: RevisionId::new(revision_id),
            plan_id: plan_id.to_string(),
            status,
            previous: Some(license.snapshot()),
        })
    }

    async fn list_revisions(&self, id: &LicenseId) -> Result<Vec<LicenseRevision>> {
        let rows = sqlx::query(
            r#"
            SELECT revision_id, license_id, plan_id, status, created_at
            FROM billing.license_revisions
            WHERE license_id = $1
            ORDER BY revision_id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::from_sqlx("list_revisions", e))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(LicenseRevision {
                    revision_id: RevisionId::new(row.try_get("revision_id")?),
                    license_id: LicenseId::from_uuid(row.try_get("license_id")?),
                    plan_id: row.try_get("plan_id")?,
                    status: Self::parse_status(&status)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| BillingError::from_sqlx("list_revisions", e))
    }
}
