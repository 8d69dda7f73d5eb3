use crate::domain::types::{LicenseId, NewUsageRecord, RevisionId, UsageRecord, UsageRecordId};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

/// Row predicate over the usage records of one (license, usage group) scope.
///
/// Every populated field is a conjunct. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageFilter {
    pub revision_id: Option<RevisionId>,
    /// `start < t`
    pub start_before: Option<DateTime<Utc>>,
    /// `start >= t`
    pub start_at_or_after: Option<DateTime<Utc>>,
    /// `start <= t`
    pub start_at_or_before: Option<DateTime<Utc>>,
    /// closed and `end <= t`
    pub end_at_or_before: Option<DateTime<Utc>>,
    /// open or `end >= t`
    pub open_or_end_at_or_after: Option<DateTime<Utc>>,
    /// open or `end > t`
    pub open_or_end_after: Option<DateTime<Utc>>,
    /// `Some(true)` only open records, `Some(false)` only closed ones
    pub open: Option<bool>,
}

impl UsageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Records whose interval intersects the closed range `[start, end]`.
    pub fn intersecting(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_at_or_before: Some(end),
            open_or_end_at_or_after: Some(start),
            ..Self::default()
        }
    }

    pub fn open_for_revision(revision_id: RevisionId) -> Self {
        Self {
            revision_id: Some(revision_id),
            open: Some(true),
            ..Self::default()
        }
    }

    pub fn closed() -> Self {
        Self {
            open: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        if let Some(revision_id) = self.revision_id {
            if record.revision_id != revision_id {
                return false;
            }
        }
        if let Some(t) = self.start_before {
            if record.start >= t {
                return false;
            }
        }
        if let Some(t) = self.start_at_or_after {
            if record.start < t {
                return false;
            }
        }
        if let Some(t) = self.start_at_or_before {
            if record.start > t {
                return false;
            }
        }
        if let Some(t) = self.end_at_or_before {
            if record.end.map_or(true, |end| end > t) {
                return false;
            }
        }
        if let Some(t) = self.open_or_end_at_or_after {
            if record.end.map_or(false, |end| end < t) {
                return false;
            }
        }
        if let Some(t) = self.open_or_end_after {
            if record.end.map_or(false, |end| end <= t) {
                return false;
            }
        }
        if let Some(open) = self.open {
            if record.is_open() != open {
                return false;
            }
        }
        true
    }

    fn push_conditions(&self, builder: &mut QueryBuilder<'static, Postgres>) {
        if let Some(revision_id) = self.revision_id {
            builder
                .push(" AND revision_id = ")
                .push_bind(revision_id.value());
        }
        if let Some(t) = self.start_before {
            builder.push(" AND start_at < ").push_bind(t);
        }
        if let Some(t) = self.start_at_or_after {
            builder.push(" AND start_at >= ").push_bind(t);
        }
        if let Some(t) = self.start_at_or_before {
            builder.push(" AND start_at <= ").push_bind(t);
        }
        if let Some(t) = self.end_at_or_before {
            builder.push(" AND end_at IS NOT NULL AND end_at <= ").push_bind(t);
        }
        if let Some(t) = self.open_or_end_at_or_after {
            builder
                .push(" AND (end_at IS NULL OR end_at >= ")
                .push_bind(t)
                .push(")");
        }
        if let Some(t) = self.open_or_end_after {
            builder
                .push(" AND (end_at IS NULL OR end_at > ")
                .push_bind(t)
                .push(")");
        }
        match self.open {
            Some(true) => {
                builder.push(" AND end_at IS NULL");
            }
            Some(false) => {
                builder.push(" AND end_at IS NOT NULL");
            }
            None => {}
        }
    }
}

/// Persistence contract for usage records.
///
/// Reads may run outside a transaction. Every mutation goes through a
/// [`UsageTransaction`] that holds an exclusive lock on the scope until it
/// is committed or dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Records of the scope matching `filter`, ordered by record id.
    async fn query_usage_records(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
        filter: &UsageFilter,
    ) -> Result<Vec<UsageRecord>>;

    /// Opens a transaction locking the (license, usage group) scope.
    async fn begin(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
    ) -> Result<Box<dyn UsageTransaction>>;
}

/// Unit of work over one locked (license, usage group) scope.
///
/// Dropping the transaction without calling `commit` discards its changes.
#[async_trait]
pub trait UsageTransaction: Send {
    async fn query_usage_records(&mut self, filter: &UsageFilter) -> Result<Vec<UsageRecord>>;

    async fn create_usage_record(&mut self, record: &NewUsageRecord) -> Result<UsageRecord>;

    /// Sets `end` on every matching record; returns the number of rows touched.
    async fn update_record_end(&mut self, filter: &UsageFilter, end: DateTime<Utc>) -> Result<u64>;

    /// Sets `start` on every matching record; returns the number of rows touched.
    async fn update_record_start(
        &mut self,
        filter: &UsageFilter,
        start: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_usage_records(&mut self, filter: &UsageFilter) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

const USAGE_COLUMNS: &str =
    "usage_id, license_id, revision_id, usage_group, quantity, start_at, end_at";

fn usage_record_from_row(row: &PgRow) -> std::result::Result<UsageRecord, sqlx::Error> {
    Ok(UsageRecord {
        id: UsageRecordId::new(row.try_get("usage_id")?),
        license_id: LicenseId::from_uuid(row.try_get("license_id")?),
        revision_id: RevisionId::new(row.try_get("revision_id")?),
        usage_group: row.try_get("usage_group")?,
        quantity: row.try_get("quantity")?,
        start: row.try_get("start_at")?,
        end: row.try_get("end_at")?,
    })
}

fn scoped(
    prefix: QueryBuilder<'static, Postgres>,
    license_id: &LicenseId,
    usage_group: &str,
    filter: &UsageFilter,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = prefix;
    builder
        .push(" WHERE license_id = ")
        .push_bind(license_id.as_uuid())
        .push(" AND usage_group = ")
        .push_bind(usage_group.to_string());
    filter.push_conditions(&mut builder);
    builder
}

fn select_query(
    license_id: &LicenseId,
    usage_group: &str,
    filter: &UsageFilter,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = scoped(
        QueryBuilder::new(format!("SELECT {} FROM billing.usage_records", USAGE_COLUMNS)),
        license_id,
        usage_group,
        filter,
    );
    builder.push(" ORDER BY usage_id ASC");
    builder
}

pub struct SqlUsageRepository {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl SqlUsageRepository {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }
}

#[async_trait]
impl UsageRepository for SqlUsageRepository {
    async fn query_usage_records(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
        filter: &UsageFilter,
    ) -> Result<Vec<UsageRecord>> {
        let rows = select_query(license_id, usage_group, filter)
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::from_sqlx("query_usage_records", e))?;

        rows.iter()
            .map(usage_record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BillingError::from_sqlx("query_usage_records", e))
    }

    async fn begin(
        &self,
        license_id: &LicenseId,
        usage_group: &str,
    ) -> Result<Box<dyn UsageTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::from_sqlx("begin_usage_transaction", e))?;

        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::from_sqlx("begin_usage_transaction", e))?;

        // Serializes writers on scopes that have no rows yet
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", license_id, usage_group))
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::from_sqlx("lock_usage_scope", e))?;

        sqlx::query(
            r#"
            SELECT usage_id FROM billing.usage_records
            WHERE license_id = $1 AND usage_group = $2
            FOR UPDATE
            "#,
        )
        .bind(license_id.as_uuid())
        .bind(usage_group)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| BillingError::from_sqlx("lock_usage_scope", e))?;

        debug!("Locked usage scope {}:{}", license_id, usage_group);

        Ok(Box::new(SqlUsageTransaction {
            tx,
            license_id: *license_id,
            usage_group: usage_group.to_string(),
        }))
    }
}

pub struct SqlUsageTransaction {
    tx: Transaction<'static, Postgres>,
    license_id: LicenseId,
    usage_group: String,
}

#[async_trait]
impl UsageTransaction for SqlUsageTransaction {
    async fn query_usage_records(&mut self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let rows = select_query(&self.license_id, &self.usage_group, filter)
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| BillingError::from_sqlx("query_usage_records", e))?;

        rows.iter()
            .map(usage_record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BillingError::from_sqlx("query_usage_records", e))
    }

    async fn create_usage_record(&mut self, record: &NewUsageRecord) -> Result<UsageRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO billing.usage_records
                (license_id, revision_id, usage_group, quantity, start_at, end_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            USAGE_COLUMNS
        ))
        .bind(record.license_id.as_uuid())
        .bind(record.revision_id.value())
        .bind(&record.usage_group)
        .bind(record.quantity)
        .bind(record.start)
        .bind(record.end)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| BillingError::from_sqlx("create_usage_record", e))?;

        usage_record_from_row(&row).map_err(|e| BillingError::from_sqlx("create_usage_record", e))
    }

    async fn update_record_end(&mut self, filter: &UsageFilter, end: DateTime<Utc>) -> Result<u64> {
        let mut prefix = QueryBuilder::new("UPDATE billing.usage_records SET end_at = ");
        prefix.push_bind(end);

        let result = scoped(prefix, &self.license_id, &self.usage_group, filter)
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| BillingError::from_sqlx("update_record_end", e))?;

        Ok(result.rows_affected())
    }

    async fn update_record_start(
        &mut self,
        filter: &UsageFilter,
        start: DateTime<Utc>,
    ) -> Result<u64> {
        let mut prefix = QueryBuilder::new("UPDATE billing.usage_records SET start_at = ");
        prefix.push_bind(start);

        let result = scoped(prefix, &self.license_id, &self.usage_group, filter)
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| BillingError::from_sqlx("update_record_start", e))?;

        Ok(result.rows_affected())
    }

    async fn delete_usage_records(&mut self, filter: &UsageFilter) -> Result<u64> {
        let result = scoped(
            QueryBuilder::new("DELETE FROM billing.usage_records"),
            &self.license_id,
            &self.usage_group,
            filter,
        )
        .build()
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::from_sqlx("delete_usage_records", e))?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| BillingError::from_sqlx("commit_usage_transaction", e))
    }
}
