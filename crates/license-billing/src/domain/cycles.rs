use crate::config::CycleConfig;
use crate::domain::types::{BillingCycle, BillingPeriod, OwnerId};
use crate::error::{BillingError, Result};
use crate::metrics::BillingMetrics;
use crate::storage::cycles::BillingCycleRepository;
use crate::storage::retry::retry_on_conflict;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use std::sync::Arc;
use tracing::{debug, info};

/// Derives calendar-aligned billing cycle boundaries and resolves them to
/// stored cycles.
pub struct BillingCycleCalculator {
    repository: Arc<dyn BillingCycleRepository>,
    config: CycleConfig,
    metrics: Option<Arc<BillingMetrics>>,
    conflict_retries: bool,
}

impl BillingCycleCalculator {
    pub fn new(repository: Arc<dyn BillingCycleRepository>, config: CycleConfig) -> Self {
        Self {
            repository,
            config,
            metrics: None,
            conflict_retries: true,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_conflict_retries(mut self, enabled: bool) -> Self {
        self.conflict_retries = enabled;
        self
    }

    pub fn cycle_type(&self) -> &str {
        &self.config.cycle_type
    }

    pub fn period(&self) -> BillingPeriod {
        self.config.period
    }

    pub fn normalize_start(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        normalize_start(
            at,
            self.config.period,
            self.config.asynchronous,
            self.config.week_start,
        )
    }

    pub fn compute_end(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>> {
        compute_end(start, self.config.period)
    }

    /// Returns the owner's cycle covering `at`, creating it when missing.
    ///
    /// With `save == false` a missing cycle is returned unsaved, which lets
    /// estimation callers price a period without persisting anything.
    pub async fn get_or_create_cycle(
        &self,
        owner_id: &OwnerId,
        at: DateTime<Utc>,
        save: bool,
    ) -> Result<BillingCycle> {
        let start = self.normalize_start(at)?;
        let end = self.compute_end(start)?;
        let cycle_type = self.config.cycle_type.as_str();

        if !save {
            let existing = self
                .repository
                .find_billing_cycle(owner_id, cycle_type, start, end)
                .await?;
            return Ok(existing.unwrap_or_else(|| {
                BillingCycle::new(cycle_type.to_string(), owner_id.clone(), start, end)
            }));
        }

        let candidate = BillingCycle::new(cycle_type.to_string(), owner_id.clone(), start, end);
        let metrics = self.metrics.as_deref();
        let stored = if self.conflict_retries {
            retry_on_conflict("find_or_create_billing_cycle", metrics, || {
                self.repository.find_or_create_billing_cycle(&candidate)
            })
            .await?
        } else {
            self.repository
                .find_or_create_billing_cycle(&candidate)
                .await?
        };

        if stored.id == candidate.id {
            info!(
                "Created {} billing cycle {} for owner {}: {} - {}",
                cycle_type, stored.id, owner_id, stored.start, stored.end
            );
            if let Some(metrics) = metrics {
                metrics.record_cycle_created(cycle_type);
            }
        } else {
            debug!("Resolved existing billing cycle {}", stored.id);
        }

        Ok(stored)
    }

    pub async fn get_next_cycle(&self, cycle: &BillingCycle, save: bool) -> Result<BillingCycle> {
        self.get_or_create_cycle(&cycle.owner_id, cycle.end + Duration::seconds(1), save)
            .await
    }

    /// The stored cycle covering `at`, without creating one. `None` usually
    /// means the owner has no active license yet.
    pub async fn find_cycle(
        &self,
        owner_id: &OwnerId,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingCycle>> {
        self.repository
            .find_cycle_containing(owner_id, &self.config.cycle_type, at)
            .await
    }

    pub fn label(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        label(start, end, self.config.period, self.config.asynchronous)
    }
}

fn midnight(date: NaiveDate) -> Result<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| BillingError::validation("start", "invalid calendar date"))
}

fn first_of_month(year: i32, month: u32) -> Result<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| BillingError::validation("start", "invalid calendar date"))
        .and_then(midnight)
}

/// Aligns `at` to the start of its calendar period. Asynchronous cycles keep
/// `at` unchanged so that they roll forward from their first instant.
///
/// The year period normalizes to January 1st of the year *after* `at`.
/// Every other period normalizes backwards into the enclosing period.
pub fn normalize_start(
    at: DateTime<Utc>,
    period: BillingPeriod,
    asynchronous: bool,
    week_start: Weekday,
) -> Result<DateTime<Utc>> {
    if asynchronous {
        return Ok(at);
    }

    match period {
        BillingPeriod::Hour => at
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| BillingError::validation("start", "cannot align to the hour")),
        BillingPeriod::Day => midnight(at.date_naive()),
        BillingPeriod::Week => {
            let offset = (7 + at.weekday().num_days_from_monday()
                - week_start.num_days_from_monday())
                % 7;
            midnight(at.date_naive() - Duration::days(i64::from(offset)))
        }
        BillingPeriod::Month => first_of_month(at.year(), at.month()),
        BillingPeriod::Quarter => first_of_month(at.year(), (at.month() - 1) / 3 * 3 + 1),
        BillingPeriod::HalfYear => {
            first_of_month(at.year(), if at.month() < 7 { 1 } else { 7 })
        }
        BillingPeriod::Year => first_of_month(at.year() + 1, 1),
    }
}

/// End of the cycle starting at `start`: one second before the next cycle
/// starts. Month arithmetic clamps to the end of shorter months.
pub fn compute_end(start: DateTime<Utc>, period: BillingPeriod) -> Result<DateTime<Utc>> {
    let next_start = match (period.months(), period.fixed_duration()) {
        (Some(months), _) => start.checked_add_months(Months::new(months)),
        (None, Some(duration)) => start.checked_add_signed(duration),
        (None, None) => None,
    };

    next_start
        .map(|next| next - Duration::seconds(1))
        .ok_or_else(|| BillingError::validation("start", "cycle end is out of range"))
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}

/// "March 1st 2024"
fn long_date(at: DateTime<Utc>) -> String {
    format!(
        "{} {}{} {}",
        at.format("%B"),
        at.day(),
        ordinal_suffix(at.day()),
        at.year()
    )
}

/// Human readable description of a cycle.
///
/// Day cycles render a single date, synchronous month cycles render the month
/// and year, everything else renders a date range.
pub fn label(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period: BillingPeriod,
    asynchronous: bool,
) -> String {
    match period {
        BillingPeriod::Day => long_date(end),
        BillingPeriod::Month if !asynchronous => start.format("%B %Y").to_string(),
        _ => format!("{} - {}", long_date(start), long_date(end)),
    }
}
