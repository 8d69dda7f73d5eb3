use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Owner of licenses and billing cycles (the customer account)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// License identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicenseId(Uuid);

impl LicenseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LicenseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LicenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LicenseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// License revision identifier. Revisions are numbered in creation order,
/// so a higher id is always a later revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId(i64);

impl RevisionId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Usage record identifier, monotonically increasing in insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageRecordId(i64);

impl UsageRecordId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UsageRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Billing cycle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingCycleId(Uuid);

impl BillingCycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BillingCycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BillingCycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// License lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Created,
    Pending,
    Active,
    Suspended,
    Expired,
    Canceled,
}

impl LicenseStatus {
    /// Statuses that precede the first activation.
    pub fn is_pre_active(&self) -> bool {
        matches!(self, LicenseStatus::Created | LicenseStatus::Pending)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LicenseStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LicenseStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: LicenseStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            // A new revision without a status change (plan change)
            return true;
        }
        matches!(
            (self, next),
            (LicenseStatus::Created, LicenseStatus::Pending)
                | (LicenseStatus::Created, LicenseStatus::Active)
                | (LicenseStatus::Pending, LicenseStatus::Active)
                | (LicenseStatus::Active, LicenseStatus::Suspended)
                | (LicenseStatus::Active, LicenseStatus::Expired)
                | (LicenseStatus::Suspended, LicenseStatus::Active)
                | (LicenseStatus::Suspended, LicenseStatus::Expired)
                | (LicenseStatus::Expired, LicenseStatus::Active)
                | (_, LicenseStatus::Canceled)
        )
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseStatus::Created => write!(f, "created"),
            LicenseStatus::Pending => write!(f, "pending"),
            LicenseStatus::Active => write!(f, "active"),
            LicenseStatus::Suspended => write!(f, "suspended"),
            LicenseStatus::Expired => write!(f, "expired"),
            LicenseStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(LicenseStatus::Created),
            "pending" => Ok(LicenseStatus::Pending),
            "active" => Ok(LicenseStatus::Active),
            "suspended" => Ok(LicenseStatus::Suspended),
            "expired" => Ok(LicenseStatus::Expired),
            "canceled" => Ok(LicenseStatus::Canceled),
            other => Err(format!("unknown license status: {}", other)),
        }
    }
}

/// Length of a billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingPeriod {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    HalfYear,
    Year,
}

impl BillingPeriod {
    /// Calendar months spanned by the period, for month-based periods.
    pub fn months(&self) -> Option<u32> {
        match self {
            BillingPeriod::Month => Some(1),
            BillingPeriod::Quarter => Some(3),
            BillingPeriod::HalfYear => Some(6),
            BillingPeriod::Year => Some(12),
            BillingPeriod::Hour | BillingPeriod::Day | BillingPeriod::Week => None,
        }
    }

    /// Fixed length of the period, for periods that are not month-based.
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            BillingPeriod::Hour => Some(Duration::hours(1)),
            BillingPeriod::Day => Some(Duration::days(1)),
            BillingPeriod::Week => Some(Duration::weeks(1)),
            _ => None,
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingPeriod::Hour => write!(f, "hour"),
            BillingPeriod::Day => write!(f, "day"),
            BillingPeriod::Week => write!(f, "week"),
            BillingPeriod::Month => write!(f, "month"),
            BillingPeriod::Quarter => write!(f, "quarter"),
            BillingPeriod::HalfYear => write!(f, "half-year"),
            BillingPeriod::Year => write!(f, "year"),
        }
    }
}

impl FromStr for BillingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(BillingPeriod::Hour),
            "day" => Ok(BillingPeriod::Day),
            "week" => Ok(BillingPeriod::Week),
            "month" => Ok(BillingPeriod::Month),
            "quarter" => Ok(BillingPeriod::Quarter),
            "half-year" => Ok(BillingPeriod::HalfYear),
            "year" => Ok(BillingPeriod::Year),
            other => Err(format!("unknown billing period: {}", other)),
        }
    }
}

/// How usage in a group accumulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageGroupKind {
    /// Additive events (bandwidth, API calls)
    Counter,
    /// Point-in-time levels held over intervals (environments, seats)
    Gauge,
}

impl fmt::Display for UsageGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageGroupKind::Counter => write!(f, "counter"),
            UsageGroupKind::Gauge => write!(f, "gauge"),
        }
    }
}

/// A metered resource offered by a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageGroupDefinition {
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub kind: UsageGroupKind,
    /// SKU handed to the charge estimator
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub free_quantity: Decimal,
    #[serde(default)]
    pub not_charged: bool,
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub initial_quantity: Option<Decimal>,
}

impl UsageGroupDefinition {
    pub fn counter(name: impl Into<String>, free_quantity: Decimal) -> Self {
        Self::new(name, UsageGroupKind::Counter, free_quantity)
    }

    pub fn gauge(name: impl Into<String>, free_quantity: Decimal) -> Self {
        Self::new(name, UsageGroupKind::Gauge, free_quantity)
    }

    fn new(name: impl Into<String>, kind: UsageGroupKind, free_quantity: Decimal) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            kind,
            product: None,
            free_quantity,
            not_charged: false,
            immediate: false,
            initial_quantity: None,
        }
    }
}

/// A stored unit of usage for a (license, usage group) scope.
///
/// `end == None` marks an open record that is still accruing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub license_id: LicenseId,
    pub revision_id: RevisionId,
    pub usage_group: String,
    pub quantity: Decimal,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whether the record's interval intersects the closed range `[start, end]`.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && self.end.map_or(true, |e| e >= start)
    }

    pub fn overlaps(&self, other: &UsageRecord) -> bool {
        let self_before_other = self.end.map_or(false, |e| e < other.start);
        let other_before_self = other.end.map_or(false, |e| e < self.start);
        !self_before_other && !other_before_self
    }
}

/// Input for appending a usage record
#[derive(Debug, Clone, PartialEq)]
pub struct NewUsageRecord {
    pub license_id: LicenseId,
    pub revision_id: RevisionId,
    pub usage_group: String,
    pub quantity: Decimal,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// A billing period for one owner and cycle type.
///
/// `end` is stored as one second before the next cycle's start so that
/// consecutive cycles tile the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycle {
    pub id: BillingCycleId,
    pub cycle_type: String,
    pub owner_id: OwnerId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub active: bool,
}

impl BillingCycle {
    pub fn new(
        cycle_type: String,
        owner_id: OwnerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BillingCycleId::new(),
            cycle_type,
            owner_id,
            start,
            end,
            active: true,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    /// Length of the cycle in seconds, counting both boundary seconds.
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds() + 1
    }
}

/// Free allowance of a usage group for one revision within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeQuantity {
    pub quantity: Decimal,
    /// Part of the cycle during which the revision was in effect
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FreeQuantity {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds() + 1
    }
}

/// Usage line item handed to the external charge estimator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeableUsage {
    pub usage_group: String,
    pub product: Option<String>,
    /// Set for gauge items, which are charged per revision interval
    pub revision_id: Option<RevisionId>,
    pub quantity: Decimal,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Status and plan of a license at one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseSnapshot {
    pub revision_id: RevisionId,
    pub plan_id: String,
    pub status: LicenseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: LicenseId,
    pub owner_id: OwnerId,
    pub revision_id: RevisionId,
    pub plan_id: String,
    pub status: LicenseStatus,
    /// Snapshot of the revision this one replaced, used to diff transitions
    pub previous: Option<LicenseSnapshot>,
}

impl License {
    pub fn snapshot(&self) -> LicenseSnapshot {
        LicenseSnapshot {
            revision_id: self.revision_id,
            plan_id: self.plan_id.clone(),
            status: self.status,
        }
    }

    pub fn previous_status(&self) -> Option<LicenseStatus> {
        self.previous.as_ref().map(|p| p.status)
    }
}

/// Persisted revision of a license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRevision {
    pub revision_id: RevisionId,
    pub license_id: LicenseId,
    pub plan_id: String,
    pub status: LicenseStatus,
    pub created_at: DateTime<Utc>,
}

/// Interval during which a revision was in effect. `end == None` for the
/// current revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSpan {
    pub revision_id: RevisionId,
    pub plan_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl RevisionSpan {
    /// Derives spans from revisions ordered by id: each revision lasts until
    /// one second before the next one was created. A revision replaced in
    /// the second it was created keeps the single second `[start, start]`.
    pub fn from_revisions(revisions: &[LicenseRevision]) -> Vec<RevisionSpan> {
        let mut ordered: Vec<&LicenseRevision> = revisions.iter().collect();
        ordered.sort_by_key(|r| r.revision_id);

        ordered
            .iter()
            .enumerate()
            .map(|(index, revision)| RevisionSpan {
                revision_id: revision.revision_id,
                plan_id: revision.plan_id.clone(),
                start: revision.created_at,
                end: ordered.get(index + 1).map(|next| {
                    (next.created_at - Duration::seconds(1)).max(revision.created_at)
                }),
            })
            .collect()
    }

    /// Clips the span to `[start, end]`, or `None` if they do not intersect.
    pub fn clip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let clipped_start = self.start.max(start);
        let clipped_end = self.end.map_or(end, |e| e.min(end));
        if clipped_start > clipped_end {
            None
        } else {
            Some((clipped_start, clipped_end))
        }
    }
}
