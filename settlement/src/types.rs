//! Core types for partner settlement

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Period lifecycle status
///
/// Status only advances `Open -> Calculated -> Locked`; `Locked` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    /// Accepting calculation
    Open,
    /// Settlements computed, still correctable
    Calculated,
    /// Frozen
    Locked,
}

impl PeriodStatus {
    /// Upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Open => "OPEN",
            PeriodStatus::Calculated => "CALCULATED",
            PeriodStatus::Locked => "LOCKED",
        }
    }
}

impl std::fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settlement period covering `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    /// Period ID (UUIDv7)
    pub id: Uuid,

    /// Inclusive start
    pub start: DateTime<Utc>,

    /// Exclusive end
    pub end: DateTime<Utc>,

    /// Lifecycle status
    pub status: PeriodStatus,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last calculation time
    pub calculated_at: Option<DateTime<Utc>>,

    /// Actor of the last calculation
    pub calculated_by: Option<String>,

    /// Lock time
    pub locked_at: Option<DateTime<Utc>>,

    /// Locking actor
    pub locked_by: Option<String>,
}

impl SettlementPeriod {
    /// New OPEN period
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            start,
            end,
            status: PeriodStatus::Open,
            created_at: Utc::now(),
            calculated_at: None,
            calculated_by: None,
            locked_at: None,
            locked_by: None,
        }
    }

    /// Whether `[start, end)` intersects this period
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && self.start < end
    }

    /// Terminal state reached
    pub fn is_locked(&self) -> bool {
        self.status == PeriodStatus::Locked
    }

    /// Latest instant still inside `[start, end)`
    pub fn last_instant(&self) -> DateTime<Utc> {
        self.end - Duration::nanoseconds(1)
    }
}

/// Revenue share owed to one partner for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Settlement ID
    pub id: Uuid,

    /// Owning period
    pub period_id: Uuid,

    /// Partner code from attribution
    pub partner_code: String,

    /// Partner ID
    pub partner_id: Uuid,

    /// Attributed revenue in the window
    pub revenue_attributed: Decimal,

    /// Agreement percent used
    pub revenue_share_percent: Decimal,

    /// Amount owed (2 dp)
    pub amount: Decimal,

    /// Frozen with its period
    pub is_locked: bool,

    /// Calculation time
    pub calculated_at: DateTime<Utc>,

    /// Manual adjustment actor
    pub adjusted_by: Option<String>,

    /// Manual adjustment note
    pub adjustment_note: Option<String>,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

/// Partner record (owned by the partner management layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    /// Partner ID
    pub id: Uuid,

    /// Code used in attribution exports
    pub code: String,

    /// Display name
    pub name: String,
}

/// Revenue-share agreement with a validity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerAgreement {
    /// Partner ID
    pub partner_id: Uuid,

    /// Percent of attributed revenue owed (15 = 15%)
    pub revenue_share_percent: Decimal,

    /// Inclusive start
    pub valid_from: DateTime<Utc>,

    /// Exclusive end; open-ended when absent
    pub valid_until: Option<DateTime<Utc>>,
}

impl PartnerAgreement {
    /// Whether the agreement is in force at `at`
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_until.map_or(true, |until| at < until)
    }
}

/// One attribution export row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    /// Partner code
    pub partner_code: String,

    /// Revenue attributed to the partner
    pub revenue_attributed: Decimal,
}

/// Why a partner got no settlement row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Summed revenue was zero or negative
    NoRevenue,
    /// Partner code did not resolve
    UnknownPartner,
    /// No agreement in force at the close of the period
    NoActiveAgreement,
}

/// Partner left out of a calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPartner {
    /// Partner code
    pub partner_code: String,

    /// Reason
    pub reason: SkipReason,
}

/// Result of `calculate_settlements`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationSummary {
    /// Period after calculation
    pub period: SettlementPeriod,

    /// Rows written
    pub settlements: Vec<Settlement>,

    /// Partners without a row
    pub skipped: Vec<SkippedPartner>,

    /// Σ amount
    pub total_amount: Decimal,
}

/// Result of `lock_period`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOutcome {
    /// Period after the call
    pub period: SettlementPeriod,

    /// True when the period was already locked and nothing changed
    pub already_locked: bool,
}

impl LockOutcome {
    /// Lock time
    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.period.locked_at
    }

    /// Locking actor
    pub fn locked_by(&self) -> Option<&str> {
        self.period.locked_by.as_deref()
    }
}
