//! Core types for the token ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for token quantities)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Kind of account holding a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AccountKind {
    /// Individual user
    User = 1,
    /// Organization (tenant)
    Organization = 2,
}

impl AccountKind {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::User => "user",
            AccountKind::Organization => "organization",
        }
    }
}

/// Account identifier (user or organization UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId {
    kind: AccountKind,
    id: Uuid,
}

impl AccountId {
    /// User account
    pub fn user(id: Uuid) -> Self {
        Self {
            kind: AccountKind::User,
            id,
        }
    }

    /// Organization account
    pub fn organization(id: Uuid) -> Self {
        Self {
            kind: AccountKind::Organization,
            id,
        }
    }

    /// Account kind
    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    /// Underlying UUID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Nil UUIDs are treated as an absent account
    pub fn is_missing(&self) -> bool {
        self.id.is_nil()
    }

    /// Storage key prefix: kind byte || uuid bytes
    pub fn storage_key(&self) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0] = self.kind as u8;
        key[1..].copy_from_slice(self.id.as_bytes());
        key
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Balance bucket funding a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SourceType {
    /// Platform-funded capacity
    Platform = 1,
    /// Promotional capacity, spent before `Platform`
    PlatformBonus = 2,
    /// Bring-your-own-key usage
    Byok = 3,
    /// Locally hosted models
    Local = 4,
}

impl SourceType {
    /// All buckets in storage order
    pub const ALL: [SourceType; 4] = [
        SourceType::Platform,
        SourceType::PlatformBonus,
        SourceType::Byok,
        SourceType::Local,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Platform => "platform",
            SourceType::PlatformBonus => "platform_bonus",
            SourceType::Byok => "byok",
            SourceType::Local => "local",
        }
    }

    /// Parse from wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "platform" => Some(SourceType::Platform),
            "platform_bonus" => Some(SourceType::PlatformBonus),
            "byok" => Some(SourceType::Byok),
            "local" => Some(SourceType::Local),
            _ => None,
        }
    }

    /// The `<source>_bonus` bucket, if this source has one
    pub fn bonus_bucket(&self) -> Option<SourceType> {
        match self {
            SourceType::Platform => Some(SourceType::PlatformBonus),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-account balances, partitioned by source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Owning account
    pub account: AccountId,

    /// Platform bucket
    pub platform: Decimal,

    /// Platform bonus bucket
    pub platform_bonus: Decimal,

    /// BYOK bucket
    pub byok: Decimal,

    /// Local bucket
    pub local: Decimal,

    /// Row creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// All-zero balance
    pub fn zero(account: AccountId) -> Self {
        let now = Utc::now();
        Self {
            account,
            platform: Decimal::ZERO,
            platform_bonus: Decimal::ZERO,
            byok: Decimal::ZERO,
            local: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount held in one bucket
    pub fn get(&self, source: SourceType) -> Decimal {
        match source {
            SourceType::Platform => self.platform,
            SourceType::PlatformBonus => self.platform_bonus,
            SourceType::Byok => self.byok,
            SourceType::Local => self.local,
        }
    }

    /// Apply a signed delta to one bucket
    ///
    /// The bucket is left untouched when the result would not fit a `Decimal`.
    pub fn apply(&mut self, source: SourceType, delta: Decimal) -> Result<()> {
        let bucket = match source {
            SourceType::Platform => &mut self.platform,
            SourceType::PlatformBonus => &mut self.platform_bonus,
            SourceType::Byok => &mut self.byok,
            SourceType::Local => &mut self.local,
        };
        *bucket = checked_sum(*bucket, delta)?;
        Ok(())
    }

    /// `balance[source] + balance[source_bonus]`, saturating at the `Decimal` range
    pub fn available(&self, source: SourceType) -> Decimal {
        let bonus = source
            .bonus_bucket()
            .map(|b| self.get(b))
            .unwrap_or(Decimal::ZERO);
        self.get(source).saturating_add(bonus)
    }

    /// Sum over every bucket, saturating at the `Decimal` range
    pub fn total(&self) -> Decimal {
        SourceType::ALL
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(self.get(*s)))
    }
}

/// `a + b`, or `INVALID_AMOUNT` when the sum leaves the `Decimal` range
pub fn checked_sum(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b).ok_or_else(|| {
        Error::InvalidAmount(format!("{} + {} exceeds the representable token range", a, b))
    })
}

/// Immutable record of one balance delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Account whose balance changed
    pub account: AccountId,

    /// Signed delta (positive = credit)
    pub delta: Decimal,

    /// Bucket the delta applies to
    pub source: SourceType,

    /// Grouping transaction
    pub transaction_id: Uuid,

    /// Human-readable reason
    pub reason: String,

    /// Bucket value after this entry
    pub balance_after: Decimal,

    /// Entry timestamp
    pub timestamp: DateTime<Utc>,
}

/// Transaction direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Tokens added
    Credit = 1,
    /// Tokens consumed
    Debit = 2,
}

/// Atomic unit grouping one balance mutation and its ledger entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction ID
    pub transaction_id: Uuid,

    /// Account mutated
    pub account: AccountId,

    /// Credit or debit
    pub kind: TransactionKind,

    /// Requested source
    pub source: SourceType,

    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,

    /// Raw usage units before margin (debits only)
    pub raw_units: Option<Decimal>,

    /// Pricing multiplier applied after margin
    pub multiplier: Decimal,

    /// Tokens credited or billed
    pub tokens: Decimal,

    /// Ledger entries written with this transaction
    pub entry_ids: Vec<Uuid>,

    /// Reason
    pub reason: String,

    /// Caller metadata
    pub metadata: BTreeMap<String, String>,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,
}

/// Result of a credit or debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Transaction ID
    pub transaction_id: Uuid,

    /// Tokens credited or billed
    pub tokens: Decimal,

    /// True when served from a previously-seen idempotency key
    pub idempotent_replay: bool,
}

impl TransactionResult {
    /// Result reconstructed from a stored transaction
    pub fn replay_of(record: &TransactionRecord) -> Self {
        Self {
            transaction_id: record.transaction_id,
            tokens: record.tokens,
            idempotent_replay: true,
        }
    }
}

/// Options for `credit_tokens`
#[derive(Debug, Clone, Default)]
pub struct CreditOptions {
    /// Target bucket (defaults to `platform`)
    pub source: Option<SourceType>,

    /// Reason recorded on the ledger entries
    pub reason: Option<String>,

    /// Idempotency key
    pub idempotency_key: Option<String>,

    /// Caller metadata
    pub metadata: BTreeMap<String, String>,
}

impl CreditOptions {
    /// Set target bucket
    pub fn with_source(mut self, source: SourceType) -> Self {
        self.source = Some(source);
        self
    }

    /// Set reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Options for `deduct_tokens`
#[derive(Debug, Clone, Default)]
pub struct DeductOptions {
    /// Applied after margin (model-tier pricing); defaults to 1
    pub multiplier: Option<Decimal>,

    /// Reason recorded on the ledger entries
    pub reason: Option<String>,

    /// Idempotency key
    pub idempotency_key: Option<String>,

    /// Caller metadata
    pub metadata: BTreeMap<String, String>,
}

impl DeductOptions {
    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: Decimal) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Aggregate view of an account's ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Account
    pub account: AccountId,
    /// Sum of positive deltas
    pub total_credits: Decimal,
    /// Sum of negative deltas (as a positive number)
    pub total_debits: Decimal,
    /// `total_credits - total_debits`
    pub computed_balance: Decimal,
    /// Distinct transactions touching the account
    pub transaction_count: usize,
}

/// Stored vs recomputed value of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDiscrepancy {
    /// Bucket
    pub source: SourceType,
    /// Value on the balance row
    pub stored: Decimal,
    /// Σ ledger deltas
    pub computed: Decimal,
}

/// Outcome of `verify_balance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReconciliation {
    /// Account
    pub account: AccountId,
    /// True when every bucket matches its ledger
    pub matches: bool,
    /// Buckets that do not match
    pub discrepancies: Vec<SourceDiscrepancy>,
}
