//! Token Ledger
//!
//! Metered token accounting for AI usage: per-account balances split by
//! funding source, an append-only ledger, margin-based billing, BYOK
//! credential resolution and trial admission control.
//!
//! # Architecture
//!
//! - **Materialized balances**: balances are a projection of the ledger log
//! - **Single Writer**: one actor task applies every balance mutation
//! - **Atomic commits**: balance row, ledger entries and idempotency record
//!   land in one RocksDB write batch
//!
//! # Invariants
//!
//! - `balance(account, source) == Σ entries(account, source).delta`
//! - Every balance mutation has exactly one ledger entry per touched source
//! - Ledger entries are never modified or deleted
//! - Replaying an idempotency key never mutates a balance twice

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod margin;
pub mod vault;
pub mod source;
pub mod trial_guard;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    AccountId, AccountKind, Balance, CreditOptions, DeductOptions, LedgerEntry, LedgerSummary,
    SourceType, TransactionRecord, TransactionResult,
};
pub use ledger::TokenLedgerEngine;
pub use margin::{Margin, MarginCalculator, MarginUpdate};
pub use source::{SourceResolver, TokenSource};
pub use trial_guard::{AdmissionDecision, OrganizationDirectory, TenantStatus, TrialGuard};
pub use vault::{AesGcmCipher, ByokVault, Cipher};
pub use config::Config;
pub use storage::Storage;
