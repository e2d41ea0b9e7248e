//! Actor-based concurrency for the ledger
//!
//! Every balance mutation goes through one writer task, so the
//! read-balance / apply-delta / commit sequence for an account can never
//! interleave with another writer. Reads bypass the actor and go straight
//! to storage.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          TokenLedgerEngine (many callers)             │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerActor (single task)               │
//! │  1. idempotency lookup                                │
//! │  2. read balance row                                  │
//! │  3. build ledger entries + new balance                │
//! │  4. Storage::commit (one WriteBatch)                  │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::storage::{Commit, Storage};
use crate::types::{
    checked_sum, AccountId, Balance, LedgerEntry, SourceType, TransactionKind,
    TransactionRecord, TransactionResult,
};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A balance mutation, fully priced by the engine
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Add tokens
    Credit {
        /// Account
        account: AccountId,
        /// Amount for `source`
        amount: Decimal,
        /// Amount for `platform_bonus`
        bonus: Decimal,
        /// Target bucket
        source: SourceType,
        /// Reason
        reason: String,
        /// Idempotency key
        idempotency_key: Option<String>,
        /// Caller metadata
        metadata: BTreeMap<String, String>,
    },

    /// Consume tokens
    Debit {
        /// Account
        account: AccountId,
        /// Billed amount (after margin and multiplier)
        billed: Decimal,
        /// Raw usage units
        raw_units: Decimal,
        /// Multiplier used for pricing
        multiplier: Decimal,
        /// Requested bucket
        source: SourceType,
        /// Reason
        reason: String,
        /// Idempotency key
        idempotency_key: Option<String>,
        /// Caller metadata
        metadata: BTreeMap<String, String>,
    },
}

impl Mutation {
    fn idempotency_key(&self) -> Option<&str> {
        match self {
            Mutation::Credit {
                idempotency_key, ..
            }
            | Mutation::Debit {
                idempotency_key, ..
            } => idempotency_key.as_deref(),
        }
    }

    fn account(&self) -> AccountId {
        match self {
            Mutation::Credit { account, .. } | Mutation::Debit { account, .. } => *account,
        }
    }
}

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Create a zero balance row if absent
    EnsureBalance {
        account: AccountId,
        response: oneshot::Sender<Result<Balance>>,
    },

    /// Apply a credit or debit
    Apply {
        mutation: Mutation,
        response: oneshot::Sender<Result<TransactionResult>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that serializes ledger writes
#[derive(Debug)]
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { storage, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                LedgerMessage::EnsureBalance { account, response } => {
                    let _ = response.send(self.ensure_balance(account));
                }
                LedgerMessage::Apply { mutation, response } => {
                    let result = self.apply(mutation);
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "Ledger mutation failed");
                    }
                    let _ = response.send(result);
                }
            }
        }

        tracing::info!("Ledger actor stopped");
    }

    fn ensure_balance(&self, account: AccountId) -> Result<Balance> {
        if let Some(existing) = self.storage.get_balance(&account)? {
            return Ok(existing);
        }
        let balance = Balance::zero(account);
        self.storage.put_balance(&balance)?;
        tracing::debug!(account = %account, "Balance row created");
        Ok(balance)
    }

    fn apply(&self, mutation: Mutation) -> Result<TransactionResult> {
        if let Some(key) = mutation.idempotency_key() {
            if let Some(previous) = self.storage.find_by_idempotency_key(key)? {
                if previous.account != mutation.account() {
                    tracing::warn!(
                        idempotency_key = key,
                        original_account = %previous.account,
                        account = %mutation.account(),
                        "Idempotency key reused across accounts, returning original result"
                    );
                }
                tracing::info!(
                    transaction_id = %previous.transaction_id,
                    idempotency_key = key,
                    "Idempotent replay"
                );
                return Ok(TransactionResult::replay_of(&previous));
            }
        }

        let commit = self.build_commit(mutation)?;
        // Nothing is cached in memory, so a failed commit leaves no partial state behind
        self.storage.commit(&commit)?;

        Ok(TransactionResult {
            transaction_id: commit.transaction.transaction_id,
            tokens: commit.transaction.tokens,
            idempotent_replay: false,
        })
    }

    fn build_commit(&self, mutation: Mutation) -> Result<Commit> {
        let account = mutation.account();
        let mut balance = self
            .storage
            .get_balance(&account)?
            .unwrap_or_else(|| Balance::zero(account));

        let transaction_id = Uuid::now_v7();
        let now = Utc::now();

        // (bucket, signed delta) pairs, in application order
        let (deltas, record) = match mutation {
            Mutation::Credit {
                account,
                amount,
                bonus,
                source,
                reason,
                idempotency_key,
                metadata,
            } => {
                let mut deltas = Vec::with_capacity(2);
                if amount > Decimal::ZERO {
                    deltas.push((source, amount));
                }
                if bonus > Decimal::ZERO {
                    deltas.push((SourceType::PlatformBonus, bonus));
                }
                let record = TransactionRecord {
                    transaction_id,
                    account,
                    kind: TransactionKind::Credit,
                    source,
                    idempotency_key,
                    raw_units: None,
                    multiplier: Decimal::ONE,
                    tokens: checked_sum(amount, bonus)?,
                    entry_ids: Vec::new(),
                    reason,
                    metadata,
                    created_at: now,
                };
                (deltas, record)
            }

            Mutation::Debit {
                account,
                billed,
                raw_units,
                multiplier,
                source,
                reason,
                idempotency_key,
                metadata,
            } => {
                let deltas = split_debit(&balance, source, billed);
                let record = TransactionRecord {
                    transaction_id,
                    account,
                    kind: TransactionKind::Debit,
                    source,
                    idempotency_key,
                    raw_units: Some(raw_units),
                    multiplier,
                    tokens: billed,
                    entry_ids: Vec::new(),
                    reason,
                    metadata,
                    created_at: now,
                };
                (deltas, record)
            }
        };

        if deltas.is_empty() {
            return Err(Error::InvalidAmount(
                "Transaction would not change any balance".to_string(),
            ));
        }

        let mut record = record;
        let mut entries = Vec::with_capacity(deltas.len());
        for (source, delta) in deltas {
            balance.apply(source, delta)?;
            let entry = LedgerEntry {
                entry_id: Uuid::now_v7(),
                account,
                delta,
                source,
                transaction_id,
                reason: record.reason.clone(),
                balance_after: balance.get(source),
                timestamp: now,
            };
            record.entry_ids.push(entry.entry_id);
            entries.push(entry);
        }
        balance.updated_at = now;

        Ok(Commit {
            balance,
            entries,
            transaction: record,
        })
    }
}

/// Split a debit across buckets.
///
/// Sources with a bonus bucket draw the bonus down first (never below zero);
/// the remainder hits the source bucket, which may go negative. A zero debit
/// still yields one zero-delta entry so every transaction is on the ledger.
pub fn split_debit(
    balance: &Balance,
    source: SourceType,
    billed: Decimal,
) -> Vec<(SourceType, Decimal)> {
    let mut deltas = Vec::with_capacity(2);
    let mut remaining = billed;

    if let Some(bonus_bucket) = source.bonus_bucket() {
        let from_bonus = balance.get(bonus_bucket).max(Decimal::ZERO).min(remaining);
        if from_bonus > Decimal::ZERO {
            deltas.push((bonus_bucket, -from_bonus));
            remaining -= from_bonus;
        }
    }

    if remaining > Decimal::ZERO || deltas.is_empty() {
        deltas.push((source, -remaining));
    }

    deltas
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    /// Create a zero balance row if absent
    pub async fn ensure_balance(&self, account: AccountId) -> Result<Balance> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::EnsureBalance {
                account,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Apply a mutation
    pub async fn apply(&self, mutation: Mutation) -> Result<TransactionResult> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::Apply {
                mutation,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(storage: Arc<Storage>, mailbox_capacity: usize) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let actor = LedgerActor::new(storage, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn dec(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn credit(account: AccountId, amount: i64, key: Option<&str>) -> Mutation {
        Mutation::Credit {
            account,
            amount: dec(amount),
            bonus: Decimal::ZERO,
            source: SourceType::Platform,
            reason: "test".to_string(),
            idempotency_key: key.map(str::to_string),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_split_debit_uses_bonus_first() {
        let mut balance = Balance::zero(AccountId::user(Uuid::new_v4()));
        balance.apply(SourceType::Platform, dec(100)).unwrap();
        balance.apply(SourceType::PlatformBonus, dec(30)).unwrap();

        let deltas = split_debit(&balance, SourceType::Platform, dec(50));
        assert_eq!(
            deltas,
            vec![(SourceType::PlatformBonus, dec(-30)), (SourceType::Platform, dec(-20))]
        );

        let deltas = split_debit(&balance, SourceType::Platform, dec(10));
        assert_eq!(deltas, vec![(SourceType::PlatformBonus, dec(-10))]);
    }

    #[test]
    fn test_split_debit_overdraft_and_zero() {
        let balance = Balance::zero(AccountId::user(Uuid::new_v4()));
        assert_eq!(
            split_debit(&balance, SourceType::Platform, dec(5)),
            vec![(SourceType::Platform, dec(-5))]
        );
        assert_eq!(
            split_debit(&balance, SourceType::Byok, Decimal::ZERO),
            vec![(SourceType::Byok, Decimal::ZERO)]
        );
    }

    #[tokio::test]
    async fn test_actor_apply_and_replay() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_ledger_actor(storage.clone(), 16);
        let account = AccountId::organization(Uuid::new_v4());

        let first = handle.apply(credit(account, 100, Some("topup-1"))).await.unwrap();
        assert!(!first.idempotent_replay);

        let second = handle.apply(credit(account, 100, Some("topup-1"))).await.unwrap();
        assert!(second.idempotent_replay);
        assert_eq!(second.transaction_id, first.transaction_id);

        let balance = storage.get_balance(&account).unwrap().unwrap();
        assert_eq!(balance.platform, dec(100));
        assert_eq!(storage.account_entries(&account).unwrap().len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_ensure_balance_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_ledger_actor(storage.clone(), 16);
        let account = AccountId::user(Uuid::new_v4());

        let created = handle.ensure_balance(account).await.unwrap();
        handle.apply(credit(account, 7, None)).await.unwrap();
        let again = handle.ensure_balance(account).await.unwrap();

        assert_eq!(created.total(), Decimal::ZERO);
        assert_eq!(again.platform, dec(7));
        assert_eq!(again.created_at, created.created_at);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_shutdown_closes_mailbox() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_ledger_actor(storage, 4);
        handle.shutdown().await.unwrap();

        // Give the actor a chance to exit
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = handle
            .apply(credit(AccountId::user(Uuid::new_v4()), 1, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONCURRENCY_ERROR");
    }
}
