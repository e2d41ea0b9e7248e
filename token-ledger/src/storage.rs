//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `balances` - Materialized balances (key: account)
//! - `ledger` - Append-only ledger entries (key: account || entry_id)
//! - `transactions` - Committed transactions (key: transaction_id)
//! - `idempotency` - Idempotency index (key: sha256(idempotency_key))
//! - `margins` - Margin configuration (key: source)
//! - `byok` - Encrypted BYOK credentials (key: user_id || provider)

use crate::{
    error::{Error, Result},
    margin::Margin,
    types::{AccountId, Balance, LedgerEntry, SourceType, TransactionRecord},
    vault::ByokCredential,
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_LEDGER: &str = "ledger";
const CF_TRANSACTIONS: &str = "transactions";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_MARGINS: &str = "margins";
const CF_BYOK: &str = "byok";

/// A balance mutation together with everything that must land with it
#[derive(Debug, Clone)]
pub struct Commit {
    /// Balance row after the mutation
    pub balance: Balance,
    /// One entry per touched bucket
    pub entries: Vec<LedgerEntry>,
    /// Transaction record (also indexed by idempotency key)
    pub transaction: TransactionRecord,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_LEDGER, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_MARGINS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BYOK, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened token ledger store");

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Balances are read on every request, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // Balance operations

    /// Get stored balance row
    pub fn get_balance(&self, account: &AccountId) -> Result<Option<Balance>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(cf, account.storage_key())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert a balance row (no ledger entry; only used for zero rows)
    pub fn put_balance(&self, balance: &Balance) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, balance.account.storage_key(), bincode::serialize(balance)?);
        self.write(batch)
    }

    // Transaction operations

    /// Commit balance, ledger entries, transaction and idempotency index atomically
    pub fn commit(&self, commit: &Commit) -> Result<()> {
        let mut batch = WriteBatch::default();

        // 1. Balance
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        batch.put_cf(
            cf_balances,
            commit.balance.account.storage_key(),
            bincode::serialize(&commit.balance)?,
        );

        // 2. Ledger entries
        let cf_ledger = self.cf_handle(CF_LEDGER)?;
        for entry in &commit.entries {
            batch.put_cf(
                cf_ledger,
                Self::ledger_key(&entry.account, entry.entry_id),
                bincode::serialize(entry)?,
            );
        }

        // 3. Transaction
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let tx_id = commit.transaction.transaction_id;
        batch.put_cf(
            cf_transactions,
            tx_id.as_bytes(),
            bincode::serialize(&commit.transaction)?,
        );

        // 4. Idempotency index
        if let Some(key) = &commit.transaction.idempotency_key {
            let cf_idempotency = self.cf_handle(CF_IDEMPOTENCY)?;
            batch.put_cf(cf_idempotency, Self::idempotency_key(key), tx_id.as_bytes());
        }

        self.write(batch)?;

        tracing::debug!(
            transaction_id = %tx_id,
            account = %commit.balance.account,
            entries = commit.entries.len(),
            "Transaction committed"
        );

        Ok(())
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<TransactionRecord>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, transaction_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Look up the transaction previously committed under an idempotency key
    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionRecord>> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;
        let tx_id = match self.db.get_cf(cf, Self::idempotency_key(key))? {
            Some(value) => {
                let bytes: [u8; 16] = value.as_slice().try_into().map_err(|_| {
                    Error::Storage("Corrupt idempotency index value".to_string())
                })?;
                Uuid::from_bytes(bytes)
            }
            None => return Ok(None),
        };

        let record = self.get_transaction(tx_id)?.ok_or_else(|| {
            Error::Storage(format!("Idempotency index points at missing transaction {}", tx_id))
        })?;
        Ok(Some(record))
    }

    /// All ledger entries for an account, oldest first
    pub fn account_entries(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        let prefix = account.storage_key();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    // Margin operations

    /// Get margin for a source
    pub fn get_margin(&self, source: SourceType) -> Result<Option<Margin>> {
        let cf = self.cf_handle(CF_MARGINS)?;
        match self.db.get_cf(cf, [source as u8])? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put margin
    pub fn put_margin(&self, margin: &Margin) -> Result<()> {
        let cf = self.cf_handle(CF_MARGINS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, [margin.source as u8], bincode::serialize(margin)?);
        self.write(batch)
    }

    /// All margins, ordered by source
    pub fn list_margins(&self) -> Result<Vec<Margin>> {
        let cf = self.cf_handle(CF_MARGINS)?;
        let mut margins = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            margins.push(bincode::deserialize(&value)?);
        }
        Ok(margins)
    }

    /// Write configured margins that have no stored row yet
    pub fn seed_margins(&self, margins: &[Margin]) -> Result<usize> {
        let mut seeded = 0;
        for margin in margins {
            if self.get_margin(margin.source)?.is_none() {
                self.put_margin(margin)?;
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    // BYOK operations

    /// Put (insert or replace) a credential
    pub fn put_credential(&self, credential: &ByokCredential) -> Result<()> {
        let cf = self.cf_handle(CF_BYOK)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            Self::byok_key(credential.user_id, &credential.provider),
            bincode::serialize(credential)?,
        );
        self.write(batch)
    }

    /// Get credential for (user, provider)
    pub fn get_credential(&self, user_id: Uuid, provider: &str) -> Result<Option<ByokCredential>> {
        let cf = self.cf_handle(CF_BYOK)?;
        match self.db.get_cf(cf, Self::byok_key(user_id, provider))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All credentials of a user
    pub fn list_credentials(&self, user_id: Uuid) -> Result<Vec<ByokCredential>> {
        let cf = self.cf_handle(CF_BYOK)?;
        let prefix = user_id.as_bytes();

        let mut credentials = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            credentials.push(bincode::deserialize(&value)?);
        }
        Ok(credentials)
    }

    /// Hard-delete a credential; returns whether it existed
    pub fn delete_credential(&self, user_id: Uuid, provider: &str) -> Result<bool> {
        if self.get_credential(user_id, provider)?.is_none() {
            return Ok(false);
        }
        let cf = self.cf_handle(CF_BYOK)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, Self::byok_key(user_id, provider));
        self.write(batch)?;
        Ok(true)
    }

    // Key helpers

    fn ledger_key(account: &AccountId, entry_id: Uuid) -> Vec<u8> {
        let mut key = account.storage_key().to_vec();
        key.extend_from_slice(entry_id.as_bytes());
        key
    }

    fn idempotency_key(key: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.finalize().into()
    }

    fn byok_key(user_id: Uuid, provider: &str) -> Vec<u8> {
        let mut key = user_id.as_bytes().to_vec();
        key.extend_from_slice(provider.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn test_commit(account: AccountId, delta: i64, key: Option<&str>) -> Commit {
        let transaction_id = Uuid::now_v7();
        let mut balance = Balance::zero(account);
        balance.apply(SourceType::Platform, Decimal::from(delta)).unwrap();
        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            account,
            delta: Decimal::from(delta),
            source: SourceType::Platform,
            transaction_id,
            reason: "test".to_string(),
            balance_after: Decimal::from(delta),
            timestamp: Utc::now(),
        };
        Commit {
            balance,
            transaction: TransactionRecord {
                transaction_id,
                account,
                kind: TransactionKind::Credit,
                source: SourceType::Platform,
                idempotency_key: key.map(str::to_string),
                raw_units: None,
                multiplier: Decimal::ONE,
                tokens: Decimal::from(delta),
                entry_ids: vec![entry.entry_id],
                reason: "test".to_string(),
                metadata: BTreeMap::new(),
                created_at: Utc::now(),
            },
            entries: vec![entry],
        }
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.db.cf_handle(CF_BALANCES).is_some());
        assert!(storage.db.cf_handle(CF_LEDGER).is_some());
        assert!(storage.db.cf_handle(CF_BYOK).is_some());
    }

    #[test]
    fn test_commit_writes_all_parts() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account = AccountId::user(Uuid::new_v4());

        let commit = test_commit(account, 100, Some("req-1"));
        storage.commit(&commit).unwrap();

        let balance = storage.get_balance(&account).unwrap().unwrap();
        assert_eq!(balance.platform, Decimal::from(100));

        let entries = storage.account_entries(&account).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction_id, commit.transaction.transaction_id);

        let replay = storage.find_by_idempotency_key("req-1").unwrap().unwrap();
        assert_eq!(replay.transaction_id, commit.transaction.transaction_id);
        assert!(storage.find_by_idempotency_key("req-2").unwrap().is_none());
    }

    #[test]
    fn test_account_entries_are_scoped_to_account() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let id = Uuid::new_v4();
        let user = AccountId::user(id);
        let org = AccountId::organization(id);

        storage.commit(&test_commit(user, 10, None)).unwrap();
        storage.commit(&test_commit(user, 20, None)).unwrap();
        storage.commit(&test_commit(org, 30, None)).unwrap();
        storage
            .commit(&test_commit(AccountId::user(Uuid::new_v4()), 40, None))
            .unwrap();

        let entries = storage.account_entries(&user).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.account == user));
        // UUIDv7 keys keep insertion order
        assert_eq!(entries[0].delta, Decimal::from(10));
        assert_eq!(storage.account_entries(&org).unwrap().len(), 1);
    }

    #[test]
    fn test_seed_margins_does_not_overwrite() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let mut custom = Margin::new(SourceType::Platform, Decimal::ONE, Decimal::ZERO, Decimal::ZERO);
        custom.is_active = false;
        storage.put_margin(&custom).unwrap();

        let defaults: Vec<Margin> = config.margins.iter().map(|m| m.to_margin()).collect();
        let seeded = storage.seed_margins(&defaults).unwrap();
        assert_eq!(seeded, defaults.len() - 1);

        let platform = storage.get_margin(SourceType::Platform).unwrap().unwrap();
        assert!(!platform.is_active);
        assert_eq!(storage.list_margins().unwrap().len(), defaults.len());
    }
}
