//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `periods` - Settlement periods (key: period_id)
//! - `settlements` - Settlement rows (key: period_id || partner_code)
//!
//! Recalculation swaps a period's rows and its status in one `WriteBatch`.

use crate::{
    types::{PeriodStatus, SettlementPeriod, Settlement},
    Config, Error, Result,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::fmt;
use uuid::Uuid;

const CF_PERIODS: &str = "periods";
const CF_SETTLEMENTS: &str = "settlements";

/// Storage wrapper for RocksDB
pub struct SettlementStorage {
    db: DB,
    sync_writes: bool,
}

impl fmt::Debug for SettlementStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementStorage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

fn settlement_key(period_id: Uuid, partner_code: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + partner_code.len());
    key.extend_from_slice(period_id.as_bytes());
    key.extend_from_slice(partner_code.as_bytes());
    key
}

impl SettlementStorage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PERIODS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SETTLEMENTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened settlement store");

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
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

    // Period operations

    /// Insert or replace a period
    pub fn put_period(&self, period: &SettlementPeriod) -> Result<()> {
        let cf = self.cf_handle(CF_PERIODS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, period.id.as_bytes(), bincode::serialize(period)?);
        self.write(batch)
    }

    /// Get period by ID
    pub fn get_period(&self, period_id: Uuid) -> Result<Option<SettlementPeriod>> {
        let cf = self.cf_handle(CF_PERIODS)?;
        match self.db.get_cf(cf, period_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All periods ordered by start
    pub fn list_periods(&self) -> Result<Vec<SettlementPeriod>> {
        let cf = self.cf_handle(CF_PERIODS)?;
        let mut periods = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            periods.push(bincode::deserialize::<SettlementPeriod>(&value)?);
        }
        periods.sort_by_key(|p| p.start);
        Ok(periods)
    }

    /// The OPEN period, if any
    pub fn find_open_period(&self) -> Result<Option<SettlementPeriod>> {
        Ok(self
            .list_periods()?
            .into_iter()
            .find(|p| p.status == PeriodStatus::Open))
    }

    // Settlement operations

    /// Insert or replace one partner's row
    pub fn put_settlement(&self, settlement: &Settlement) -> Result<()> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            settlement_key(settlement.period_id, &settlement.partner_code),
            bincode::serialize(settlement)?,
        );
        self.write(batch)
    }

    /// One partner's row
    pub fn get_settlement(&self, period_id: Uuid, partner_code: &str) -> Result<Option<Settlement>> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        match self.db.get_cf(cf, settlement_key(period_id, partner_code))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows of a period, ordered by partner code
    pub fn list_settlements(&self, period_id: Uuid) -> Result<Vec<Settlement>> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        let prefix = period_id.as_bytes();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut settlements = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            settlements.push(bincode::deserialize(&value)?);
        }
        Ok(settlements)
    }

    /// Swap a period's rows for `settlements` and store `period`, in one batch
    ///
    /// Returns how many previous rows were removed.
    pub fn replace_settlements(
        &self,
        period: &SettlementPeriod,
        settlements: &[Settlement],
    ) -> Result<usize> {
        let existing = self.list_settlements(period.id)?;
        let periods_cf = self.cf_handle(CF_PERIODS)?;
        let settlements_cf = self.cf_handle(CF_SETTLEMENTS)?;

        let mut batch = WriteBatch::default();
        for old in &existing {
            batch.delete_cf(settlements_cf, settlement_key(period.id, &old.partner_code));
        }
        for settlement in settlements {
            batch.put_cf(
                settlements_cf,
                settlement_key(settlement.period_id, &settlement.partner_code),
                bincode::serialize(settlement)?,
            );
        }
        batch.put_cf(periods_cf, period.id.as_bytes(), bincode::serialize(period)?);
        self.write(batch)?;
        Ok(existing.len())
    }

    /// Write a locked period together with its frozen rows
    pub fn commit_lock(&self, period: &SettlementPeriod, settlements: &[Settlement]) -> Result<()> {
        let periods_cf = self.cf_handle(CF_PERIODS)?;
        let settlements_cf = self.cf_handle(CF_SETTLEMENTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(periods_cf, period.id.as_bytes(), bincode::serialize(period)?);
        for settlement in settlements {
            batch.put_cf(
                settlements_cf,
                settlement_key(settlement.period_id, &settlement.partner_code),
                bincode::serialize(settlement)?,
            );
        }
        self.write(batch)
    }
}
