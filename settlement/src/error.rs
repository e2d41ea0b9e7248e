//! Error types for partner settlement

use thiserror::Error;
use uuid::Uuid;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// A required field was empty or absent
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    /// Adjustment amount out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Period start is not before its end
    #[error("Invalid date range: start {start} is not before end {end}")]
    InvalidDateRange {
        /// Requested start
        start: chrono::DateTime<chrono::Utc>,
        /// Requested end
        end: chrono::DateTime<chrono::Utc>,
    },

    /// Requested range intersects an existing period
    #[error("Period overlaps existing period {0}")]
    PeriodOverlap(Uuid),

    /// Another period is still OPEN
    #[error("Open period {0} already exists")]
    OpenPeriodExists(Uuid),

    /// Period is LOCKED and frozen
    #[error("Period {0} is locked")]
    PeriodLocked(Uuid),

    /// Lock requested before calculation
    #[error("Period {0} has not been calculated")]
    NotCalculated(Uuid),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Attribution or partner service failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable caller-facing error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingRequired(_) => "MISSING_REQUIRED",
            Error::InvalidAmount(_) => "INVALID_AMOUNT",
            Error::InvalidDateRange { .. } => "INVALID_DATE_RANGE",
            Error::PeriodOverlap(_) => "PERIOD_OVERLAP",
            Error::OpenPeriodExists(_) => "OPEN_PERIOD_EXISTS",
            Error::PeriodLocked(_) => "PERIOD_LOCKED",
            Error::NotCalculated(_) => "NOT_CALCULATED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
