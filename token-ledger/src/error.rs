//! Error types for the token ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// A required field was empty or absent
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    /// Amount, multiplier or margin value out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// BYOK encryption or decryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Collaborator (organization directory, etc.) failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
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
            Error::NotFound(_) => "NOT_FOUND",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Encryption(_) => "ENCRYPTION_ERROR",
            Error::Concurrency(_) => "CONCURRENCY_ERROR",
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
