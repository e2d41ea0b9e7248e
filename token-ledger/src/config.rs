//! Configuration for the token ledger

use crate::{margin::Margin, types::SourceType};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Writer actor configuration
    pub writer: WriterConfig,

    /// Margins seeded on first open
    pub margins: Vec<MarginConfig>,

    /// BYOK configuration
    pub byok: ByokConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/token-ledger"),
            service_name: "token-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDBConfig::default(),
            writer: WriterConfig::default(),
            margins: MarginConfig::defaults(),
            byok: ByokConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Single-writer actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Bounded mailbox size (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// Margin row as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginConfig {
    /// Source priced by this row
    pub source: SourceType,
    /// Cost per 1,000 raw units
    pub base_cost_per_1k: Decimal,
    /// Markup percent
    pub margin_percent: Decimal,
    /// Minimum charge
    pub min_charge: Decimal,
    /// Active flag
    pub is_active: bool,
}

impl MarginConfig {
    /// Default margin table
    ///
    /// Platform usage is marked up; BYOK and local usage are recorded at raw
    /// units since the platform does not fund them.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                source: SourceType::Platform,
                base_cost_per_1k: Decimal::from(1000),
                margin_percent: Decimal::from(20),
                min_charge: Decimal::ONE,
                is_active: true,
            },
            Self {
                source: SourceType::Byok,
                base_cost_per_1k: Decimal::from(1000),
                margin_percent: Decimal::ZERO,
                min_charge: Decimal::ZERO,
                is_active: false,
            },
            Self {
                source: SourceType::Local,
                base_cost_per_1k: Decimal::from(1000),
                margin_percent: Decimal::ZERO,
                min_charge: Decimal::ZERO,
                is_active: false,
            },
        ]
    }

    /// Convert into a stored margin row
    pub fn to_margin(&self) -> Margin {
        Margin {
            source: self.source,
            base_cost_per_1k: self.base_cost_per_1k,
            margin_percent: self.margin_percent,
            min_charge: self.min_charge,
            is_active: self.is_active,
            updated_at: Utc::now(),
        }
    }
}

/// BYOK vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByokConfig {
    /// Environment variable holding the hex-encoded 32-byte master key
    pub master_key_env: String,

    /// Providers served by locally hosted models
    pub local_providers: Vec<String>,
}

impl Default for ByokConfig {
    fn default() -> Self {
        Self {
            master_key_env: "TOKEN_LEDGER_MASTER_KEY".to_string(),
            local_providers: vec!["ollama".to_string(), "lmstudio".to_string()],
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("TOKEN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("TOKEN_LEDGER_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(providers) = std::env::var("TOKEN_LEDGER_LOCAL_PROVIDERS") {
            config.byok.local_providers = providers
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
        }

        Ok(config)
    }

    /// Read the BYOK master key from the configured environment variable
    pub fn master_key(&self) -> crate::Result<[u8; 32]> {
        let encoded = std::env::var(&self.byok.master_key_env).map_err(|_| {
            crate::Error::Config(format!("{} is not set", self.byok.master_key_env))
        })?;
        parse_master_key(&encoded)
    }
}

/// Decode a hex-encoded 32-byte key
pub fn parse_master_key(encoded: &str) -> crate::Result<[u8; 32]> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| crate::Error::Config(format!("Master key is not valid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| crate::Error::Config("Master key must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "token-ledger");
        assert_eq!(config.margins.len(), 3);
        assert!(config.byok.local_providers.contains(&"ollama".to_string()));
    }

    #[test]
    fn test_parse_master_key() {
        let key = parse_master_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key[0], 0xab);
        assert!(parse_master_key("abcd").is_err());
        assert!(parse_master_key("zz").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/tmp/ledger"
service_name = "token-ledger"
service_version = "0.1.0"
metrics_listen_addr = "127.0.0.1:9100"

[rocksdb]
write_buffer_size_mb = 16
max_write_buffer_number = 2
max_background_jobs = 2
sync_writes = false
enable_statistics = false

[writer]
mailbox_capacity = 64

[[margins]]
source = "platform"
base_cost_per_1k = "0.01"
margin_percent = "10"
min_charge = "0.001"
is_active = true

[byok]
master_key_env = "LEDGER_KEY"
local_providers = ["ollama"]
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.writer.mailbox_capacity, 64);
        assert_eq!(config.margins.len(), 1);
        assert_eq!(config.margins[0].source, SourceType::Platform);
        assert_eq!(config.byok.master_key_env, "LEDGER_KEY");
    }
}
