//! Partner Settlement
//!
//! Periodic partner revenue-share settlement: lockable periods, per-partner
//! settlement rows computed from attribution exports and revenue-share
//! agreements.
//!
//! # Architecture
//!
//! - **Period state machine**: `OPEN -> CALCULATED -> LOCKED`, LOCKED is terminal
//! - **Full replace**: recalculating a non-locked period rewrites all its rows
//! - **Price then commit**: partners are priced first; rows and status land in one batch
//! - **Best-effort metrics**: collector failures are logged, never propagated
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use settlement::services::{InMemoryAttribution, InMemoryPartners, TracingMetricsCollector};
//! use settlement::{Config, SettlementPeriodManager};
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let manager = SettlementPeriodManager::open(
//!         Config::default(),
//!         Arc::new(InMemoryAttribution::new()),
//!         Arc::new(InMemoryPartners::new()),
//!         Arc::new(TracingMetricsCollector),
//!     )?;
//!
//!     let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
//!     let end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
//!     let period = manager.create_period(start, end).await?;
//!
//!     let summary = manager.calculate_settlements(period.id, "finance").await?;
//!     println!("{} settlements, total {}", summary.settlements.len(), summary.total_amount);
//!
//!     manager.lock_period(period.id, "finance").await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod services;
pub mod storage;
pub mod manager;
pub mod error;
pub mod config;

// Re-exports
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use manager::SettlementPeriodManager;
pub use services::{AttributionService, MetricsCollector, PartnerService};
pub use storage::SettlementStorage;
