//! Collaborators consumed by the period manager
//!
//! Attribution tracking, partner management and metrics are owned by other
//! services; only their interfaces live here, plus in-memory versions for
//! wiring and tests.

use crate::{
    types::{AttributionRecord, Partner, PartnerAgreement},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

/// Revenue attribution export
#[async_trait]
pub trait AttributionService: Send + Sync {
    /// Revenue attributed per partner code in `[start, end)`
    async fn export_attribution(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AttributionRecord>>;
}

/// Partner and agreement lookup
#[async_trait]
pub trait PartnerService: Send + Sync {
    /// Resolve a partner by attribution code
    async fn get_partner(&self, partner_code: &str) -> Result<Option<Partner>>;

    /// Agreement in force for `partner_id` at `at`
    async fn get_active_agreement(
        &self,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<PartnerAgreement>>;
}

/// Business event sink
///
/// Failures are logged by the caller and never abort settlement.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Record one event
    async fn record_event(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> Result<()>;
}

/// Metrics collector that emits events as structured logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsCollector;

#[async_trait]
impl MetricsCollector for TracingMetricsCollector {
    async fn record_event(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        tracing::info!(event_type, source, payload = %payload, "Settlement event");
        Ok(())
    }
}

/// Attribution rows timestamped at the moment revenue was attributed
#[derive(Debug, Default)]
pub struct InMemoryAttribution {
    rows: RwLock<Vec<(DateTime<Utc>, AttributionRecord)>>,
}

impl InMemoryAttribution {
    /// Empty export
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute `revenue` to `partner_code` at `at`
    pub fn record(&self, at: DateTime<Utc>, partner_code: &str, revenue: rust_decimal::Decimal) {
        self.rows.write().push((
            at,
            AttributionRecord {
                partner_code: partner_code.to_string(),
                revenue_attributed: revenue,
            },
        ));
    }
}

#[async_trait]
impl AttributionService for InMemoryAttribution {
    async fn export_attribution(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AttributionRecord>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(at, _)| start <= *at && *at < end)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// In-memory partner directory
#[derive(Debug, Default)]
pub struct InMemoryPartners {
    partners: DashMap<String, Partner>,
    agreements: DashMap<Uuid, Vec<PartnerAgreement>>,
}

impl InMemoryPartners {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a partner
    pub fn upsert_partner(&self, partner: Partner) {
        self.partners.insert(partner.code.clone(), partner);
    }

    /// Add an agreement
    pub fn add_agreement(&self, agreement: PartnerAgreement) {
        self.agreements
            .entry(agreement.partner_id)
            .or_default()
            .push(agreement);
    }
}

#[async_trait]
impl PartnerService for InMemoryPartners {
    async fn get_partner(&self, partner_code: &str) -> Result<Option<Partner>> {
        Ok(self.partners.get(partner_code).map(|p| p.value().clone()))
    }

    async fn get_active_agreement(
        &self,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<PartnerAgreement>> {
        // Latest-starting agreement wins when windows overlap
        Ok(self.agreements.get(&partner_id).and_then(|list| {
            list.iter()
                .filter(|a| a.is_active_at(at))
                .max_by_key(|a| a.valid_from)
                .cloned()
        }))
    }
}
