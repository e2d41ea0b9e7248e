//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `token_ledger_credits_total` - Committed credit transactions
//! - `token_ledger_debits_total` - Committed debit transactions
//! - `token_ledger_idempotent_replays_total` - Requests served from an idempotency key
//! - `token_ledger_billed_tokens` - Histogram of billed tokens per debit
//! - `token_ledger_admission_denied_total` - Trial guard denials
//! - `token_ledger_paygo_triggered_total` - Paid tenants admitted into overage
//!
//! The registry is scraped over HTTP at `GET /metrics` (see [`Metrics::router`]).

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Committed credits
    pub credits_total: IntCounter,

    /// Committed debits
    pub debits_total: IntCounter,

    /// Idempotent replays
    pub idempotent_replays: IntCounter,

    /// Billed tokens histogram
    pub billed_tokens: Histogram,

    /// Admission denials
    pub admission_denied: IntCounter,

    /// PAYGO triggers
    pub paygo_triggered: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let credits_total =
            IntCounter::new("token_ledger_credits_total", "Committed credit transactions")?;
        registry.register(Box::new(credits_total.clone()))?;

        let debits_total =
            IntCounter::new("token_ledger_debits_total", "Committed debit transactions")?;
        registry.register(Box::new(debits_total.clone()))?;

        let idempotent_replays = IntCounter::new(
            "token_ledger_idempotent_replays_total",
            "Requests served from an idempotency key",
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let billed_tokens = Histogram::with_opts(
            HistogramOpts::new("token_ledger_billed_tokens", "Billed tokens per debit").buckets(
                vec![0.01, 0.1, 1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0],
            ),
        )?;
        registry.register(Box::new(billed_tokens.clone()))?;

        let admission_denied = IntCounter::new(
            "token_ledger_admission_denied_total",
            "Requests denied by the trial guard",
        )?;
        registry.register(Box::new(admission_denied.clone()))?;

        let paygo_triggered = IntCounter::new(
            "token_ledger_paygo_triggered_total",
            "Paid tenants admitted into pay-as-you-go overage",
        )?;
        registry.register(Box::new(paygo_triggered.clone()))?;

        Ok(Self {
            credits_total,
            debits_total,
            idempotent_replays,
            billed_tokens,
            admission_denied,
            paygo_triggered,
            registry,
        })
    }

    /// Record committed credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record committed debit
    pub fn record_debit(&self, billed: f64) {
        self.debits_total.inc();
        self.billed_tokens.observe(billed);
    }

    /// Record idempotent replay
    pub fn record_replay(&self) {
        self.idempotent_replays.inc();
    }

    /// Record admission denial
    pub fn record_denied(&self) {
        self.admission_denied.inc();
    }

    /// Record PAYGO overage
    pub fn record_paygo(&self) {
        self.paygo_triggered.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry contents in the Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Router serving `GET /metrics`
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.credits_total.get(), 0);
        assert_eq!(metrics.debits_total.get(), 0);

        // Independent registries never collide
        let other = Metrics::new().unwrap();
        other.record_credit();
        assert_eq!(metrics.credits_total.get(), 0);
    }

    #[test]
    fn test_record_debit() {
        let metrics = Metrics::new().unwrap();
        metrics.record_debit(0.011);
        metrics.record_debit(12.0);
        assert_eq!(metrics.debits_total.get(), 2);
        assert_eq!(metrics.billed_tokens.get_sample_count(), 2);
    }

    #[test]
    fn test_registry_exposes_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_denied();
        metrics.record_paygo();
        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"token_ledger_admission_denied_total".to_string()));
        assert!(names.contains(&"token_ledger_paygo_triggered_total".to_string()));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_credit();

        let response = metrics_handler(State(metrics.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("token_ledger_credits_total 1"));
    }
}
