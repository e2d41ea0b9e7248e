//! Settlement period lifecycle
//!
//! ```text
//! OPEN --calculate--> CALCULATED --lock--> LOCKED
//!                      ^      |
//!                      +------+ recalculate (full replace)
//! ```
//!
//! Every mutation holds the manager's write lock across its check-and-write,
//! so the "one OPEN period" and "no overlap" checks cannot race a concurrent
//! create. Calculation prices every partner before touching storage, then
//! swaps the period's rows and status in one batch, so a collaborator
//! failure leaves the previous rows and status as they were.

use crate::{
    services::{AttributionService, MetricsCollector, PartnerService},
    storage::SettlementStorage,
    types::{
        CalculationSummary, LockOutcome, PeriodStatus, Settlement, SettlementPeriod, SkipReason,
        SkippedPartner,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Metrics event: period created
pub const EVENT_PERIOD_CREATED: &str = "settlement.period_created";
/// Metrics event: settlements calculated
pub const EVENT_CALCULATED: &str = "settlement.calculated";
/// Metrics event: period locked
pub const EVENT_LOCKED: &str = "settlement.locked";

/// Settlement period manager
pub struct SettlementPeriodManager {
    /// Storage backend
    storage: Arc<SettlementStorage>,

    /// Attribution export
    attribution: Arc<dyn AttributionService>,

    /// Partner and agreement lookup
    partners: Arc<dyn PartnerService>,

    /// Business event sink
    metrics: Arc<dyn MetricsCollector>,

    /// Serializes period mutations
    write_lock: Mutex<()>,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for SettlementPeriodManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementPeriodManager")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl SettlementPeriodManager {
    /// Open storage and wire collaborators
    pub fn open(
        config: Config,
        attribution: Arc<dyn AttributionService>,
        partners: Arc<dyn PartnerService>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        let storage = Arc::new(SettlementStorage::open(&config)?);
        Ok(Self {
            storage,
            attribution,
            partners,
            metrics,
            write_lock: Mutex::new(()),
            config,
        })
    }

    /// Create a new OPEN period covering `[start, end)`
    pub async fn create_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SettlementPeriod> {
        if start >= end {
            return Err(Error::InvalidDateRange { start, end });
        }

        let _guard = self.write_lock.lock().await;

        let existing = self.storage.list_periods()?;
        if let Some(conflict) = existing.iter().find(|p| p.overlaps(start, end)) {
            return Err(Error::PeriodOverlap(conflict.id));
        }
        if let Some(open) = existing.iter().find(|p| p.status == PeriodStatus::Open) {
            return Err(Error::OpenPeriodExists(open.id));
        }

        let period = SettlementPeriod::new(start, end);
        self.storage.put_period(&period)?;

        tracing::info!(
            period_id = %period.id,
            start = %period.start,
            end = %period.end,
            "Settlement period created"
        );
        self.emit(
            EVENT_PERIOD_CREATED,
            json!({
                "period_id": period.id,
                "start": period.start,
                "end": period.end,
            }),
        )
        .await;

        Ok(period)
    }

    /// Compute every partner's settlement for a period
    ///
    /// Replaces all existing rows of the period and moves it to CALCULATED.
    pub async fn calculate_settlements(
        &self,
        period_id: Uuid,
        actor: &str,
    ) -> Result<CalculationSummary> {
        require_actor(actor)?;
        let _guard = self.write_lock.lock().await;

        let mut period = self.load_period(period_id)?;
        if period.is_locked() {
            return Err(Error::PeriodLocked(period_id));
        }

        let rows = self
            .attribution
            .export_attribution(period.start, period.end)
            .await?;

        // Sum rows per partner code
        let mut revenue: BTreeMap<String, Decimal> = BTreeMap::new();
        for row in rows {
            let total = revenue.entry(row.partner_code).or_default();
            *total = total.checked_add(row.revenue_attributed).ok_or_else(|| {
                Error::InvalidAmount("Attributed revenue exceeds the decimal range".to_string())
            })?;
        }

        let now = Utc::now();
        let mut settlements = Vec::with_capacity(revenue.len());
        let mut skipped = Vec::new();

        for (partner_code, revenue_attributed) in revenue {
            match self
                .settle_partner(&period, &partner_code, revenue_attributed, now)
                .await?
            {
                Ok(settlement) => {
                    tracing::debug!(
                        period_id = %period_id,
                        partner_code = %settlement.partner_code,
                        amount = %settlement.amount,
                        "Settlement priced"
                    );
                    settlements.push(settlement);
                }
                Err(reason) => {
                    tracing::warn!(
                        period_id = %period_id,
                        partner_code = %partner_code,
                        revenue = %revenue_attributed,
                        reason = ?reason,
                        "Partner skipped"
                    );
                    skipped.push(SkippedPartner {
                        partner_code,
                        reason,
                    });
                }
            }
        }

        period.status = PeriodStatus::Calculated;
        period.calculated_at = Some(now);
        period.calculated_by = Some(actor.to_string());
        let removed = self.storage.replace_settlements(&period, &settlements)?;
        if removed > 0 {
            tracing::info!(period_id = %period_id, removed, "Replaced previous settlements");
        }

        let total_amount = settlements
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(s.amount));

        tracing::info!(
            period_id = %period_id,
            actor,
            settlements = settlements.len(),
            skipped = skipped.len(),
            total = %total_amount,
            "Settlements calculated"
        );
        self.emit(
            EVENT_CALCULATED,
            json!({
                "period_id": period_id,
                "actor": actor,
                "settlement_count": settlements.len(),
                "skipped_count": skipped.len(),
                "total_amount": total_amount.to_string(),
            }),
        )
        .await;

        Ok(CalculationSummary {
            period,
            settlements,
            skipped,
            total_amount,
        })
    }

    /// Price one partner, or say why it gets no row
    async fn settle_partner(
        &self,
        period: &SettlementPeriod,
        partner_code: &str,
        revenue_attributed: Decimal,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<Settlement, SkipReason>> {
        if revenue_attributed <= Decimal::ZERO {
            return Ok(Err(SkipReason::NoRevenue));
        }

        let Some(partner) = self.partners.get_partner(partner_code).await? else {
            return Ok(Err(SkipReason::UnknownPartner));
        };

        let Some(agreement) = self
            .partners
            .get_active_agreement(partner.id, period.last_instant())
            .await?
        else {
            return Ok(Err(SkipReason::NoActiveAgreement));
        };

        let amount = revenue_attributed
            .checked_mul(agreement.revenue_share_percent)
            .map(|share| (share / Decimal::ONE_HUNDRED).round_dp(2))
            .ok_or_else(|| {
                Error::InvalidAmount(format!(
                    "Settlement for {} exceeds the decimal range",
                    partner_code
                ))
            })?;

        Ok(Ok(Settlement {
            id: Uuid::now_v7(),
            period_id: period.id,
            partner_code: partner_code.to_string(),
            partner_id: partner.id,
            revenue_attributed,
            revenue_share_percent: agreement.revenue_share_percent,
            amount,
            is_locked: false,
            calculated_at: now,
            adjusted_by: None,
            adjustment_note: None,
            updated_at: now,
        }))
    }

    /// Lock a CALCULATED period; locking twice is a no-op
    pub async fn lock_period(&self, period_id: Uuid, actor: &str) -> Result<LockOutcome> {
        require_actor(actor)?;
        let _guard = self.write_lock.lock().await;

        let mut period = self.load_period(period_id)?;
        match period.status {
            PeriodStatus::Open => return Err(Error::NotCalculated(period_id)),
            PeriodStatus::Locked => {
                tracing::debug!(period_id = %period_id, "Period already locked");
                return Ok(LockOutcome {
                    period,
                    already_locked: true,
                });
            }
            PeriodStatus::Calculated => {}
        }

        let now = Utc::now();
        period.status = PeriodStatus::Locked;
        period.locked_at = Some(now);
        period.locked_by = Some(actor.to_string());

        let settlements: Vec<Settlement> = self
            .storage
            .list_settlements(period_id)?
            .into_iter()
            .map(|mut s| {
                s.is_locked = true;
                s.updated_at = now;
                s
            })
            .collect();

        self.storage.commit_lock(&period, &settlements)?;

        tracing::info!(
            period_id = %period_id,
            actor,
            settlements = settlements.len(),
            "Settlement period locked"
        );
        self.emit(
            EVENT_LOCKED,
            json!({
                "period_id": period_id,
                "actor": actor,
                "settlement_count": settlements.len(),
            }),
        )
        .await;

        Ok(LockOutcome {
            period,
            already_locked: false,
        })
    }

    /// Manually correct one partner's amount before lock
    pub async fn adjust_settlement(
        &self,
        period_id: Uuid,
        partner_code: &str,
        amount: Decimal,
        actor: &str,
        note: &str,
    ) -> Result<Settlement> {
        require_actor(actor)?;
        if amount < Decimal::ZERO {
            return Err(Error::InvalidAmount(
                "Settlement amount must not be negative".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        let period = self.load_period(period_id)?;
        if period.is_locked() {
            return Err(Error::PeriodLocked(period_id));
        }

        let mut settlement = self
            .storage
            .get_settlement(period_id, partner_code)?
            .ok_or_else(|| {
                Error::NotFound(format!("settlement {} in period {}", partner_code, period_id))
            })?;

        let previous = settlement.amount;
        settlement.amount = amount.round_dp(2);
        settlement.adjusted_by = Some(actor.to_string());
        settlement.adjustment_note = Some(note.to_string()).filter(|n| !n.trim().is_empty());
        settlement.updated_at = Utc::now();
        self.storage.put_settlement(&settlement)?;

        tracing::info!(
            period_id = %period_id,
            partner_code,
            actor,
            previous = %previous,
            amount = %settlement.amount,
            "Settlement adjusted"
        );

        Ok(settlement)
    }

    /// Period by ID
    pub fn get_period(&self, period_id: Uuid) -> Result<SettlementPeriod> {
        self.load_period(period_id)
    }

    /// The OPEN period, if any
    pub fn get_open_period(&self) -> Result<Option<SettlementPeriod>> {
        self.storage.find_open_period()
    }

    /// All periods ordered by start
    pub fn list_periods(&self) -> Result<Vec<SettlementPeriod>> {
        self.storage.list_periods()
    }

    /// Settlement rows of a period
    pub fn list_settlements(&self, period_id: Uuid) -> Result<Vec<Settlement>> {
        self.load_period(period_id)?;
        self.storage.list_settlements(period_id)
    }

    fn load_period(&self, period_id: Uuid) -> Result<SettlementPeriod> {
        self.storage
            .get_period(period_id)?
            .ok_or_else(|| Error::NotFound(format!("period {}", period_id)))
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self
            .metrics
            .record_event(event_type, &self.config.metrics_source, payload)
            .await
        {
            tracing::error!(event_type, error = %e, "Failed to record settlement event");
        }
    }
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(Error::MissingRequired("actor".to_string()));
    }
    Ok(())
}
