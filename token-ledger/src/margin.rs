//! Margin configuration and billed-cost calculation
//!
//! ```text
//! billed = max(min_charge, (raw_units / 1000) * base_cost_per_1k * (1 + margin_percent / 100))
//! billed = billed * multiplier
//! ```
//!
//! An inactive (or absent) margin bills raw units with no markup; the
//! multiplier still applies.

use crate::{types::SourceType, Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-source margin rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Margin {
    /// Source this rule prices
    pub source: SourceType,

    /// Cost per 1,000 raw units
    pub base_cost_per_1k: Decimal,

    /// Markup percent (10 = +10%)
    pub margin_percent: Decimal,

    /// Floor applied after markup
    pub min_charge: Decimal,

    /// Inactive rules bill raw units
    pub is_active: bool,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl Margin {
    /// Create an active margin
    pub fn new(
        source: SourceType,
        base_cost_per_1k: Decimal,
        margin_percent: Decimal,
        min_charge: Decimal,
    ) -> Self {
        Self {
            source,
            base_cost_per_1k,
            margin_percent,
            min_charge,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    /// Apply a partial update, rejecting negative values
    pub fn apply_update(&mut self, update: &MarginUpdate) -> Result<()> {
        for (field, value) in [
            ("base_cost_per_1k", update.base_cost_per_1k),
            ("margin_percent", update.margin_percent),
            ("min_charge", update.min_charge),
        ] {
            if let Some(value) = value {
                ensure_non_negative(field, value)?;
            }
        }

        if let Some(base) = update.base_cost_per_1k {
            self.base_cost_per_1k = base;
        }
        if let Some(percent) = update.margin_percent {
            self.margin_percent = percent;
        }
        if let Some(min) = update.min_charge {
            self.min_charge = min;
        }
        if let Some(active) = update.is_active {
            self.is_active = active;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn ensure_non_negative(field: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "{} must not be negative (got {})",
            field, value
        )));
    }
    Ok(())
}

/// Partial margin update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginUpdate {
    /// New base cost per 1,000 units
    pub base_cost_per_1k: Option<Decimal>,
    /// New markup percent
    pub margin_percent: Option<Decimal>,
    /// New minimum charge
    pub min_charge: Option<Decimal>,
    /// New active flag
    pub is_active: Option<bool>,
}

/// Converts raw usage units into billed tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct MarginCalculator;

impl MarginCalculator {
    /// Billed cost before the multiplier
    pub fn apply(raw_units: Decimal, margin: Option<&Margin>) -> Result<Decimal> {
        match margin {
            Some(m) if m.is_active => {
                let thousand = Decimal::from(1000);
                let hundred = Decimal::from(100);
                let markup = Decimal::ONE + m.margin_percent / hundred;
                let marked_up = (raw_units / thousand)
                    .checked_mul(m.base_cost_per_1k)
                    .and_then(|cost| cost.checked_mul(markup))
                    .ok_or_else(|| out_of_range(raw_units))?;
                Ok(marked_up.max(m.min_charge))
            }
            _ => Ok(raw_units),
        }
    }

    /// Billed cost with the call-time multiplier applied after margin
    pub fn bill(
        raw_units: Decimal,
        margin: Option<&Margin>,
        multiplier: Decimal,
    ) -> Result<Decimal> {
        Self::apply(raw_units, margin)?
            .checked_mul(multiplier)
            .ok_or_else(|| out_of_range(raw_units))
    }
}

fn out_of_range(raw_units: Decimal) -> Error {
    Error::InvalidAmount(format!(
        "Billing {} raw units exceeds the representable token range",
        raw_units
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn reference_margin() -> Margin {
        Margin::new(SourceType::Platform, dec("0.01"), dec("10"), dec("0.001"))
    }

    #[test]
    fn test_reference_calculation() {
        let billed = MarginCalculator::apply(Decimal::from(1000), Some(&reference_margin())).unwrap();
        assert_eq!(billed, dec("0.011"));
    }

    #[test]
    fn test_min_charge_floor() {
        // 10 units -> 0.00011, below the floor
        let billed = MarginCalculator::apply(Decimal::from(10), Some(&reference_margin())).unwrap();
        assert_eq!(billed, dec("0.001"));

        let billed = MarginCalculator::apply(Decimal::ZERO, Some(&reference_margin())).unwrap();
        assert_eq!(billed, dec("0.001"));
    }

    #[test]
    fn test_multiplier_applied_after_margin() {
        let billed =
            MarginCalculator::bill(Decimal::from(1000), Some(&reference_margin()), dec("2.5"))
                .unwrap();
        assert_eq!(billed, dec("0.0275"));

        // Floor is hit before the multiplier, so the multiplier scales the floor
        let billed = MarginCalculator::bill(Decimal::from(10), Some(&reference_margin()), dec("3"))
            .unwrap();
        assert_eq!(billed, dec("0.003"));
    }

    #[test]
    fn test_inactive_or_missing_margin_bills_raw() {
        let mut margin = reference_margin();
        margin.is_active = false;
        assert_eq!(
            MarginCalculator::apply(Decimal::from(1234), Some(&margin)).unwrap(),
            Decimal::from(1234)
        );
        assert_eq!(
            MarginCalculator::apply(Decimal::from(77), None).unwrap(),
            Decimal::from(77)
        );
        assert_eq!(
            MarginCalculator::bill(Decimal::from(10), None, Decimal::from(2)).unwrap(),
            Decimal::from(20)
        );
    }

    #[test]
    fn test_out_of_range_bill_is_rejected() {
        let err = MarginCalculator::bill(Decimal::MAX, None, Decimal::from(2)).unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let pricey = Margin::new(SourceType::Platform, Decimal::MAX, dec("10"), dec("0.001"));
        let err = MarginCalculator::apply(Decimal::from(1_000_000), Some(&pricey)).unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
    }

    #[test]
    fn test_apply_update_partial_and_validated() {
        let mut margin = reference_margin();
        margin
            .apply_update(&MarginUpdate {
                margin_percent: Some(dec("25")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(margin.margin_percent, dec("25"));
        assert_eq!(margin.base_cost_per_1k, dec("0.01"));

        let err = margin
            .apply_update(&MarginUpdate {
                min_charge: Some(dec("-1")),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
        assert_eq!(margin.min_charge, dec("0.001"));
    }
}
