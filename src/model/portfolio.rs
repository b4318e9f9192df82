use super::instrument::InstrumentRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default absolute-value tolerance below which a quantity is treated as
/// zero throughout the core (normalizer, portfolio, grid composer).
pub const QUANTITY_PRECISION: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Long,
    Short,
}

impl TradeType {
    pub fn from_quantity(qty: f64) -> Self {
        if qty >= 0.0 {
            TradeType::Long
        } else {
            TradeType::Short
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: InstrumentRef,
    /// Signed: positive is long, negative is short. Fixed-precision decimal
    /// string on the wire, matching the exchange-amount convention for
    /// `TradeInstruction.quantity`; `f64` in memory.
    #[serde(with = "super::decimal::decimal_string")]
    pub quantity: f64,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl_pct: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub notional: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ts: Option<i64>,
    pub trade_type: TradeType,
}

impl PositionSnapshot {
    pub fn flat(instrument: InstrumentRef) -> Self {
        Self {
            instrument,
            quantity: 0.0,
            avg_price: None,
            mark_price: None,
            unrealized_pnl: None,
            unrealized_pnl_pct: None,
            notional: None,
            leverage: None,
            entry_ts: None,
            trade_type: TradeType::Long,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() <= QUANTITY_PRECISION
    }
}

/// Risk/exchange guardrails. Every field is optional: absence means
/// "unconstrained" for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_positions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trade_qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_order_qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_notional: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_qty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioView {
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(with = "super::decimal::decimal_string")]
    pub free_cash: f64,
    pub positions: HashMap<String, PositionSnapshot>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub gross_exposure: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub net_exposure: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub total_value: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub total_unrealized_pnl: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub buying_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

impl PortfolioView {
    pub fn active_position_count(&self) -> usize {
        self.positions.values().filter(|p| !p.is_flat()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_position_reports_is_flat() {
        let pos = PositionSnapshot::flat(InstrumentRef::new("BTC-USDT"));
        assert!(pos.is_flat());
    }

    #[test]
    fn near_zero_quantity_counts_as_flat() {
        let mut pos = PositionSnapshot::flat(InstrumentRef::new("BTC-USDT"));
        pos.quantity = 1e-12;
        assert!(pos.is_flat());
    }
}
