use super::instrument::InstrumentRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn from_delta(delta: f64) -> Self {
        if delta > 0.0 {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMode {
    Market,
    Limit,
}

/// A validated, executable order produced by the Plan Normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeInstruction {
    /// Deterministic: `"{compose_id}:{symbol}:{index}"`.
    pub instruction_id: String,
    pub compose_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    /// Always > 0; direction carried by `side`. Stored as a fixed-precision
    /// decimal string; in-memory arithmetic still uses `f64`.
    #[serde(with = "super::decimal::decimal_string")]
    pub quantity: f64,
    pub leverage: f64,
    pub price_mode: PriceMode,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slippage_bps: Option<f64>,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl TradeInstruction {
    pub fn deterministic_id(compose_id: &str, symbol: &str, index: usize) -> String {
        format!("{compose_id}:{symbol}:{index}")
    }
}
