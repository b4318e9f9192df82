use super::instruction::TradeSide;
use super::instrument::InstrumentRef;
use super::portfolio::TradeType;
use serde::{Deserialize, Serialize};

/// A realized fill event, the unit persisted to `strategy_details` and
/// consumed by the rolling digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub trade_id: String,
    pub compose_id: String,
    pub instruction_id: String,
    pub strategy_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    pub trade_type: TradeType,
    /// Fixed-precision decimal string on the wire; `f64` in memory.
    #[serde(with = "super::decimal::decimal_string")]
    pub quantity: f64,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub notional_entry: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub notional_exit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_ts: Option<i64>,
    pub trade_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_ms: Option<i64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(default, with = "super::decimal::opt_decimal_string", skip_serializing_if = "Option::is_none")]
    pub fee_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Rolling per-instrument statistics fed to the composer as context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolDigest {
    pub trade_count: u32,
    pub realized_pnl: f64,
    pub win_rate: f64,
    pub avg_holding_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_ts: Option<i64>,
}

pub type Digest = std::collections::HashMap<String, SymbolDigest>;
