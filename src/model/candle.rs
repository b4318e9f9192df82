use super::instrument::{Interval, InstrumentRef};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar for one instrument at one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub instrument: InstrumentRef,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    pub interval: Interval,
}

impl Candle {
    /// `(close - open) / open`, the one load-bearing technical the feature
    /// pipeline computes from raw candles.
    pub fn change_pct(&self) -> Option<f64> {
        if self.o.abs() <= f64::EPSILON {
            None
        } else {
            Some((self.c - self.o) / self.o)
        }
    }
}

/// A per-symbol bundle of best-effort ticker / open-interest / funding data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<FundingSnapshot>,
}

/// `map<symbol, SymbolSnapshot>`.
pub type MarketSnapshot = std::collections::HashMap<String, SymbolSnapshot>;
