use super::instrument::InstrumentRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata tag key used to mark snapshot-derived feature vectors.
pub const META_GROUP_BY: &str = "group_by";
pub const META_GROUP_BY_MARKET_SNAPSHOT: &str = "market_snapshot";
pub const META_INTERVAL: &str = "interval";

/// A per-symbol bag of computed features. `meta` must carry either
/// `interval` (candle-derived) or `group_by = "market_snapshot"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub ts: i64,
    pub instrument: InstrumentRef,
    pub values: HashMap<String, f64>,
    pub meta: HashMap<String, String>,
}

impl FeatureVector {
    pub fn interval(&self) -> Option<&str> {
        self.meta.get(META_INTERVAL).map(|s| s.as_str())
    }

    pub fn is_market_snapshot(&self) -> bool {
        self.meta.get(META_GROUP_BY).map(|s| s.as_str()) == Some(META_GROUP_BY_MARKET_SNAPSHOT)
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// Per-symbol fetch window for the Feature Pipeline's candle stage.
#[derive(Debug, Clone, Copy)]
pub struct CandleConfig {
    pub interval: super::instrument::Interval,
    pub lookback: usize,
}

impl CandleConfig {
    pub fn defaults() -> Vec<CandleConfig> {
        use super::instrument::Interval::*;
        vec![
            CandleConfig {
                interval: OneSecond,
                lookback: 180,
            },
            CandleConfig {
                interval: OneMinute,
                lookback: 240,
            },
        ]
    }
}
