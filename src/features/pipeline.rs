use crate::model::{
    Candle, CandleConfig, FeatureVector, Interval, MarketSnapshot, META_GROUP_BY,
    META_GROUP_BY_MARKET_SNAPSHOT, META_INTERVAL,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Turns raw candles and a market snapshot into the flat `FeatureVector`
/// list composers read from. No composer performs its own feature
/// extraction — this is the single place technicals are derived.
#[async_trait]
pub trait FeatureComputer: Send + Sync {
    async fn compute(
        &self,
        candles: &[Candle],
        snapshot: &MarketSnapshot,
        configs: &[CandleConfig],
    ) -> Vec<FeatureVector>;
}

/// Reference implementation: one `change_pct` feature per symbol per
/// interval (from the most recent bar in that interval), plus a flattened
/// snapshot feature vector per symbol.
pub struct DefaultFeatureComputer;

impl DefaultFeatureComputer {
    pub fn new() -> Self {
        Self
    }

    fn candle_features(candles: &[Candle], interval: Interval) -> Vec<FeatureVector> {
        let mut latest_by_symbol: HashMap<String, &Candle> = HashMap::new();
        for candle in candles.iter().filter(|c| c.interval == interval) {
            latest_by_symbol
                .entry(candle.instrument.symbol.clone())
                .and_modify(|existing| {
                    if candle.ts_ms >= existing.ts_ms {
                        *existing = candle;
                    }
                })
                .or_insert(candle);
        }

        let mut out: Vec<FeatureVector> = latest_by_symbol
            .into_iter()
            .map(|(symbol, candle)| {
                let mut values = HashMap::new();
                if let Some(change_pct) = candle.change_pct() {
                    values.insert("change_pct".to_string(), change_pct);
                }
                values.insert("close".to_string(), candle.c);

                let mut meta = HashMap::new();
                meta.insert(META_INTERVAL.to_string(), interval.as_str().to_string());

                FeatureVector {
                    ts: candle.ts_ms,
                    instrument: candle.instrument.clone(),
                    values,
                    meta,
                }
            })
            .collect();

        out.sort_by(|a, b| a.instrument.symbol.cmp(&b.instrument.symbol));
        out
    }

    fn snapshot_features(snapshot: &MarketSnapshot) -> Vec<FeatureVector> {
        let mut symbols: Vec<&String> = snapshot.keys().collect();
        symbols.sort();

        symbols
            .into_iter()
            .map(|symbol| {
                let entry = &snapshot[symbol];
                let mut values = HashMap::new();

                if let Some(price) = &entry.price {
                    if let Some(v) = price.last {
                        values.insert("price.last".to_string(), v);
                    }
                    if let Some(v) = price.open {
                        values.insert("price.open".to_string(), v);
                    }
                    if let Some(v) = price.high {
                        values.insert("price.high".to_string(), v);
                    }
                    if let Some(v) = price.low {
                        values.insert("price.low".to_string(), v);
                    }
                    if let Some(v) = price.bid {
                        values.insert("price.bid".to_string(), v);
                    }
                    if let Some(v) = price.ask {
                        values.insert("price.ask".to_string(), v);
                    }
                    if let Some(v) = price.change_pct {
                        values.insert("price.change_pct".to_string(), v);
                    }
                    if let Some(v) = price.volume {
                        values.insert("price.volume".to_string(), v);
                    }
                }
                if let Some(oi) = entry.open_interest {
                    values.insert("open_interest".to_string(), oi);
                }
                if let Some(funding) = &entry.funding_rate {
                    if let Some(v) = funding.rate {
                        values.insert("funding.rate".to_string(), v);
                    }
                    if let Some(v) = funding.mark_price {
                        values.insert("funding.mark_price".to_string(), v);
                    }
                }

                let mut meta = HashMap::new();
                meta.insert(
                    META_GROUP_BY.to_string(),
                    META_GROUP_BY_MARKET_SNAPSHOT.to_string(),
                );

                FeatureVector {
                    ts: 0,
                    instrument: crate::model::InstrumentRef::new(symbol.clone()),
                    values,
                    meta,
                }
            })
            .collect()
    }
}

impl Default for DefaultFeatureComputer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureComputer for DefaultFeatureComputer {
    async fn compute(
        &self,
        candles: &[Candle],
        snapshot: &MarketSnapshot,
        configs: &[CandleConfig],
    ) -> Vec<FeatureVector> {
        // Medium interval (1m) first, then micro interval (1s), matching the
        // ordering the composers expect when ranking features by freshness.
        let mut ordered_configs: Vec<&CandleConfig> = configs.iter().collect();
        ordered_configs.sort_by_key(|c| match c.interval {
            Interval::OneMinute => 0,
            Interval::OneSecond => 1,
            _ => 2,
        });

        let mut out = Vec::new();
        for config in ordered_configs {
            out.extend(Self::candle_features(candles, config.interval));
        }
        out.extend(Self::snapshot_features(snapshot));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentRef;

    fn candle(symbol: &str, ts_ms: i64, o: f64, c: f64, interval: Interval) -> Candle {
        Candle {
            ts_ms,
            instrument: InstrumentRef::new(symbol),
            o,
            h: o.max(c),
            l: o.min(c),
            c,
            v: 1.0,
            interval,
        }
    }

    #[tokio::test]
    async fn picks_latest_bar_per_symbol_per_interval() {
        let candles = vec![
            candle("BTC-USDT", 1_000, 100.0, 101.0, Interval::OneMinute),
            candle("BTC-USDT", 2_000, 101.0, 99.0, Interval::OneMinute),
        ];
        let computer = DefaultFeatureComputer::new();
        let features = computer
            .compute(&candles, &MarketSnapshot::new(), &[CandleConfig {
                interval: Interval::OneMinute,
                lookback: 240,
            }])
            .await;

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].ts, 2_000);
        assert!((features[0].value("change_pct").unwrap() - (-2.0 / 101.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn snapshot_features_are_flattened_and_tagged() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert(
            "ETH-USDT".to_string(),
            crate::model::SymbolSnapshot {
                price: Some(crate::model::PriceSnapshot {
                    last: Some(2000.0),
                    ..Default::default()
                }),
                open_interest: None,
                funding_rate: None,
            },
        );

        let computer = DefaultFeatureComputer::new();
        let features = computer.compute(&[], &snapshot, &[]).await;

        assert_eq!(features.len(), 1);
        assert!(features[0].is_market_snapshot());
        assert_eq!(features[0].value("price.last"), Some(2000.0));
    }

    #[tokio::test]
    async fn ordering_is_medium_then_micro_then_snapshot() {
        let candles = vec![
            candle("BTC-USDT", 1_000, 100.0, 101.0, Interval::OneMinute),
            candle("BTC-USDT", 1_000, 100.0, 100.5, Interval::OneSecond),
        ];
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert("BTC-USDT".to_string(), crate::model::SymbolSnapshot::default());

        let computer = DefaultFeatureComputer::new();
        let features = computer
            .compute(&candles, &snapshot, &CandleConfig::defaults())
            .await;

        assert_eq!(features[0].interval(), Some("1m"));
        assert_eq!(features[1].interval(), Some("1s"));
        assert!(features[2].is_market_snapshot());
    }
}
