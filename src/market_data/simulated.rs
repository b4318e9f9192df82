use super::source::MarketDataSource;
use crate::model::{Candle, Interval, InstrumentRef, MarketSnapshot, PriceSnapshot, SymbolSnapshot};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Deterministic, in-process market data source for tests and local
/// paper-trading demos. Each symbol drifts along a small fixed sinusoid
/// around its configured base price, seeded the same way across runs.
pub struct SimulatedMarketDataSource {
    base_prices: HashMap<String, f64>,
    tick: AtomicI64,
    last_by_symbol: RwLock<HashMap<String, f64>>,
}

impl SimulatedMarketDataSource {
    pub fn new(base_prices: HashMap<String, f64>) -> Self {
        Self {
            base_prices,
            tick: AtomicI64::new(0),
            last_by_symbol: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_symbols(symbols: &[String]) -> Self {
        let base_prices = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), 120.0 + i as f64 * 15.0))
            .collect();
        Self::new(base_prices)
    }

    fn price_at(&self, symbol: &str, tick: i64) -> f64 {
        let base = *self.base_prices.get(symbol).unwrap_or(&100.0);
        let phase = (tick as f64) * 0.1;
        base * (1.0 + 0.002 * phase.sin())
    }

    /// Advances the internal clock by one step; subsequent snapshot/candle
    /// calls reflect the new price. Exposed for deterministic test setup.
    pub fn advance(&self) {
        self.tick.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.last_by_symbol.write().insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl MarketDataSource for SimulatedMarketDataSource {
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: Interval,
        lookback: usize,
    ) -> Vec<Candle> {
        let tick = self.tick.load(Ordering::SeqCst);
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let overridden = self.last_by_symbol.read().get(symbol).copied();
            let close = overridden.unwrap_or_else(|| self.price_at(symbol, tick));
            let open = overridden.unwrap_or_else(|| self.price_at(symbol, tick.saturating_sub(1)));
            let n = lookback.min(1).max(1);
            for _ in 0..n {
                out.push(Candle {
                    ts_ms: tick * 1000,
                    instrument: InstrumentRef::new(symbol.clone()),
                    o: open,
                    h: open.max(close),
                    l: open.min(close),
                    c: close,
                    v: 1.0,
                    interval,
                });
            }
        }
        out
    }

    async fn get_market_snapshot(&self, symbols: &[String]) -> MarketSnapshot {
        let tick = self.tick.load(Ordering::SeqCst);
        let mut snapshot = MarketSnapshot::new();
        for symbol in symbols {
            let overridden = self.last_by_symbol.read().get(symbol).copied();
            let last = overridden.unwrap_or_else(|| self.price_at(symbol, tick));
            let prev = overridden.unwrap_or_else(|| self.price_at(symbol, tick.saturating_sub(1)));
            let change_pct = if prev.abs() > f64::EPSILON {
                (last - prev) / prev
            } else {
                0.0
            };
            snapshot.insert(
                symbol.clone(),
                SymbolSnapshot {
                    price: Some(PriceSnapshot {
                        last: Some(last),
                        open: Some(prev),
                        high: Some(last.max(prev)),
                        low: Some(last.min(prev)),
                        bid: Some(last * 0.9995),
                        ask: Some(last * 1.0005),
                        change_pct: Some(change_pct),
                        volume: Some(1.0),
                    }),
                    open_interest: None,
                    funding_rate: None,
                },
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_last_price_for_every_symbol() {
        let src = SimulatedMarketDataSource::from_symbols(&["BTC-USDT".into(), "ETH-USDT".into()]);
        let snapshot = src
            .get_market_snapshot(&["BTC-USDT".into(), "ETH-USDT".into()])
            .await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot["BTC-USDT"].price.as_ref().unwrap().last.is_some());
    }

    #[tokio::test]
    async fn set_price_pins_candles_to_exact_value() {
        let src = SimulatedMarketDataSource::from_symbols(&["BTC-USDT".into()]);
        src.set_price("BTC-USDT", 42_000.0);
        let candles = src
            .get_recent_candles(&["BTC-USDT".into()], Interval::OneMinute, 1)
            .await;
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].c, 42_000.0);
    }

    #[tokio::test]
    async fn missing_symbol_does_not_panic_and_uses_fallback_base() {
        let src = SimulatedMarketDataSource::new(HashMap::new());
        let candles = src
            .get_recent_candles(&["UNKNOWN-USDT".into()], Interval::OneMinute, 1)
            .await;
        assert_eq!(candles.len(), 1);
    }
}
