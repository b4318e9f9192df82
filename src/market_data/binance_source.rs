use super::source::MarketDataSource;
use crate::binance::client::BinanceClient;
use crate::model::{Candle, Interval, MarketSnapshot, PriceSnapshot, SymbolSnapshot};
use async_trait::async_trait;
use tracing::warn;

/// REST-pull market data source backed by Binance's public endpoints.
/// Stateless: every call builds a fresh [`BinanceClient`] and lets it drop
/// (and with it, its underlying connection pool) once the call completes.
pub struct BinanceMarketDataSource;

impl BinanceMarketDataSource {
    pub fn new() -> Self {
        Self
    }

    fn normalize(symbol: &str) -> String {
        symbol.replace('-', "").replace('/', "").to_uppercase()
    }
}

impl Default for BinanceMarketDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for BinanceMarketDataSource {
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: Interval,
        lookback: usize,
    ) -> Vec<Candle> {
        let client = BinanceClient::public();
        let limit = lookback.clamp(1, 1000) as u32;

        let fetches = symbols.iter().map(|symbol| {
            let client = client.clone();
            let binance_symbol = Self::normalize(symbol);
            async move {
                match client.get_klines(&binance_symbol, interval, limit).await {
                    Ok(candles) => candles,
                    Err(err) => {
                        warn!(symbol = %binance_symbol, error = %err, "candle fetch failed, skipping symbol");
                        Vec::new()
                    }
                }
            }
        });

        futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn get_market_snapshot(&self, symbols: &[String]) -> MarketSnapshot {
        let client = BinanceClient::public();

        let fetches = symbols.iter().map(|symbol| {
            let client = client.clone();
            let binance_symbol = Self::normalize(symbol);
            let original = symbol.clone();
            async move {
                let ticker = match client.get_ticker(&binance_symbol).await {
                    Ok(t) => t,
                    Err(err) => {
                        warn!(symbol = %binance_symbol, error = %err, "ticker fetch failed, skipping symbol");
                        return (original, None);
                    }
                };

                let parse = |key: &str| ticker[key].as_str().and_then(|s| s.parse::<f64>().ok());

                let snapshot = SymbolSnapshot {
                    price: Some(PriceSnapshot {
                        last: parse("lastPrice"),
                        open: parse("openPrice"),
                        high: parse("highPrice"),
                        low: parse("lowPrice"),
                        bid: parse("bidPrice"),
                        ask: parse("askPrice"),
                        change_pct: parse("priceChangePercent").map(|p| p / 100.0),
                        volume: parse("volume"),
                    }),
                    open_interest: None,
                    funding_rate: None,
                };

                (original, Some(snapshot))
            }
        });

        let results = futures_util::future::join_all(fetches).await;

        let mut snapshot = MarketSnapshot::new();
        for (symbol, entry) in results {
            if let Some(s) = entry {
                snapshot.insert(symbol, s);
            }
        }
        snapshot
    }
}
