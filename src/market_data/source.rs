use crate::model::{Candle, Interval, MarketSnapshot};
use async_trait::async_trait;

/// Pulls multi-interval OHLCV and per-symbol snapshots. Stateless: a
/// conforming implementation creates a fresh exchange handle per call
/// rather than holding a long-lived connection.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch up to `lookback` most recent candles at `interval` for each
    /// symbol. Per-symbol fetches run concurrently; a failure for one
    /// symbol yields an empty result for that symbol only — the batch
    /// never aborts. Results are flattened into one ordered sequence.
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: Interval,
        lookback: usize,
    ) -> Vec<Candle>;

    /// Best-effort fetch of ticker/open-interest/funding for each symbol.
    /// Any sub-fetch may fail independently and is simply omitted from
    /// the resulting record. Closes underlying connections before
    /// returning.
    async fn get_market_snapshot(&self, symbols: &[String]) -> MarketSnapshot;
}
