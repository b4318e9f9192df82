use crate::model::{Digest, SymbolDigest, TradeHistoryEntry};
use std::collections::HashMap;

/// Builds the rolling per-instrument digest the composers read as context:
/// trade count and cumulative realized P&L over every trade in `trades`,
/// but win rate and average holding time only from the subset that closed
/// a position (those carrying a `realized_pnl`). `trades` is expected to
/// already be bounded to the caller's lookback window — this function
/// does no further trimming.
pub fn build_digest(trades: &[TradeHistoryEntry]) -> Digest {
    let mut by_symbol: HashMap<String, Vec<&TradeHistoryEntry>> = HashMap::new();
    for trade in trades {
        by_symbol
            .entry(trade.instrument.symbol.clone())
            .or_default()
            .push(trade);
    }

    let mut digest = Digest::new();
    for (symbol, entries) in by_symbol {
        let closed: Vec<&&TradeHistoryEntry> = entries
            .iter()
            .filter(|e| e.realized_pnl.is_some())
            .collect();

        let win_rate = if closed.is_empty() {
            0.0
        } else {
            let wins = closed.iter().filter(|e| e.realized_pnl.unwrap() > 0.0).count();
            wins as f64 / closed.len() as f64
        };

        let avg_holding_ms = if closed.is_empty() {
            0.0
        } else {
            let total: i64 = closed.iter().filter_map(|e| e.holding_ms).sum();
            let with_holding = closed.iter().filter(|e| e.holding_ms.is_some()).count();
            if with_holding == 0 {
                0.0
            } else {
                total as f64 / with_holding as f64
            }
        };

        digest.insert(
            symbol,
            SymbolDigest {
                trade_count: entries.len() as u32,
                realized_pnl: entries.iter().filter_map(|e| e.realized_pnl).sum(),
                win_rate,
                avg_holding_ms,
                last_trade_ts: entries.iter().map(|e| e.trade_ts).max(),
            },
        );
    }
    digest
}
