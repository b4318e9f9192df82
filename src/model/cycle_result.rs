use super::instruction::TradeInstruction;
use super::portfolio::PortfolioView;
use super::trade_history::TradeHistoryEntry;
use serde::{Deserialize, Serialize};

/// A rolling, per-strategy summary refreshed every cycle; persisted
/// alongside the portfolio view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    pub ts_ms: i64,
    pub active_positions: usize,
    pub total_value: Option<f64>,
    pub total_unrealized_pnl: Option<f64>,
    pub trade_count: usize,
}

/// The full output of one Decision Coordinator cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionCycleResult {
    pub compose_id: String,
    pub cycle_index: u64,
    pub timestamp_ms: i64,
    pub rationale: String,
    pub instructions: Vec<TradeInstruction>,
    pub trades: Vec<TradeHistoryEntry>,
    pub portfolio_view: PortfolioView,
    pub strategy_summary: StrategySummary,
}
