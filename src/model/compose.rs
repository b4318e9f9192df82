use super::candle::MarketSnapshot;
use super::feature::FeatureVector;
use super::instruction::TradeInstruction;
use super::portfolio::{Constraints, PortfolioView};
use super::trade_history::Digest;
use serde::{Deserialize, Serialize};

/// Everything a composer needs to produce a plan for one cycle. Shared
/// verbatim between the prompt composer, the grid composer, and the
/// normalizer.
#[derive(Debug, Clone)]
pub struct ComposeContext {
    pub ts: i64,
    pub compose_id: String,
    pub strategy_id: String,
    pub features: Vec<FeatureVector>,
    pub portfolio: PortfolioView,
    pub digest: Digest,
    pub prompt_text: Option<String>,
    pub market_snapshot: Option<MarketSnapshot>,
    pub constraints: Constraints,
}

/// What every composer returns: normalized, executable instructions plus
/// a human-readable trace of why.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeResult {
    pub instructions: Vec<TradeInstruction>,
    pub rationale: String,
}

impl ComposeResult {
    pub fn empty(rationale: impl Into<String>) -> Self {
        Self {
            instructions: Vec::new(),
            rationale: rationale.into(),
        }
    }
}
