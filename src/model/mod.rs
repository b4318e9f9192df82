//! Typed value objects shared across the whole decision pipeline: the
//! instrument/candle/feature data read in, the portfolio/plan/instruction
//! objects produced and consumed cycle to cycle, and the result types
//! persisted for audit.

pub mod candle;
pub mod compose;
pub mod cycle_result;
pub mod decimal;
pub mod feature;
pub mod instrument;
pub mod instruction;
pub mod plan;
pub mod portfolio;
pub mod trade_history;
pub mod tx_result;

pub use candle::{Candle, FundingSnapshot, MarketSnapshot, PriceSnapshot, SymbolSnapshot};
pub use compose::{ComposeContext, ComposeResult};
pub use cycle_result::{DecisionCycleResult, StrategySummary};
pub use feature::{CandleConfig, FeatureVector};
pub use instrument::{Interval, InstrumentRef};
pub use instruction::{PriceMode, TradeInstruction, TradeSide};
pub use plan::{PlanAction, PlanItem, PlanProposal};
pub use portfolio::{Constraints, PortfolioView, PositionSnapshot, TradeType, QUANTITY_PRECISION};
pub use trade_history::{Digest, SymbolDigest, TradeHistoryEntry};
pub use tx_result::{TxResult, TxStatus};
