pub mod live;
pub mod paper;

pub use live::LiveExecutionGateway;
pub use paper::PaperExecutionGateway;

use crate::model::{MarketSnapshot, TradeInstruction, TxResult};
use async_trait::async_trait;

/// Boundary between normalized `TradeInstruction`s and wherever fills
/// actually come from — a local fill simulator or a real exchange. Never
/// returns an `Err`: every instruction maps to exactly one `TxResult`,
/// `ERROR`/`REJECTED` included, so the Decision Coordinator can always
/// fold the outcome into `TradeHistoryEntry` without a fallible branch.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        snapshot: Option<&MarketSnapshot>,
    ) -> Vec<TxResult>;
}
