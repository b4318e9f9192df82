use super::ExecutionGateway;
use crate::model::{MarketSnapshot, TradeSide, TradeInstruction, TxResult, TxStatus};
use async_trait::async_trait;
use std::collections::HashMap;

/// Reference implementation used for virtual-mode trading and in tests:
/// every instruction fills in full against a reference price taken from
/// the market snapshot, with a fixed slippage and fee model. No order
/// ever partially fills or gets stuck — the only rejection path is a
/// missing/invalid reference price.
pub struct PaperExecutionGateway {
    fee_bps: f64,
}

impl PaperExecutionGateway {
    pub fn new(fee_bps: f64) -> Self {
        Self { fee_bps }
    }

    fn reference_price(snapshot: &MarketSnapshot, symbol: &str) -> Option<f64> {
        let price = snapshot.get(symbol)?.price.as_ref()?;
        price.last.or_else(|| match (price.bid, price.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }).or(price.open)
    }

    fn fill(&self, instruction: &TradeInstruction, ref_price: f64) -> TxResult {
        let slippage_bps = instruction.max_slippage_bps.unwrap_or(5.0);
        let direction = match instruction.side {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        };
        let exec_price = ref_price * (1.0 + direction * slippage_bps / 10_000.0);
        let fee_cost = exec_price * instruction.quantity * self.fee_bps / 10_000.0;

        TxResult {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: instruction.quantity,
            avg_exec_price: Some(exec_price),
            slippage_bps: Some(slippage_bps),
            fee_cost: Some(fee_cost),
            leverage: Some(instruction.leverage),
            status: TxStatus::Filled,
            reason: None,
            meta: HashMap::new(),
        }
    }
}

#[async_trait]
impl ExecutionGateway for PaperExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        snapshot: Option<&MarketSnapshot>,
    ) -> Vec<TxResult> {
        let empty = MarketSnapshot::new();
        let snapshot = snapshot.unwrap_or(&empty);

        instructions
            .iter()
            .map(|instruction| {
                match Self::reference_price(snapshot, &instruction.instrument.symbol) {
                    Some(price) if price > 0.0 => self.fill(instruction, price),
                    _ => TxResult::rejected(
                        instruction.instruction_id.clone(),
                        instruction.instrument.clone(),
                        instruction.side,
                        instruction.quantity,
                        "no_price",
                    ),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstrumentRef, PriceMode, PriceSnapshot, SymbolSnapshot};

    fn instruction(symbol: &str, side: TradeSide, qty: f64) -> TradeInstruction {
        TradeInstruction {
            instruction_id: "c1:sym:0".into(),
            compose_id: "c1".into(),
            instrument: InstrumentRef::new(symbol),
            side,
            quantity: qty,
            leverage: 1.0,
            price_mode: PriceMode::Market,
            limit_price: None,
            max_slippage_bps: Some(10.0),
            meta: HashMap::new(),
        }
    }

    fn snapshot_with(symbol: &str, last: f64) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert(
            symbol.to_string(),
            SymbolSnapshot {
                price: Some(PriceSnapshot { last: Some(last), ..Default::default() }),
                open_interest: None,
                funding_rate: None,
            },
        );
        snapshot
    }

    #[tokio::test]
    async fn fills_buy_above_reference_price_by_slippage() {
        let gateway = PaperExecutionGateway::new(10.0);
        let snapshot = snapshot_with("BTC-USDT", 50_000.0);
        let results = gateway
            .execute(&[instruction("BTC-USDT", TradeSide::Buy, 0.1)], Some(&snapshot))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TxStatus::Filled);
        assert!(results[0].avg_exec_price.unwrap() > 50_000.0);
        assert!((results[0].filled_qty - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_when_no_price_available() {
        let gateway = PaperExecutionGateway::new(10.0);
        let results = gateway
            .execute(&[instruction("BTC-USDT", TradeSide::Buy, 0.1)], None)
            .await;
        assert_eq!(results[0].status, TxStatus::Rejected);
        assert_eq!(results[0].reason.as_deref(), Some("no_price"));
    }

    #[tokio::test]
    async fn sell_fills_below_reference_price_by_slippage() {
        let gateway = PaperExecutionGateway::new(0.0);
        let snapshot = snapshot_with("BTC-USDT", 50_000.0);
        let results = gateway
            .execute(&[instruction("BTC-USDT", TradeSide::Sell, 0.1)], Some(&snapshot))
            .await;
        assert!(results[0].avg_exec_price.unwrap() < 50_000.0);
        assert_eq!(results[0].fee_cost, Some(0.0));
    }
}
