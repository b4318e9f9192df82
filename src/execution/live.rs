use super::ExecutionGateway;
use crate::binance::BinanceClient;
use crate::model::{MarketSnapshot, TradeInstruction, TradeSide, TxResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Minimum base-asset quantity and notional Binance spot typically enforces
/// for majors; a real deployment would read these from `exchangeInfo`, but
/// a conservative local floor keeps obviously-too-small orders from ever
/// reaching the network.
const MIN_QTY_FLOOR: f64 = 1e-6;
const MIN_NOTIONAL_FLOOR: f64 = 5.0;

/// Margin buffer applied on top of the raw `qty * price / leverage`
/// requirement before a derivatives open is allowed through.
const MARGIN_SAFETY_FACTOR: f64 = 1.02;
const QUOTE_ASSET: &str = "USDT";

/// How long to wait before polling a freshly submitted market order for
/// its fill status.
const FILL_POLL_DELAY: Duration = Duration::from_millis(400);

/// Adapts normalized `TradeInstruction`s onto the signed Binance REST
/// surface. Generalizes the teacher's raw HMAC client into the fuller
/// exchange-adapter contract this runtime needs: leverage/margin mode are
/// set once per symbol and cached, `reduceOnly` is dispatched from the
/// normalizer's per-instruction hint, and one-way mode means no
/// `positionSide` is ever sent. No network error is allowed to escape
/// `execute` — everything below a transport failure folds into `TxResult`.
pub struct LiveExecutionGateway {
    client: BinanceClient,
    is_spot: bool,
    leverage: u32,
    margin_type: String,
    fee_bps: f64,
    prepared_symbols: Mutex<HashSet<String>>,
}

impl LiveExecutionGateway {
    pub fn new(
        client: BinanceClient,
        is_spot: bool,
        leverage: u32,
        margin_type: impl Into<String>,
        fee_bps: f64,
    ) -> Self {
        Self {
            client,
            is_spot,
            leverage,
            margin_type: margin_type.into(),
            fee_bps,
            prepared_symbols: Mutex::new(HashSet::new()),
        }
    }

    fn normalize_symbol(symbol: &str) -> String {
        symbol.replace('-', "").replace('_', "").to_uppercase()
    }

    /// Sets leverage and margin mode for `symbol` once; subsequent calls
    /// for the same symbol are no-ops. Futures-only — spot has neither
    /// concept.
    async fn prepare_symbol(&self, symbol: &str) {
        if self.is_spot {
            return;
        }
        {
            let mut prepared = self.prepared_symbols.lock();
            if !prepared.insert(symbol.to_string()) {
                return;
            }
        }
        if let Err(err) = self.client.set_leverage(symbol, self.leverage).await {
            warn!(symbol, error = %err, "set_leverage failed; continuing with exchange default");
        }
        if let Err(err) = self.client.set_margin_type(symbol, &self.margin_type).await {
            warn!(symbol, error = %err, "set_margin_type failed; continuing with exchange default");
        }
    }

    fn required_margin(quantity: f64, price: f64, leverage: f64) -> f64 {
        quantity * price / leverage.max(1.0) * MARGIN_SAFETY_FACTOR
    }

    fn precheck(instruction: &TradeInstruction, ref_price: Option<f64>) -> Result<(), &'static str> {
        if instruction.quantity < MIN_QTY_FLOOR {
            return Err("quantity_below_minimum");
        }
        if let Some(price) = ref_price {
            if price > 0.0 && instruction.quantity * price < MIN_NOTIONAL_FLOOR {
                return Err("notional_below_minimum");
            }
        }
        Ok(())
    }

    fn reduce_only(instruction: &TradeInstruction) -> Option<bool> {
        instruction.meta.get("reduce_only").and_then(|v| v.as_bool())
    }

    /// Derivatives opens only: rejects with `insufficient_margin` when the
    /// free quote balance can't cover `qty * price / leverage` plus a 2%
    /// buffer. Closes (`reduce_only`) free margin rather than consume it,
    /// so they skip this check entirely.
    async fn check_margin(&self, instruction: &TradeInstruction, ref_price: Option<f64>) -> Result<(), &'static str> {
        if self.is_spot || Self::reduce_only(instruction) == Some(true) {
            return Ok(());
        }
        let price = match ref_price {
            Some(p) if p > 0.0 => p,
            _ => return Ok(()),
        };
        let required_margin = Self::required_margin(instruction.quantity, price, instruction.leverage);

        let free = match self.client.get_balance(QUOTE_ASSET).await {
            Ok(free) => free,
            Err(err) => {
                warn!(symbol = %instruction.instrument.symbol, error = %err, "balance lookup failed; skipping margin precheck");
                return Ok(());
            }
        };
        if free < required_margin {
            return Err("insufficient_margin");
        }
        Ok(())
    }

    fn reference_price(snapshot: Option<&MarketSnapshot>, symbol: &str) -> Option<f64> {
        snapshot
            .and_then(|s| s.get(symbol))
            .and_then(|s| s.price.as_ref())
            .and_then(|p| p.last.or(p.open))
    }

    async fn submit(&self, instruction: &TradeInstruction, ref_price: Option<f64>) -> TxResult {
        let symbol = Self::normalize_symbol(&instruction.instrument.symbol);
        self.prepare_symbol(&symbol).await;

        let side = match instruction.side {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        };
        let reduce_only = if self.is_spot { None } else { Self::reduce_only(instruction) };
        let client_order_id = instruction.instruction_id.replace([':', '-'], "_");

        let placed = self
            .client
            .place_order(
                &symbol,
                side,
                "MARKET",
                instruction.quantity,
                None,
                None,
                Some(&client_order_id),
                reduce_only,
                None,
            )
            .await;

        let order = match placed {
            Ok(order) => order,
            Err(err) => {
                return TxResult::error(
                    instruction.instruction_id.clone(),
                    instruction.instrument.clone(),
                    instruction.side,
                    instruction.quantity,
                    err.to_string(),
                );
            }
        };

        let order_id = order["orderId"].as_u64();
        tokio::time::sleep(FILL_POLL_DELAY).await;

        let polled = match order_id {
            Some(id) => self.client.fetch_order(&symbol, id).await.ok(),
            None => None,
        };
        let final_order = polled.unwrap_or(order);

        Self::result_from_order(instruction, ref_price, &final_order, self.fee_bps)
    }

    fn result_from_order(
        instruction: &TradeInstruction,
        ref_price: Option<f64>,
        order: &serde_json::Value,
        fee_bps: f64,
    ) -> TxResult {
        let status = order["status"].as_str().unwrap_or("");
        let executed_qty: f64 = order["executedQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| order["executedQty"].as_f64())
            .unwrap_or(0.0);
        let cumm_quote: f64 = order["cummulativeQuoteQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| order["cummulativeQuoteQty"].as_f64())
            .unwrap_or(0.0);

        let avg_price = if executed_qty > 0.0 {
            Some(cumm_quote / executed_qty)
        } else {
            ref_price
        };

        let tx_status = match status {
            "FILLED" if executed_qty > 0.0 => crate::model::TxStatus::Filled,
            "PARTIALLY_FILLED" => crate::model::TxStatus::Partial,
            "CANCELED" | "EXPIRED" | "REJECTED" => crate::model::TxStatus::Rejected,
            _ if executed_qty >= instruction.quantity - 1e-9 && executed_qty > 0.0 => {
                crate::model::TxStatus::Filled
            }
            _ if executed_qty > 0.0 => crate::model::TxStatus::Partial,
            _ => crate::model::TxStatus::Error,
        };

        let fee_cost = avg_price.map(|p| p * executed_qty * fee_bps / 10_000.0);

        TxResult {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: executed_qty,
            avg_exec_price: avg_price,
            slippage_bps: None,
            fee_cost,
            leverage: Some(instruction.leverage),
            status: tx_status,
            reason: (!matches!(tx_status, crate::model::TxStatus::Filled)).then(|| status.to_string()),
            meta: std::collections::HashMap::new(),
        }
    }
}

#[async_trait]
impl ExecutionGateway for LiveExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        snapshot: Option<&MarketSnapshot>,
    ) -> Vec<TxResult> {
        let mut results = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let ref_price = Self::reference_price(snapshot, &instruction.instrument.symbol);
            if let Err(reason) = Self::precheck(instruction, ref_price) {
                results.push(TxResult::rejected(
                    instruction.instruction_id.clone(),
                    instruction.instrument.clone(),
                    instruction.side,
                    instruction.quantity,
                    reason,
                ));
                continue;
            }
            if let Err(reason) = self.check_margin(instruction, ref_price).await {
                results.push(TxResult::rejected(
                    instruction.instruction_id.clone(),
                    instruction.instrument.clone(),
                    instruction.side,
                    instruction.quantity,
                    reason,
                ));
                continue;
            }
            results.push(self.submit(instruction, ref_price).await);
        }
        results
    }
}
