use super::instruction::TradeSide;
use super::instrument::InstrumentRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Filled,
    Partial,
    Rejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub instruction_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    pub requested_qty: f64,
    pub filled_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_exec_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage_bps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl TxResult {
    pub fn rejected(
        instruction_id: impl Into<String>,
        instrument: InstrumentRef,
        side: TradeSide,
        requested_qty: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            instrument,
            side,
            requested_qty,
            filled_qty: 0.0,
            avg_exec_price: None,
            slippage_bps: None,
            fee_cost: None,
            leverage: None,
            status: TxStatus::Rejected,
            reason: Some(reason.into()),
            meta: HashMap::new(),
        }
    }

    pub fn error(
        instruction_id: impl Into<String>,
        instrument: InstrumentRef,
        side: TradeSide,
        requested_qty: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status: TxStatus::Error,
            ..Self::rejected(instruction_id, instrument, side, requested_qty, reason)
        }
    }
}
