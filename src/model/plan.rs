use super::instrument::InstrumentRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Noop,
}

impl PlanAction {
    /// Sign applied to `target_qty` when resolving an OPEN action's signed
    /// target position (open_long -> positive, open_short -> negative).
    /// CLOSE_* actions don't resolve through this sign: `target_qty` there
    /// is a reduce magnitude bounded by the current position, handled
    /// separately in the normalizer so a partial close can never flip the
    /// position through zero. NOOP has no sign (target stays at current
    /// quantity).
    pub fn sign(&self) -> f64 {
        match self {
            PlanAction::OpenLong | PlanAction::CloseShort => 1.0,
            PlanAction::OpenShort | PlanAction::CloseLong => -1.0,
            PlanAction::Noop => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub instrument: InstrumentRef,
    pub action: PlanAction,
    /// Magnitude, always >= 0; never a signed target.
    pub target_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanProposal {
    pub ts: i64,
    pub items: Vec<PlanItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl PlanProposal {
    pub fn empty(ts: i64) -> Self {
        Self {
            ts,
            items: Vec::new(),
            rationale: None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.items.iter().any(|i| i.action != PlanAction::Noop)
    }
}
