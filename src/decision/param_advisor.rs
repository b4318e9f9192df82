use super::llm::LlmClient;
use crate::model::ComposeContext;
use serde::Deserialize;
use std::sync::Arc;

/// Advised grid parameters. All fields but the three base ones are
/// optional — an advisor that only wants to nudge `step_pct` doesn't also
/// have to invent a zone.
#[derive(Debug, Clone, Deserialize)]
pub struct GridParamAdvice {
    pub grid_step_pct: f64,
    pub grid_max_steps: u32,
    pub grid_base_fraction: f64,
    #[serde(default)]
    pub grid_lower_pct: Option<f64>,
    #[serde(default)]
    pub grid_upper_pct: Option<f64>,
    #[serde(default)]
    pub grid_count: Option<u32>,
    #[serde(default)]
    pub advisor_rationale: Option<String>,
}

/// Previously applied parameters, passed back to the advisor so it anchors
/// suggestions to the current regime instead of re-deriving from scratch
/// every refresh.
#[derive(Debug, Clone, Default)]
pub struct PrevGridParams {
    pub step_pct: f64,
    pub max_steps: u32,
    pub base_fraction: f64,
    pub grid_lower_pct: Option<f64>,
    pub grid_upper_pct: Option<f64>,
    pub grid_count: Option<u32>,
}

const SYSTEM_PROMPT: &str = "You are a grid parameter advisor. \
Given the current market snapshot metrics and runtime settings, propose grid parameters dynamically. \
Use higher sensitivity (smaller step_pct, larger max_steps) for high-liquidity, high-volatility pairs; lower sensitivity otherwise. \
Respect typical ranges: step_pct 0.0005-0.01, max_steps 1-5, base_fraction 0.03-0.10. \
Optionally include grid zone bounds (grid_lower_pct, grid_upper_pct) and grid_count when appropriate. \
Calibrate base_fraction and optional grid_count using portfolio context: equity, buying_power, free_cash, and constraints.max_leverage. \
Prefer smaller base_fraction and fewer steps when capital is tight. Anchor to previous_params when provided; prefer gradual adjustments. \
Respond with pure JSON: {\"grid_step_pct\": number, \"grid_max_steps\": integer, \"grid_base_fraction\": number, \"grid_lower_pct\": number?, \"grid_upper_pct\": number?, \"grid_count\": integer?, \"advisor_rationale\": str?}.";

/// Wraps an `LlmClient` to produce `GridParamAdvice`, a narrower contract
/// than a full trading plan: the advisor reasons about grid *shape*, never
/// about direction or size of an individual order.
pub struct GridParamAdvisor {
    llm: Arc<dyn LlmClient>,
}

impl GridParamAdvisor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn advise(
        &self,
        context: &ComposeContext,
        symbols: &[String],
        prev: &PrevGridParams,
        cap_factor: f64,
        max_leverage: f64,
    ) -> Option<GridParamAdvice> {
        let mut metrics = serde_json::Map::new();
        for fv in &context.features {
            if !fv.is_market_snapshot() || !symbols.contains(&fv.instrument.symbol) {
                continue;
            }
            let mut snap = serde_json::Map::new();
            for key in ["price.last", "price.change_pct", "price.volume", "open_interest", "funding.rate"] {
                if let Some(v) = fv.value(key) {
                    snap.insert(key.to_string(), serde_json::json!(v));
                }
            }
            metrics.insert(fv.instrument.symbol.clone(), serde_json::Value::Object(snap));
        }

        let equity = context.portfolio.total_value.unwrap_or(context.portfolio.free_cash);
        let payload = serde_json::json!({
            "symbols": symbols,
            "snapshot_metrics": metrics,
            "previous_params": {
                "grid_step_pct": prev.step_pct,
                "grid_max_steps": prev.max_steps,
                "grid_base_fraction": prev.base_fraction,
                "grid_lower_pct": prev.grid_lower_pct,
                "grid_upper_pct": prev.grid_upper_pct,
                "grid_count": prev.grid_count,
            },
            "portfolio": {
                "equity": equity,
                "buying_power": context.portfolio.buying_power,
                "free_cash": context.portfolio.free_cash,
                "max_leverage": max_leverage,
                "cap_factor": cap_factor,
            },
        });

        let prompt = format!(
            "{SYSTEM_PROMPT}\n\nReturn JSON only. Context:\n{}",
            serde_json::to_string(&payload).unwrap_or_default()
        );

        match self.llm.invoke_raw(&prompt).await {
            Ok(content) => match serde_json::from_str::<GridParamAdvice>(&content) {
                Ok(advice) => Some(advice),
                Err(err) => {
                    tracing::warn!(error = %err, "grid param advice failed validation");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "grid param advisor LLM call failed");
                None
            }
        }
    }
}
