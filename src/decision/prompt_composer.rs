use super::composer::Composer;
use super::llm::LlmClient;
use super::normalizer::{normalize_plan, NormalizerConfig};
use crate::model::{ComposeContext, ComposeResult, QUANTITY_PRECISION};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Builds the LLM prompt from a cycle's `ComposeContext`, invokes the
/// planner, and feeds whatever it returns through the shared normalizer.
/// A failed invocation or an LLM response that doesn't parse never
/// propagates — it becomes an empty plan whose rationale echoes the
/// failure, exactly as a cycle with no actionable ideas would.
pub struct PromptComposer {
    llm: Arc<dyn LlmClient>,
    strategy_prompt: String,
    normalizer_config: NormalizerConfig,
}

impl PromptComposer {
    pub fn new(llm: Arc<dyn LlmClient>, strategy_prompt: impl Into<String>, normalizer_config: NormalizerConfig) -> Self {
        Self {
            llm,
            strategy_prompt: strategy_prompt.into(),
            normalizer_config,
        }
    }

    fn build_summary(context: &ComposeContext) -> Value {
        let mut summary = Map::new();
        summary.insert(
            "active_positions".into(),
            json!(context.portfolio.active_position_count()),
        );
        insert_opt(&mut summary, "total_value", context.portfolio.total_value);
        insert_opt(&mut summary, "free_cash_or_balance", Some(context.portfolio.free_cash));
        insert_opt(&mut summary, "unrealized_pnl", context.portfolio.total_unrealized_pnl);
        insert_opt(&mut summary, "buying_power", context.portfolio.buying_power);
        Value::Object(summary)
    }

    /// Groups feature vectors by `meta.group_by` (falling back to
    /// `meta.interval`, then `"other"`), matching the distilled source's
    /// `features` payload shape so the model can read `features.1m` /
    /// `features.market_snapshot` directly.
    fn build_features(context: &ComposeContext) -> Value {
        let mut grouped: Map<String, Value> = Map::new();
        for fv in &context.features {
            let key = if fv.is_market_snapshot() {
                "market_snapshot".to_string()
            } else {
                fv.interval().unwrap_or("other").to_string()
            };
            let entry = grouped.entry(key).or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = entry {
                let mut values = Map::new();
                for (k, v) in &fv.values {
                    values.insert(k.clone(), json!(v));
                }
                arr.push(json!({
                    "symbol": fv.instrument.symbol,
                    "values": values,
                }));
            }
        }
        Value::Object(grouped)
    }

    fn build_positions(context: &ComposeContext) -> Value {
        let mut positions = Map::new();
        for (symbol, pos) in &context.portfolio.positions {
            if pos.is_flat() {
                continue;
            }
            positions.insert(
                symbol.clone(),
                json!({
                    "quantity": pos.quantity,
                    "avg_price": pos.avg_price,
                    "unrealized_pnl": pos.unrealized_pnl,
                    "leverage": pos.leverage,
                }),
            );
        }
        Value::Object(positions)
    }

    fn build_constraints(context: &ComposeContext) -> Value {
        serde_json::to_value(&context.constraints).unwrap_or(Value::Null)
    }

    /// Assembles the JSON payload the system prompt describes, with null
    /// and empty-object/array fields pruned so the model isn't shown noise
    /// it has to reason past.
    fn build_payload(&self, context: &ComposeContext) -> Value {
        let mut payload = Map::new();
        payload.insert("strategy_prompt".into(), json!(self.strategy_prompt));
        payload.insert("summary".into(), Self::build_summary(context));
        if let Some(snapshot) = &context.market_snapshot {
            payload.insert("market".into(), json!(snapshot));
        }
        payload.insert("features".into(), Self::build_features(context));
        payload.insert("positions".into(), Self::build_positions(context));
        payload.insert("constraints".into(), Self::build_constraints(context));
        if !context.digest.is_empty() {
            payload.insert("digest".into(), json!(context.digest));
        }

        let mut pruned = Value::Object(payload);
        prune_none(&mut pruned);
        pruned
    }
}

/// Recursively drops null values and empty objects/arrays, mirroring the
/// grounding source's `_prune_none` helper.
fn prune_none(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if let Some(v) = map.get_mut(&key) {
                    prune_none(v);
                    let drop = matches!(v, Value::Null)
                        || matches!(v, Value::Object(m) if m.is_empty())
                        || matches!(v, Value::Array(a) if a.is_empty());
                    if drop {
                        map.remove(&key);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                prune_none(v);
            }
        }
        _ => {}
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        map.insert(key.to_string(), json!(v));
    }
}

#[async_trait]
impl Composer for PromptComposer {
    async fn compose(&mut self, context: &ComposeContext) -> ComposeResult {
        let payload = self.build_payload(context);
        let prompt = format!(
            "{}\n\nContext:\n{}",
            "Read Context and decide per the system instructions. Output JSON only.",
            serde_json::to_string(&payload).unwrap_or_default()
        );

        let plan = match self.llm.invoke(&prompt).await {
            Ok(plan) => plan,
            Err(err) => {
                return ComposeResult::empty(format!(
                    "LLM invocation failed: {err}"
                ));
            }
        };

        if plan.items.iter().any(|i| i.target_qty < 0.0) {
            return ComposeResult::empty(format!(
                "LLM output failed validation: negative target_qty present. Raw plan: {plan:?}"
            ));
        }

        if !plan.is_actionable() {
            let rationale = plan
                .rationale
                .unwrap_or_else(|| "LLM returned no actionable items".to_string());
            return ComposeResult::empty(rationale);
        }

        let instructions = normalize_plan(context, &plan, &self.normalizer_config);
        let rationale = plan.rationale.unwrap_or_else(|| "LLM plan normalized".to_string());
        ComposeResult { instructions, rationale }
    }
}
