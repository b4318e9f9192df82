use crate::model::PlanProposal;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Planner boundary the Prompt Composer calls through. Implementations own
/// the model SDK/provider details; the composer only ever sees a
/// `PlanProposal` or an error it folds into the cycle's rationale.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<PlanProposal>;

    /// Lower-level call returning the model's raw text, used by callers
    /// that need a shape other than `PlanProposal` (e.g. the grid
    /// parameter advisor). Default system prompt, same transport.
    async fn invoke_raw(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Fixed system prompt enforcing the output contract every composer relies
/// on: actions restricted to the five `PlanAction` variants, magnitudes
/// never signed, no direct flips (the caller splits those), and spot
/// accounts confined to the long side.
const SYSTEM_PROMPT: &str = "You are a disciplined trading plan generator. \
Read the provided context and decide. features.1m values are structural trends over 240 periods; \
features.1s values are near-real-time moves; market snapshot fields are the freshest price/open-interest/funding reads available. \
Respond with pure JSON matching: {\"items\": [{\"symbol\": str, \"action\": \"open_long\"|\"open_short\"|\"close_long\"|\"close_short\"|\"noop\", \"target_qty\": number >= 0, \"leverage\": number?, \"confidence\": number?, \"rationale\": str?}], \"rationale\": str}. \
target_qty is always a non-negative magnitude, never a signed delta. Emit at most one item per symbol. \
On a spot account only open_long and close_long are valid; never propose open_short or close_short. \
Never propose flipping a position directly from long to short or vice versa in one item — close it first and let a later cycle open the other side.";

/// Wire shape the system prompt asks the model to return. Kept separate
/// from `PlanItem`/`PlanProposal` so a model that omits `symbol` or sends a
/// malformed action fails to deserialize cleanly rather than silently
/// defaulting.
#[derive(Debug, Deserialize)]
struct RawPlanItem {
    symbol: String,
    action: String,
    target_qty: f64,
    #[serde(default)]
    leverage: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlanProposal {
    #[serde(default)]
    items: Vec<RawPlanItem>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Parses a model's raw text response into a `PlanProposal`, tolerating a
/// fenced ```json code block (the common way chat models wrap JSON output)
/// around the object.
pub fn parse_plan_response(ts: i64, content: &str) -> anyhow::Result<PlanProposal> {
    let trimmed = strip_code_fence(content.trim());
    let raw: RawPlanProposal = serde_json::from_str(trimmed)?;

    let mut items = Vec::with_capacity(raw.items.len());
    for item in raw.items {
        let action = match item.action.as_str() {
            "open_long" => crate::model::PlanAction::OpenLong,
            "open_short" => crate::model::PlanAction::OpenShort,
            "close_long" => crate::model::PlanAction::CloseLong,
            "close_short" => crate::model::PlanAction::CloseShort,
            "noop" => crate::model::PlanAction::Noop,
            other => anyhow::bail!("unknown plan action '{other}'"),
        };
        if item.target_qty < 0.0 {
            anyhow::bail!("target_qty must be non-negative, got {}", item.target_qty);
        }
        items.push(crate::model::PlanItem {
            instrument: crate::model::InstrumentRef::new(item.symbol),
            action,
            target_qty: item.target_qty,
            leverage: item.leverage,
            confidence: item.confidence,
            rationale: item.rationale,
        });
    }

    Ok(PlanProposal {
        ts,
        items,
        rationale: raw.rationale,
    })
}

fn strip_code_fence(s: &str) -> &str {
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Reference `LlmClient` talking to an OpenAI-compatible chat-completions
/// endpoint (OpenRouter by default), the same family of provider the
/// grounding source's model factory resolves by name. JSON mode is
/// requested so the response body is the bare object `parse_plan_response`
/// expects, with no prose wrapped around it.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_id: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model_id: model_id.into(),
        }
    }

    pub fn openrouter(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self::new("https://openrouter.ai/api/v1", api_key, model_id)
    }
}

impl HttpLlmClient {
    async fn chat(&self, system_prompt: &str, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model_id,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": prompt},
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM request failed: {e}"))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse LLM response: {e}"))?;

        if !status.is_success() {
            anyhow::bail!("LLM endpoint returned {}: {}", status, payload);
        }

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("LLM response missing choices[0].message.content"))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<PlanProposal> {
        let content = self.chat(SYSTEM_PROMPT, prompt).await?;
        let ts = chrono::Utc::now().timestamp_millis();
        parse_plan_response(ts, &content)
    }

    async fn invoke_raw(&self, prompt: &str) -> anyhow::Result<String> {
        self.chat(SYSTEM_PROMPT, prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_plan_json() {
        let body = r#"{"items": [{"symbol": "BTC-USDT", "action": "open_long", "target_qty": 0.01}], "rationale": "momentum up"}"#;
        let plan = parse_plan_response(0, body).unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].action, crate::model::PlanAction::OpenLong);
        assert_eq!(plan.rationale.as_deref(), Some("momentum up"));
    }

    #[test]
    fn strips_fenced_code_block() {
        let body = "```json\n{\"items\": [], \"rationale\": \"noop\"}\n```";
        let plan = parse_plan_response(0, body).unwrap();
        assert!(plan.items.is_empty());
    }

    #[test]
    fn rejects_negative_target_qty() {
        let body = r#"{"items": [{"symbol": "BTC-USDT", "action": "open_long", "target_qty": -1.0}]}"#;
        assert!(parse_plan_response(0, body).is_err());
    }

    #[test]
    fn rejects_unknown_action() {
        let body = r#"{"items": [{"symbol": "BTC-USDT", "action": "yolo", "target_qty": 1.0}]}"#;
        assert!(parse_plan_response(0, body).is_err());
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(parse_plan_response(0, "not json at all").is_err());
    }
}
