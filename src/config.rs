//! The user-specified strategy request. Deserialized at the edge of the
//! runtime; every optional field carries a named default function so that
//! older or partial JSON documents deserialize without error — the same
//! forward-compatibility discipline the rest of this codebase applies to
//! its persisted configuration.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;
pub const DEFAULT_MODEL_PROVIDER: &str = "openrouter";
pub const DEFAULT_AGENT_MODEL: &str = "deepseek/deepseek-chat";
pub const DEFAULT_MAX_POSITIONS: u32 = 5;
pub const DEFAULT_MAX_SYMBOLS: usize = 5;
pub const DEFAULT_MAX_LEVERAGE: f64 = 10.0;
pub const DEFAULT_CAP_FACTOR: f64 = 1.5;
pub const DEFAULT_FEE_BPS: f64 = 10.0;
pub const DEFAULT_DECIDE_INTERVAL_SEC: u64 = 60;

fn default_provider() -> String {
    DEFAULT_MODEL_PROVIDER.to_string()
}
fn default_model_id() -> String {
    DEFAULT_AGENT_MODEL.to_string()
}
fn default_initial_capital() -> f64 {
    DEFAULT_INITIAL_CAPITAL
}
fn default_max_leverage() -> f64 {
    DEFAULT_MAX_LEVERAGE
}
fn default_max_positions() -> u32 {
    DEFAULT_MAX_POSITIONS
}
fn default_decide_interval() -> u64 {
    DEFAULT_DECIDE_INTERVAL_SEC
}
fn default_cap_factor() -> f64 {
    DEFAULT_CAP_FACTOR
}
fn default_fee_bps() -> f64 {
    DEFAULT_FEE_BPS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Virtual,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::Virtual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Future,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl Default for MarginMode {
    fn default() -> Self {
        MarginMode::Cross
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for LlmModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub exchange_id: Option<String>,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    /// Absent at the wire layer until `UserRequest::validate` infers it.
    #[serde(default)]
    pub market_type: Option<MarketType>,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            exchange_id: None,
            trading_mode: TradingMode::default(),
            api_key: None,
            secret_key: None,
            passphrase: None,
            testnet: false,
            market_type: None,
            margin_mode: MarginMode::default(),
            fee_bps: default_fee_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    pub symbols: Vec<String>,
    #[serde(default = "default_decide_interval")]
    pub decide_interval_sec: u64,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default = "default_cap_factor")]
    pub cap_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub llm_model_config: LlmModelConfig,
    #[serde(default)]
    pub exchange_config: ExchangeConfig,
    pub trading_config: TradingConfig,
}

impl UserRequest {
    /// Normalizes symbols, infers `market_type` when absent, and enforces
    /// the request-level invariants. Call once at runtime construction;
    /// failures are `RuntimeError::Configuration` and fail fast.
    pub fn validate(mut self) -> Result<Self> {
        if self.trading_config.symbols.is_empty() {
            return Err(RuntimeError::Configuration(
                "at least one symbol is required".into(),
            ));
        }
        if self.trading_config.symbols.len() > DEFAULT_MAX_SYMBOLS {
            return Err(RuntimeError::Configuration(format!(
                "maximum {DEFAULT_MAX_SYMBOLS} symbols allowed"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        let mut normalized = Vec::with_capacity(self.trading_config.symbols.len());
        for symbol in self.trading_config.symbols.drain(..) {
            let upper = symbol.to_uppercase();
            if seen.insert(upper.clone()) {
                normalized.push(upper);
            }
        }
        self.trading_config.symbols = normalized;

        if self.trading_config.initial_capital <= 0.0 {
            return Err(RuntimeError::Configuration(
                "initial_capital must be > 0".into(),
            ));
        }
        if self.trading_config.max_leverage <= 0.0 {
            return Err(RuntimeError::Configuration(
                "max_leverage must be > 0".into(),
            ));
        }

        if self.exchange_config.market_type.is_none() {
            let max_leverage = self.trading_config.max_leverage;
            self.exchange_config.market_type = Some(if max_leverage <= 1.0 {
                MarketType::Spot
            } else {
                MarketType::Swap
            });
        }

        if self.exchange_config.trading_mode == TradingMode::Live
            && (self.exchange_config.api_key.is_none() || self.exchange_config.secret_key.is_none())
        {
            return Err(RuntimeError::Configuration(
                "live trading requires api_key and secret_key".into(),
            ));
        }

        Ok(self)
    }

    pub fn is_spot(&self) -> bool {
        matches!(self.exchange_config.market_type, Some(MarketType::Spot))
    }

    /// `custom_prompt` and `prompt_text` concatenated with a blank line
    /// when both present; else whichever is present; else a default
    /// mentioning the configured symbols.
    pub fn resolved_prompt(&self) -> String {
        let custom = self.trading_config.custom_prompt.as_deref();
        let prompt = self.trading_config.prompt_text.as_deref();
        match (custom, prompt) {
            (Some(c), Some(p)) => format!("{p}\n\n{c}"),
            (Some(c), None) => c.to_string(),
            (None, Some(p)) => p.to_string(),
            (None, None) => format!(
                "Compose trading instructions for symbols: {}.",
                self.trading_config.symbols.join(", ")
            ),
        }
    }
}
