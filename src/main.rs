//! Entry point for the strategy runtime demo binary: loads one or more
//! `UserRequest`s, wires each into a `DecisionCoordinator` + `StreamController`,
//! and runs them concurrently until Ctrl+C.

mod binance;
mod config;
mod decision;
mod error;
mod execution;
mod features;
mod market_data;
mod model;
mod persistence;
mod portfolio;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceClient;
use crate::config::{TradingMode, UserRequest};
use crate::decision::{
    Composer, GridComposer, GridParamAdvisor, HttpLlmClient, LlmClient, NormalizerConfig,
    PromptComposer,
};
use crate::execution::{ExecutionGateway, LiveExecutionGateway, PaperExecutionGateway};
use crate::features::{DefaultFeatureComputer, FeatureComputer};
use crate::market_data::{BinanceMarketDataSource, MarketDataSource};
use crate::model::{CandleConfig, Constraints};
use crate::persistence::{FileStrategyRepository, StrategyRepository};
use crate::portfolio::{FilePortfolioSnapshotStore, InMemoryPortfolioService, PortfolioService};
use crate::runtime::{DecisionCoordinator, StreamController, SystemClock};

fn strategies_config_path() -> PathBuf {
    std::env::var("STRATEGIES_CONFIG")
        .unwrap_or_else(|_| "strategies.json".to_string())
        .into()
}

fn data_dir() -> PathBuf {
    std::env::var("STRATEGY_DATA_DIR")
        .unwrap_or_else(|_| "./data".to_string())
        .into()
}

fn load_requests(path: &PathBuf) -> anyhow::Result<Vec<UserRequest>> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let requests: Vec<UserRequest> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    requests.into_iter().map(|r| Ok(r.validate()?)).collect()
}

fn build_composer(strategy_id: &str, request: &UserRequest, normalizer_config: NormalizerConfig) -> Box<dyn Composer> {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::openrouter(
        request.llm_model_config.api_key.clone().unwrap_or_default(),
        request.llm_model_config.model_id.clone(),
    ));

    let is_grid = request.trading_config.template_id.as_deref() == Some("grid");
    if is_grid {
        let advisor = Some(Arc::new(GridParamAdvisor::new(llm)));
        info!(strategy_id, "using grid composer");
        Box::new(GridComposer::new(
            request.trading_config.symbols.clone(),
            request.is_spot(),
            request.trading_config.max_leverage,
            normalizer_config,
            advisor,
        ))
    } else {
        info!(strategy_id, "using prompt composer");
        Box::new(PromptComposer::new(llm, request.resolved_prompt(), normalizer_config))
    }
}

fn build_execution_gateway(request: &UserRequest) -> Arc<dyn ExecutionGateway> {
    let fee_bps = request.exchange_config.fee_bps;
    match request.exchange_config.trading_mode {
        TradingMode::Virtual => Arc::new(PaperExecutionGateway::new(fee_bps)),
        TradingMode::Live => {
            let api_key = request.exchange_config.api_key.clone().unwrap_or_default();
            let secret_key = request.exchange_config.secret_key.clone().unwrap_or_default();
            let client = BinanceClient::new(api_key, secret_key);
            let margin_type = match request.exchange_config.margin_mode {
                config::MarginMode::Isolated => "ISOLATED",
                config::MarginMode::Cross => "CROSSED",
            };
            Arc::new(LiveExecutionGateway::new(
                client,
                request.is_spot(),
                request.trading_config.max_leverage.max(1.0) as u32,
                margin_type,
                fee_bps,
            ))
        }
    }
}

async fn spawn_strategy(
    strategy_id: String,
    request: UserRequest,
    base_dir: PathBuf,
    cancellation: CancellationToken,
) {
    let constraints = Constraints {
        max_positions: Some(request.trading_config.max_positions),
        max_leverage: Some(request.trading_config.max_leverage),
        ..Constraints::default()
    };
    let normalizer_config = NormalizerConfig {
        is_spot: request.is_spot(),
        max_leverage: request.trading_config.max_leverage,
        cap_factor: request.trading_config.cap_factor,
        ..NormalizerConfig::default()
    };

    let repository: Arc<dyn StrategyRepository> = Arc::new(FileStrategyRepository::new(&base_dir));
    let snapshot_store = Arc::new(FilePortfolioSnapshotStore::new(base_dir.join("snapshots")));
    let portfolio: Arc<dyn PortfolioService> = Arc::new(InMemoryPortfolioService::new(
        &strategy_id,
        request.trading_config.initial_capital,
        request.is_spot(),
        request.trading_config.max_leverage,
        constraints.clone(),
    ));
    let market_data: Arc<dyn MarketDataSource> = Arc::new(BinanceMarketDataSource::new());
    let feature_computer: Arc<dyn FeatureComputer> = Arc::new(DefaultFeatureComputer::new());
    let execution = build_execution_gateway(&request);
    let composer = build_composer(&strategy_id, &request, normalizer_config);
    let is_live = request.exchange_config.trading_mode == TradingMode::Live;

    if let Err(e) = repository.ensure_strategy(
        &strategy_id,
        request.trading_config.strategy_name.as_deref().unwrap_or(&strategy_id),
        &serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
        "waiting_running",
        chrono::Utc::now().timestamp_millis(),
    ) {
        error!(strategy_id = %strategy_id, error = %e, "failed to register strategy; aborting");
        return;
    }
    if let Err(e) = repository.set_status(&strategy_id, "running") {
        warn!(strategy_id = %strategy_id, error = %e, "failed to set initial running status");
    }

    let coordinator = DecisionCoordinator::new(
        strategy_id.clone(),
        request.trading_config.symbols.clone(),
        CandleConfig::defaults(),
        constraints,
        market_data,
        feature_computer,
        composer,
        execution,
        portfolio.clone(),
        repository.clone(),
        Arc::new(SystemClock),
    );

    let controller = StreamController::new(
        strategy_id.clone(),
        coordinator,
        repository,
        snapshot_store,
        portfolio,
        Duration::from_secs(request.trading_config.decide_interval_sec.max(1)),
        is_live,
        cancellation,
        None,
    );

    info!(strategy_id = %strategy_id, "strategy task starting");
    controller.run().await;
    info!(strategy_id = %strategy_id, "strategy task finished");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("strategy runtime starting");

    let config_path = strategies_config_path();
    let requests = match load_requests(&config_path) {
        Ok(requests) => requests,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load strategy config");
            return Err(e);
        }
    };
    if requests.is_empty() {
        anyhow::bail!("no strategies configured in {}", config_path.display());
    }

    let base_dir = data_dir();
    std::fs::create_dir_all(&base_dir)?;

    let cancellation = CancellationToken::new();
    let mut handles = Vec::with_capacity(requests.len());
    for (idx, request) in requests.into_iter().enumerate() {
        let strategy_id = request
            .trading_config
            .strategy_name
            .clone()
            .unwrap_or_else(|| format!("strategy-{idx}"));
        let market_type = request.exchange_config.market_type;
        info!(strategy_id = %strategy_id, symbols = ?request.trading_config.symbols, market_type = ?market_type, "configured strategy");

        let token = cancellation.clone();
        let dir = base_dir.clone();
        handles.push(tokio::spawn(spawn_strategy(strategy_id, request, dir, token)));
    }

    info!(count = handles.len(), "all strategies running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; cancelling strategy loops");
    cancellation.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "strategy task panicked");
        }
    }

    info!("strategy runtime shut down complete");
    Ok(())
}
