use super::clock::Clock;
use super::digest::build_digest;
use crate::decision::Composer;
use crate::execution::ExecutionGateway;
use crate::features::FeatureComputer;
use crate::market_data::MarketDataSource;
use crate::model::{
    CandleConfig, Constraints, DecisionCycleResult, StrategySummary, TradeHistoryEntry, TradeSide,
    TradeType, TxStatus,
};
use crate::persistence::StrategyRepository;
use crate::portfolio::PortfolioService;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const MARKET_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DIGEST_WINDOW: usize = 200;

/// Runs one strategy's decision cycle end to end: market data in,
/// `TradeInstruction`s and `TxResult`s out, portfolio and repository
/// updated in place. Owned exclusively by one strategy's Stream Controller
/// loop — cycles run strictly sequentially, so `run_once` takes `&mut
/// self` only for the boxed composer's internal state.
pub struct DecisionCoordinator {
    strategy_id: String,
    symbols: Vec<String>,
    candle_configs: Vec<CandleConfig>,
    constraints: Constraints,
    market_data: Arc<dyn MarketDataSource>,
    feature_computer: Arc<dyn FeatureComputer>,
    composer: Box<dyn Composer>,
    execution: Arc<dyn ExecutionGateway>,
    portfolio: Arc<dyn PortfolioService>,
    repository: Arc<dyn StrategyRepository>,
    clock: Arc<dyn Clock>,
    cycle_counter: AtomicU64,
}

impl DecisionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_id: impl Into<String>,
        symbols: Vec<String>,
        candle_configs: Vec<CandleConfig>,
        constraints: Constraints,
        market_data: Arc<dyn MarketDataSource>,
        feature_computer: Arc<dyn FeatureComputer>,
        composer: Box<dyn Composer>,
        execution: Arc<dyn ExecutionGateway>,
        portfolio: Arc<dyn PortfolioService>,
        repository: Arc<dyn StrategyRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbols,
            candle_configs,
            constraints,
            market_data,
            feature_computer,
            composer,
            execution,
            portfolio,
            repository,
            clock,
            cycle_counter: AtomicU64::new(0),
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Never fails: a bad cycle becomes an empty `DecisionCycleResult`
    /// whose rationale explains why, so the Stream Controller's loop never
    /// has to special-case an `Err`.
    pub async fn run_once(&mut self) -> DecisionCycleResult {
        let ts = self.clock.now_ms();
        let compose_id = uuid::Uuid::new_v4().to_string();
        let cycle_index = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut rationale_notes: Vec<String> = Vec::new();

        let (candles, snapshot) = match tokio::time::timeout(
            MARKET_FETCH_TIMEOUT,
            self.fetch_market_data(),
        )
        .await
        {
            Ok(data) => data,
            Err(_) => {
                warn!(strategy_id = %self.strategy_id, "market data fetch timed out");
                rationale_notes.push("market data fetch timed out; continuing with empty data".to_string());
                (Vec::new(), crate::model::MarketSnapshot::new())
            }
        };

        let features = self
            .feature_computer
            .compute(&candles, &snapshot, &self.candle_configs)
            .await;

        let price_map: HashMap<String, f64> = self
            .symbols
            .iter()
            .filter_map(|symbol| {
                crate::decision::resolve_price_from_features(&features, symbol)
                    .map(|price| (symbol.clone(), price))
            })
            .collect();
        self.portfolio.mark_to_market(&price_map);

        let recent_trades = match self.repository.recent_trades(&self.strategy_id, DIGEST_WINDOW) {
            Ok(trades) => trades,
            Err(e) => {
                warn!(strategy_id = %self.strategy_id, error = %e, "failed to load trade history for digest");
                rationale_notes.push(format!("trade history unavailable: {e}"));
                Vec::new()
            }
        };
        let digest = build_digest(&recent_trades);

        let portfolio_view = self.portfolio.get_view();

        let context = crate::model::ComposeContext {
            ts,
            compose_id: compose_id.clone(),
            strategy_id: self.strategy_id.clone(),
            features,
            portfolio: portfolio_view,
            digest,
            prompt_text: None,
            market_snapshot: Some(snapshot.clone()),
            constraints: self.constraints.clone(),
        };

        let mut compose_result = self.composer.compose(&context).await;
        if !rationale_notes.is_empty() {
            compose_result.rationale = format!("{}; {}", rationale_notes.join("; "), compose_result.rationale);
        }

        let tx_results = if compose_result.instructions.is_empty() {
            Vec::new()
        } else {
            self.execution
                .execute(&compose_result.instructions, Some(&snapshot))
                .await
        };

        let mut trades = tx_results_to_trades(
            &self.strategy_id,
            &compose_id,
            ts,
            &compose_result.instructions,
            &tx_results,
        );
        self.portfolio.apply_trades(&mut trades, &price_map);

        let final_view = self.portfolio.get_view();
        let strategy_summary = StrategySummary {
            strategy_id: self.strategy_id.clone(),
            ts_ms: ts,
            active_positions: final_view.active_position_count(),
            total_value: final_view.total_value,
            total_unrealized_pnl: final_view.total_unrealized_pnl,
            trade_count: trades.len(),
        };

        DecisionCycleResult {
            compose_id,
            cycle_index,
            timestamp_ms: ts,
            rationale: compose_result.rationale,
            instructions: compose_result.instructions,
            trades,
            portfolio_view: final_view,
            strategy_summary,
        }
    }

    async fn fetch_market_data(&self) -> (Vec<crate::model::Candle>, crate::model::MarketSnapshot) {
        let candle_futures = self.candle_configs.iter().map(|cfg| {
            let market_data = Arc::clone(&self.market_data);
            let symbols = self.symbols.clone();
            let interval = cfg.interval;
            let lookback = cfg.lookback;
            async move { market_data.get_recent_candles(&symbols, interval, lookback).await }
        });
        let snapshot_future = self.market_data.get_market_snapshot(&self.symbols);

        let (candle_results, snapshot) = tokio::join!(join_all(candle_futures), snapshot_future);
        let candles = candle_results.into_iter().flatten().collect();
        (candles, snapshot)
    }
}

/// Only `FILLED`/`PARTIAL` results become trades; `REJECTED`/`ERROR`
/// leave no audit row beyond the instruction itself and the rationale.
/// Whether a result closes or opens exposure is read off the originating
/// `TradeInstruction`'s `reduce_only` hint rather than the `TxResult`
/// itself — not every gateway echoes it back onto the result.
fn tx_results_to_trades(
    strategy_id: &str,
    compose_id: &str,
    ts: i64,
    instructions: &[crate::model::TradeInstruction],
    results: &[crate::model::TxResult],
) -> Vec<TradeHistoryEntry> {
    let reduce_only_by_id: HashMap<&str, bool> = instructions
        .iter()
        .map(|i| {
            (
                i.instruction_id.as_str(),
                i.meta.get("reduce_only").and_then(|v| v.as_bool()).unwrap_or(false),
            )
        })
        .collect();

    results
        .iter()
        .filter(|r| matches!(r.status, TxStatus::Filled | TxStatus::Partial))
        .filter(|r| r.filled_qty > 0.0)
        .map(|r| {
            let reduce_only = reduce_only_by_id
                .get(r.instruction_id.as_str())
                .copied()
                .unwrap_or(false);
            let exec_price = r.avg_exec_price;
            TradeHistoryEntry {
                trade_id: r.instruction_id.clone(),
                compose_id: compose_id.to_string(),
                instruction_id: r.instruction_id.clone(),
                strategy_id: strategy_id.to_string(),
                instrument: r.instrument.clone(),
                side: r.side,
                trade_type: TradeType::from_quantity(r.side.sign()),
                quantity: r.filled_qty,
                entry_price: if reduce_only { None } else { exec_price },
                exit_price: if reduce_only { exec_price } else { None },
                notional_entry: if reduce_only {
                    None
                } else {
                    exec_price.map(|p| p * r.filled_qty)
                },
                notional_exit: if reduce_only {
                    exec_price.map(|p| p * r.filled_qty)
                } else {
                    None
                },
                entry_ts: if reduce_only { None } else { Some(ts) },
                exit_ts: None,
                trade_ts: ts,
                holding_ms: None,
                realized_pnl: None,
                fee_cost: r.fee_cost,
                leverage: r.leverage,
                note: r.reason.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::clock::FixedClock;
    use super::*;
    use crate::decision::NormalizerConfig;
    use crate::decision::PromptComposer;
    use crate::execution::PaperExecutionGateway;
    use crate::market_data::SimulatedMarketDataSource;
    use crate::model::Candle;
    use crate::persistence::FileStrategyRepository;
    use crate::portfolio::InMemoryPortfolioService;
    use async_trait::async_trait;

    struct NoopLlm;

    #[async_trait]
    impl crate::decision::LlmClient for NoopLlm {
        async fn invoke(&self, _prompt: &str) -> anyhow::Result<crate::model::PlanProposal> {
            anyhow::bail!("no llm in test")
        }

        async fn invoke_raw(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("no llm in test")
        }
    }

    struct StubMarketData;

    #[async_trait]
    impl MarketDataSource for StubMarketData {
        async fn get_recent_candles(
            &self,
            symbols: &[String],
            interval: crate::model::Interval,
            _lookback: usize,
        ) -> Vec<Candle> {
            symbols
                .iter()
                .map(|s| Candle {
                    ts_ms: 1,
                    instrument: crate::model::InstrumentRef::new(s.clone()),
                    o: 100.0,
                    h: 101.0,
                    l: 99.0,
                    c: 100.0,
                    v: 1.0,
                    interval,
                })
                .collect()
        }

        async fn get_market_snapshot(&self, _symbols: &[String]) -> crate::model::MarketSnapshot {
            crate::model::MarketSnapshot::new()
        }
    }

    fn test_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("coordinator-test-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn run_once_returns_empty_cycle_when_llm_unavailable() {
        let dir = test_dir("empty-cycle");
        let repository = Arc::new(FileStrategyRepository::new(&dir));
        let portfolio = Arc::new(InMemoryPortfolioService::new(
            "s1",
            10_000.0,
            true,
            1.0,
            Constraints::default(),
        ));
        let composer = Box::new(PromptComposer::new(
            Arc::new(NoopLlm),
            "trade BTC-USDT",
            NormalizerConfig::default(),
        ));

        let mut coordinator = DecisionCoordinator::new(
            "s1",
            vec!["BTC-USDT".to_string()],
            CandleConfig::defaults(),
            Constraints::default(),
            Arc::new(StubMarketData),
            Arc::new(crate::features::DefaultFeatureComputer::new()),
            composer,
            Arc::new(PaperExecutionGateway::new(10.0)),
            portfolio,
            repository,
            Arc::new(FixedClock(1_000)),
        );

        let result = coordinator.run_once().await;
        assert!(result.instructions.is_empty());
        assert!(result.trades.is_empty());
        assert_eq!(result.cycle_index, 1);
        assert_eq!(result.timestamp_ms, 1_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn run_once_increments_cycle_index_across_calls() {
        let dir = test_dir("cycle-index");
        let repository = Arc::new(FileStrategyRepository::new(&dir));
        let portfolio = Arc::new(InMemoryPortfolioService::new(
            "s1",
            10_000.0,
            true,
            1.0,
            Constraints::default(),
        ));
        let composer = Box::new(PromptComposer::new(
            Arc::new(NoopLlm),
            "trade BTC-USDT",
            NormalizerConfig::default(),
        ));
        let mut coordinator = DecisionCoordinator::new(
            "s1",
            vec!["BTC-USDT".to_string()],
            CandleConfig::defaults(),
            Constraints::default(),
            Arc::new(StubMarketData),
            Arc::new(crate::features::DefaultFeatureComputer::new()),
            composer,
            Arc::new(PaperExecutionGateway::new(10.0)),
            portfolio,
            repository,
            Arc::new(FixedClock(1_000)),
        );

        let first = coordinator.run_once().await;
        let second = coordinator.run_once().await;
        assert_eq!(first.cycle_index, 1);
        assert_eq!(second.cycle_index, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn run_once_marks_positions_to_market_even_without_trades() {
        let dir = test_dir("mark-to-market");
        let repository = Arc::new(FileStrategyRepository::new(&dir));
        let portfolio = Arc::new(InMemoryPortfolioService::new(
            "s1",
            10_000.0,
            false,
            3.0,
            Constraints::default(),
        ));
        let mut seed = [crate::model::TradeHistoryEntry {
            trade_id: "seed".into(),
            compose_id: "seed".into(),
            instruction_id: "seed".into(),
            strategy_id: "s1".into(),
            instrument: crate::model::InstrumentRef::new("BTC-USDT"),
            side: TradeSide::Buy,
            trade_type: TradeType::Long,
            quantity: 1.0,
            entry_price: Some(90.0),
            exit_price: None,
            notional_entry: Some(90.0),
            notional_exit: None,
            entry_ts: Some(0),
            exit_ts: None,
            trade_ts: 0,
            holding_ms: None,
            realized_pnl: None,
            fee_cost: Some(0.0),
            leverage: Some(1.0),
            note: None,
        }];
        portfolio.apply_trades(&mut seed, &HashMap::new());

        let composer = Box::new(PromptComposer::new(
            Arc::new(NoopLlm),
            "trade BTC-USDT",
            NormalizerConfig::default(),
        ));
        let mut coordinator = DecisionCoordinator::new(
            "s1",
            vec!["BTC-USDT".to_string()],
            CandleConfig::defaults(),
            Constraints::default(),
            Arc::new(StubMarketData),
            Arc::new(crate::features::DefaultFeatureComputer::new()),
            composer,
            Arc::new(PaperExecutionGateway::new(10.0)),
            portfolio,
            repository,
            Arc::new(FixedClock(1_000)),
        );

        let result = coordinator.run_once().await;
        let pos = &result.portfolio_view.positions["BTC-USDT"];
        assert!((pos.mark_price.unwrap() - 100.0).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
