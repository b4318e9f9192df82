use super::coordinator::DecisionCoordinator;
use crate::model::{DecisionCycleResult, StrategySummary};
use crate::persistence::StrategyRepository;
use crate::portfolio::{PortfolioService, PortfolioSnapshotStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WAITING_RUNNING_POLL: Duration = Duration::from_secs(1);
const WAITING_RUNNING_TIMEOUT: Duration = Duration::from_secs(300);
const RUNNING_STATUS: &str = "running";
const STOPPED_STATUS: &str = "stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    WaitingRunning,
    Running,
    Stopped,
}

/// What `main.rs`'s ambient broadcast sink relays to dashboard/event
/// consumers: one `Status` at startup and stop, one `Cycle` per decision
/// cycle. Generalizes the teacher's axum/ws push into a transport-agnostic
/// event the HTTP layer (out of scope here) would subscribe to.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Status { strategy_id: String, status: String },
    Cycle { result: Box<DecisionCycleResult> },
}

/// Drives one strategy through `Initializing -> WaitingRunning -> Running
/// -> Stopped`. Owns the [`DecisionCoordinator`] for that strategy and is
/// the only writer of its persisted `status`/`metadata`.
pub struct StreamController {
    strategy_id: String,
    coordinator: DecisionCoordinator,
    repository: Arc<dyn StrategyRepository>,
    snapshot_store: Arc<dyn PortfolioSnapshotStore>,
    portfolio: Arc<dyn PortfolioService>,
    decide_interval: Duration,
    is_live: bool,
    cancellation: CancellationToken,
    events: Option<broadcast::Sender<StreamEvent>>,
    state: AtomicBool,
}

impl StreamController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_id: impl Into<String>,
        coordinator: DecisionCoordinator,
        repository: Arc<dyn StrategyRepository>,
        snapshot_store: Arc<dyn PortfolioSnapshotStore>,
        portfolio: Arc<dyn PortfolioService>,
        decide_interval: Duration,
        is_live: bool,
        cancellation: CancellationToken,
        events: Option<broadcast::Sender<StreamEvent>>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            coordinator,
            repository,
            snapshot_store,
            portfolio,
            decide_interval,
            is_live,
            cancellation,
            events,
            // Tracks only whether Stopped has been reached, for idempotent shutdown; the
            // authoritative state lives in the persisted `status` field.
            state: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_status(&self, status: &str) {
        self.emit(StreamEvent::Status {
            strategy_id: self.strategy_id.clone(),
            status: status.to_string(),
        });
    }

    /// Runs the full lifecycle to completion. Consumes `self`: a
    /// controller is single-use, one per strategy task.
    pub async fn run(mut self) {
        info!(strategy_id = %self.strategy_id, state = ?StreamState::Initializing, "stream controller starting");

        if let Some(view) = self.load_snapshot() {
            self.portfolio.seed_from_snapshot(&view);
        }

        info!(strategy_id = %self.strategy_id, state = ?StreamState::WaitingRunning, "waiting for running status");
        if !self.wait_for_running().await {
            self.finish("cancelled").await;
            return;
        }

        info!(strategy_id = %self.strategy_id, state = ?StreamState::Running, "entering running state");
        self.enter_running().await;
        self.emit_status(RUNNING_STATUS);

        let stop_reason = self.run_loop().await;
        self.finish(stop_reason).await;
    }

    fn load_snapshot(&self) -> Option<crate::model::PortfolioView> {
        match self.snapshot_store.load_latest(&self.strategy_id) {
            Ok(view) => view,
            Err(e) => {
                warn!(strategy_id = %self.strategy_id, error = %e, "failed to load portfolio snapshot");
                None
            }
        }
    }

    async fn wait_for_running(&self) -> bool {
        let start = Instant::now();
        loop {
            if self.cancellation.is_cancelled() {
                return false;
            }
            match self.repository.get_status(&self.strategy_id) {
                Ok(Some(status)) if status == RUNNING_STATUS => return true,
                Ok(_) => {}
                Err(e) => warn!(strategy_id = %self.strategy_id, error = %e, "failed to read status while waiting"),
            }
            if start.elapsed() >= WAITING_RUNNING_TIMEOUT {
                warn!(strategy_id = %self.strategy_id, "waiting_running timed out; proceeding anyway");
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(WAITING_RUNNING_POLL) => {}
                _ = self.cancellation.cancelled() => return false,
            }
        }
    }

    /// Persists the strategy's first portfolio snapshot + an empty summary,
    /// and, in live mode, records the observed free cash as `initial_capital`
    /// the first time this runs (idempotent on the metadata key's presence).
    async fn enter_running(&mut self) {
        let view = self.portfolio.get_view();
        let initial_cycle = DecisionCycleResult {
            compose_id: format!("{}:init", self.strategy_id),
            cycle_index: 0,
            timestamp_ms: view.ts,
            rationale: "strategy entering running state".to_string(),
            instructions: Vec::new(),
            trades: Vec::new(),
            strategy_summary: StrategySummary {
                strategy_id: self.strategy_id.clone(),
                ts_ms: view.ts,
                active_positions: view.active_position_count(),
                total_value: view.total_value,
                total_unrealized_pnl: view.total_unrealized_pnl,
                trade_count: 0,
            },
            portfolio_view: view.clone(),
        };
        if let Err(e) = self.repository.record_cycle(&self.strategy_id, &initial_cycle) {
            warn!(strategy_id = %self.strategy_id, error = %e, "failed to persist initial cycle");
        }
        if let Err(e) = self.snapshot_store.save(&self.strategy_id, &view) {
            warn!(strategy_id = %self.strategy_id, error = %e, "failed to persist initial portfolio snapshot");
        }

        if self.is_live {
            let already_recorded = self
                .repository
                .get_metadata(&self.strategy_id, "initial_capital")
                .ok()
                .flatten()
                .is_some();
            if !already_recorded {
                if let Err(e) = self.repository.set_metadata(
                    &self.strategy_id,
                    "initial_capital",
                    // Decimal string, matching the fixed-precision storage
                    // convention every other monetary field persists under.
                    serde_json::json!(format!("{:.8}", view.free_cash)),
                ) {
                    warn!(strategy_id = %self.strategy_id, error = %e, "failed to record initial_capital");
                }
            }
        }
    }

    /// Runs cycles on `decide_interval` while persistence reports
    /// `running`, returning the stop reason for [`finish`].
    async fn run_loop(&mut self) -> &'static str {
        loop {
            if self.cancellation.is_cancelled() {
                return "cancelled";
            }
            match self.repository.get_status(&self.strategy_id) {
                Ok(Some(status)) if status != RUNNING_STATUS => return "normal_exit",
                Err(e) => {
                    warn!(strategy_id = %self.strategy_id, error = %e, "failed to read status mid-loop; continuing");
                }
                _ => {}
            }

            let result = self.coordinator.run_once().await;
            if let Err(e) = self.repository.record_cycle(&self.strategy_id, &result) {
                warn!(strategy_id = %self.strategy_id, error = %e, "failed to persist cycle");
            }
            if let Err(e) = self
                .snapshot_store
                .save(&self.strategy_id, &result.portfolio_view)
            {
                warn!(strategy_id = %self.strategy_id, error = %e, "failed to persist portfolio snapshot");
            }
            self.emit(StreamEvent::Cycle { result: Box::new(result) });

            tokio::select! {
                _ = tokio::time::sleep(self.decide_interval) => {}
                _ = self.cancellation.cancelled() => return "cancelled",
            }
        }
    }

    async fn finish(mut self, reason: &'static str) {
        self.state.store(true, Ordering::SeqCst);
        info!(strategy_id = %self.strategy_id, reason, state = ?StreamState::Stopped, "stream controller stopping");
        if let Err(e) = self.repository.set_status(&self.strategy_id, STOPPED_STATUS) {
            warn!(strategy_id = %self.strategy_id, error = %e, "failed to persist stopped status");
        }
        if let Err(e) =
            self.repository
                .set_metadata(&self.strategy_id, "stop_reason", serde_json::json!(reason))
        {
            warn!(strategy_id = %self.strategy_id, error = %e, "failed to record stop reason");
        }
        self.emit_status(STOPPED_STATUS);
    }
}
