use crate::error::{Result, RuntimeError};
use crate::model::{DecisionCycleResult, PortfolioView, StrategySummary, TradeHistoryEntry, TradeInstruction};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Audit row for one `strategy_cycles` entry, keyed by `compose_id` so a
/// repeated persist of the same cycle overwrites rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub compose_id: String,
    pub cycle_index: u64,
    pub compose_ts: i64,
    pub rationale: String,
}

/// `strategy_portfolio_snapshots` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshotRecord {
    pub snapshot_ts: i64,
    /// Fixed-precision decimal strings on disk, per the storage boundary's
    /// monetary-value convention; `f64` everywhere else.
    #[serde(with = "crate::model::decimal::decimal_string")]
    pub cash: f64,
    #[serde(with = "crate::model::decimal::decimal_string")]
    pub total_value: f64,
    #[serde(with = "crate::model::decimal::decimal_string")]
    pub total_unrealized_pnl: f64,
}

impl From<&PortfolioView> for PortfolioSnapshotRecord {
    fn from(view: &PortfolioView) -> Self {
        Self {
            snapshot_ts: view.ts,
            cash: view.free_cash,
            total_value: view.total_value.unwrap_or(view.free_cash),
            total_unrealized_pnl: view.total_unrealized_pnl.unwrap_or(0.0),
        }
    }
}

/// Bounds below which the reference store prunes oldest rows, keeping the
/// one-file-per-strategy document from growing without limit across a
/// long-lived strategy's lifetime. A real DB-backed store would have no
/// such cap; this is purely a reference-implementation concern.
const MAX_CYCLES: usize = 500;
const MAX_TRADES: usize = 2_000;
const MAX_SNAPSHOTS: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StrategyRecord {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    cycles: HashMap<String, CycleRecord>,
    #[serde(default)]
    instructions: HashMap<String, TradeInstruction>,
    #[serde(default)]
    trades: HashMap<String, TradeHistoryEntry>,
    #[serde(default)]
    portfolio_snapshots: Vec<PortfolioSnapshotRecord>,
    #[serde(default)]
    holdings: Vec<crate::model::PositionSnapshot>,
    #[serde(default)]
    summary: Option<StrategySummary>,
}

/// The persistence boundary the Stream Controller and Decision Coordinator
/// write through. Every method is fallible but callers are expected to log
/// and swallow `Err` — a `PersistenceError` must never propagate into the
/// decision loop (see `RuntimeError::Persistence`).
pub trait StrategyRepository: Send + Sync {
    /// Idempotent: creates the row only if it doesn't already exist.
    fn ensure_strategy(
        &self,
        strategy_id: &str,
        name: &str,
        config: &Value,
        initial_status: &str,
        created_at: i64,
    ) -> Result<()>;

    fn get_status(&self, strategy_id: &str) -> Result<Option<String>>;
    fn set_status(&self, strategy_id: &str, status: &str) -> Result<()>;

    fn get_metadata(&self, strategy_id: &str, key: &str) -> Result<Option<Value>>;
    /// Idempotent: setting the same key to the same value twice is a no-op
    /// on disk (still re-written, but to identical content).
    fn set_metadata(&self, strategy_id: &str, key: &str, value: Value) -> Result<()>;

    /// Persists the cycle row, its instructions, its trades, the portfolio
    /// snapshot, and the refreshed summary in one atomic write. Re-persisting
    /// the same `compose_id` overwrites in place rather than duplicating.
    fn record_cycle(
        &self,
        strategy_id: &str,
        result: &DecisionCycleResult,
    ) -> Result<()>;

    /// Up to `limit` most recent trades for `strategy_id`, newest last —
    /// the window the Decision Coordinator folds into the rolling digest.
    fn recent_trades(&self, strategy_id: &str, limit: usize) -> Result<Vec<TradeHistoryEntry>>;
}

/// One JSON document per strategy under `base_dir`, written with the
/// tmp-then-rename pattern the rest of this codebase uses for durable
/// state (see `runtime_config.rs`, `snapshot_store.rs`). Good enough for
/// the reference binary and for tests; a production deployment swaps this
/// for the real persistence service sitting outside this core.
pub struct FileStrategyRepository {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, StrategyRecord>>,
}

impl FileStrategyRepository {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, strategy_id: &str) -> PathBuf {
        self.base_dir.join(format!("{strategy_id}.json"))
    }

    fn load(&self, strategy_id: &str) -> Result<StrategyRecord> {
        if let Some(record) = self.cache.read().get(strategy_id) {
            return Ok(record.clone());
        }
        let path = self.path_for(strategy_id);
        let record = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                RuntimeError::Persistence(format!("read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                RuntimeError::Persistence(format!("parse {}: {e}", path.display()))
            })?
        } else {
            StrategyRecord::default()
        };
        self.cache.write().insert(strategy_id.to_string(), record.clone());
        Ok(record)
    }

    fn save(&self, strategy_id: &str, record: &StrategyRecord) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            RuntimeError::Persistence(format!("create dir {}: {e}", self.base_dir.display()))
        })?;
        let path = self.path_for(strategy_id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| RuntimeError::Persistence(format!("serialize: {e}")))?;
        std::fs::write(&tmp_path, &content).map_err(|e| {
            RuntimeError::Persistence(format!("write tmp {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            RuntimeError::Persistence(format!("rename to {}: {e}", path.display()))
        })?;
        self.cache.write().insert(strategy_id.to_string(), record.clone());
        Ok(())
    }

    fn with_record<F>(&self, strategy_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut StrategyRecord),
    {
        let mut record = self.load(strategy_id)?;
        f(&mut record);
        self.save(strategy_id, &record)
    }
}

fn prune_oldest_cycles(record: &mut StrategyRecord) {
    if record.cycles.len() <= MAX_CYCLES {
        return;
    }
    let mut entries: Vec<(String, i64)> = record
        .cycles
        .iter()
        .map(|(id, c)| (id.clone(), c.compose_ts))
        .collect();
    entries.sort_by_key(|(_, ts)| *ts);
    let overflow = entries.len() - MAX_CYCLES;
    for (id, _) in entries.into_iter().take(overflow) {
        record.cycles.remove(&id);
    }
}

fn prune_oldest_trades(record: &mut StrategyRecord) {
    if record.trades.len() <= MAX_TRADES {
        return;
    }
    let mut entries: Vec<(String, i64)> = record
        .trades
        .iter()
        .map(|(id, t)| (id.clone(), t.trade_ts))
        .collect();
    entries.sort_by_key(|(_, ts)| *ts);
    let overflow = entries.len() - MAX_TRADES;
    for (id, _) in entries.into_iter().take(overflow) {
        record.trades.remove(&id);
    }
}

impl StrategyRepository for FileStrategyRepository {
    fn ensure_strategy(
        &self,
        strategy_id: &str,
        name: &str,
        config: &Value,
        initial_status: &str,
        created_at: i64,
    ) -> Result<()> {
        let existing = self.load(strategy_id)?;
        if existing.created_at.is_some() {
            return Ok(());
        }
        self.with_record(strategy_id, |record| {
            record.name = name.to_string();
            record.status = initial_status.to_string();
            record.config = config.clone();
            record.created_at = Some(created_at);
        })
    }

    fn get_status(&self, strategy_id: &str) -> Result<Option<String>> {
        let record = self.load(strategy_id)?;
        Ok(if record.status.is_empty() {
            None
        } else {
            Some(record.status)
        })
    }

    fn set_status(&self, strategy_id: &str, status: &str) -> Result<()> {
        self.with_record(strategy_id, |record| {
            record.status = status.to_string();
        })
    }

    fn get_metadata(&self, strategy_id: &str, key: &str) -> Result<Option<Value>> {
        let record = self.load(strategy_id)?;
        Ok(record.metadata.get(key).cloned())
    }

    fn set_metadata(&self, strategy_id: &str, key: &str, value: Value) -> Result<()> {
        self.with_record(strategy_id, |record| {
            record.metadata.insert(key.to_string(), value);
        })
    }

    fn record_cycle(&self, strategy_id: &str, result: &DecisionCycleResult) -> Result<()> {
        self.with_record(strategy_id, |record| {
            record.cycles.insert(
                result.compose_id.clone(),
                CycleRecord {
                    compose_id: result.compose_id.clone(),
                    cycle_index: result.cycle_index,
                    compose_ts: result.timestamp_ms,
                    rationale: result.rationale.clone(),
                },
            );
            for instruction in &result.instructions {
                record
                    .instructions
                    .insert(instruction.instruction_id.clone(), instruction.clone());
            }
            for trade in &result.trades {
                record.trades.insert(trade.trade_id.clone(), trade.clone());
            }
            record
                .portfolio_snapshots
                .push(PortfolioSnapshotRecord::from(&result.portfolio_view));
            if record.portfolio_snapshots.len() > MAX_SNAPSHOTS {
                let overflow = record.portfolio_snapshots.len() - MAX_SNAPSHOTS;
                record.portfolio_snapshots.drain(0..overflow);
            }
            record.holdings = result
                .portfolio_view
                .positions
                .values()
                .filter(|p| !p.is_flat())
                .cloned()
                .collect();
            record.summary = Some(result.strategy_summary.clone());
            prune_oldest_cycles(record);
            prune_oldest_trades(record);
        })
    }

    fn recent_trades(&self, strategy_id: &str, limit: usize) -> Result<Vec<TradeHistoryEntry>> {
        let record = self.load(strategy_id)?;
        let mut trades: Vec<TradeHistoryEntry> = record.trades.into_values().collect();
        trades.sort_by_key(|t| t.trade_ts);
        if trades.len() > limit {
            let overflow = trades.len() - limit;
            trades.drain(0..overflow);
        }
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Constraints, InstrumentRef, PortfolioView, TradeSide, TradeType};
    use std::collections::HashMap as Map;

    fn tmp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("strategy-runtime-repo-test-{name}-{}", std::process::id()))
    }

    fn sample_cycle(compose_id: &str, cycle_index: u64) -> DecisionCycleResult {
        DecisionCycleResult {
            compose_id: compose_id.to_string(),
            cycle_index,
            timestamp_ms: 1_000,
            rationale: "test cycle".into(),
            instructions: vec![],
            trades: vec![TradeHistoryEntry {
                trade_id: format!("{compose_id}:trade"),
                compose_id: compose_id.to_string(),
                instruction_id: format!("{compose_id}:BTC-USDT:0"),
                strategy_id: "s1".into(),
                instrument: InstrumentRef::new("BTC-USDT"),
                side: TradeSide::Buy,
                trade_type: TradeType::Long,
                quantity: 0.01,
                entry_price: Some(50_000.0),
                exit_price: None,
                notional_entry: Some(500.0),
                notional_exit: None,
                entry_ts: Some(1_000),
                exit_ts: None,
                trade_ts: 1_000,
                holding_ms: None,
                realized_pnl: None,
                fee_cost: Some(0.1),
                leverage: Some(1.0),
                note: None,
            }],
            portfolio_view: PortfolioView {
                ts: 1_000,
                strategy_id: Some("s1".into()),
                free_cash: 9_500.0,
                positions: Map::new(),
                gross_exposure: Some(0.0),
                net_exposure: Some(0.0),
                total_value: Some(9_500.0),
                total_unrealized_pnl: Some(0.0),
                buying_power: Some(9_500.0),
                constraints: Some(Constraints::default()),
            },
            strategy_summary: StrategySummary {
                strategy_id: "s1".into(),
                ts_ms: 1_000,
                active_positions: 0,
                total_value: Some(9_500.0),
                total_unrealized_pnl: Some(0.0),
                trade_count: 1,
            },
        }
    }

    #[test]
    fn ensure_strategy_is_idempotent_on_created_at() {
        let dir = tmp_dir("ensure");
        let repo = FileStrategyRepository::new(&dir);
        repo.ensure_strategy("s1", "demo", &Value::Null, "running", 1).unwrap();
        repo.ensure_strategy("s1", "renamed", &Value::Null, "stopped", 2).unwrap();
        assert_eq!(repo.get_status("s1").unwrap().as_deref(), Some("running"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn record_cycle_is_idempotent_on_repeat() {
        let dir = tmp_dir("cycle");
        let repo = FileStrategyRepository::new(&dir);
        let cycle = sample_cycle("c1", 1);
        repo.record_cycle("s1", &cycle).unwrap();
        repo.record_cycle("s1", &cycle).unwrap();
        let trades = repo.recent_trades("s1", 100).unwrap();
        assert_eq!(trades.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn recent_trades_bounds_to_limit_newest_last() {
        let dir = tmp_dir("recent");
        let repo = FileStrategyRepository::new(&dir);
        for i in 0..5 {
            let mut cycle = sample_cycle(&format!("c{i}"), i as u64);
            cycle.trades[0].trade_id = format!("t{i}");
            cycle.trades[0].trade_ts = i as i64;
            repo.record_cycle("s1", &cycle).unwrap();
        }
        let trades = repo.recent_trades("s1", 2).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades.last().unwrap().trade_id, "t4");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn status_round_trips_across_instances() {
        let dir = tmp_dir("status");
        {
            let repo = FileStrategyRepository::new(&dir);
            repo.ensure_strategy("s1", "demo", &Value::Null, "waiting_running", 1).unwrap();
            repo.set_status("s1", "running").unwrap();
        }
        let repo2 = FileStrategyRepository::new(&dir);
        assert_eq!(repo2.get_status("s1").unwrap().as_deref(), Some("running"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
