use crate::error::{Result, RuntimeError};
use crate::model::PortfolioView;
use std::path::PathBuf;
use tracing::info;

/// Durable checkpoint of a strategy's `PortfolioView`, read once at Stream
/// Controller startup to seed `InMemoryPortfolioService` and written once
/// per cycle after the coordinator applies trades.
pub trait PortfolioSnapshotStore: Send + Sync {
    fn load_latest(&self, strategy_id: &str) -> Result<Option<PortfolioView>>;
    fn save(&self, strategy_id: &str, view: &PortfolioView) -> Result<()>;
}

/// File-backed reference implementation: one `<strategy_id>.json` per
/// strategy under `base_dir`, written with the tmp-then-rename pattern so a
/// crash mid-write never leaves a corrupt snapshot behind.
pub struct FilePortfolioSnapshotStore {
    base_dir: PathBuf,
}

impl FilePortfolioSnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, strategy_id: &str) -> PathBuf {
        self.base_dir.join(format!("{strategy_id}.json"))
    }
}

impl PortfolioSnapshotStore for FilePortfolioSnapshotStore {
    fn load_latest(&self, strategy_id: &str) -> Result<Option<PortfolioView>> {
        let path = self.path_for(strategy_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RuntimeError::Persistence(format!("read snapshot {}: {e}", path.display()))
        })?;
        let view: PortfolioView = serde_json::from_str(&content).map_err(|e| {
            RuntimeError::Persistence(format!("parse snapshot {}: {e}", path.display()))
        })?;
        Ok(Some(view))
    }

    fn save(&self, strategy_id: &str, view: &PortfolioView) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            RuntimeError::Persistence(format!("create snapshot dir {}: {e}", self.base_dir.display()))
        })?;
        let path = self.path_for(strategy_id);
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(view)
            .map_err(|e| RuntimeError::Persistence(format!("serialize snapshot: {e}")))?;

        std::fs::write(&tmp_path, &content).map_err(|e| {
            RuntimeError::Persistence(format!("write tmp snapshot {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            RuntimeError::Persistence(format!("rename tmp snapshot to {}: {e}", path.display()))
        })?;

        info!(strategy_id, path = %path.display(), "portfolio snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Constraints;
    use std::collections::HashMap;

    fn sample_view(strategy_id: &str) -> PortfolioView {
        PortfolioView {
            ts: 1,
            strategy_id: Some(strategy_id.to_string()),
            free_cash: 500.0,
            positions: HashMap::new(),
            gross_exposure: Some(0.0),
            net_exposure: Some(0.0),
            total_value: Some(500.0),
            total_unrealized_pnl: Some(0.0),
            buying_power: Some(500.0),
            constraints: Some(Constraints::default()),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!(
            "strategy-runtime-test-{}",
            std::process::id()
        ));
        let store = FilePortfolioSnapshotStore::new(&dir);
        let view = sample_view("s1");
        store.save("s1", &view).unwrap();
        let loaded = store.load_latest("s1").unwrap().unwrap();
        assert_eq!(loaded.free_cash, view.free_cash);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_snapshot_returns_none() {
        let dir = std::env::temp_dir().join(format!(
            "strategy-runtime-test-missing-{}",
            std::process::id()
        ));
        let store = FilePortfolioSnapshotStore::new(&dir);
        assert!(store.load_latest("does-not-exist").unwrap().is_none());
    }
}
