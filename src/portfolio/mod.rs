//! Tracks cash, positions, exposure, and unrealized P&L for one strategy,
//! and exposes the typed [`PortfolioView`](crate::model::PortfolioView) the
//! rest of the decision pipeline reads. Mutated only by the Decision
//! Coordinator, once per cycle, after execution.

pub mod service;
pub mod snapshot_store;

pub use service::{InMemoryPortfolioService, PortfolioService};
pub use snapshot_store::{FilePortfolioSnapshotStore, PortfolioSnapshotStore};
