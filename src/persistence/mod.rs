//! Schema and trait boundary for the handful of tables the core owns:
//! strategy status/metadata, cycle/instruction/trade audit rows, and the
//! rolling portfolio snapshot + summary. The real HTTP/DB-backed store is
//! an external collaborator (out of scope); [`FileStrategyRepository`] is
//! the reference backing implementation used by tests and the demo
//! binary, following the same tmp-then-rename atomicity as
//! [`crate::runtime_config::RuntimeConfig`] and
//! [`crate::portfolio::FilePortfolioSnapshotStore`].

pub mod repository;

pub use repository::{FileStrategyRepository, StrategyRepository};
