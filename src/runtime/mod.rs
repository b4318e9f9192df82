//! Wires the Feature Pipeline, Composer, Execution Gateway, Portfolio
//! Service, and `StrategyRepository` into one per-strategy decision loop,
//! and drives that loop through its `Initializing -> WaitingRunning ->
//! Running -> Stopped` lifecycle.

pub mod clock;
pub mod coordinator;
pub mod digest;
pub mod stream_controller;

pub use clock::{Clock, SystemClock};
pub use coordinator::DecisionCoordinator;
pub use digest::build_digest;
pub use stream_controller::{StreamController, StreamEvent, StreamState};
