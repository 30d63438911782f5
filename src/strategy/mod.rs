//! Hedge strategy: signals, execution and the evaluation loop.
//!
//! - `group`: the open hedge group and its legs
//! - `signal`: spread-driven open / add / close decisions
//! - `locks`: per-venue, per-order-category mutual exclusion
//! - `executor`: concurrent two-leg execution with compensation
//! - `engine`: the non-reentrant evaluation loop

pub mod engine;
pub mod executor;
pub mod group;
pub mod locks;
pub mod signal;

pub use engine::{CycleOutcome, HedgeEngine};
pub use executor::{
    execute_hedged_order, ExecutionCoordinator, ExecutionOutcome, HedgeFill, LegResult, RaceResult,
};
pub use group::{Direction, HedgeGroup, HedgePosition, PositionStatus};
pub use locks::{LockGuard, LockState, OrderTypeLocks};
pub use signal::{Signal, SignalEvaluator};
