//! Shared helpers.

pub mod decimal;

pub use decimal::{floor_to_step, safe_div, weighted_average};
