//! # Spread Hedger
//!
//! Cross-venue hedge execution engine for perpetual futures. Holds offsetting
//! positions on two venues while their price spread is wide and unwinds them
//! when it collapses.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `events`: Structured engine events and alarms
//! - `exchange`: Venue REST/WebSocket clients and the paper venue
//! - `feed`: Staleness-gated per-venue quotes
//! - `strategy`: Signals, order-type locks, paired execution, evaluation loop
//! - `risk`: Protective orders, circuit breaker, reconciliation
//! - `persistence`: SQLite position ledger
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod events;
pub mod exchange;
pub mod feed;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
