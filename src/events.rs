//! Structured engine events.
//!
//! Every state transition is emitted as a JSON payload. Routine events go to
//! the `hedge_event` target; alarms go to `hedge_alarm` at error level with an
//! `ALARM:` prefix so log tooling can split them without parsing messages.

use crate::exchange::{OrderCategory, OrderSide, Venue};
use crate::strategy::Direction;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

const EVENT_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Alarm,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    HedgeOpened {
        trade_id: String,
        direction: Direction,
        amount: Decimal,
        spread: Decimal,
        price_a: Decimal,
        price_b: Decimal,
        skew_ms: u64,
    },
    HedgeAdded {
        trade_id: String,
        direction: Direction,
        amount: Decimal,
        spread: Decimal,
        legs: usize,
    },
    HedgeClosed {
        trade_id: String,
        direction: Direction,
        gross_pnl: Decimal,
        net_pnl: Decimal,
        forced: bool,
    },
    /// Close-all stopped early because the spread widened again.
    PartialClose {
        closed: usize,
        remaining: usize,
        spread: Option<Decimal>,
    },
    StopPlaced {
        venue: Venue,
        side: OrderSide,
        trigger_price: Decimal,
        quantity: Decimal,
    },
    StopMoved {
        venue: Venue,
        from: Decimal,
        to: Decimal,
    },
    TrailingPlaced {
        venue: Venue,
        activation_price: Decimal,
        callback_rate: Decimal,
    },
    ProtectiveOrderRefused {
        venue: Venue,
        category: OrderCategory,
        trigger_price: Decimal,
        market_price: Decimal,
    },
    /// A stop or trailing stop closed one venue's side of the group.
    ProtectiveOrderFilled {
        venue: Venue,
        category: OrderCategory,
        order_id: String,
        price: Decimal,
    },
    CircuitBreaker {
        venue: Venue,
        unrealized_pnl: Decimal,
        loss_limit: Decimal,
    },
    DuplicatesCancelled {
        venue: Venue,
        category: OrderCategory,
        cancelled: usize,
    },
    LockTimeout {
        venue: Venue,
        category: OrderCategory,
        pending_order_id: Option<String>,
    },
    SingleLegExposure {
        filled_venue: Venue,
        failed_venue: Venue,
        order_id: String,
        amount: Decimal,
        closing: bool,
        error: String,
    },
    CompensationConfirmed {
        venue: Venue,
        order_id: String,
    },
    /// Compensation could not be confirmed. Requires manual resolution.
    CompensationFailed {
        venue: Venue,
        detail: String,
    },
    ReconciliationMismatch {
        venue: Venue,
        ledger_amount: Decimal,
        venue_amount: Decimal,
    },
}

impl EngineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            EngineEvent::SingleLegExposure { .. }
            | EngineEvent::CompensationFailed { .. }
            | EngineEvent::CircuitBreaker { .. }
            | EngineEvent::ReconciliationMismatch { .. } => Severity::Alarm,
            EngineEvent::ProtectiveOrderRefused { .. }
            | EngineEvent::ProtectiveOrderFilled { .. }
            | EngineEvent::LockTimeout { .. }
            | EngineEvent::PartialClose { .. }
            | EngineEvent::DuplicatesCancelled { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }

    pub fn is_alarm(&self) -> bool {
        self.severity() == Severity::Alarm
    }

    /// Emit event as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity() {
            Severity::Info => info!(target: "hedge_event", "EVENT: {}", json),
            Severity::Warning => warn!(target: "hedge_event", "EVENT: {}", json),
            Severity::Alarm => error!(target: "hedge_alarm", "ALARM: {}", json),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Emits events and keeps the most recent ones in memory for status output.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    recent: Arc<Mutex<VecDeque<RecordedEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: EngineEvent) {
        event.emit();

        let mut recent = self.recent.lock();
        if recent.len() == EVENT_LOG_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(RecordedEvent {
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn recent(&self) -> Vec<EngineEvent> {
        self.recent.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn alarms(&self) -> Vec<EngineEvent> {
        self.recent
            .lock()
            .iter()
            .filter(|r| r.event.is_alarm())
            .map(|r| r.event.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_single_leg_is_alarm() {
        let event = EngineEvent::SingleLegExposure {
            filled_venue: Venue::A,
            failed_venue: Venue::B,
            order_id: "1".into(),
            amount: dec!(0.02),
            closing: false,
            error: "order timed out".into(),
        };
        assert_eq!(event.severity(), Severity::Alarm);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"SingleLegExposure\""));
    }

    #[test]
    fn test_event_log_is_bounded() {
        let log = EventLog::new();
        for i in 0..(EVENT_LOG_CAPACITY + 10) {
            log.record(EngineEvent::CompensationConfirmed {
                venue: Venue::A,
                order_id: i.to_string(),
            });
        }

        let recent = log.recent();
        assert_eq!(recent.len(), EVENT_LOG_CAPACITY);
        assert_eq!(
            recent[0],
            EngineEvent::CompensationConfirmed {
                venue: Venue::A,
                order_id: "10".into()
            }
        );
        assert!(log.alarms().is_empty());
    }
}
