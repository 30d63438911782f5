//! Ledger vs. venue position reconciliation.
//!
//! Reporting only: mismatches raise an alarm event for the operator and
//! never trigger orders.

use crate::events::{EngineEvent, EventLog};
use crate::exchange::{OrderSide, Venue, VenueClient, VenuePosition, VenueResult};
use crate::strategy::HedgePosition;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// One venue's comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueReconciliation {
    pub venue: Venue,
    /// Signed exposure the ledger believes in (long positive).
    pub ledger_amount: Decimal,
    /// Signed exposure the venue reports, or `None` if it could not be read.
    pub venue_amount: Option<Decimal>,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationReport {
    pub venues: Vec<VenueReconciliation>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.venues.iter().all(|v| v.matched)
    }

    pub fn summary(&self) -> String {
        self.venues
            .iter()
            .map(|v| {
                let reported = v
                    .venue_amount
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unavailable".to_string());
                format!(
                    "{}: ledger={} venue={} {}",
                    v.venue,
                    v.ledger_amount,
                    reported,
                    if v.matched { "ok" } else { "MISMATCH" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Signed exposure the ledger's open trades imply on `venue`.
pub fn expected_exposure(trades: &[HedgePosition], venue: Venue) -> Decimal {
    trades
        .iter()
        .map(|t| match t.side(venue) {
            OrderSide::Buy => t.amount,
            OrderSide::Sell => -t.amount,
        })
        .sum()
}

/// Signed net position for `symbol` as reported by the venue.
pub fn reported_exposure(positions: &[VenuePosition], symbol: &str) -> Decimal {
    positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .map(|p| p.amount)
        .sum()
}

pub struct Reconciler {
    symbols: [String; 2],
    tolerance: Decimal,
    events: EventLog,
}

impl Reconciler {
    pub fn new(symbols: [String; 2], tolerance: Decimal, events: EventLog) -> Self {
        Self {
            symbols,
            tolerance,
            events,
        }
    }

    /// Compares ledger exposure with venue-reported positions on both venues.
    pub async fn reconcile(
        &self,
        trades: &[HedgePosition],
        clients: [&dyn VenueClient; 2],
    ) -> ReconciliationReport {
        let mut venues = Vec::with_capacity(2);

        for venue in Venue::ALL {
            let ledger_amount = expected_exposure(trades, venue);
            let reported: VenueResult<Vec<VenuePosition>> =
                clients[venue.index()].get_positions().await;

            let entry = match reported {
                Ok(positions) => {
                    let venue_amount = reported_exposure(&positions, &self.symbols[venue.index()]);
                    let matched = (venue_amount - ledger_amount).abs() <= self.tolerance;
                    if !matched {
                        self.events.record(EngineEvent::ReconciliationMismatch {
                            venue,
                            ledger_amount,
                            venue_amount,
                        });
                    }
                    VenueReconciliation {
                        venue,
                        ledger_amount,
                        venue_amount: Some(venue_amount),
                        matched,
                    }
                }
                Err(e) => {
                    // Unknown is not a mismatch; next pass will try again.
                    warn!(%venue, error = %e, "Positions unavailable for reconciliation");
                    VenueReconciliation {
                        venue,
                        ledger_amount,
                        venue_amount: None,
                        matched: true,
                    }
                }
            };
            venues.push(entry);
        }

        let report = ReconciliationReport { venues };
        if report.is_consistent() {
            info!(summary = %report.summary(), "Reconciliation passed");
        } else {
            warn!(summary = %report.summary(), "Reconciliation found mismatches");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockVenueClient, VenueError};
    use crate::strategy::group::tests::leg;
    use crate::strategy::Direction;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, amount: Decimal) -> VenuePosition {
        VenuePosition {
            symbol: symbol.to_string(),
            amount,
            entry_price: dec!(100),
        }
    }

    fn reconciler(events: &EventLog) -> Reconciler {
        Reconciler::new(
            ["BTCUSDT".to_string(), "BTCUSDT".to_string()],
            dec!(0.001),
            events.clone(),
        )
    }

    #[test]
    fn test_expected_exposure() {
        let trades = vec![
            leg("t1", Direction::LongAShortB, dec!(0.01)),
            leg("t2", Direction::LongAShortB, dec!(0.02)),
        ];
        assert_eq!(expected_exposure(&trades, Venue::A), dec!(0.03));
        assert_eq!(expected_exposure(&trades, Venue::B), dec!(-0.03));
        assert_eq!(expected_exposure(&[], Venue::A), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_matching_positions() {
        let events = EventLog::new();
        let mut a = MockVenueClient::new();
        a.expect_get_positions()
            .returning(|| Ok(vec![position("BTCUSDT", dec!(0.02)), position("ETHUSDT", dec!(1))]));
        let mut b = MockVenueClient::new();
        b.expect_get_positions()
            .returning(|| Ok(vec![position("BTCUSDT", dec!(-0.0205))]));

        let trades = vec![leg("t1", Direction::LongAShortB, dec!(0.02))];
        let report = reconciler(&events).reconcile(&trades, [&a, &b]).await;

        assert!(report.is_consistent());
        assert!(events.recent().is_empty());
    }

    #[tokio::test]
    async fn test_mismatch_is_reported_not_corrected() {
        let events = EventLog::new();
        let mut a = MockVenueClient::new();
        a.expect_get_positions().returning(|| Ok(vec![]));
        a.expect_place_order().never();
        let mut b = MockVenueClient::new();
        b.expect_get_positions()
            .returning(|| Err(VenueError::VenueUnavailable("503".into())));

        let trades = vec![leg("t1", Direction::ShortALongB, dec!(0.02))];
        let report = reconciler(&events).reconcile(&trades, [&a, &b]).await;

        assert!(!report.is_consistent());
        assert_eq!(report.venues[0].ledger_amount, dec!(-0.02));
        assert_eq!(report.venues[1].venue_amount, None);
        assert!(report.summary().contains("MISMATCH"));
        assert!(matches!(
            events.alarms()[..],
            [EngineEvent::ReconciliationMismatch { venue: Venue::A, .. }]
        ));
    }
}
