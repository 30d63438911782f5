//! The evaluation loop tying feeds, signals, execution, protection and the
//! ledger together.
//!
//! One cycle runs at a time. A cycle that starts while another is still in
//! flight returns immediately. Feeds are only read here; they never trigger
//! trading on their own. The ledger is written only after both legs of a race
//! are confirmed, so it never records exposure that was compensated away.

use crate::config::Config;
use crate::events::{EngineEvent, EventLog};
use crate::exchange::{OrderSide, Venue, VenueClient};
use crate::feed::{PriceFeed, PriceQuote};
use crate::persistence::{CloseRecord, OpenRecord, PositionLedger};
use crate::risk::{
    ProtectionVerdict, ProtectiveFill, ProtectiveOrderManager, ReconciliationReport, Reconciler,
};
use crate::strategy::executor::{ExecutionCoordinator, ExecutionOutcome, HedgeFill};
use crate::strategy::group::{Direction, HedgeGroup, HedgePosition};
use crate::strategy::locks::OrderTypeLocks;
use crate::strategy::signal::{spread, Signal, SignalEvaluator};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one evaluation cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was still running.
    InFlight,
    /// Order issuance is latched off after unresolved single-leg exposure.
    Halted,
    NoQuotes,
    Hold,
    Opened { trade_id: String },
    Closed { closed: usize, remaining: usize },
    ForceClosed { closed: usize, remaining: usize },
    /// A protective order closed `venue`; the other venue was flattened.
    ProtectiveExit { venue: Venue, closed: usize },
    /// The venues rejected or timed out; nothing persisted. Retried next cycle.
    ExecutionFailed,
    Error(String),
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HedgeEngine {
    config: Config,
    feeds: [Arc<PriceFeed>; 2],
    coordinator: ExecutionCoordinator,
    evaluator: SignalEvaluator,
    protection: Mutex<ProtectiveOrderManager>,
    group: Mutex<HedgeGroup>,
    ledger: parking_lot::Mutex<PositionLedger>,
    reconciler: Reconciler,
    in_flight: AtomicBool,
    halted: AtomicBool,
    events: EventLog,
}

impl HedgeEngine {
    /// Builds the engine and restores the open group from the ledger.
    /// Fails when the ledger's open trades disagree on direction.
    pub fn new(
        config: Config,
        clients: [Arc<dyn VenueClient>; 2],
        feeds: [Arc<PriceFeed>; 2],
        ledger: PositionLedger,
        events: EventLog,
    ) -> Result<Self> {
        let open = ledger.get_open_trades()?;
        let group = HedgeGroup::from_open_trades(open)
            .context("Ledger holds open trades in both directions")?;
        if !group.is_empty() {
            info!(
                legs = group.legs().len(),
                direction = ?group.direction(),
                amount = %group.total_amount(),
                "Restored open hedge group from ledger"
            );
        }

        let [client_a, client_b] = clients;
        let locks = OrderTypeLocks::new(config.execution.lock_timeout(), events.clone());
        let coordinator = ExecutionCoordinator::new(
            client_a,
            client_b,
            config.execution.clone(),
            locks,
            events.clone(),
        );
        let protection = ProtectiveOrderManager::new(
            config.protection.clone(),
            config.execution.price_tick,
            events.clone(),
        );
        let reconciler = Reconciler::new(
            [config.venue_a.symbol.clone(), config.venue_b.symbol.clone()],
            config.persistence.reconcile_tolerance,
            events.clone(),
        );

        Ok(Self {
            evaluator: SignalEvaluator::new(config.strategy.clone()),
            feeds,
            coordinator,
            protection: Mutex::new(protection),
            group: Mutex::new(group),
            ledger: parking_lot::Mutex::new(ledger),
            reconciler,
            in_flight: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            events,
            config,
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub async fn group(&self) -> HedgeGroup {
        self.group.lock().await.clone()
    }

    pub fn ledger_report(&self) -> Result<String> {
        self.ledger.lock().report()
    }

    fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!(%reason, "Order issuance halted until operator intervention");
        }
    }

    /// One evaluation cycle. Never runs concurrently with itself.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_flight) = InFlight::enter(&self.in_flight) else {
            debug!("Previous cycle still running, skipping");
            return CycleOutcome::InFlight;
        };
        if self.is_halted() {
            return CycleOutcome::Halted;
        }

        match self.cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Evaluation cycle failed");
                CycleOutcome::Error(e.to_string())
            }
        }
    }

    async fn cycle(&self) -> Result<CycleOutcome> {
        let quotes = self.quotes().await;
        let mut group = self.group.lock().await;

        if !group.is_empty() {
            let fill = self.protection.lock().await.check_fills(&self.coordinator).await;
            if let Some(fill) = fill {
                let outcome = self.exit_after_protective_fill(&mut group, fill, &quotes).await?;
                self.after_cycle(&group, &quotes).await;
                return Ok(outcome);
            }

            let verdict = self.protection.lock().await.assess(&group, &quotes);
            if let ProtectionVerdict::ForceClose { venue, unrealized_pnl } = verdict {
                warn!(%venue, pnl = %unrealized_pnl, "Circuit breaker tripped, closing all legs");
                self.coordinator.cancel_protective_orders().await;
                let outcome = self.close_all(&mut group, true).await?;
                self.after_cycle(&group, &quotes).await;
                return Ok(outcome);
            }
        }

        let signal = self
            .evaluator
            .evaluate(&group, quotes[0].as_ref(), quotes[1].as_ref());
        debug!(?signal, legs = group.legs().len(), "Signal evaluated");

        let outcome = match signal {
            Signal::None if quotes.iter().any(Option::is_none) => CycleOutcome::NoQuotes,
            Signal::None => CycleOutcome::Hold,
            Signal::Open { direction, spread } | Signal::Add { direction, spread } => {
                self.open(&mut group, direction, spread, &quotes).await?
            }
            Signal::CloseAll { spread } => {
                info!(%spread, legs = group.legs().len(), "Spread collapsed, closing all legs");
                self.close_all(&mut group, false).await?
            }
        };

        self.after_cycle(&group, &quotes).await;
        Ok(outcome)
    }

    async fn after_cycle(&self, group: &HedgeGroup, quotes: &[Option<PriceQuote>; 2]) {
        if self.is_halted() {
            return;
        }
        let mut protection = self.protection.lock().await;
        if group.is_empty() {
            protection.reset();
        } else {
            protection.maintain(&self.coordinator, group, quotes).await;
        }
    }

    /// Valid quotes for both venues, falling back to one REST ticker read
    /// for a venue whose push feed is invalid.
    async fn quotes(&self) -> [Option<PriceQuote>; 2] {
        let mut quotes = [None, None];
        for venue in Venue::ALL {
            let feed = &self.feeds[venue.index()];
            quotes[venue.index()] = match feed.read() {
                Some(quote) => Some(quote),
                None if self.config.strategy.rest_price_fallback => {
                    let client = self.coordinator.client(venue);
                    match self.coordinator.bounded(client.fetch_ticker()).await {
                        Ok(ticker) => {
                            let quote = PriceQuote::from_ticker(ticker);
                            debug!(%venue, mid = %quote.mid(), "Using REST ticker fallback");
                            quote.valid.then_some(quote)
                        }
                        Err(e) => {
                            debug!(%venue, error = %e, "REST ticker fallback failed");
                            None
                        }
                    }
                }
                None => None,
            };
        }
        quotes
    }

    async fn open(
        &self,
        group: &mut HedgeGroup,
        direction: Direction,
        spread: Decimal,
        quotes: &[Option<PriceQuote>; 2],
    ) -> Result<CycleOutcome> {
        let strategy = &self.config.strategy;

        // Never open while the ledger holds exposure the group does not know.
        let ledger_open = self.ledger.lock().open_count()?;
        if ledger_open != group.legs().len() {
            warn!(
                ledger_open,
                group_legs = group.legs().len(),
                "Ledger and group disagree, refusing to open"
            );
            return Ok(CycleOutcome::Hold);
        }
        if !group.has_capacity(strategy.unit_amount, strategy.max_legs, strategy.max_size) {
            return Ok(CycleOutcome::Hold);
        }

        let quoted = entry_quotes(direction, quotes);
        let outcome = self
            .coordinator
            .open_unit(direction, strategy.unit_amount, quoted)
            .await;

        match outcome {
            ExecutionOutcome::Filled(fill) => {
                let position = self.ledger.lock().record_open(&OpenRecord {
                    direction,
                    amount: strategy.unit_amount,
                    price_a: fill.price(Venue::A),
                    price_b: fill.price(Venue::B),
                    order_id_a: fill.order_id(Venue::A).to_string(),
                    order_id_b: fill.order_id(Venue::B).to_string(),
                    spread,
                })?;
                let trade_id = position.trade_id.clone();
                let first = group.is_empty();
                group.push(position)?;

                if first {
                    self.events.record(EngineEvent::HedgeOpened {
                        trade_id: trade_id.clone(),
                        direction,
                        amount: strategy.unit_amount,
                        spread,
                        price_a: fill.price(Venue::A),
                        price_b: fill.price(Venue::B),
                        skew_ms: fill.skew.as_millis() as u64,
                    });
                } else {
                    self.events.record(EngineEvent::HedgeAdded {
                        trade_id: trade_id.clone(),
                        direction,
                        amount: strategy.unit_amount,
                        spread,
                        legs: group.legs().len(),
                    });
                }
                Ok(CycleOutcome::Opened { trade_id })
            }
            ExecutionOutcome::SingleLeg {
                compensated: false, ..
            } => {
                self.halt("unresolved single-leg exposure while opening");
                Ok(CycleOutcome::Halted)
            }
            ExecutionOutcome::SingleLeg { .. } | ExecutionOutcome::BothFailed => {
                Ok(CycleOutcome::ExecutionFailed)
            }
            ExecutionOutcome::Busy => Ok(CycleOutcome::Hold),
        }
    }

    /// Closes legs oldest first. Between legs of a non-forced close the
    /// spread is re-read, and the close stops if it has widened past the
    /// close threshold plus buffer.
    async fn close_all(&self, group: &mut HedgeGroup, forced: bool) -> Result<CycleOutcome> {
        let legs: Vec<HedgePosition> = group.legs().to_vec();
        let total = legs.len();
        let mut closed = 0;
        let mut stopped_at: Option<Option<Decimal>> = None;

        for leg in &legs {
            let quotes = self.quotes().await;
            if closed > 0 && !forced {
                let current = match (&quotes[0], &quotes[1]) {
                    (Some(a), Some(b)) => Some(spread(a, b)),
                    _ => None,
                };
                if !current.is_some_and(|s| self.evaluator.close_still_valid(s)) {
                    stopped_at = Some(current);
                    break;
                }
            }

            let quoted = exit_quotes(leg.direction, &quotes, leg);
            match self.coordinator.close_position(leg, quoted).await {
                ExecutionOutcome::Filled(fill) => {
                    self.settle(group, leg, &fill, spread_or_zero(&quotes), forced)?;
                    closed += 1;
                }
                ExecutionOutcome::SingleLeg { .. } => {
                    self.halt("unresolved single-leg exposure while closing");
                    return Ok(CycleOutcome::Halted);
                }
                ExecutionOutcome::BothFailed | ExecutionOutcome::Busy => {
                    warn!(trade_id = %leg.trade_id, "Close failed, retrying next cycle");
                    break;
                }
            }
        }

        let remaining = total - closed;
        if remaining > 0 && closed > 0 {
            self.events.record(EngineEvent::PartialClose {
                closed,
                remaining,
                spread: stopped_at.flatten(),
            });
        }
        if remaining == 0 {
            self.coordinator.cancel_protective_orders().await;
        }

        Ok(if forced {
            CycleOutcome::ForceClosed { closed, remaining }
        } else {
            CycleOutcome::Closed { closed, remaining }
        })
    }

    /// One venue's side of the group was closed by a protective order.
    /// Closes the other side and settles every leg against both exits.
    async fn exit_after_protective_fill(
        &self,
        group: &mut HedgeGroup,
        fill: ProtectiveFill,
        quotes: &[Option<PriceQuote>; 2],
    ) -> Result<CycleOutcome> {
        let Some(direction) = group.direction() else {
            return Ok(CycleOutcome::Hold);
        };
        let (stopped, other) = (fill.venue, fill.venue.other());
        warn!(
            venue = %stopped,
            category = %fill.category,
            price = %fill.price,
            "Protective order filled, closing the other venue"
        );
        self.coordinator.cancel_protective_orders().await;

        let exit_price = |venue: Venue| {
            let price = touch(&quotes[venue.index()], direction.side(venue).opposite());
            if price > Decimal::ZERO {
                price
            } else {
                group.average_entry(venue)
            }
        };
        let side = direction.side(other).opposite();
        let flattened = self
            .coordinator
            .flatten(other, side, group.total_amount(), exit_price(other))
            .await;
        let Some((order_id, price)) = flattened else {
            self.halt("venue left open after a protective order filled");
            return Ok(CycleOutcome::Halted);
        };

        let mut exit = HedgeFill {
            order_ids: Default::default(),
            prices: [Decimal::ZERO; 2],
            skew: Duration::ZERO,
        };
        exit.prices[stopped.index()] = if fill.price > Decimal::ZERO {
            fill.price
        } else {
            exit_price(stopped)
        };
        exit.order_ids[stopped.index()] = fill.order_id;
        exit.prices[other.index()] = price;
        exit.order_ids[other.index()] = order_id;

        let legs = group.legs().to_vec();
        for leg in &legs {
            self.settle(group, leg, &exit, spread_or_zero(quotes), true)?;
        }
        Ok(CycleOutcome::ProtectiveExit {
            venue: stopped,
            closed: legs.len(),
        })
    }

    fn settle(
        &self,
        group: &mut HedgeGroup,
        leg: &HedgePosition,
        fill: &HedgeFill,
        spread: Decimal,
        forced: bool,
    ) -> Result<()> {
        let fee = |venue: Venue, price: Decimal| {
            let rate = match venue {
                Venue::A => self.config.venue_a.taker_fee_rate,
                Venue::B => self.config.venue_b.taker_fee_rate,
            };
            rate.map(|r| r * price * leg.amount)
        };

        let record = CloseRecord {
            price_a: fill.price(Venue::A),
            price_b: fill.price(Venue::B),
            order_id_a: fill.order_id(Venue::A).to_string(),
            order_id_b: fill.order_id(Venue::B).to_string(),
            spread,
            open_fee_a: fee(Venue::A, leg.entry_price_a),
            open_fee_b: fee(Venue::B, leg.entry_price_b),
            close_fee_a: fee(Venue::A, fill.price(Venue::A)),
            close_fee_b: fee(Venue::B, fill.price(Venue::B)),
            forced,
        };

        let closed = self.ledger.lock().record_close(&leg.trade_id, &record)?;
        group.remove(&leg.trade_id);
        self.events.record(EngineEvent::HedgeClosed {
            trade_id: closed.trade_id,
            direction: closed.direction,
            gross_pnl: closed.gross_pnl,
            net_pnl: closed.net_pnl,
            forced,
        });
        Ok(())
    }

    /// Compares ledger exposure with the venues. Advisory only.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let trades = self.ledger.lock().get_open_trades()?;
        let clients = [
            self.coordinator.client(Venue::A).as_ref(),
            self.coordinator.client(Venue::B).as_ref(),
        ];
        Ok(self.reconciler.reconcile(&trades, clients).await)
    }

    /// Drives evaluation cycles until `shutdown` is set. Each tick spawns a
    /// cycle; overlapping ticks are absorbed by the in-flight flag.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<()> {
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Startup reconciliation failed");
        }

        let mut evaluation = tokio::time::interval(self.config.strategy.eval_interval());
        evaluation.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let reconcile_every = Duration::from_secs(self.config.persistence.reconcile_interval_secs);
        let mut reconciliation = tokio::time::interval_at(
            tokio::time::Instant::now() + reconcile_every,
            reconcile_every,
        );
        let mut shutdown_poll = tokio::time::interval(Duration::from_millis(250));

        info!(
            interval_ms = self.config.strategy.eval_interval_ms,
            "Evaluation loop started"
        );

        loop {
            tokio::select! {
                _ = evaluation.tick() => {
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        let outcome = engine.run_cycle().await;
                        match outcome {
                            CycleOutcome::Hold
                            | CycleOutcome::NoQuotes
                            | CycleOutcome::InFlight => debug!(?outcome, "Cycle finished"),
                            _ => info!(?outcome, "Cycle finished"),
                        }
                    });
                }
                _ = reconciliation.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Periodic reconciliation failed");
                    }
                    match self.ledger_report() {
                        Ok(report) => info!("\n{}", report),
                        Err(e) => warn!(error = %e, "Ledger report failed"),
                    }
                }
                _ = shutdown_poll.tick() => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        // Let a cycle in flight finish before returning.
        while self.in_flight.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Evaluation loop stopped; open hedges remain in the ledger");
        Ok(())
    }
}

fn touch(quote: &Option<PriceQuote>, side: OrderSide) -> Decimal {
    quote
        .map(|q| match side {
            OrderSide::Buy => q.ask,
            OrderSide::Sell => q.bid,
        })
        .unwrap_or_default()
}

/// Prices an opening order would expect to pay, per venue.
fn entry_quotes(direction: Direction, quotes: &[Option<PriceQuote>; 2]) -> [Decimal; 2] {
    Venue::ALL.map(|venue| touch(&quotes[venue.index()], direction.side(venue)))
}

/// Prices a closing order would expect, falling back to the entry price.
fn exit_quotes(
    direction: Direction,
    quotes: &[Option<PriceQuote>; 2],
    leg: &HedgePosition,
) -> [Decimal; 2] {
    Venue::ALL.map(|venue| {
        let price = touch(&quotes[venue.index()], direction.side(venue).opposite());
        if price > Decimal::ZERO {
            price
        } else {
            leg.entry_price(venue)
        }
    })
}

fn spread_or_zero(quotes: &[Option<PriceQuote>; 2]) -> Decimal {
    match (&quotes[0], &quotes[1]) {
        (Some(a), Some(b)) => spread(a, b),
        _ => Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        MockVenueClient, OrderAck, OrderRequest, OrderStatus, PaperVenue, VenueError,
    };
    use crate::strategy::PositionStatus;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    struct Harness {
        engine: Arc<HedgeEngine>,
        venues: [Arc<PaperVenue>; 2],
        feeds: [Arc<PriceFeed>; 2],
    }

    impl Harness {
        async fn set_mid(&self, venue: Venue, mid: Decimal) {
            let (bid, ask) = (mid - dec!(0.01), mid + dec!(0.01));
            self.feeds[venue.index()].update(bid, ask, None);
            self.venues[venue.index()].set_quote(bid, ask).await;
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.strategy.open_threshold = dec!(0.1);
        config.strategy.close_threshold = dec!(0.03);
        config.strategy.add_step = dec!(0.05);
        config.strategy.close_recheck_buffer = dec!(0.02);
        config.strategy.max_legs = 2;
        config.strategy.unit_amount = dec!(1);
        config.strategy.max_size = dec!(2);
        config.execution.qty_step = dec!(0.001);
        config.execution.price_tick = dec!(0.01);
        config.protection.loss_limit = dec!(0.5);
        config
    }

    fn feeds() -> [Arc<PriceFeed>; 2] {
        Venue::ALL.map(|v| Arc::new(PriceFeed::new(v, Duration::from_secs(30))))
    }

    fn harness_with(config: Config, ledger: PositionLedger) -> Harness {
        let venues = [
            Arc::new(PaperVenue::new("paper-a", "BTCUSDT")),
            Arc::new(PaperVenue::new("paper-b", "BTCUSDT")),
        ];
        let feeds = feeds();
        let clients: [Arc<dyn VenueClient>; 2] = [venues[0].clone(), venues[1].clone()];
        let engine = assert_ok!(HedgeEngine::new(
            config,
            clients,
            feeds.clone(),
            ledger,
            EventLog::new()
        ));
        Harness {
            engine: Arc::new(engine),
            venues,
            feeds,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), PositionLedger::new(":memory:").unwrap())
    }

    async fn opened(h: &Harness) -> String {
        h.set_mid(Venue::A, dec!(100)).await;
        h.set_mid(Venue::B, dec!(100.15)).await;
        match h.engine.run_cycle().await {
            CycleOutcome::Opened { trade_id } => trade_id,
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wide_spread_opens_hedge() {
        let h = harness();
        opened(&h).await;

        let group = h.engine.group().await;
        assert_eq!(group.direction(), Some(Direction::LongAShortB));
        assert_eq!(group.legs()[0].spread_at_open, dec!(0.15));
        assert_eq!(group.legs()[0].entry_price_a, dec!(100.01));
        assert_eq!(group.legs()[0].entry_price_b, dec!(100.14));
        assert_eq!(h.venues[0].position().await, dec!(1));
        assert_eq!(h.venues[1].position().await, dec!(-1));
        assert!(h
            .engine
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e, EngineEvent::HedgeOpened { .. })));

        // Protection followed the new position on both venues.
        assert_eq!(h.venues[0].get_open_orders().await.unwrap().len(), 2);
        assert_eq!(h.venues[1].get_open_orders().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_or_narrow_feed_takes_no_action() {
        let mut config = config();
        config.strategy.rest_price_fallback = false;
        let h = harness_with(config, PositionLedger::new(":memory:").unwrap());

        h.set_mid(Venue::A, dec!(100)).await;
        assert_eq!(h.engine.run_cycle().await, CycleOutcome::NoQuotes);

        h.set_mid(Venue::B, dec!(100.05)).await;
        assert_eq!(h.engine.run_cycle().await, CycleOutcome::Hold);

        h.set_mid(Venue::B, dec!(100.5)).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(h.engine.run_cycle().await, CycleOutcome::NoQuotes);
        assert!(h.venues[0].placed_orders().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_fallback_when_feed_invalid() {
        let h = harness();
        h.set_mid(Venue::A, dec!(100)).await;
        // Only the paper venue knows B's price.
        h.venues[1].set_quote(dec!(100.14), dec!(100.16)).await;

        assert!(matches!(h.engine.run_cycle().await, CycleOutcome::Opened { .. }));
        assert!(h.feeds[1].read().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leg_timeout_is_compensated_and_not_persisted() {
        let h = harness();
        h.venues[1].set_latency(Duration::from_secs(60)).await;
        h.set_mid(Venue::A, dec!(100)).await;
        h.set_mid(Venue::B, dec!(100.15)).await;

        assert_eq!(h.engine.run_cycle().await, CycleOutcome::ExecutionFailed);

        let placed = h.venues[0].placed_orders().await;
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].side, OrderSide::Sell);
        assert!(placed[1].reduce_only);
        assert_eq!(h.venues[0].position().await, Decimal::ZERO);
        assert!(h.engine.group().await.is_empty());
        assert!(!assert_ok!(h.engine.ledger.lock().has_open_positions()));
        assert!(!h.engine.is_halted());
        // The market locks outlived the whole operation.
        assert!(!h
            .engine
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e, EngineEvent::LockTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_compensation_halts_issuance() {
        let mut a = MockVenueClient::new();
        a.expect_place_order()
            .withf(|r| !r.reduce_only)
            .times(1)
            .returning(|_| {
                Ok(OrderAck {
                    order_id: "a-1".into(),
                    avg_price: Some(dec!(100.01)),
                    status: OrderStatus::Filled,
                })
            });
        a.expect_place_order()
            .withf(|r| r.reduce_only)
            .times(1)
            .returning(|_| Err(VenueError::OrderRejected("margin is insufficient".into())));
        let mut b = MockVenueClient::new();
        b.expect_place_order()
            .times(1)
            .returning(|_| Err(VenueError::VenueUnavailable("502".into())));

        let feeds = feeds();
        feeds[0].update(dec!(99.99), dec!(100.01), None);
        feeds[1].update(dec!(100.14), dec!(100.16), None);
        let clients: [Arc<dyn VenueClient>; 2] = [Arc::new(a), Arc::new(b)];
        let engine = HedgeEngine::new(
            config(),
            clients,
            feeds,
            PositionLedger::new(":memory:").unwrap(),
            EventLog::new(),
        )
        .unwrap();

        assert_eq!(engine.run_cycle().await, CycleOutcome::Halted);
        assert!(engine.is_halted());
        assert!(engine
            .events()
            .alarms()
            .iter()
            .any(|e| matches!(e, EngineEvent::CompensationFailed { venue: Venue::A, .. })));

        // Latched: no further orders, even with a signal present.
        assert_eq!(engine.run_cycle().await, CycleOutcome::Halted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapse_closes_and_records_pnl() {
        let h = harness();
        let trade_id = opened(&h).await;

        h.set_mid(Venue::A, dec!(100.05)).await;
        h.set_mid(Venue::B, dec!(100.07)).await;
        assert_eq!(
            h.engine.run_cycle().await,
            CycleOutcome::Closed {
                closed: 1,
                remaining: 0
            }
        );

        let ledger = h.engine.ledger.lock();
        assert_eq!(
            ledger.get_trade(&trade_id).unwrap().unwrap().status,
            PositionStatus::Closed
        );
        drop(ledger);
        assert_eq!(h.venues[0].position().await, Decimal::ZERO);
        assert_eq!(h.venues[1].position().await, Decimal::ZERO);
        assert!(h.venues[0].get_open_orders().await.unwrap().is_empty());

        // A: bought 100.01, sold 100.04. B: sold 100.14, bought 100.08.
        let closed = h
            .engine
            .events()
            .recent()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::HedgeClosed { gross_pnl, .. } => Some(gross_pnl),
                _ => None,
            });
        assert_eq!(closed, Some(dec!(0.09)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_forces_close() {
        // No resting stops, so the breaker is what closes the position.
        let mut config = config();
        config.protection.enabled = false;
        let h = harness_with(config, PositionLedger::new(":memory:").unwrap());
        opened(&h).await;

        // A collapses, B follows: spread stays wide but A lost 0.71.
        h.set_mid(Venue::A, dec!(99.3)).await;
        h.set_mid(Venue::B, dec!(99.45)).await;
        assert_eq!(
            h.engine.run_cycle().await,
            CycleOutcome::ForceClosed {
                closed: 1,
                remaining: 0
            }
        );
        assert!(h.engine.group().await.is_empty());
        assert!(h
            .engine
            .events()
            .recent()
            .iter()
            .any(|e| matches!(e, EngineEvent::HedgeClosed { forced: true, .. })));
    }

    fn no_exposure_alarms(engine: &HedgeEngine) -> bool {
        !engine.events().alarms().iter().any(|e| {
            matches!(
                e,
                EngineEvent::SingleLegExposure { .. } | EngineEvent::CompensationFailed { .. }
            )
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fill_on_one_venue_closes_the_other() {
        let h = harness();
        let trade_id = opened(&h).await;

        // A wicks through its 99.51 stop; only A's side is closed.
        h.set_mid(Venue::A, dec!(99.4)).await;
        assert_eq!(h.venues[0].position().await, Decimal::ZERO);
        assert_eq!(h.venues[1].position().await, dec!(-1));

        assert_eq!(
            h.engine.run_cycle().await,
            CycleOutcome::ProtectiveExit {
                venue: Venue::A,
                closed: 1
            }
        );
        assert!(!h.engine.is_halted());
        assert_eq!(h.venues[1].position().await, Decimal::ZERO);
        assert!(h.engine.group().await.is_empty());
        for venue in &h.venues {
            assert!(assert_ok!(venue.get_open_orders().await).is_empty());
        }

        let ledger = h.engine.ledger.lock();
        assert!(!assert_ok!(ledger.has_open_positions()));
        let trade = ledger.get_trade(&trade_id).unwrap().unwrap();
        assert_eq!(trade.status, PositionStatus::Closed);
        drop(ledger);

        // A: bought 100.01, stopped out at 99.39. B: sold 100.14, bought 100.16.
        let closed = h
            .engine
            .events()
            .recent()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::HedgeClosed { gross_pnl, forced, .. } => Some((gross_pnl, forced)),
                _ => None,
            });
        assert_eq!(closed, Some((dec!(-0.64), true)));
        assert!(h.engine.events().alarms().is_empty());

        // The collapse that follows finds nothing to close.
        h.set_mid(Venue::A, dec!(100.1)).await;
        h.set_mid(Venue::B, dec!(100.12)).await;
        assert_eq!(h.engine.run_cycle().await, CycleOutcome::Hold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_untracked_stop_fill_does_not_halt() {
        let mut config = config();
        config.protection.enabled = false;
        let h = harness_with(config, PositionLedger::new(":memory:").unwrap());
        opened(&h).await;

        // A stop left over from an earlier session fires on A.
        let stop = OrderRequest::stop_market(OrderSide::Sell, dec!(1), dec!(99.51));
        assert_ok!(h.venues[0].place_order(stop).await);
        h.set_mid(Venue::A, dec!(99.4)).await;
        h.set_mid(Venue::B, dec!(99.42)).await;
        assert_eq!(h.venues[0].position().await, Decimal::ZERO);

        assert_eq!(
            h.engine.run_cycle().await,
            CycleOutcome::ForceClosed {
                closed: 1,
                remaining: 0
            }
        );
        assert!(!h.engine.is_halted());
        assert_eq!(h.venues[1].position().await, Decimal::ZERO);
        assert!(!assert_ok!(h.engine.ledger.lock().has_open_positions()));
        assert!(no_exposure_alarms(&h.engine));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycles_are_rejected() {
        let h = harness();
        h.set_mid(Venue::A, dec!(100)).await;
        h.set_mid(Venue::B, dec!(100.15)).await;
        h.venues[0].set_latency(Duration::from_millis(100)).await;

        let (first, second) = tokio::join!(h.engine.run_cycle(), h.engine.run_cycle());
        assert!(matches!(first, CycleOutcome::Opened { .. }));
        assert_eq!(second, CycleOutcome::InFlight);
        assert_eq!(h.engine.group().await.legs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_when_spread_rewidens() {
        let h = harness();
        opened(&h).await;
        h.set_mid(Venue::B, dec!(100.2)).await;
        assert!(matches!(h.engine.run_cycle().await, CycleOutcome::Opened { .. }));
        assert_eq!(h.engine.group().await.legs().len(), 2);

        h.set_mid(Venue::A, dec!(100.1)).await;
        h.set_mid(Venue::B, dec!(100.12)).await;
        for venue in &h.venues {
            venue.set_latency(Duration::from_millis(100)).await;
        }

        let feed_b = h.feeds[1].clone();
        let widen = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            feed_b.update(dec!(100.29), dec!(100.31), None);
        });

        assert_eq!(
            h.engine.run_cycle().await,
            CycleOutcome::Closed {
                closed: 1,
                remaining: 1
            }
        );
        assert_ok!(widen.await);
        assert!(h.engine.events().recent().iter().any(|e| matches!(
            e,
            EngineEvent::PartialClose {
                closed: 1,
                remaining: 1,
                spread: Some(_)
            }
        )));
        assert_eq!(h.engine.group().await.legs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_restores_group_from_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let ledger = PositionLedger::new(&path).unwrap();
            ledger
                .record_open(&OpenRecord {
                    direction: Direction::ShortALongB,
                    amount: dec!(1),
                    price_a: dec!(100.15),
                    price_b: dec!(100),
                    order_id_a: "a-1".into(),
                    order_id_b: "b-1".into(),
                    spread: dec!(-0.15),
                })
                .unwrap();
        }

        let h = harness_with(config(), PositionLedger::new(&path).unwrap());
        let group = h.engine.group().await;
        assert_eq!(group.direction(), Some(Direction::ShortALongB));
        assert_eq!(group.total_amount(), dec!(1));

        // Venues are flat, so reconciliation reports both sides.
        let report = assert_ok!(h.engine.reconcile().await);
        assert!(!report.is_consistent());
        assert!(h.venues[0].placed_orders().await.is_empty());
    }
}
