//! Race-style paired order execution with single-leg compensation.
//!
//! Both legs of a hedge are submitted concurrently. Venue failures never
//! escape this module: every call is bounded by a timeout and folded into a
//! [`LegResult`]. When exactly one leg succeeds the coordinator compensates
//! immediately and monitors the compensating order for a bounded window.
//! A compensation that cannot be confirmed is reported as a terminal alarm
//! and never retried here.

use crate::config::ExecutionConfig;
use crate::events::{EngineEvent, EventLog};
use crate::exchange::{
    OrderAck, OrderCategory, OrderRequest, OrderSide, OrderStatus, Venue, VenueClient, VenueError,
    VenueResult,
};
use crate::strategy::group::{Direction, HedgePosition};
use crate::strategy::locks::{LockGuard, OrderTypeLocks};
use crate::utils::floor_to_step;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one venue leg.
#[derive(Debug, Clone)]
pub struct LegResult {
    pub venue: Venue,
    pub success: bool,
    pub ack: Option<OrderAck>,
    pub error: Option<VenueError>,
    /// Time from race start until this leg completed.
    pub elapsed: Duration,
}

impl LegResult {
    pub fn order_id(&self) -> Option<&str> {
        self.ack.as_ref().map(|ack| ack.order_id.as_str())
    }
}

/// Outcome of a concurrent two-leg submission.
#[derive(Debug, Clone)]
pub struct RaceResult {
    /// Indexed by [`Venue::index`].
    pub results: [LegResult; 2],
    pub both_successful: bool,
    pub total_execution_time: Duration,
    /// Completion skew between the two legs.
    pub time_difference: Duration,
    pub first_completed: Venue,
}

impl RaceResult {
    pub fn leg(&self, venue: Venue) -> &LegResult {
        &self.results[venue.index()]
    }

    /// `(succeeded, failed)` when exactly one leg went through.
    pub fn single_leg(&self) -> Option<(&LegResult, &LegResult)> {
        let [a, b] = &self.results;
        match (a.success, b.success) {
            (true, false) => Some((a, b)),
            (false, true) => Some((b, a)),
            _ => None,
        }
    }
}

async fn timed_leg<F>(venue: Venue, leg: F, limit: Duration, started: Instant) -> LegResult
where
    F: Future<Output = VenueResult<OrderAck>>,
{
    let outcome = match tokio::time::timeout(limit, leg).await {
        Ok(outcome) => outcome,
        Err(_) => Err(VenueError::OrderTimeout(format!(
            "no acknowledgement within {}ms",
            limit.as_millis()
        ))),
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(ack) => LegResult {
            venue,
            success: true,
            ack: Some(ack),
            error: None,
            elapsed,
        },
        Err(e) => LegResult {
            venue,
            success: false,
            ack: None,
            error: Some(e),
            elapsed,
        },
    }
}

/// Runs both legs concurrently, neither waiting for the other to start.
pub async fn execute_hedged_order<FA, FB>(leg_a: FA, leg_b: FB, limit: Duration) -> RaceResult
where
    FA: Future<Output = VenueResult<OrderAck>>,
    FB: Future<Output = VenueResult<OrderAck>>,
{
    let started = Instant::now();
    let (a, b) = tokio::join!(
        timed_leg(Venue::A, leg_a, limit, started),
        timed_leg(Venue::B, leg_b, limit, started),
    );

    let time_difference = if a.elapsed > b.elapsed {
        a.elapsed - b.elapsed
    } else {
        b.elapsed - a.elapsed
    };
    let first_completed = if b.elapsed < a.elapsed {
        Venue::B
    } else {
        Venue::A
    };

    RaceResult {
        both_successful: a.success && b.success,
        total_execution_time: started.elapsed(),
        time_difference,
        first_completed,
        results: [a, b],
    }
}

/// Resolved fills of both legs.
#[derive(Debug, Clone)]
pub struct HedgeFill {
    pub order_ids: [String; 2],
    pub prices: [Decimal; 2],
    pub skew: Duration,
}

impl HedgeFill {
    pub fn order_id(&self, venue: Venue) -> &str {
        &self.order_ids[venue.index()]
    }

    pub fn price(&self, venue: Venue) -> Decimal {
        self.prices[venue.index()]
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Both legs done. For closes this includes a confirmed compensation.
    Filled(HedgeFill),
    /// Exactly one leg went through. `compensated` is false when the
    /// exposure could not be confirmed neutral within the monitor window.
    SingleLeg { filled: Venue, compensated: bool },
    /// Neither leg went through; nothing changed.
    BothFailed,
    /// A market lock was held by another operation.
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
enum PollOutcome {
    Filled(Decimal),
    Terminal(OrderStatus),
    Exhausted,
}

/// Issues paired orders across both venues.
pub struct ExecutionCoordinator {
    clients: [Arc<dyn VenueClient>; 2],
    config: ExecutionConfig,
    locks: OrderTypeLocks,
    events: EventLog,
}

impl ExecutionCoordinator {
    pub fn new(
        venue_a: Arc<dyn VenueClient>,
        venue_b: Arc<dyn VenueClient>,
        config: ExecutionConfig,
        locks: OrderTypeLocks,
        events: EventLog,
    ) -> Self {
        Self {
            clients: [venue_a, venue_b],
            config,
            locks,
            events,
        }
    }

    pub fn client(&self, venue: Venue) -> &Arc<dyn VenueClient> {
        &self.clients[venue.index()]
    }

    pub fn locks(&self) -> &OrderTypeLocks {
        &self.locks
    }

    /// Bounds any venue call by the configured leg timeout.
    pub async fn bounded<T, F>(&self, call: F) -> VenueResult<T>
    where
        F: Future<Output = VenueResult<T>>,
    {
        let limit = self.config.leg_timeout();
        tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(VenueError::OrderTimeout(format!(
                "no response within {}ms",
                limit.as_millis()
            )))
        })
    }

    fn acquire_market_pair(&self) -> Option<[LockGuard; 2]> {
        let a = self.locks.acquire_guard(Venue::A, OrderCategory::Market)?;
        let b = self.locks.acquire_guard(Venue::B, OrderCategory::Market)?;
        Some([a, b])
    }

    async fn race(&self, request_a: OrderRequest, request_b: OrderRequest) -> RaceResult {
        let client_a = self.client(Venue::A).clone();
        let client_b = self.client(Venue::B).clone();
        execute_hedged_order(
            async move { client_a.place_order(request_a).await },
            async move { client_b.place_order(request_b).await },
            self.config.leg_timeout(),
        )
        .await
    }

    /// Opens one hedge unit in `direction`. `quoted` holds the prices used at
    /// submission time, indexed by venue, for fill-price fallback.
    #[instrument(skip(self, quoted))]
    pub async fn open_unit(
        &self,
        direction: Direction,
        amount: Decimal,
        quoted: [Decimal; 2],
    ) -> ExecutionOutcome {
        let Some(guards) = self.acquire_market_pair() else {
            return ExecutionOutcome::Busy;
        };

        let quantity = floor_to_step(amount, self.config.qty_step);
        let race = self
            .race(
                OrderRequest::market(direction.side(Venue::A), quantity),
                OrderRequest::market(direction.side(Venue::B), quantity),
            )
            .await;
        self.mark_pending(&guards, &race);

        info!(
            both_successful = race.both_successful,
            total_ms = race.total_execution_time.as_millis() as u64,
            skew_ms = race.time_difference.as_millis() as u64,
            first = %race.first_completed,
            "Open race finished"
        );

        if race.both_successful {
            return ExecutionOutcome::Filled(self.resolve_fills(&race, quoted).await);
        }

        let Some((filled, failed)) = race.single_leg() else {
            warn!(
                error_a = ?race.leg(Venue::A).error,
                error_b = ?race.leg(Venue::B).error,
                "Both open legs failed, retrying next cycle"
            );
            return ExecutionOutcome::BothFailed;
        };

        let order_id = filled.order_id().unwrap_or_default().to_string();
        self.events.record(EngineEvent::SingleLegExposure {
            filled_venue: filled.venue,
            failed_venue: failed.venue,
            order_id,
            amount: quantity,
            closing: false,
            error: failed
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        });

        let reverse = direction.side(filled.venue).opposite();
        let window = Duration::from_millis(self.config.open_monitor_window_ms);
        let compensated = self
            .compensate(filled.venue, reverse, quantity, quoted[filled.venue.index()], window)
            .await
            .is_some();

        ExecutionOutcome::SingleLeg {
            filled: filled.venue,
            compensated,
        }
    }

    /// Closes one hedge leg with reduce-only market orders on both venues.
    #[instrument(skip(self, position, quoted), fields(trade_id = %position.trade_id))]
    pub async fn close_position(
        &self,
        position: &HedgePosition,
        quoted: [Decimal; 2],
    ) -> ExecutionOutcome {
        let Some(guards) = self.acquire_market_pair() else {
            return ExecutionOutcome::Busy;
        };

        let quantity = position.amount;
        let closing_side = |venue: Venue| position.side(venue).opposite();
        let mut race = self
            .race(
                OrderRequest::market(closing_side(Venue::A), quantity).reduce_only(),
                OrderRequest::market(closing_side(Venue::B), quantity).reduce_only(),
            )
            .await;
        self.mark_pending(&guards, &race);
        self.accept_flat_legs(&mut race).await;

        info!(
            both_successful = race.both_successful,
            total_ms = race.total_execution_time.as_millis() as u64,
            skew_ms = race.time_difference.as_millis() as u64,
            "Close race finished"
        );

        if race.both_successful {
            return ExecutionOutcome::Filled(self.resolve_fills(&race, quoted).await);
        }

        let Some((filled, failed)) = race.single_leg() else {
            warn!(
                error_a = ?race.leg(Venue::A).error,
                error_b = ?race.leg(Venue::B).error,
                "Both close legs failed, retrying next cycle"
            );
            return ExecutionOutcome::BothFailed;
        };

        let ack = filled.ack.clone();
        self.events.record(EngineEvent::SingleLegExposure {
            filled_venue: filled.venue,
            failed_venue: failed.venue,
            order_id: filled.order_id().unwrap_or_default().to_string(),
            amount: quantity,
            closing: true,
            error: failed
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        });

        // The closed leg is flat. Finish the other leg instead of reopening.
        let (filled_venue, failed_venue) = (filled.venue, failed.venue);
        let window = Duration::from_millis(self.config.close_monitor_window_ms);
        let Some((comp_id, comp_price)) = self
            .compensate(
                failed_venue,
                closing_side(failed_venue),
                quantity,
                quoted[failed_venue.index()],
                window,
            )
            .await
        else {
            return ExecutionOutcome::SingleLeg {
                filled: filled_venue,
                compensated: false,
            };
        };

        let mut order_ids: [String; 2] = Default::default();
        let mut prices = [Decimal::ZERO; 2];
        if let Some(ack) = ack {
            prices[filled_venue.index()] = self
                .resolve_fill_price(filled_venue, &ack, quoted[filled_venue.index()])
                .await;
            order_ids[filled_venue.index()] = ack.order_id;
        }
        order_ids[failed_venue.index()] = comp_id;
        prices[failed_venue.index()] = comp_price;

        ExecutionOutcome::Filled(HedgeFill {
            order_ids,
            prices,
            skew: race.time_difference,
        })
    }

    /// A reduce-only leg refused by a venue holding nothing to reduce was
    /// already closed, usually by a protective order. Counts it as done.
    async fn accept_flat_legs(&self, race: &mut RaceResult) {
        for venue in Venue::ALL {
            let leg = race.leg(venue);
            let refused = leg.error.as_ref().is_some_and(|e| !e.is_transient());
            if !refused || !self.is_flat(venue).await {
                continue;
            }
            warn!(%venue, error = ?leg.error, "Close refused on a flat venue, leg already closed");
            let leg = &mut race.results[venue.index()];
            leg.success = true;
            leg.error = None;
        }
        race.both_successful = race.results.iter().all(|leg| leg.success);
    }

    /// Whether `venue` reports no open position. Unknown counts as not flat.
    async fn is_flat(&self, venue: Venue) -> bool {
        match self.bounded(self.client(venue).get_positions()).await {
            Ok(positions) => positions.iter().all(|p| p.amount.is_zero()),
            Err(e) => {
                warn!(%venue, error = %e, "Positions unavailable");
                false
            }
        }
    }

    /// Closes whatever `venue` still holds with a reduce-only market order,
    /// after a protective order closed the other venue. A venue that is
    /// already flat is reported closed at `fallback` with no order id.
    #[instrument(skip(self))]
    pub async fn flatten(
        &self,
        venue: Venue,
        side: OrderSide,
        quantity: Decimal,
        fallback: Decimal,
    ) -> Option<(String, Decimal)> {
        if self.is_flat(venue).await {
            info!(%venue, "Venue already flat");
            return Some((String::new(), fallback));
        }
        let Some(_guard) = self.locks.acquire_guard(venue, OrderCategory::Market) else {
            error!(%venue, "Market lock held, cannot flatten");
            return None;
        };
        let window = Duration::from_millis(self.config.close_monitor_window_ms);
        self.compensate(venue, side, quantity, fallback, window).await
    }

    fn mark_pending(&self, guards: &[LockGuard; 2], race: &RaceResult) {
        for venue in Venue::ALL {
            if let Some(order_id) = race.leg(venue).order_id() {
                guards[venue.index()].set_pending(order_id);
            }
        }
    }

    async fn resolve_fills(&self, race: &RaceResult, quoted: [Decimal; 2]) -> HedgeFill {
        let ack_a = race.leg(Venue::A).ack.clone();
        let ack_b = race.leg(Venue::B).ack.clone();

        let (price_a, price_b) = tokio::join!(
            self.resolve_optional(Venue::A, ack_a.as_ref(), quoted[0]),
            self.resolve_optional(Venue::B, ack_b.as_ref(), quoted[1]),
        );

        HedgeFill {
            order_ids: [
                ack_a.map(|a| a.order_id).unwrap_or_default(),
                ack_b.map(|a| a.order_id).unwrap_or_default(),
            ],
            prices: [price_a, price_b],
            skew: race.time_difference,
        }
    }

    async fn resolve_optional(
        &self,
        venue: Venue,
        ack: Option<&OrderAck>,
        fallback: Decimal,
    ) -> Decimal {
        match ack {
            Some(ack) => self.resolve_fill_price(venue, ack, fallback).await,
            None => fallback,
        }
    }

    /// Average fill price, re-reading the order once after a short delay when
    /// the acknowledgement carried a zero placeholder.
    pub async fn resolve_fill_price(
        &self,
        venue: Venue,
        ack: &OrderAck,
        fallback: Decimal,
    ) -> Decimal {
        if let Some(price) = ack.avg_price.filter(|p| *p > Decimal::ZERO) {
            return price;
        }

        tokio::time::sleep(self.config.fill_poll_delay()).await;
        let client = self.client(venue);
        match self.bounded(client.get_order_status(&ack.order_id)).await {
            Ok(report) if report.avg_price > Decimal::ZERO => report.avg_price,
            Ok(report) => {
                warn!(
                    %venue,
                    order_id = %ack.order_id,
                    status = ?report.status,
                    %fallback,
                    "Average price still zero, using quoted price"
                );
                fallback
            }
            Err(e) => {
                warn!(
                    %venue,
                    order_id = %ack.order_id,
                    error = %e,
                    %fallback,
                    "Order status unavailable, using quoted price"
                );
                fallback
            }
        }
    }

    /// Places a reduce-only market order on `venue` and monitors it for at
    /// most `window`. Returns the order id and fill price once confirmed.
    async fn compensate(
        &self,
        venue: Venue,
        side: OrderSide,
        quantity: Decimal,
        fallback: Decimal,
        window: Duration,
    ) -> Option<(String, Decimal)> {
        error!(%venue, %side, %quantity, "Single-leg exposure, placing compensating order");

        let request = OrderRequest::market(side, quantity).reduce_only();
        let client = self.client(venue);
        let ack = match self.bounded(client.place_order(request)).await {
            Ok(ack) => ack,
            Err(e) => {
                self.events.record(EngineEvent::CompensationFailed {
                    venue,
                    detail: format!("compensating order not accepted: {e}"),
                });
                return None;
            }
        };

        let confirmed_price = if ack.status == OrderStatus::Filled {
            Some(self.resolve_fill_price(venue, &ack, fallback).await)
        } else {
            match self.await_fill(venue, &ack.order_id, window).await {
                PollOutcome::Filled(price) if price > Decimal::ZERO => Some(price),
                PollOutcome::Filled(_) => Some(fallback),
                PollOutcome::Terminal(status) => {
                    self.events.record(EngineEvent::CompensationFailed {
                        venue,
                        detail: format!("compensating order {} ended {:?}", ack.order_id, status),
                    });
                    None
                }
                PollOutcome::Exhausted => {
                    self.events.record(EngineEvent::CompensationFailed {
                        venue,
                        detail: format!(
                            "compensating order {} unconfirmed after {}ms",
                            ack.order_id,
                            window.as_millis()
                        ),
                    });
                    None
                }
            }
        };

        let price = confirmed_price?;
        self.events.record(EngineEvent::CompensationConfirmed {
            venue,
            order_id: ack.order_id.clone(),
        });
        Some((ack.order_id, price))
    }

    /// Polls an order at a fixed interval until filled, terminal, or the
    /// window is spent.
    async fn await_fill(&self, venue: Venue, order_id: &str, window: Duration) -> PollOutcome {
        let interval = self.config.monitor_poll_interval();
        let attempts = (window.as_millis() / interval.as_millis().max(1)).max(1) as u32;
        let client = self.client(venue);

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            match self.bounded(client.get_order_status(order_id)).await {
                Ok(report) => {
                    self.locks
                        .observe(venue, OrderCategory::Market, order_id, report.status);
                    match report.status {
                        OrderStatus::Filled => return PollOutcome::Filled(report.avg_price),
                        status if status.is_terminal() => return PollOutcome::Terminal(status),
                        status => {
                            debug!(%venue, %order_id, attempt, ?status, "Order still working")
                        }
                    }
                }
                Err(e) => debug!(%venue, %order_id, attempt, error = %e, "Status poll failed"),
            }
        }

        PollOutcome::Exhausted
    }

    /// Cancels every resting stop and trailing order on both venues.
    pub async fn cancel_protective_orders(&self) {
        for venue in Venue::ALL {
            for category in [OrderCategory::StopMarket, OrderCategory::TrailingStopMarket] {
                let client = self.client(venue);
                match self.bounded(client.cancel_orders_by_type(category)).await {
                    Ok(0) => {}
                    Ok(count) => info!(%venue, %category, count, "Cancelled protective orders"),
                    Err(e) => {
                        warn!(%venue, %category, error = %e, "Failed to cancel protective orders")
                    }
                }
            }
        }
    }
}
