//! Stop-loss and trailing-stop lifecycle for an open hedge group.
//!
//! Each venue's side of the group is protected independently. Every cycle the
//! manager derives the desired protective orders from the amount-weighted
//! entry, compares them with what is resting on the venue, and creates,
//! replaces or leaves them alone. Stops only ever tighten. A leg whose
//! unrealized loss crosses the loss limit trips the circuit breaker, which
//! forces a market close of the whole group regardless of spread.
//!
//! The manager remembers the protective orders it placed or adopted and polls
//! them each cycle. A filled one means that venue's side is already closed,
//! and the engine must close the other side rather than wait for the spread.

use crate::config::ProtectionConfig;
use crate::events::{EngineEvent, EventLog};
use crate::exchange::{OpenOrder, OrderCategory, OrderRequest, OrderSide, OrderStatus, Venue};
use crate::feed::PriceQuote;
use crate::strategy::locks::cancel_duplicates;
use crate::strategy::{ExecutionCoordinator, HedgeGroup};
use crate::utils::{floor_to_step, safe_div};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// One venue's aggregated side of the hedge group.
#[derive(Debug, Clone, PartialEq)]
pub struct LegExposure {
    pub venue: Venue,
    /// `Buy` for a long position, `Sell` for a short one.
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub market_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Desired protective order, recomputed every cycle and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveOrderSpec {
    pub venue: Venue,
    pub side: OrderSide,
    pub category: OrderCategory,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
}

/// A protective order the venue reports filled.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveFill {
    pub venue: Venue,
    pub category: OrderCategory,
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionVerdict {
    Healthy,
    /// A leg breached the loss limit; close everything now.
    ForceClose { venue: Venue, unrealized_pnl: Decimal },
}

pub fn unrealized_pnl(
    side: OrderSide,
    entry: Decimal,
    market: Decimal,
    quantity: Decimal,
) -> Decimal {
    match side {
        OrderSide::Buy => (market - entry) * quantity,
        OrderSide::Sell => (entry - market) * quantity,
    }
}

/// Price at which the position has lost `loss` in quote currency.
pub fn stop_loss_price(
    side: OrderSide,
    entry: Decimal,
    loss: Decimal,
    quantity: Decimal,
) -> Decimal {
    let distance = safe_div(loss, quantity);
    match side {
        OrderSide::Buy => entry - distance,
        OrderSide::Sell => entry + distance,
    }
}

/// Price at which the position has gained `profit` in quote currency.
pub fn trailing_activation_price(
    side: OrderSide,
    entry: Decimal,
    profit: Decimal,
    quantity: Decimal,
) -> Decimal {
    let distance = safe_div(profit, quantity);
    match side {
        OrderSide::Buy => entry + distance,
        OrderSide::Sell => entry - distance,
    }
}

/// A closing trigger must sit on the far side of the market: below it for a
/// sell, above it for a buy. Anything else would fire immediately.
pub fn is_valid_trigger(closing_side: OrderSide, trigger: Decimal, market: Decimal) -> bool {
    match closing_side {
        OrderSide::Sell => trigger < market,
        OrderSide::Buy => trigger > market,
    }
}

/// The more protective of two stop prices for a position on `side`.
pub fn tighter_stop(side: OrderSide, a: Decimal, b: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => a.max(b),
        OrderSide::Sell => a.min(b),
    }
}

/// Aggregates the group per venue. Venues without a quote are skipped.
pub fn leg_exposures(group: &HedgeGroup, quotes: &[Option<PriceQuote>; 2]) -> Vec<LegExposure> {
    let Some(direction) = group.direction() else {
        return Vec::new();
    };
    let quantity = group.total_amount();

    Venue::ALL
        .into_iter()
        .filter_map(|venue| {
            let quote = quotes[venue.index()]?;
            let side = direction.side(venue);
            let entry_price = group.average_entry(venue);
            Some(LegExposure {
                venue,
                side,
                quantity,
                entry_price,
                market_price: quote.last_price,
                unrealized_pnl: unrealized_pnl(side, entry_price, quote.last_price, quantity),
            })
        })
        .collect()
}

const PROTECTIVE: [OrderCategory; 2] = [
    OrderCategory::StopMarket,
    OrderCategory::TrailingStopMarket,
];

fn slot(category: OrderCategory) -> usize {
    match category {
        OrderCategory::TrailingStopMarket => 1,
        _ => 0,
    }
}

pub struct ProtectiveOrderManager {
    config: ProtectionConfig,
    price_tick: Decimal,
    events: EventLog,
    /// Most protective stop placed per venue since the group opened.
    ratchet: [Option<Decimal>; 2],
    /// Working protective order ids, by venue then stop/trailing slot.
    working: [[Option<String>; 2]; 2],
}

impl ProtectiveOrderManager {
    pub fn new(config: ProtectionConfig, price_tick: Decimal, events: EventLog) -> Self {
        Self {
            config,
            price_tick,
            events,
            ratchet: [None, None],
            working: Default::default(),
        }
    }

    /// Forgets ratchet state and working orders once the group is flat.
    pub fn reset(&mut self) {
        self.ratchet = [None, None];
        self.working = Default::default();
    }

    pub fn working_order(&self, venue: Venue, category: OrderCategory) -> Option<&str> {
        self.working[venue.index()][slot(category)].as_deref()
    }

    fn set_working(&mut self, venue: Venue, category: OrderCategory, order_id: Option<String>) {
        self.working[venue.index()][slot(category)] = order_id;
    }

    /// Polls every working protective order. Returns the first one the venue
    /// reports filled. Orders that ended any other way are forgotten so the
    /// next maintenance pass replaces them.
    pub async fn check_fills(
        &mut self,
        coordinator: &ExecutionCoordinator,
    ) -> Option<ProtectiveFill> {
        for venue in Venue::ALL {
            for category in PROTECTIVE {
                let Some(order_id) = self.working_order(venue, category).map(str::to_string)
                else {
                    continue;
                };
                let client = coordinator.client(venue);
                let status = coordinator.bounded(client.get_order_status(&order_id)).await;
                let report = match status {
                    Ok(report) => report,
                    Err(e) => {
                        debug!(%venue, %order_id, error = %e, "Protective status unavailable");
                        continue;
                    }
                };

                match report.status {
                    OrderStatus::Filled => {
                        self.set_working(venue, category, None);
                        self.events.record(EngineEvent::ProtectiveOrderFilled {
                            venue,
                            category,
                            order_id: order_id.clone(),
                            price: report.avg_price,
                        });
                        return Some(ProtectiveFill {
                            venue,
                            category,
                            order_id,
                            price: report.avg_price,
                            quantity: report.executed_qty,
                        });
                    }
                    status if status.is_terminal() => {
                        debug!(%venue, %category, %order_id, ?status, "Protective order gone");
                        self.set_working(venue, category, None);
                    }
                    _ => {}
                }
            }
        }
        None
    }

    pub fn ratchet_level(&self, venue: Venue) -> Option<Decimal> {
        self.ratchet[venue.index()]
    }

    /// Circuit breaker check.
    pub fn assess(
        &self,
        group: &HedgeGroup,
        quotes: &[Option<PriceQuote>; 2],
    ) -> ProtectionVerdict {
        for exposure in leg_exposures(group, quotes) {
            if exposure.unrealized_pnl < -self.config.loss_limit {
                error!(
                    venue = %exposure.venue,
                    pnl = %exposure.unrealized_pnl,
                    entry = %exposure.entry_price,
                    market = %exposure.market_price,
                    "Loss limit breached, forcing close"
                );
                self.events.record(EngineEvent::CircuitBreaker {
                    venue: exposure.venue,
                    unrealized_pnl: exposure.unrealized_pnl,
                    loss_limit: self.config.loss_limit,
                });
                return ProtectionVerdict::ForceClose {
                    venue: exposure.venue,
                    unrealized_pnl: exposure.unrealized_pnl,
                };
            }
        }
        ProtectionVerdict::Healthy
    }

    /// Stop for `exposure`, given the stop currently resting on the venue.
    pub fn desired_stop(
        &self,
        exposure: &LegExposure,
        live: Option<Decimal>,
    ) -> ProtectiveOrderSpec {
        let target = if exposure.unrealized_pnl > self.config.profit_bootstrap {
            // Breakeven plus buffer is the same formula with a negative loss.
            stop_loss_price(
                exposure.side,
                exposure.entry_price,
                -self.config.breakeven_buffer,
                exposure.quantity,
            )
        } else {
            stop_loss_price(
                exposure.side,
                exposure.entry_price,
                self.config.loss_limit,
                exposure.quantity,
            )
        };
        let mut trigger = floor_to_step(target, self.price_tick);

        for seen in [live, self.ratchet[exposure.venue.index()]].into_iter().flatten() {
            trigger = tighter_stop(exposure.side, trigger, seen);
        }

        ProtectiveOrderSpec {
            venue: exposure.venue,
            side: exposure.side.opposite(),
            category: OrderCategory::StopMarket,
            trigger_price: trigger,
            quantity: exposure.quantity,
        }
    }

    pub fn desired_trailing(&self, exposure: &LegExposure) -> ProtectiveOrderSpec {
        let activation = trailing_activation_price(
            exposure.side,
            exposure.entry_price,
            self.config.trailing_profit,
            exposure.quantity,
        );
        ProtectiveOrderSpec {
            venue: exposure.venue,
            side: exposure.side.opposite(),
            category: OrderCategory::TrailingStopMarket,
            trigger_price: floor_to_step(activation, self.price_tick),
            quantity: exposure.quantity,
        }
    }

    /// Places or replaces protective orders so they match the group.
    pub async fn maintain(
        &mut self,
        coordinator: &ExecutionCoordinator,
        group: &HedgeGroup,
        quotes: &[Option<PriceQuote>; 2],
    ) {
        if !self.config.enabled {
            return;
        }

        for exposure in leg_exposures(group, quotes) {
            let venue = exposure.venue;
            let closing = exposure.side.opposite();
            let client = coordinator.client(venue).as_ref();

            let open = match coordinator
                .bounded(cancel_duplicates(
                    client,
                    venue,
                    OrderCategory::StopMarket,
                    closing,
                    &self.events,
                ))
                .await
            {
                Ok(open) => open,
                Err(e) => {
                    warn!(%venue, error = %e, "Open orders unavailable, skipping protection");
                    continue;
                }
            };
            self.maintain_stop(coordinator, &exposure, &open).await;

            let open = match coordinator
                .bounded(cancel_duplicates(
                    client,
                    venue,
                    OrderCategory::TrailingStopMarket,
                    closing,
                    &self.events,
                ))
                .await
            {
                Ok(open) => open,
                Err(e) => {
                    warn!(%venue, error = %e, "Open orders unavailable, skipping trailing stop");
                    continue;
                }
            };
            self.maintain_trailing(coordinator, &exposure, &open).await;
        }
    }

    async fn maintain_stop(
        &mut self,
        coordinator: &ExecutionCoordinator,
        exposure: &LegExposure,
        open: &[OpenOrder],
    ) {
        let venue = exposure.venue;
        let live = find_live(open, OrderCategory::StopMarket, exposure.side.opposite());
        let live_price = live.and_then(|o| o.stop_price);
        let spec = self.desired_stop(exposure, live_price);

        if let (Some(order), Some(price)) = (live, live_price) {
            let drift = (price - spec.trigger_price).abs();
            if drift <= self.config.stop_replace_tolerance && order.quantity == spec.quantity {
                debug!(%venue, stop = %price, "Stop already in place");
                self.ratchet[venue.index()] = Some(spec.trigger_price);
                let order_id = Some(order.order_id.clone());
                self.set_working(venue, OrderCategory::StopMarket, order_id);
                return;
            }
        }

        if !self.validate(&spec, exposure.market_price) {
            return;
        }

        if self.place(coordinator, &spec, live).await {
            self.ratchet[venue.index()] = Some(spec.trigger_price);
            match live_price {
                Some(from) => self.events.record(EngineEvent::StopMoved {
                    venue,
                    from,
                    to: spec.trigger_price,
                }),
                None => self.events.record(EngineEvent::StopPlaced {
                    venue,
                    side: spec.side,
                    trigger_price: spec.trigger_price,
                    quantity: spec.quantity,
                }),
            }
        }
    }

    async fn maintain_trailing(
        &mut self,
        coordinator: &ExecutionCoordinator,
        exposure: &LegExposure,
        open: &[OpenOrder],
    ) {
        let live = find_live(open, OrderCategory::TrailingStopMarket, exposure.side.opposite());
        let spec = self.desired_trailing(exposure);

        // A working trailing stop is never chased; only a size change replaces it.
        if let Some(order) = live.filter(|order| order.quantity == spec.quantity) {
            let order_id = Some(order.order_id.clone());
            self.set_working(exposure.venue, OrderCategory::TrailingStopMarket, order_id);
            return;
        }

        // Activation must still lie ahead of the market.
        if !is_valid_trigger(spec.side.opposite(), spec.trigger_price, exposure.market_price) {
            debug!(
                venue = %spec.venue,
                activation = %spec.trigger_price,
                market = %exposure.market_price,
                "Trailing activation already passed, skipping"
            );
            return;
        }

        if self.place(coordinator, &spec, live).await {
            self.events.record(EngineEvent::TrailingPlaced {
                venue: spec.venue,
                activation_price: spec.trigger_price,
                callback_rate: self.config.trailing_callback_rate,
            });
        }
    }

    fn validate(&self, spec: &ProtectiveOrderSpec, market: Decimal) -> bool {
        if is_valid_trigger(spec.side, spec.trigger_price, market) {
            return true;
        }
        error!(
            venue = %spec.venue,
            category = %spec.category,
            side = %spec.side,
            trigger = %spec.trigger_price,
            %market,
            "Protective order would trigger immediately, refusing"
        );
        self.events.record(EngineEvent::ProtectiveOrderRefused {
            venue: spec.venue,
            category: spec.category,
            trigger_price: spec.trigger_price,
            market_price: market,
        });
        false
    }

    /// Replaces `live` with an order matching `spec` under the category lock.
    async fn place(
        &mut self,
        coordinator: &ExecutionCoordinator,
        spec: &ProtectiveOrderSpec,
        live: Option<&OpenOrder>,
    ) -> bool {
        let Some(guard) = coordinator.locks().acquire_guard(spec.venue, spec.category) else {
            return false;
        };
        let client = coordinator.client(spec.venue);

        if let Some(order) = live {
            if let Err(e) = coordinator.bounded(client.cancel_order(&order.order_id)).await {
                warn!(
                    venue = %spec.venue,
                    order_id = %order.order_id,
                    error = %e,
                    "Failed to cancel old protective order"
                );
                return false;
            }
            self.set_working(spec.venue, spec.category, None);
        }

        let request = match spec.category {
            OrderCategory::TrailingStopMarket => OrderRequest::trailing_stop(
                spec.side,
                spec.quantity,
                spec.trigger_price,
                self.config.trailing_callback_rate,
            ),
            _ => OrderRequest::stop_market(spec.side, spec.quantity, spec.trigger_price),
        };

        match coordinator.bounded(client.place_order(request)).await {
            Ok(ack) => {
                guard.set_pending(&ack.order_id);
                info!(
                    venue = %spec.venue,
                    category = %spec.category,
                    trigger = %spec.trigger_price,
                    quantity = %spec.quantity,
                    order_id = %ack.order_id,
                    "Protective order placed"
                );
                self.set_working(spec.venue, spec.category, Some(ack.order_id));
                true
            }
            Err(e) => {
                warn!(
                    venue = %spec.venue,
                    category = %spec.category,
                    error = %e,
                    "Protective order failed"
                );
                false
            }
        }
    }
}

fn find_live(
    open: &[OpenOrder],
    category: OrderCategory,
    side: OrderSide,
) -> Option<&OpenOrder> {
    open.iter()
        .filter(|o| o.category == category && o.side == side)
        .max_by_key(|o| o.placement_key())
}
