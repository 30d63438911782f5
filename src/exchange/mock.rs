//! In-process paper venue.
//!
//! Fills market orders at the touch, rests stop and trailing orders until a
//! quote update crosses them, and enforces reduce-only the way a real futures
//! venue does. Failure injection hooks make single-leg and timeout paths
//! reproducible in tests and paper runs.

use super::error::{VenueError, VenueResult};
use super::traits::VenueClient;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
    avg_price: Decimal,
    executed_qty: Decimal,
    placed_at: i64,
    updated_at: i64,
    /// Best price seen since a trailing stop activated.
    trailing_extreme: Option<Decimal>,
}

#[derive(Debug, Default)]
struct PaperState {
    quote: Option<TopOfBook>,
    /// Signed net position.
    position: Decimal,
    entry_price: Decimal,
    orders: HashMap<String, PaperOrder>,
    placed: Vec<OrderRequest>,
    failures: VecDeque<VenueError>,
    unavailable: bool,
    zero_avg_price: bool,
    latency: Duration,
}

impl PaperState {
    fn apply_fill(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let before = self.position;
        let after = before + signed;

        if after.is_zero() {
            self.entry_price = Decimal::ZERO;
        } else if before.is_zero() || before.is_sign_positive() != after.is_sign_positive() {
            self.entry_price = price;
        } else if before.is_sign_positive() == signed.is_sign_positive() {
            let total = before.abs() + quantity;
            self.entry_price = (self.entry_price * before.abs() + price * quantity) / total;
        }

        self.position = after;
    }

    /// Reduce-only quantity that may actually execute, or why it may not.
    fn reducible(&self, side: OrderSide, quantity: Decimal) -> Result<Decimal, String> {
        let closes = match side {
            OrderSide::Buy => self.position < Decimal::ZERO,
            OrderSide::Sell => self.position > Decimal::ZERO,
        };
        if !closes {
            return Err("ReduceOnly Order is rejected".to_string());
        }
        Ok(quantity.min(self.position.abs()))
    }

    fn touch(&self, side: OrderSide) -> Option<Decimal> {
        self.quote.map(|q| match side {
            OrderSide::Buy => q.ask,
            OrderSide::Sell => q.bid,
        })
    }
}

/// Paper trading venue implementing [`VenueClient`].
pub struct PaperVenue {
    name: String,
    symbol: String,
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            state: Arc::new(RwLock::new(PaperState::default())),
            order_id_counter: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self) -> String {
        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.name, id)
    }

    /// Updates the top of book and fires any resting order it crosses.
    pub async fn set_quote(&self, bid: Decimal, ask: Decimal) {
        let mut state = self.state.write().await;
        let last = (bid + ask) / Decimal::TWO;
        state.quote = Some(TopOfBook { bid, ask, last });

        let resting: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status == OrderStatus::New && o.request.category.is_protective())
            .map(|(id, _)| id.clone())
            .collect();

        for order_id in resting {
            let triggered = {
                let Some(order) = state.orders.get_mut(&order_id) else {
                    continue;
                };
                crosses(order, last)
            };
            if !triggered {
                continue;
            }

            let (side, quantity) = match state.orders.get(&order_id) {
                Some(o) => (o.request.side, o.request.quantity),
                None => continue,
            };
            let fill = state
                .reducible(side, quantity)
                .ok()
                .zip(state.touch(side));
            let now = chrono::Utc::now().timestamp_millis();

            match fill {
                Some((qty, price)) => {
                    state.apply_fill(side, qty, price);
                    if let Some(order) = state.orders.get_mut(&order_id) {
                        order.status = OrderStatus::Filled;
                        order.avg_price = price;
                        order.executed_qty = qty;
                        order.updated_at = now;
                    }
                    info!(
                        venue = %self.name,
                        %order_id,
                        %price,
                        quantity = %qty,
                        "Paper protective order triggered"
                    );
                }
                None => {
                    if let Some(order) = state.orders.get_mut(&order_id) {
                        order.status = OrderStatus::Expired;
                        order.updated_at = now;
                    }
                }
            }
        }
    }

    /// Queues an error returned by the next `place_order`.
    pub async fn fail_next_order(&self, error: VenueError) {
        self.state.write().await.failures.push_back(error);
    }

    /// While set, every call fails with `VenueUnavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Delay applied before each order is processed.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    /// Report a zero average price in order acks, like some venues do
    /// immediately after acceptance.
    pub async fn set_zero_avg_price(&self, enabled: bool) {
        self.state.write().await.zero_avg_price = enabled;
    }

    /// Signed net position.
    pub async fn position(&self) -> Decimal {
        self.state.read().await.position
    }

    /// Every request accepted or rejected so far, in submission order.
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.placed.clone()
    }

    async fn check_available(&self) -> VenueResult<()> {
        if self.state.read().await.unavailable {
            return Err(VenueError::VenueUnavailable(format!("{} is down", self.name)));
        }
        Ok(())
    }
}

/// Whether a resting protective order fires at `last`. Trailing stops track
/// the best price after activation and fire on a `callback_rate` percent
/// retrace from it.
fn crosses(order: &mut PaperOrder, last: Decimal) -> bool {
    let request = &order.request;
    match request.category {
        OrderCategory::StopMarket => match (request.side, request.stop_price) {
            (OrderSide::Sell, Some(stop)) => last <= stop,
            (OrderSide::Buy, Some(stop)) => last >= stop,
            _ => false,
        },
        OrderCategory::TrailingStopMarket => {
            let (Some(activation), Some(rate)) = (request.activation_price, request.callback_rate)
            else {
                return false;
            };
            let retrace = rate / dec!(100);
            match request.side {
                // Protects a long: activates on the way up, fires on a pullback.
                OrderSide::Sell => {
                    let extreme = match order.trailing_extreme {
                        Some(high) => high.max(last),
                        None if last >= activation => last,
                        None => return false,
                    };
                    order.trailing_extreme = Some(extreme);
                    last <= extreme * (Decimal::ONE - retrace)
                }
                OrderSide::Buy => {
                    let extreme = match order.trailing_extreme {
                        Some(low) => low.min(last),
                        None if last <= activation => last,
                        None => return false,
                    };
                    order.trailing_extreme = Some(extreme);
                    last >= extreme * (Decimal::ONE + retrace)
                }
            }
        }
        _ => false,
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn place_order(&self, request: OrderRequest) -> VenueResult<OrderAck> {
        let latency = self.state.read().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_available().await?;

        let mut state = self.state.write().await;
        state.placed.push(request.clone());

        if let Some(error) = state.failures.pop_front() {
            debug!(venue = %self.name, %error, "Injected order failure");
            return Err(error);
        }
        if request.quantity <= Decimal::ZERO {
            return Err(VenueError::OrderRejected("quantity must be positive".into()));
        }

        let order_id = self.next_order_id();
        let now = chrono::Utc::now().timestamp_millis();

        if request.category != OrderCategory::Market {
            if let (OrderCategory::StopMarket, Some(stop), Some(quote)) =
                (request.category, request.stop_price, state.quote)
            {
                let immediate = match request.side {
                    OrderSide::Sell => stop >= quote.last,
                    OrderSide::Buy => stop <= quote.last,
                };
                if immediate {
                    let reason = "Order would immediately trigger".to_string();
                    return Err(VenueError::OrderRejected(reason));
                }
            }

            debug!(
                venue = %self.name,
                %order_id,
                category = %request.category,
                "Paper order resting"
            );
            state.orders.insert(
                order_id.clone(),
                PaperOrder {
                    request,
                    status: OrderStatus::New,
                    avg_price: Decimal::ZERO,
                    executed_qty: Decimal::ZERO,
                    placed_at: now,
                    updated_at: now,
                    trailing_extreme: None,
                },
            );
            return Ok(OrderAck {
                order_id,
                avg_price: None,
                status: OrderStatus::New,
            });
        }

        let Some(price) = state.touch(request.side) else {
            return Err(VenueError::OrderRejected("no market price".into()));
        };
        let quantity = if request.reduce_only {
            state
                .reducible(request.side, request.quantity)
                .map_err(VenueError::OrderRejected)?
        } else {
            request.quantity
        };

        state.apply_fill(request.side, quantity, price);
        let zero_avg_price = state.zero_avg_price;
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                status: OrderStatus::Filled,
                avg_price: price,
                executed_qty: quantity,
                placed_at: now,
                updated_at: now,
                trailing_extreme: None,
            },
        );

        info!(
            venue = %self.name,
            %order_id,
            side = %request.side,
            %quantity,
            %price,
            reduce_only = request.reduce_only,
            "Paper market order filled"
        );

        Ok(OrderAck {
            order_id,
            avg_price: Some(if zero_avg_price { Decimal::ZERO } else { price }),
            status: OrderStatus::Filled,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> VenueResult<()> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status == OrderStatus::New => {
                order.status = OrderStatus::Canceled;
                order.updated_at = chrono::Utc::now().timestamp_millis();
                Ok(())
            }
            _ => Err(VenueError::OrderRejected(format!("Unknown order sent: {order_id}"))),
        }
    }

    async fn cancel_orders_by_type(&self, category: OrderCategory) -> VenueResult<usize> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        let mut cancelled = 0;
        for order in state.orders.values_mut() {
            if order.status == OrderStatus::New && order.request.category == category {
                order.status = OrderStatus::Canceled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn get_order_status(&self, order_id: &str) -> VenueResult<OrderStatusReport> {
        self.check_available().await?;
        let state = self.state.read().await;
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| VenueError::OrderRejected(format!("Order does not exist: {order_id}")))?;
        Ok(OrderStatusReport {
            order_id: order_id.to_string(),
            status: order.status,
            avg_price: order.avg_price,
            executed_qty: order.executed_qty,
        })
    }

    async fn get_open_orders(&self) -> VenueResult<Vec<OpenOrder>> {
        self.check_available().await?;
        let state = self.state.read().await;
        Ok(state
            .orders
            .iter()
            .filter(|(_, o)| o.status == OrderStatus::New)
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                category: o.request.category,
                side: o.request.side,
                quantity: o.request.quantity,
                stop_price: o.request.stop_price,
                activation_price: o.request.activation_price,
                status: o.status,
                placed_at: o.placed_at,
                updated_at: o.updated_at,
            })
            .collect())
    }

    async fn get_positions(&self) -> VenueResult<Vec<VenuePosition>> {
        self.check_available().await?;
        let state = self.state.read().await;
        if state.position.is_zero() {
            return Ok(Vec::new());
        }
        Ok(vec![VenuePosition {
            symbol: self.symbol.clone(),
            amount: state.position,
            entry_price: state.entry_price,
        }])
    }

    async fn fetch_ticker(&self) -> VenueResult<TopOfBook> {
        self.check_available().await?;
        self.state
            .read()
            .await
            .quote
            .ok_or_else(|| VenueError::VenueUnavailable("no quote yet".into()))
    }
}
