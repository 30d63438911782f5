//! Order, position and quote types shared by every venue adapter.
//!
//! The first half of this file is the venue-neutral vocabulary the engine
//! speaks. The second half holds the wire formats of the Binance-compatible
//! futures REST API that [`super::FuturesRestClient`] decodes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical order category. Each category has its own slot in the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderCategory {
    Market,
    Limit,
    StopMarket,
    TrailingStopMarket,
}

impl OrderCategory {
    pub const ALL: [OrderCategory; 4] = [
        OrderCategory::Market,
        OrderCategory::Limit,
        OrderCategory::StopMarket,
        OrderCategory::TrailingStopMarket,
    ];

    pub fn index(self) -> usize {
        match self {
            OrderCategory::Market => 0,
            OrderCategory::Limit => 1,
            OrderCategory::StopMarket => 2,
            OrderCategory::TrailingStopMarket => 3,
        }
    }

    /// Wire name used by Binance-compatible futures APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderCategory::Market => "MARKET",
            OrderCategory::Limit => "LIMIT",
            OrderCategory::StopMarket => "STOP_MARKET",
            OrderCategory::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }

    pub fn is_protective(&self) -> bool {
        matches!(
            self,
            OrderCategory::StopMarket | OrderCategory::TrailingStopMarket
        )
    }
}

impl fmt::Display for OrderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// True once the venue will never change this order again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::ExpiredInMatch
        )
    }
}

/// Venue-neutral order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub category: OrderCategory,
    pub quantity: Decimal,
    /// Limit price, only meaningful for `Limit`.
    pub price: Option<Decimal>,
    /// Trigger price for `StopMarket`.
    pub stop_price: Option<Decimal>,
    /// Activation price for `TrailingStopMarket`.
    pub activation_price: Option<Decimal>,
    /// Callback rate in percent for `TrailingStopMarket`.
    pub callback_rate: Option<Decimal>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(side: OrderSide, quantity: Decimal) -> Self {
        Self {
            side,
            category: OrderCategory::Market,
            quantity,
            price: None,
            stop_price: None,
            activation_price: None,
            callback_rate: None,
            reduce_only: false,
        }
    }

    pub fn stop_market(side: OrderSide, quantity: Decimal, stop_price: Decimal) -> Self {
        Self {
            category: OrderCategory::StopMarket,
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::market(side, quantity)
        }
    }

    pub fn trailing_stop(
        side: OrderSide,
        quantity: Decimal,
        activation_price: Decimal,
        callback_rate: Decimal,
    ) -> Self {
        Self {
            category: OrderCategory::TrailingStopMarket,
            activation_price: Some(activation_price),
            callback_rate: Some(callback_rate),
            reduce_only: true,
            ..Self::market(side, quantity)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Acknowledgement returned when a venue accepts an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price. Some venues report zero right after acceptance.
    pub avg_price: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub status: OrderStatus,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
}

/// A resting order as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub category: OrderCategory,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub activation_price: Option<Decimal>,
    pub status: OrderStatus,
    /// Placement time in epoch milliseconds.
    pub placed_at: i64,
    /// Last update time in epoch milliseconds.
    pub updated_at: i64,
}

impl OpenOrder {
    /// Orders by placement: time first, then the numeric tail of the id,
    /// which venues assign in increasing order.
    pub fn placement_key(&self) -> (i64, u64) {
        let sequence = self
            .order_id
            .rsplit('-')
            .next()
            .and_then(|tail| tail.parse().ok())
            .unwrap_or(0);
        (self.placed_at, sequence)
    }
}

/// Net position on one venue. Positive amount is long, negative is short.
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePosition {
    pub symbol: String,
    pub amount: Decimal,
    pub entry_price: Decimal,
}

/// Best bid/ask snapshot used for REST price fallback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopOfBook {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

// ==================== Binance-compatible wire types ====================

/// Order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub stop_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub activate_price: Option<Decimal>,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub update_time: i64,
}

impl OrderResponse {
    pub fn category(&self) -> Option<OrderCategory> {
        OrderCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == self.order_type)
    }

    pub fn into_ack(self) -> OrderAck {
        OrderAck {
            order_id: self.order_id.to_string(),
            avg_price: self.avg_price,
            status: self.status,
        }
    }

    pub fn into_status_report(self) -> OrderStatusReport {
        OrderStatusReport {
            order_id: self.order_id.to_string(),
            status: self.status,
            avg_price: self.avg_price.unwrap_or_default(),
            executed_qty: self.executed_qty,
        }
    }

    /// Converts to an [`OpenOrder`]; unknown order types are dropped.
    pub fn into_open_order(self) -> Option<OpenOrder> {
        let category = self.category()?;
        Some(OpenOrder {
            order_id: self.order_id.to_string(),
            category,
            side: self.side,
            quantity: self.orig_qty,
            stop_price: self.stop_price.filter(|p| *p > Decimal::ZERO),
            activation_price: self.activate_price.filter(|p| *p > Decimal::ZERO),
            status: self.status,
            placed_at: self.time,
            updated_at: self.update_time,
        })
    }
}

/// Futures position information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTicker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
}

/// Error body returned by Binance-compatible APIs.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_response_with_zero_avg_price() {
        let body = r#"{
            "orderId": 42, "symbol": "BTCUSDT", "status": "NEW",
            "avgPrice": "0.00000", "origQty": "0.020", "executedQty": "0",
            "side": "BUY", "type": "MARKET", "updateTime": 1700000000000
        }"#;
        let response: OrderResponse = serde_json::from_str(body).unwrap();
        let ack = response.into_ack();

        assert_eq!(ack.order_id, "42");
        assert_eq!(ack.avg_price, Some(Decimal::ZERO));
        assert_eq!(ack.status, OrderStatus::New);
    }

    #[test]
    fn test_stop_order_becomes_open_order() {
        let body = r#"{
            "orderId": 7, "symbol": "BTCUSDT", "status": "NEW",
            "avgPrice": "0", "origQty": "0.020", "executedQty": "0",
            "side": "SELL", "type": "STOP_MARKET", "stopPrice": "64000.0",
            "time": 1699999990000, "updateTime": 1700000000000
        }"#;
        let response: OrderResponse = serde_json::from_str(body).unwrap();
        let open = response.into_open_order().unwrap();

        assert_eq!(open.category, OrderCategory::StopMarket);
        assert_eq!(open.stop_price, Some(dec!(64000.0)));
        assert_eq!(open.activation_price, None);
        assert_eq!(open.placement_key(), (1699999990000, 7));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_protective_constructors_are_reduce_only() {
        let stop = OrderRequest::stop_market(OrderSide::Sell, dec!(0.02), dec!(99.5));
        assert!(stop.reduce_only);
        assert_eq!(stop.category, OrderCategory::StopMarket);

        let market = OrderRequest::market(OrderSide::Buy, dec!(0.02));
        assert!(!market.reduce_only);
        assert!(market.reduce_only().reduce_only);
    }
}
