//! Venue abstraction consumed by the hedge engine.
//!
//! Each [`VenueClient`] is bound to one venue and one instrument, so none of
//! the calls take a symbol.

use super::error::VenueResult;
use super::types::{
    OpenOrder, OrderAck, OrderCategory, OrderRequest, OrderStatusReport, TopOfBook, VenuePosition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two venues the engine hedges across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    A,
    B,
}

impl Venue {
    pub const ALL: [Venue; 2] = [Venue::A, Venue::B];

    pub fn index(self) -> usize {
        match self {
            Venue::A => 0,
            Venue::B => 1,
        }
    }

    pub fn other(self) -> Venue {
        match self {
            Venue::A => Venue::B,
            Venue::B => Venue::A,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::A => write!(f, "venue-a"),
            Venue::B => write!(f, "venue-b"),
        }
    }
}

/// Order routing and account queries for a single venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Human-readable venue name for logs.
    fn name(&self) -> String;

    async fn place_order(&self, request: OrderRequest) -> VenueResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> VenueResult<()>;

    /// Cancels every open order of `category`. Returns how many were cancelled.
    async fn cancel_orders_by_type(&self, category: OrderCategory) -> VenueResult<usize>;

    async fn get_order_status(&self, order_id: &str) -> VenueResult<OrderStatusReport>;

    async fn get_open_orders(&self) -> VenueResult<Vec<OpenOrder>>;

    async fn get_positions(&self) -> VenueResult<Vec<VenuePosition>>;

    /// REST top-of-book, used only when the push feed is invalid.
    async fn fetch_ticker(&self) -> VenueResult<TopOfBook>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_display_and_other() {
        assert_eq!(Venue::A.to_string(), "venue-a");
        assert_eq!(Venue::A.other(), Venue::B);
        assert_eq!(Venue::B.index(), 1);
    }
}
