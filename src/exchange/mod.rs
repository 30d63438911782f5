//! Venue connectivity.
//!
//! ## REST
//! [`FuturesRestClient`] speaks the Binance-compatible `/fapi` dialect used
//! by both venues: order placement and cancellation, order status, open
//! orders, positions and a ticker fallback.
//!
//! ## WebSocket
//! [`BookTickerStream`] keeps a [`crate::feed::PriceFeed`] current from the
//! combined book ticker and trade streams.
//!
//! ## Paper
//! [`PaperVenue`] fills orders in-process for paper runs and tests.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;
mod websocket;

pub use client::FuturesRestClient;
pub use error::{VenueError, VenueResult};
pub use mock::PaperVenue;
pub use traits::*;
pub use types::*;
pub use websocket::{BookTickerStream, WsEvent};
