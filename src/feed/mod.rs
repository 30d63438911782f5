//! Per-venue top-of-book state with staleness gating.
//!
//! A [`PriceFeed`] is written only by its push transport and read by the
//! evaluation loop. Readers never see a stale quote: [`PriceFeed::read`]
//! returns `None` once the last update is older than the staleness window or
//! the book is one-sided. Staleness is a normal condition during reconnects,
//! not an error.

use crate::exchange::{TopOfBook, Venue};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot of one venue's book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_price: Decimal,
    pub updated_at: Instant,
    /// Recomputed on every read, never stored.
    pub valid: bool,
}

impl PriceQuote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Builds an already-validated quote from a REST ticker.
    pub fn from_ticker(ticker: TopOfBook) -> Self {
        Self {
            bid: ticker.bid,
            ask: ticker.ask,
            last_price: ticker.last,
            updated_at: Instant::now(),
            valid: ticker.bid > Decimal::ZERO && ticker.ask > Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredQuote {
    bid: Decimal,
    ask: Decimal,
    last_price: Decimal,
    updated_at: Instant,
}

/// Latest quote for one venue.
#[derive(Debug)]
pub struct PriceFeed {
    venue: Venue,
    staleness_window: Duration,
    quote: RwLock<Option<StoredQuote>>,
}

impl PriceFeed {
    pub fn new(venue: Venue, staleness_window: Duration) -> Self {
        Self {
            venue,
            staleness_window,
            quote: RwLock::new(None),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    /// Stores a new book. `last` defaults to the mid when the transport only
    /// delivers bid/ask.
    pub fn update(&self, bid: Decimal, ask: Decimal, last: Option<Decimal>) {
        let last_price = last.unwrap_or((bid + ask) / Decimal::TWO);
        *self.quote.write() = Some(StoredQuote {
            bid,
            ask,
            last_price,
            updated_at: Instant::now(),
        });
    }

    /// Records a trade print. Does not refresh the quote's age.
    pub fn record_trade(&self, price: Decimal) {
        if let Some(stored) = self.quote.write().as_mut() {
            stored.last_price = price;
        }
    }

    /// Raw snapshot including the validity flag, for status display.
    pub fn snapshot(&self) -> Option<PriceQuote> {
        let stored = (*self.quote.read())?;
        let fresh = stored.updated_at.elapsed() < self.staleness_window;
        let two_sided = stored.bid > Decimal::ZERO && stored.ask > Decimal::ZERO;

        Some(PriceQuote {
            bid: stored.bid,
            ask: stored.ask,
            last_price: stored.last_price,
            updated_at: stored.updated_at,
            valid: fresh && two_sided,
        })
    }

    /// Returns the quote only while it is valid.
    pub fn read(&self) -> Option<PriceQuote> {
        match self.snapshot() {
            Some(quote) if quote.valid => Some(quote),
            Some(quote) => {
                debug!(
                    venue = %self.venue,
                    age_ms = quote.updated_at.elapsed().as_millis() as u64,
                    bid = %quote.bid,
                    ask = %quote.ask,
                    "Quote invalid"
                );
                None
            }
            None => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.read().is_some()
    }
}
