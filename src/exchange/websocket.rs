//! Push transport feeding a [`PriceFeed`] from a futures WebSocket.
//!
//! Subscribes to the combined `bookTicker` and `aggTrade` streams for one
//! symbol. The stream only ever writes quote state; it never triggers
//! trading logic. Disconnects are retried forever with a fixed delay, and the
//! feed simply goes stale in between.

use crate::config::VenueConfig;
use crate::feed::PriceFeed;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Market data event relevant to the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    BookTicker { bid: Decimal, ask: Decimal },
    Trade { price: Decimal },
}

#[derive(Debug, Deserialize)]
struct StreamWrapper {
    data: StreamPayload,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum StreamPayload {
    #[serde(rename = "bookTicker")]
    BookTicker {
        #[serde(rename = "b", with = "rust_decimal::serde::str")]
        bid: Decimal,
        #[serde(rename = "a", with = "rust_decimal::serde::str")]
        ask: Decimal,
    },
    #[serde(rename = "aggTrade")]
    AggTrade {
        #[serde(rename = "p", with = "rust_decimal::serde::str")]
        price: Decimal,
    },
}

/// Parses one combined-stream text frame. Unknown frames yield nothing.
pub fn parse_message(text: &str) -> Vec<WsEvent> {
    match serde_json::from_str::<StreamWrapper>(text) {
        Ok(StreamWrapper {
            data: StreamPayload::BookTicker { bid, ask },
        }) => vec![WsEvent::BookTicker { bid, ask }],
        Ok(StreamWrapper {
            data: StreamPayload::AggTrade { price },
        }) => vec![WsEvent::Trade { price }],
        Err(e) => {
            debug!(error = %e, "Ignoring unrecognised frame");
            vec![]
        }
    }
}

pub fn apply(feed: &PriceFeed, event: WsEvent) {
    match event {
        WsEvent::BookTicker { bid, ask } => feed.update(bid, ask, None),
        WsEvent::Trade { price } => feed.record_trade(price),
    }
}

pub struct BookTickerStream {
    url: String,
    feed: Arc<PriceFeed>,
}

impl BookTickerStream {
    pub fn new(config: &VenueConfig, feed: Arc<PriceFeed>) -> Self {
        let symbol = config.symbol.to_lowercase();
        let url = format!(
            "{}/stream?streams={}@bookTicker/{}@aggTrade",
            config.ws_url.trim_end_matches('/'),
            symbol,
            symbol
        );
        Self { url, feed }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs until the task is aborted, reconnecting after every failure.
    pub async fn run(self) {
        loop {
            match self.connect_and_handle().await {
                Ok(()) => info!(venue = %self.feed.venue(), "WebSocket closed by server"),
                Err(e) => error!(venue = %self.feed.venue(), error = %e, "WebSocket error"),
            }
            warn!(
                venue = %self.feed.venue(),
                delay_secs = RECONNECT_DELAY.as_secs(),
                "Reconnecting price stream"
            );
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_handle(&self) -> Result<()> {
        info!("Connecting to WebSocket: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg.context("WebSocket read failed")? {
                Message::Text(text) => {
                    for event in parse_message(&text.to_string()) {
                        apply(&self.feed, event);
                    }
                }
                Message::Ping(payload) => {
                    write
                        .send(Message::Pong(payload))
                        .await
                        .context("Failed to answer ping")?;
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Venue;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_ticker_and_trade() {
        let book = r#"{"stream":"btcusdt@bookTicker","data":{
            "e":"bookTicker","u":1,"s":"BTCUSDT",
            "b":"64000.10","B":"1.2","a":"64000.20","A":"0.4","T":1,"E":1
        }}"#;
        assert_eq!(
            parse_message(book),
            vec![WsEvent::BookTicker {
                bid: dec!(64000.10),
                ask: dec!(64000.20)
            }]
        );

        let trade = r#"{"stream":"btcusdt@aggTrade","data":{
            "e":"aggTrade","E":1,"s":"BTCUSDT","a":5,
            "p":"64000.15","q":"0.01","f":1,"l":1,"T":1,"m":true
        }}"#;
        assert_eq!(parse_message(trade), vec![WsEvent::Trade { price: dec!(64000.15) }]);

        assert!(parse_message(r#"{"result":null,"id":1}"#).is_empty());
    }

    #[tokio::test]
    async fn test_events_update_feed() {
        let feed = PriceFeed::new(Venue::B, Duration::from_secs(30));
        apply(&feed, WsEvent::Trade { price: dec!(1) });
        assert!(feed.read().is_none());

        apply(&feed, WsEvent::BookTicker { bid: dec!(99.9), ask: dec!(100.1) });
        apply(&feed, WsEvent::Trade { price: dec!(100.05) });
        let quote = feed.read().unwrap();
        assert_eq!(quote.mid(), dec!(100));
        assert_eq!(quote.last_price, dec!(100.05));
    }

    #[test]
    fn test_stream_url() {
        let config = VenueConfig {
            ws_url: "wss://fstream.binance.com/".into(),
            ..crate::config::Config::default().venue_b
        };
        let feed = Arc::new(PriceFeed::new(Venue::B, Duration::from_secs(30)));
        let stream = BookTickerStream::new(&config, feed);
        assert_eq!(
            stream.url(),
            "wss://fstream.binance.com/stream?streams=btcusdt@bookTicker/btcusdt@aggTrade"
        );
    }
}
