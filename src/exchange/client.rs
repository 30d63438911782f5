//! REST client for Binance-compatible USDⓈ-M futures venues.
//!
//! Both venues the engine trades speak the same `/fapi` dialect, so one
//! client type serves either side; each instance is bound to one base URL,
//! one key pair and one symbol.

use crate::config::VenueConfig;
use crate::exchange::error::{VenueError, VenueResult};
use crate::exchange::traits::VenueClient;
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FuturesRestClient {
    http: Client,
    name: String,
    symbol: String,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl FuturesRestClient {
    pub fn new(config: &VenueConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            name: config.name.clone(),
            symbol: config.symbol.clone(),
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign(&self, query_string: &str) -> VenueResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| VenueError::OrderRejected(format!("invalid secret key: {e}")))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Sends a signed request; `symbol` and `timestamp` are appended.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> VenueResult<T> {
        params.push(("symbol", self.symbol.clone()));
        params.push(("timestamp", chrono::Utc::now().timestamp_millis().to_string()));

        let query_string = Self::encode(&params);
        let signature = self.sign(&query_string)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport)?;

        decode(response).await
    }

    async fn public<T: DeserializeOwned>(&self, path: &str) -> VenueResult<T> {
        let url = format!("{}{}?symbol={}", self.base_url, path, self.symbol);
        let response = self.http.get(&url).send().await.map_err(map_transport)?;
        decode(response).await
    }

    fn order_params(request: &OrderRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("side", request.side.as_str().to_string()),
            ("type", request.category.as_str().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
        ];

        if let Some(price) = request.price {
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", stop.normalize().to_string()));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
        if let Some(activation) = request.activation_price {
            params.push(("activationPrice", activation.normalize().to_string()));
        }
        if let Some(rate) = request.callback_rate {
            params.push(("callbackRate", rate.normalize().to_string()));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if request.category == OrderCategory::Market {
            params.push(("newOrderRespType", "RESULT".to_string()));
        }
        params
    }
}

fn map_transport(error: reqwest::Error) -> VenueError {
    if error.is_timeout() {
        VenueError::OrderTimeout(error.to_string())
    } else {
        VenueError::VenueUnavailable(error.to_string())
    }
}

/// Maps the HTTP status and body to a typed result. Client errors are
/// rejections except rate limiting, which is transient.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> VenueResult<T> {
    let status = response.status();
    let body = response.text().await.map_err(map_transport)?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| VenueError::Decode(format!("{e}: {body}")));
    }

    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| format!("{} (code {})", e.msg, e.code))
        .unwrap_or(body);

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            Err(VenueError::VenueUnavailable(format!("rate limited: {message}")))
        }
        s if s.is_client_error() => Err(VenueError::OrderRejected(message)),
        s => Err(VenueError::VenueUnavailable(format!("{s}: {message}"))),
    }
}

#[async_trait]
impl VenueClient for FuturesRestClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn place_order(&self, request: OrderRequest) -> VenueResult<OrderAck> {
        debug!(?request, "Placing order");
        let response: OrderResponse = self
            .signed(Method::POST, "/fapi/v1/order", Self::order_params(&request))
            .await?;
        Ok(response.into_ack())
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn cancel_order(&self, order_id: &str) -> VenueResult<()> {
        let _: OrderResponse = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn cancel_orders_by_type(&self, category: OrderCategory) -> VenueResult<usize> {
        let open = self.get_open_orders().await?;
        let mut cancelled = 0;
        for order in open.into_iter().filter(|o| o.category == category) {
            match self.cancel_order(&order.order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    let order_id = &order.order_id;
                    warn!(venue = %self.name, %order_id, error = %e, "Cancel failed")
                }
            }
        }
        Ok(cancelled)
    }

    async fn get_order_status(&self, order_id: &str) -> VenueResult<OrderStatusReport> {
        let response: OrderResponse = self
            .signed(
                Method::GET,
                "/fapi/v1/order",
                vec![("orderId", order_id.to_string())],
            )
            .await?;
        Ok(response.into_status_report())
    }

    async fn get_open_orders(&self) -> VenueResult<Vec<OpenOrder>> {
        let response: Vec<OrderResponse> = self
            .signed(Method::GET, "/fapi/v1/openOrders", Vec::new())
            .await?;
        Ok(response
            .into_iter()
            .filter_map(OrderResponse::into_open_order)
            .collect())
    }

    async fn get_positions(&self) -> VenueResult<Vec<VenuePosition>> {
        let response: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        Ok(response
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|p| VenuePosition {
                symbol: p.symbol,
                amount: p.position_amt,
                entry_price: p.entry_price,
            })
            .collect())
    }

    async fn fetch_ticker(&self) -> VenueResult<TopOfBook> {
        let ticker: BookTicker = self.public("/fapi/v1/ticker/bookTicker").await?;
        Ok(TopOfBook {
            bid: ticker.bid_price,
            ask: ticker.ask_price,
            last: (ticker.bid_price + ticker.ask_price) / rust_decimal::Decimal::TWO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FuturesRestClient {
        FuturesRestClient::new(&VenueConfig {
            name: "venue-b".into(),
            symbol: "BTCUSDT".into(),
            rest_url: server.uri(),
            ws_url: String::new(),
            api_key: "key".into(),
            secret_key: "secret".into(),
            taker_fee_rate: None,
        })
        .unwrap()
    }

    fn order_body(id: i64, kind: &str, status: &str) -> serde_json::Value {
        json!({
            "orderId": id, "symbol": "BTCUSDT", "status": status,
            "avgPrice": "64000.5", "origQty": "0.020", "executedQty": "0.020",
            "side": "SELL", "type": kind, "stopPrice": "0", "updateTime": 1700000000000i64
        })
    }

    #[test]
    fn test_signature_is_hex_hmac() {
        let server_less = FuturesRestClient {
            http: Client::new(),
            name: "a".into(),
            symbol: "BTCUSDT".into(),
            base_url: String::new(),
            api_key: String::new(),
            secret_key: "secret".into(),
        };
        let signature = server_less.sign("symbol=BTCUSDT&timestamp=1").unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(signature, server_less.sign("symbol=BTCUSDT&timestamp=1").unwrap());
    }

    #[tokio::test]
    async fn test_place_reduce_only_market_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "key"))
            .and(query_param("type", "MARKET"))
            .and(query_param("side", "SELL"))
            .and(query_param("quantity", "0.02"))
            .and(query_param("reduceOnly", "true"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(order_body(11, "MARKET", "FILLED")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ack = client(&server)
            .place_order(OrderRequest::market(OrderSide::Sell, dec!(0.020)).reduce_only())
            .await
            .unwrap();
        assert_eq!(ack.order_id, "11");
        assert_eq!(ack.avg_price, Some(dec!(64000.5)));
        assert_eq!(ack.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": -2022, "msg": "ReduceOnly Order is rejected."})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = client(&server);
        match client
            .place_order(OrderRequest::market(OrderSide::Sell, dec!(1)))
            .await
        {
            Err(VenueError::OrderRejected(msg)) => assert!(msg.contains("-2022")),
            other => panic!("unexpected {other:?}"),
        }

        let err = client.get_positions().await.unwrap_err();
        assert!(matches!(err, VenueError::VenueUnavailable(_)));
        assert!(err.is_transient());

        let err = client.get_order_status("1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancel_orders_by_type_only_touches_category() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/openOrders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                order_body(1, "STOP_MARKET", "NEW"),
                order_body(2, "TRAILING_STOP_MARKET", "NEW"),
                order_body(3, "STOP_MARKET", "NEW"),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/fapi/v1/order"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(order_body(1, "STOP_MARKET", "CANCELED")),
            )
            .expect(2)
            .mount(&server)
            .await;

        let cancelled = client(&server)
            .cancel_orders_by_type(OrderCategory::StopMarket)
            .await
            .unwrap();
        assert_eq!(cancelled, 2);
    }

    #[tokio::test]
    async fn test_positions_and_ticker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "positionAmt": "-0.020", "entryPrice": "64010.0"},
                {"symbol": "BTCUSDT", "positionAmt": "0.000", "entryPrice": "0.0"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/bookTicker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"symbol": "BTCUSDT", "bidPrice": "64000.0", "askPrice": "64000.2"}),
            ))
            .mount(&server)
            .await;

        let client = client(&server);
        let positions = client.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount, dec!(-0.020));

        let ticker = client.fetch_ticker().await.unwrap();
        assert_eq!(ticker.last, dec!(64000.1));
    }
}
