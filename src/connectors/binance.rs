// src/connectors/binance.rs
use crate::config::Credentials;
use crate::connectors::messages::{
    ApiErrorBody, ExchangeInfo, FuturesBalance, KlineEvent, OpenOrderResponse, OrderResponse,
    PositionRisk, RestKline,
};
use crate::connectors::traits::{ExecutionHandler, MarketData, StreamClient};
use crate::errors::ExchangeError;
use crate::types::{
    Candle, OpenOrder, OrderAck, PositionState, Side, StopKind, StopOrderRequest, StopQuantity,
    SymbolRules,
};
use crate::utils::precision::format_with_step;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_REST: &str = "https://fapi.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const MAINNET_WS: &str = "wss://fstream.binance.com/ws";
const TESTNET_WS: &str = "wss://stream.binancefuture.com/ws";
const RECV_WINDOW_MS: &str = "5000";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const ORDER_DOES_NOT_EXIST: i64 = -2013;

/// USDⓈ-M futures REST + kline stream client (one-way position mode).
pub struct BinanceClient {
    credentials: Option<Credentials>,
    http_client: Client,
    base_rest_url: String,
    base_ws_url: String,
    rules: Option<SymbolRules>,
}

impl BinanceClient {
    pub fn new(
        credentials: Option<Credentials>,
        testnet: bool,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        let (rest, ws) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };
        Ok(Self {
            credentials,
            http_client,
            base_rest_url: rest.to_string(),
            base_ws_url: ws.to_string(),
            rules: None,
        })
    }

    /// Rules used to format prices and quantities on outgoing orders.
    pub fn with_rules(mut self, rules: SymbolRules) -> Self {
        self.rules = Some(rules);
        self
    }

    fn credentials(&self) -> Result<&Credentials, ExchangeError> {
        self.credentials.as_ref().ok_or(ExchangeError::MissingCredentials)
    }

    fn sign_and_build_query(&self, params: Vec<(&str, String)>) -> Result<String, ExchangeError> {
        let creds = self.credentials()?;
        let mut params = params;
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query_string = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(creds.secret_key.as_bytes())
            .map_err(|_| ExchangeError::MissingCredentials)?;
        mac.update(query_string.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query_string, signature))
    }

    async fn send_signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, full_query);

        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials()?.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn send_public_request<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, query);
        let response = self.http_client.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }
        Err(classify_failure(status, &body))
    }

    fn fmt_qty(&self, qty: Decimal) -> String {
        match &self.rules {
            Some(r) => format_with_step(qty, r.step_size),
            None => qty.normalize().to_string(),
        }
    }

    fn fmt_price(&self, price: Decimal) -> String {
        match &self.rules {
            Some(r) => format_with_step(price, r.tick_size),
            None => price.normalize().to_string(),
        }
    }
}

/// Maps a non-2xx response onto the error taxonomy. 5xx means the request
/// may or may not have been executed, so it stays transient.
fn classify_failure(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited(body.to_string());
    }
    if status.is_server_error() {
        return ExchangeError::Network(format!("{}: {}", status, body));
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(api) => ExchangeError::Rejected {
            code: api.code,
            msg: api.msg,
        },
        Err(_) => ExchangeError::Rejected {
            code: i64::from(status.as_u16()),
            msg: body.to_string(),
        },
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<RestKline> = self
            .send_public_request(
                "/fapi/v1/klines",
                vec![
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let now = Utc::now().timestamp_millis();
        Ok(rows.into_iter().map(|r| r.into_candle(now)).collect())
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let info: ExchangeInfo = self
            .send_public_request("/fapi/v1/exchangeInfo", vec![])
            .await?;
        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.to_rules())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }
}

#[async_trait]
impl ExecutionHandler for BinanceClient {
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .send_signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let balances: Vec<FuturesBalance> = self
            .send_signed_request(Method::GET, "/fapi/v2/balance", vec![])
            .await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.available_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionState, ExchangeError> {
        let rows: Vec<PositionRisk> = self
            .send_signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        let mut amount = Decimal::ZERO;
        let mut entry = Decimal::ZERO;
        for row in rows.iter().filter(|r| r.symbol == symbol) {
            amount += row.position_amt;
            if !row.position_amt.is_zero() {
                entry = row.entry_price;
            }
        }
        Ok(PositionState::from_signed(amount, entry))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", self.fmt_qty(quantity)),
            ("newClientOrderId", client_order_id.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        info!(
            side = side.as_str(),
            %quantity,
            reduce_only,
            %client_order_id,
            "Sending market order"
        );

        let resp: OrderResponse = self
            .send_signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(resp.into())
    }

    async fn place_stop_order(&self, request: &StopOrderRequest) -> Result<OrderAck, ExchangeError> {
        let order_type = match request.kind {
            StopKind::StopLoss => "STOP_MARKET",
            StopKind::TakeProfit => "TAKE_PROFIT_MARKET",
        };
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", self.fmt_price(request.stop_price)),
            ("workingType", "MARK_PRICE".to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        match request.quantity {
            StopQuantity::Quantity(q) => {
                params.push(("quantity", self.fmt_qty(q)));
                if request.reduce_only {
                    params.push(("reduceOnly", "true".to_string()));
                }
            }
            // closePosition cannot be combined with quantity or reduceOnly
            StopQuantity::ClosePosition => params.push(("closePosition", "true".to_string())),
        }

        info!(
            kind = order_type,
            side = request.side.as_str(),
            stop_price = %request.stop_price,
            client_order_id = %request.client_order_id,
            "Sending protective order"
        );

        let resp: OrderResponse = self
            .send_signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(resp.into())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .send_signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .send_signed_request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let rows: Vec<OpenOrderResponse> = self
            .send_signed_request(
                Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(rows.iter().filter_map(OpenOrderResponse::to_open_order).collect())
    }

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, ExchangeError> {
        let result: Result<OrderResponse, ExchangeError> = self
            .send_signed_request(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await;
        match result {
            Ok(resp) => Ok(Some(resp.into())),
            Err(ExchangeError::Rejected { code: ORDER_DOES_NOT_EXIST, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StreamClient for BinanceClient {
    async fn subscribe_klines(
        &mut self,
        symbol: &str,
        interval: &str,
        sender: mpsc::Sender<Candle>,
    ) -> Result<()> {
        let ws_url = format!(
            "{}/{}@kline_{}",
            self.base_ws_url,
            symbol.to_lowercase(),
            interval
        );
        let url = Url::parse(&ws_url)?;

        info!(%symbol, %interval, "Starting kline WebSocket task");

        let symbol = symbol.to_string();
        tokio::spawn(async move {
            loop {
                match connect_async(url.clone()).await {
                    Ok((ws_stream, _)) => {
                        let (_, mut read) = ws_stream.split();
                        info!(%symbol, "WebSocket connected");

                        while let Some(message) = read.next().await {
                            let msg = match message {
                                Ok(msg) => msg,
                                Err(e) => {
                                    error!(%symbol, error = %e, "WebSocket error");
                                    break;
                                }
                            };
                            let Ok(text) = msg.to_text() else { continue };
                            if text.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<KlineEvent>(text) {
                                Ok(event) => {
                                    if sender.send(event.kline.into()).await.is_err() {
                                        info!(%symbol, "Kline receiver dropped, stopping stream");
                                        return;
                                    }
                                }
                                Err(e) => debug!(error = %e, "Ignoring non-kline frame"),
                            }
                        }
                    }
                    Err(e) => error!(%symbol, error = %e, "Failed to connect WebSocket"),
                }
                if sender.is_closed() {
                    return;
                }
                warn!(%symbol, delay_secs = RECONNECT_DELAY.as_secs(), "WebSocket closed, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BinanceClient {
        BinanceClient::new(
            Some(Credentials {
                api_key: "key".into(),
                secret_key: "secret".into(),
            }),
            true,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn signed_query_carries_timestamp_and_signature() {
        let query = client()
            .sign_and_build_query(vec![("symbol", "BTCUSDT".into())])
            .unwrap();
        assert!(query.starts_with("symbol=BTCUSDT&recvWindow=5000&timestamp="));
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn signing_without_credentials_fails() {
        let c = BinanceClient::new(None, true, Duration::from_secs(1)).unwrap();
        assert_eq!(
            c.sign_and_build_query(vec![]).unwrap_err(),
            ExchangeError::MissingCredentials
        );
    }

    #[test]
    fn classifies_failures() {
        let e = classify_failure(StatusCode::BAD_REQUEST, r#"{"code":-2019,"msg":"Margin is insufficient."}"#);
        assert_eq!(
            e,
            ExchangeError::Rejected {
                code: -2019,
                msg: "Margin is insufficient.".into()
            }
        );
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_failure(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_failure(StatusCode::BAD_REQUEST, "garbage").is_transient());
    }
}
