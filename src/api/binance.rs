//! Binance USDⓈ-M futures REST client
//!
//! Signed endpoints carry the `X-MBX-APIKEY` header plus `timestamp`,
//! `recvWindow` and an HMAC-SHA256 `signature` over the query string.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{Exchange, ExchangeError, PositionModeProbe};
use crate::models::{
    Candle, HistoricalOrder, OpenOrder, OrderRequest, OrderStatus, OrderType, SymbolFilters,
    WalletBalance,
};

const BINANCE_FUTURES_URL: &str = "https://fapi.binance.com";
const BINANCE_FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const RECV_WINDOW_MS: u64 = 5000;
// Well under the 2400 weight/min account limit
const REQUESTS_PER_SECOND: u32 = 10;

// "No need to change margin type." / "No need to change position side."
const CODE_MARGIN_TYPE_UNCHANGED: i64 = -4046;
const CODE_POSITION_SIDE_UNCHANGED: i64 = -4059;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct BinanceErrorResponse {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkPriceRaw {
    mark_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRaw {
    symbol: String,
    position_amt: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderRaw {
    order_id: i64,
    #[serde(rename = "type")]
    order_type: OrderType,
    #[serde(default)]
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderHistoryRaw {
    order_id: i64,
    #[serde(rename = "type")]
    order_type: OrderType,
    status: OrderStatus,
    #[serde(default)]
    reduce_only: bool,
    time: Option<i64>,
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderRaw {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoRaw {
    symbols: Vec<SymbolInfoRaw>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoRaw {
    symbol: String,
    filters: Vec<FilterRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum FilterRaw {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price { tick_size: Decimal },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: Decimal },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: Decimal },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRaw {
    asset: String,
    balance: Option<Decimal>,
    cross_wallet_balance: Option<Decimal>,
    available_balance: Option<Decimal>,
    max_withdraw_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionModeRaw {
    dual_side_position: bool,
}

fn millis_to_utc(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Kline rows are heterogeneous arrays: [openTime, open, high, low, close, volume, closeTime, ...]
fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    let time_at = |idx: usize| {
        row.get(idx)
            .and_then(|v| v.as_i64())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ExchangeError::Parse(format!("kline field {} is not a timestamp", idx)))
    };

    let close = row
        .get(4)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExchangeError::Parse("kline close is not a string".to_string()))?
        .parse::<Decimal>()
        .map_err(|e| ExchangeError::Parse(format!("kline close: {}", e)))?;

    Ok(Candle {
        open_time: time_at(0)?,
        close_time: time_at(6)?,
        close,
        is_final: None,
    })
}

// ============== Implementation ==============

/// Client for the Binance USDⓈ-M futures REST API
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: Arc<BinanceRateLimiter>,
}

impl BinanceFuturesClient {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        Self::with_base_url(BINANCE_FUTURES_URL, api_key, api_secret)
    }

    pub fn testnet(api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        Self::with_base_url(BINANCE_FUTURES_TESTNET_URL, api_key, api_secret)
    }

    /// Client against an arbitrary base URL (mock servers, proxies)
    pub fn with_base_url(
        base_url: &str,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExchangeError::Request(format!("failed to build HTTP client: {}", e)))?;

        let quota =
            Quota::per_second(NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Append timestamp/recvWindow and the HMAC signature
    fn sign_query(&self, mut params: Vec<(&str, String)>) -> Result<String, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = Self::encode_query(&params);

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Signature(e.to_string()))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query, signature))
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<String, ExchangeError> {
        let query = if signed {
            self.sign_query(params)?
        } else {
            Self::encode_query(&params)
        };

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query)
        };

        self.rate_limiter.until_ready().await;

        let mut request = self.client.request(method.clone(), &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        if let Ok(err) = serde_json::from_str::<BinanceErrorResponse>(&body) {
            return Err(ExchangeError::Api {
                code: err.code,
                msg: err.msg,
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ExchangeError::Unsupported(format!("{} {}", method, endpoint)));
        }

        Err(ExchangeError::Request(format!("HTTP {}: {}", status, body)))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let body = self.send(method, endpoint, params, signed).await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("{}: {}", endpoint, e)))
    }

    /// Treat a specific "nothing to change" API code as success
    fn tolerate(
        result: Result<String, ExchangeError>,
        benign_code: i64,
    ) -> Result<(), ExchangeError> {
        match result {
            Ok(_) => Ok(()),
            Err(ExchangeError::Api { code, .. }) if code == benign_code => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self
            .request_json(Method::GET, "/fapi/v1/klines", params, false)
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn mark_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let raw: MarkPriceRaw = self
            .request_json(
                Method::GET,
                "/fapi/v1/premiumIndex",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;

        Ok(raw.mark_price.filter(|p| *p > Decimal::ZERO))
    }

    async fn position_quantity(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let positions: Vec<PositionRiskRaw> = self
            .request_json(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;

        Ok(positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.position_amt)
            .unwrap_or(Decimal::ZERO))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let orders: Vec<OpenOrderRaw> = self
            .request_json(
                Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;

        Ok(orders
            .into_iter()
            .map(|o| OpenOrder {
                id: o.order_id,
                order_type: o.order_type,
                reduce_only: o.reduce_only,
            })
            .collect())
    }

    async fn order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoricalOrder>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("startTime", from.timestamp_millis().to_string()),
            ("endTime", to.timestamp_millis().to_string()),
        ];
        let orders: Vec<OrderHistoryRaw> = self
            .request_json(Method::GET, "/fapi/v1/allOrders", params, true)
            .await?;

        Ok(orders
            .into_iter()
            .map(|o| HistoricalOrder {
                id: o.order_id,
                order_type: o.order_type,
                status: o.status,
                reduce_only: o.reduce_only,
                create_time: millis_to_utc(o.time),
                update_time: millis_to_utc(o.update_time),
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<i64, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        if let Some(stop_price) = request.stop_price {
            params.push(("stopPrice", stop_price.normalize().to_string()));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let raw: NewOrderRaw = self
            .request_json(Method::POST, "/fapi/v1/order", params, true)
            .await?;
        Ok(raw.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.send(Method::DELETE, "/fapi/v1/order", params, true)
            .await
            .map(|_| ())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let info: ExchangeInfoRaw = self
            .request_json(Method::GET, "/fapi/v1/exchangeInfo", vec![], false)
            .await?;

        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::Parse(format!("symbol {} not in exchangeInfo", symbol)))?;

        let mut filters = SymbolFilters::default();
        for filter in sym.filters {
            match filter {
                FilterRaw::Price { tick_size } => filters.price_tick = tick_size,
                FilterRaw::LotSize { step_size } => filters.qty_step = step_size,
                FilterRaw::MinNotional { notional } => filters.min_notional = notional,
                FilterRaw::Other => {}
            }
        }

        Ok(filters)
    }

    async fn wallet_balance(&self, asset: &str) -> Result<WalletBalance, ExchangeError> {
        let balances: Vec<BalanceRaw> = self
            .request_json(Method::GET, "/fapi/v2/balance", vec![], true)
            .await?;

        let entry = balances
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .ok_or_else(|| ExchangeError::Parse(format!("asset {} not in balance list", asset)))?;

        Ok(WalletBalance {
            wallet_balance: entry.balance.or(entry.cross_wallet_balance),
            available_balance: entry.available_balance.or(entry.max_withdraw_amount),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        self.send(Method::POST, "/fapi/v1/leverage", params, true)
            .await
            .map(|_| ())
    }

    async fn set_isolated_margin(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("marginType", "ISOLATED".to_string()),
        ];
        let result = self.send(Method::POST, "/fapi/v1/marginType", params, true).await;
        Self::tolerate(result, CODE_MARGIN_TYPE_UNCHANGED)
    }

    async fn probe_position_mode(&self) -> Result<PositionModeProbe, ExchangeError> {
        let result: Result<PositionModeRaw, ExchangeError> = self
            .request_json(Method::GET, "/fapi/v1/positionSide/dual", vec![], true)
            .await;

        match result {
            Ok(raw) if raw.dual_side_position => Ok(PositionModeProbe::Hedge),
            Ok(_) => Ok(PositionModeProbe::OneWay),
            Err(ExchangeError::Unsupported(_)) => Ok(PositionModeProbe::Unsupported),
            Err(e) => Err(e),
        }
    }

    async fn set_one_way_mode(&self) -> Result<(), ExchangeError> {
        let params = vec![("dualSidePosition", "false".to_string())];
        let result = self
            .send(Method::POST, "/fapi/v1/positionSide/dual", params, true)
            .await;
        Self::tolerate(result, CODE_POSITION_SIDE_UNCHANGED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;

    fn client(server: &Server) -> BinanceFuturesClient {
        BinanceFuturesClient::with_base_url(&server.url(), "key".to_string(), "secret".to_string())
            .expect("client")
    }

    #[tokio::test]
    async fn test_recent_candles_parses_klines() {
        let mut server = Server::new_async().await;
        let body = r#"[
            [1700000000000, "100.0", "101.0", "99.0", "100.5", "12.3", 1700003599999, "0", 10, "0", "0", "0"],
            [1700003600000, "100.5", "102.0", "100.0", "101.7", "8.1", 1700007199999, "0", 7, "0", "0", "0"]
        ]"#;
        let mock = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1h".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let candles = client(&server)
            .recent_candles("BTCUSDT", "1h", 2)
            .await
            .expect("candles");

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(101.7));
        assert_eq!(candles[0].close_time.timestamp_millis(), 1700003599999);
        assert_eq!(candles[0].is_final, None);
    }

    #[tokio::test]
    async fn test_signed_request_carries_key_and_signature() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_header("X-MBX-APIKEY", "key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::Regex("timestamp=\\d+".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"symbol":"BTCUSDT","positionAmt":"-0.015","positionSide":"BOTH"}]"#)
            .create_async()
            .await;

        let qty = client(&server)
            .position_quantity("BTCUSDT")
            .await
            .expect("position");

        mock.assert_async().await;
        assert_eq!(qty, dec!(-0.015));
    }

    #[tokio::test]
    async fn test_api_error_body_is_mapped() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .create_async()
            .await;

        let request = OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(0.010));
        let err = client(&server).place_order(&request).await.unwrap_err();

        assert_eq!(
            err,
            ExchangeError::Api {
                code: -2019,
                msg: "Margin is insufficient.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_protective_order_params() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/fapi/v1/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("type".into(), "STOP_MARKET".into()),
                Matcher::UrlEncoded("side".into(), "SELL".into()),
                Matcher::UrlEncoded("quantity".into(), "0.01".into()),
                Matcher::UrlEncoded("stopPrice".into(), "99.8".into()),
                Matcher::UrlEncoded("reduceOnly".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"orderId":4242,"status":"NEW"}"#)
            .create_async()
            .await;

        let request = OrderRequest::protective(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::StopMarket,
            dec!(0.010),
            dec!(99.80),
        );
        let id = client(&server).place_order(&request).await.expect("order");

        mock.assert_async().await;
        assert_eq!(id, 4242);
    }

    #[tokio::test]
    async fn test_margin_type_unchanged_is_ok() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/marginType")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-4046,"msg":"No need to change margin type."}"#)
            .create_async()
            .await;

        assert!(client(&server).set_isolated_margin("BTCUSDT").await.is_ok());
    }

    #[tokio::test]
    async fn test_position_mode_probe() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/positionSide/dual")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"dualSidePosition":true}"#)
            .create_async()
            .await;

        let probe = client(&server).probe_position_mode().await.expect("probe");
        assert_eq!(probe, PositionModeProbe::Hedge);
    }

    #[tokio::test]
    async fn test_missing_endpoint_probes_unsupported() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/positionSide/dual")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("Not Found")
            .create_async()
            .await;

        let probe = client(&server).probe_position_mode().await.expect("probe");
        assert!(!probe.is_supported());
    }

    #[tokio::test]
    async fn test_symbol_filters_from_exchange_info() {
        let mut server = Server::new_async().await;
        let body = r#"{"symbols":[
            {"symbol":"ETHUSDT","filters":[{"filterType":"PRICE_FILTER","tickSize":"0.01","minPrice":"1","maxPrice":"1000000"}]},
            {"symbol":"BTCUSDT","filters":[
                {"filterType":"PRICE_FILTER","tickSize":"0.10","minPrice":"556.80","maxPrice":"4529764"},
                {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"1000"},
                {"filterType":"MARKET_LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"120"},
                {"filterType":"MIN_NOTIONAL","notional":"100"}
            ]}
        ]}"#;
        server
            .mock("GET", "/fapi/v1/exchangeInfo")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let filters = client(&server)
            .symbol_filters("BTCUSDT")
            .await
            .expect("filters");

        assert_eq!(filters.price_tick, dec!(0.1));
        assert_eq!(filters.qty_step, dec!(0.001));
        assert_eq!(filters.min_notional, dec!(100));
        assert_eq!(filters.price_decimal_places(), 1);
    }

    #[tokio::test]
    async fn test_wallet_balance_falls_back_to_alternate_fields() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v2/balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"asset":"BNB","balance":"1"},
                    {"asset":"USDT","crossWalletBalance":"250.5","maxWithdrawAmount":"240.25"}]"#,
            )
            .create_async()
            .await;

        let balance = client(&server).wallet_balance("usdt").await.expect("balance");
        assert_eq!(balance.wallet_balance, Some(dec!(250.5)));
        assert_eq!(balance.available_balance, Some(dec!(240.25)));
    }
}
