mod rate_limit;

pub use rate_limit::RateLimiter;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use common::config::Config;
use entity::data::Bar;
use entity::mapping::{map_record, RawRecord, RecordKind};
use entity::trading::*;
use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const KEY_ID_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_KEY_HEADER: &str = "APCA-API-SECRET-KEY";

const RATE_LIMIT: usize = 200;
const MIN_RATE: usize = 50;
const BAR_PAGE_LIMIT: &str = "10000";

/// A historical bars request.
#[derive(Debug, Clone, Copy)]
pub struct BarQuery<'a> {
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
    /// When non-empty, bars from other exchanges are dropped. Bars without an exchange are kept.
    pub exchanges: &'a [String],
}

/// The brokerage operations the trading loop depends on.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn account(&self) -> anyhow::Result<Account>;

    /// The open position in `symbol`, or `None` when there is none.
    async fn position(&self, symbol: &str) -> anyhow::Result<Option<Position>>;

    async fn submit_order(&self, order: &OrderRequest) -> anyhow::Result<Order>;

    async fn bars(&self, query: BarQuery<'_>) -> anyhow::Result<Vec<Bar>>;
}

#[derive(Clone)]
pub struct AlpacaRestApi {
    config: Arc<Config>,
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl AlpacaRestApi {
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let me = Self {
            config,
            client: Client::new(),
            limiter: Arc::new(RateLimiter::new(RATE_LIMIT, MIN_RATE)),
        };

        let account = me
            .account()
            .await
            .context("Failed to fetch account information")?;

        if !account.can_trade() {
            return Err(anyhow!(
                "Account {} cannot trade (status {}, trading blocked: {}, account blocked: {})",
                account.account_number,
                account.status,
                account.trading_blocked,
                account.account_blocked
            ));
        }

        Ok(me)
    }

    fn trading_endpoint(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.client
            .request(
                method,
                format!("{}{endpoint}", self.config.urls.alpaca_api_base),
            )
            .header(KEY_ID_HEADER, &self.config.keys.alpaca_key_id)
            .header(SECRET_KEY_HEADER, &self.config.keys.alpaca_secret_key)
    }

    fn data_endpoint(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{endpoint}", self.config.urls.alpaca_data_api))
            .header(KEY_ID_HEADER, &self.config.keys.alpaca_key_id)
            .header(SECRET_KEY_HEADER, &self.config.keys.alpaca_secret_key)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        self.send_optional(request)
            .await?
            .ok_or_else(|| anyhow!("Requested resource was not found"))
    }

    /// Like `send`, but a 404 response yields `None`.
    async fn send_optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> anyhow::Result<Option<T>> {
        self.limiter.throttle_request().await;

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            return Err(anyhow!("Request failed with status {status}: {text}"));
        }

        let res = serde_json::from_str(&text).context("Failed to parse response");
        if res.is_err() {
            debug!("{text}");
        }
        res.map(Some)
    }

    pub async fn account(&self) -> anyhow::Result<Account> {
        self.send(self.trading_endpoint(Method::GET, "/account"))
            .await
    }

    pub async fn positions(&self) -> anyhow::Result<Vec<Position>> {
        self.send(self.trading_endpoint(Method::GET, "/positions"))
            .await
    }

    pub async fn position(&self, symbol: &str) -> anyhow::Result<Option<Position>> {
        self.send_optional(
            self.trading_endpoint(Method::GET, &format!("/positions/{}", position_path(symbol))),
        )
        .await
    }

    pub async fn orders(
        &self,
        status: RequestOrderStatus,
        limit: usize,
    ) -> anyhow::Result<Vec<Order>> {
        self.send(
            self.trading_endpoint(Method::GET, "/orders")
                .query(&(("status", status), ("limit", limit), ("direction", "desc"))),
        )
        .await
    }

    pub async fn submit_order(&self, order: &OrderRequest) -> anyhow::Result<Order> {
        self.send(
            self.trading_endpoint(Method::POST, "/orders")
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(order)?.into_bytes()),
        )
        .await
    }

    /// Fetches every page of bars in the queried range, normalized through the key mapper.
    pub async fn bars(&self, query: BarQuery<'_>) -> anyhow::Result<Vec<Bar>> {
        let crypto = self.config.trading.is_crypto_symbol(query.symbol);
        let start = query.start.format(&Rfc3339)?;
        let end = query.end.map(|end| end.format(&Rfc3339)).transpose()?;

        let mut bars = Vec::new();
        let mut next_page_token: Option<String> = None;

        loop {
            let request = if crypto {
                self.data_endpoint(&format!(
                    "/v1beta3/crypto/{}/bars",
                    self.config.urls.crypto_location
                ))
                .query(&[("symbols", query.symbol)])
            } else {
                self.data_endpoint(&format!("/v2/stocks/{}/bars", query.symbol))
                    .query(&[("feed", self.config.urls.alpaca_stream_endpoint.as_str())])
            };

            let mut request = request.query(&[
                ("timeframe", query.timeframe),
                ("limit", BAR_PAGE_LIMIT),
                ("start", start.as_str()),
            ]);
            if let Some(end) = &end {
                request = request.query(&[("end", end)]);
            }
            if let Some(page_token) = &next_page_token {
                request = request.query(&[("page_token", page_token)]);
            }

            let page: BarsPage = self.send(request).await?;
            let raw_bars = page.bars.into_records(query.symbol);
            bars.extend(
                raw_bars
                    .into_iter()
                    .filter_map(|raw| normalize_bar(query.symbol, raw))
                    .filter(|bar| allowed_exchange(query.exchanges, &bar.exchange)),
            );

            next_page_token = page.next_page_token;
            if next_page_token.is_none() {
                break;
            }
        }

        bars.sort_by_key(|bar| bar.time);
        Ok(bars)
    }
}

#[async_trait]
impl Broker for AlpacaRestApi {
    async fn account(&self) -> anyhow::Result<Account> {
        AlpacaRestApi::account(self).await
    }

    async fn position(&self, symbol: &str) -> anyhow::Result<Option<Position>> {
        AlpacaRestApi::position(self, symbol).await
    }

    async fn submit_order(&self, order: &OrderRequest) -> anyhow::Result<Order> {
        AlpacaRestApi::submit_order(self, order).await
    }

    async fn bars(&self, query: BarQuery<'_>) -> anyhow::Result<Vec<Bar>> {
        AlpacaRestApi::bars(self, query).await
    }
}

#[derive(Serialize, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrderStatus {
    Open,
    Closed,
    All,
}

#[derive(Deserialize)]
struct BarsPage {
    #[serde(default)]
    bars: PageBars,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Single-symbol stock pages carry a list, multi-symbol crypto pages a map keyed by symbol. A
/// `null` list lands in `Missing`.
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum PageBars {
    #[default]
    Missing,
    List(Vec<RawRecord>),
    BySymbol(HashMap<String, Vec<RawRecord>>),
}

impl PageBars {
    fn into_records(self, symbol: &str) -> Vec<RawRecord> {
        match self {
            Self::Missing => Vec::new(),
            Self::List(records) => records,
            Self::BySymbol(mut by_symbol) => by_symbol.remove(symbol).unwrap_or_default(),
        }
    }
}

fn normalize_bar(symbol: &str, mut raw: RawRecord) -> Option<Bar> {
    raw.insert("S".to_owned(), Value::String(symbol.to_owned()));

    match Bar::try_from(map_record(RecordKind::Bar, &raw)) {
        Ok(bar) => Some(bar),
        Err(error) => {
            warn!("Dropping historical bar for {symbol}: {error}");
            None
        }
    }
}

fn allowed_exchange(exchanges: &[String], exchange: &str) -> bool {
    exchange.is_empty() || exchanges.is_empty() || exchanges.iter().any(|allowed| allowed == exchange)
}

/// Position endpoints take crypto pairs without the separator.
fn position_path(symbol: &str) -> String {
    symbol.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn stock_pages_carry_a_list() {
        let page: BarsPage = serde_json::from_value(json!({
            "bars": [
                { "t": "2022-01-03T15:00:00Z", "o": 1, "h": 2, "l": 1, "c": 2, "v": 10, "n": 1, "vw": 1.5 }
            ],
            "symbol": "AAPL",
            "next_page_token": "abc"
        }))
        .unwrap();

        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
        let bars = page
            .bars
            .into_records("AAPL")
            .into_iter()
            .filter_map(|raw| normalize_bar("AAPL", raw))
            .collect::<Vec<_>>();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "AAPL");
        assert_eq!(bars[0].time, datetime!(2022-01-03 15:00:00 UTC));
    }

    #[test]
    fn crypto_pages_are_keyed_by_symbol() {
        let page: BarsPage = serde_json::from_value(json!({
            "bars": {
                "BTC/USD": [
                    { "t": "2022-01-03T15:00:00Z", "o": 1, "h": 2, "l": 1, "c": 2, "v": 0.5 },
                    { "t": "2022-01-03T15:01:00Z", "o": 2, "h": 3, "l": 2, "c": 3, "v": 0.25 }
                ]
            },
            "next_page_token": null
        }))
        .unwrap();

        assert!(page.next_page_token.is_none());
        assert_eq!(page.bars.into_records("BTC/USD").len(), 2);
    }

    #[test]
    fn empty_pages() {
        let page: BarsPage =
            serde_json::from_value(json!({ "bars": null, "next_page_token": null })).unwrap();
        assert!(page.bars.into_records("AAPL").is_empty());

        let page: BarsPage = serde_json::from_value(json!({})).unwrap();
        assert!(page.bars.into_records("AAPL").is_empty());
    }

    #[test]
    fn malformed_bars_are_dropped() {
        let mut raw = RawRecord::new();
        raw.insert("t".to_owned(), json!("2022-01-03T15:00:00Z"));
        assert!(normalize_bar("AAPL", raw).is_none());
    }

    #[test]
    fn exchange_allow_list() {
        let allowed = vec!["CBSE".to_owned()];
        assert!(allowed_exchange(&allowed, "CBSE"));
        assert!(allowed_exchange(&allowed, ""));
        assert!(!allowed_exchange(&allowed, "ERSX"));
        assert!(allowed_exchange(&[], "ERSX"));
    }

    #[test]
    fn crypto_position_paths() {
        assert_eq!(position_path("BTC/USD"), "BTCUSD");
        assert_eq!(position_path("AAPL"), "AAPL");
    }
}
