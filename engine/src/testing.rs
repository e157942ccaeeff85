//! Fixtures shared by the engine's unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use anyhow::anyhow;
use async_trait::async_trait;
use common::config::{Config, OnDiskConfig};
use entity::{
    data::Bar,
    trading::{Account, Order, OrderRequest, Position},
};
use rest::{BarQuery, Broker};
use rust_decimal::Decimal;
use serde_json::json;
use time::{macros::datetime, Duration};

use crate::context::AppContext;

pub fn config(vars: &[(&str, &str)]) -> Config {
    let vars = vars
        .iter()
        .map(|&(key, value)| (key.to_owned(), value.to_owned()))
        .collect::<Vec<_>>();

    Config::from_sources(OnDiskConfig::default(), None, |name| {
        Ok(match name {
            "APCA_API_KEY_ID" => Some("key".to_owned()),
            "APCA_API_SECRET_KEY" => Some("secret".to_owned()),
            _ => vars
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone()),
        })
    })
    .unwrap()
}

pub fn context(vars: &[(&str, &str)]) -> AppContext {
    AppContext::new(config(vars))
}

pub fn bar(symbol: &str, minute: i64, close: Decimal) -> Bar {
    Bar {
        symbol: symbol.to_owned(),
        exchange: String::new(),
        time: datetime!(2022-01-03 15:00 UTC) + Duration::minutes(minute),
        open: close,
        high: close,
        low: close,
        close,
        volume: Decimal::ONE_HUNDRED,
        trade_count: 1,
        vwap: close,
    }
}

pub fn position(symbol: &str, qty: Decimal, avg_entry_price: Decimal) -> Position {
    serde_json::from_value(json!({
        "symbol": symbol,
        "exchange": "NASDAQ",
        "asset_class": "us_equity",
        "avg_entry_price": avg_entry_price.to_string(),
        "qty": qty.abs().to_string(),
        "side": if qty.is_sign_negative() { "short" } else { "long" },
        "market_value": "0",
        "cost_basis": "0",
        "unrealized_pl": "0"
    }))
    .unwrap()
}

/// An in-memory broker that records submitted orders.
#[derive(Default)]
pub struct MockBroker {
    pub cash: Mutex<Decimal>,
    pub position: Mutex<Option<Position>>,
    pub history: Vec<Bar>,
    pub orders: Mutex<Vec<OrderRequest>>,
    /// Number of upcoming position queries that fail.
    pub position_failures: AtomicUsize,
    pub position_queries: AtomicUsize,
    pub reject_orders: AtomicBool,
}

impl MockBroker {
    pub fn with_cash(cash: Decimal) -> Self {
        Self {
            cash: Mutex::new(cash),
            ..Self::default()
        }
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn account(&self) -> anyhow::Result<Account> {
        let cash = self.cash.lock().unwrap().to_string();
        Ok(serde_json::from_value(json!({
            "id": "0a6b5b6e-3f4c-4a1e-9d4e-3b1f2c3d4e5f",
            "account_number": "PA1234567",
            "status": "ACTIVE",
            "currency": "USD",
            "cash": cash,
            "portfolio_value": cash,
            "pattern_day_trader": false,
            "trade_suspended_by_user": false,
            "trading_blocked": false,
            "transfers_blocked": false,
            "account_blocked": false,
            "created_at": "2021-06-01T12:00:00Z",
            "shorting_enabled": true,
            "equity": cash,
            "last_equity": cash,
            "buying_power": cash
        }))?)
    }

    async fn position(&self, _symbol: &str) -> anyhow::Result<Option<Position>> {
        self.position_queries.fetch_add(1, Ordering::SeqCst);

        let failures = self.position_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.position_failures.store(failures - 1, Ordering::SeqCst);
            return Err(anyhow!("connection reset"));
        }

        Ok(self.position.lock().unwrap().clone())
    }

    async fn submit_order(&self, order: &OrderRequest) -> anyhow::Result<Order> {
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(anyhow!("insufficient buying power"));
        }

        self.orders.lock().unwrap().push(order.clone());
        Ok(serde_json::from_value(json!({
            "id": "61e69015-8549-4bfd-b9c3-01e75843f47d",
            "client_order_id": "mock",
            "symbol": order.symbol,
            "status": "accepted",
            "side": order.side,
            "type": order.order_type,
            "qty": order.qty.to_string(),
            "submitted_at": "2022-01-03T15:05:00Z"
        }))?)
    }

    async fn bars(&self, query: BarQuery<'_>) -> anyhow::Result<Vec<Bar>> {
        Ok(self
            .history
            .iter()
            .filter(|bar| bar.symbol == query.symbol)
            .cloned()
            .collect())
    }
}
