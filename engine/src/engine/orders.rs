use anyhow::Context;
use common::config::Config;
use entity::trading::{Order, OrderRequest, OrderTimeInForce, OrderType};
use log::{debug, info};
use rest::Broker;

use super::strategy::Action;

/// Turns strategy actions into market orders for the configured symbol.
pub struct OrderPlacer {
    symbol: String,
    time_in_force: OrderTimeInForce,
}

impl OrderPlacer {
    pub fn new(config: &Config) -> Self {
        // Crypto orders do not support day orders
        let time_in_force = if config.trading.is_crypto() {
            OrderTimeInForce::GoodUntilCanceled
        } else {
            OrderTimeInForce::Day
        };

        Self {
            symbol: config.trading.symbol.clone(),
            time_in_force,
        }
    }

    pub fn request(&self, action: &Action) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            qty: action.qty,
            side: action.side,
            order_type: OrderType::Market,
            time_in_force: self.time_in_force,
            limit_price: None,
            client_order_id: None,
        }
    }

    pub async fn place<B>(&self, broker: &B, action: &Action) -> anyhow::Result<Order>
    where
        B: Broker + ?Sized,
    {
        let request = self.request(action);
        debug!("Submitting {request:?}");

        let order = broker.submit_order(&request).await.with_context(|| {
            format!(
                "Failed to {} {} of {} ({})",
                action.side, action.qty, self.symbol, action.reason
            )
        })?;

        info!(
            "Submitted order {} to {} {} of {} ({})",
            order.id.hyphenated(),
            action.side,
            action.qty,
            self.symbol,
            action.reason
        );
        Ok(order)
    }
}
