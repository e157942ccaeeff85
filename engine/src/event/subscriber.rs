use anyhow::{anyhow, Context};
use common::config::BarSize;
use entity::{
    data::MarketEvent,
    mapping::{map_record, RawRecord, RecordKind},
};
use log::{debug, info};
use serde_json::Value;
use tokio::sync::watch;

use super::{
    stream::{Channel, Market, StreamTransport},
    EventQueue,
};
use crate::context::AppContext;

/// Subscribes to the market data of the configured symbol and feeds it into the event queue.
pub struct Subscriber {
    context: AppContext,
    symbol: String,
    market: Market,
    channels: Vec<Channel>,
}

impl Subscriber {
    pub fn new(context: AppContext) -> Self {
        let trading = &context.config.trading;
        let daily = trading.bar_size == BarSize::Day;

        let (market, channels) = if trading.is_crypto() {
            let bars = if daily {
                Channel::CryptoDailyBars
            } else {
                Channel::CryptoBars
            };
            (
                Market::Crypto,
                vec![Channel::CryptoTrades, Channel::CryptoQuotes, bars],
            )
        } else {
            let bars = if daily { Channel::DailyBars } else { Channel::Bars };
            (
                Market::Equity,
                vec![
                    Channel::Trades,
                    Channel::Quotes,
                    bars,
                    Channel::Statuses,
                    Channel::Lulds,
                ],
            )
        };

        Self {
            symbol: trading.symbol.clone(),
            context,
            market,
            channels,
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    #[cfg(test)]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn subscribe(&self, transport: &mut StreamTransport) -> anyhow::Result<()> {
        for &channel in &self.channels {
            let queue = self.context.queue.clone();
            transport.register(
                channel,
                &self.symbol,
                Box::new(move |raw| enqueue(&queue, raw)),
            )?;
        }

        info!(
            "Subscribed to {} for {}",
            self.channels
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            self.symbol
        );
        Ok(())
    }

    /// Streams until the transport returns, then runs the stop hook.
    pub async fn run(
        &self,
        mut transport: StreamTransport,
        stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Starting subscriber for {}", self.symbol);
        self.subscribe(&mut transport)?;

        let result = transport.run(stop).await;
        self.stop();
        result
    }

    pub fn stop(&self) {
        info!(
            "Stopping subscriber for {} ({} events waiting)",
            self.symbol,
            self.context.queue.len()
        );
    }
}

/// Drops the `T` tag and renames `S` to `symbol`. Returns the tag alongside the cleaned record.
pub fn clean_message(mut message: RawRecord) -> (Option<String>, RawRecord) {
    let tag = match message.remove("T") {
        Some(Value::String(tag)) => Some(tag),
        _ => None,
    };

    if let Some(symbol) = message.remove("S") {
        message.insert("symbol".to_owned(), symbol);
    }

    (tag, message)
}

/// Normalizes one data message and puts it on the queue.
pub fn enqueue(queue: &EventQueue<MarketEvent>, message: RawRecord) -> anyhow::Result<()> {
    let (tag, record) = clean_message(message);
    let kind = tag
        .as_deref()
        .and_then(RecordKind::from_wire_tag)
        .ok_or_else(|| anyhow!("Unsupported message type {tag:?}"))?;

    debug!("Received {kind}: {record:?}");

    let event = MarketEvent::try_from(map_record(kind, &record))
        .with_context(|| format!("Failed to build {kind} from stream message"))?;
    queue.put(event).context("Failed to enqueue event")?;

    Ok(())
}
