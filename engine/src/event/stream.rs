use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use anyhow::{anyhow, Context};
use common::config::Config;
use entity::{
    mapping::RawRecord,
    stream::{
        parse_frame, ControlMessage, StreamAction, StreamItem, Subscriptions, SuccessMessage,
    },
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{interval_at, sleep, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const PING_FREQUENCY: Duration = Duration::from_millis(30 * 1000);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives the still wire-keyed record of every matching data message.
pub type Handler = Box<dyn FnMut(RawRecord) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Market {
    Equity,
    Crypto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Trades,
    Quotes,
    Bars,
    DailyBars,
    Statuses,
    Lulds,
    CryptoTrades,
    CryptoQuotes,
    CryptoBars,
    CryptoDailyBars,
}

impl Channel {
    pub fn market(&self) -> Market {
        match self {
            Self::Trades
            | Self::Quotes
            | Self::Bars
            | Self::DailyBars
            | Self::Statuses
            | Self::Lulds => Market::Equity,
            Self::CryptoTrades | Self::CryptoQuotes | Self::CryptoBars | Self::CryptoDailyBars => {
                Market::Crypto
            }
        }
    }

    /// Name of the channel in `subscribe` actions.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Trades | Self::CryptoTrades => "trades",
            Self::Quotes | Self::CryptoQuotes => "quotes",
            Self::Bars | Self::CryptoBars => "bars",
            Self::DailyBars | Self::CryptoDailyBars => "dailyBars",
            Self::Statuses => "statuses",
            Self::Lulds => "lulds",
        }
    }

    /// The `T` tag of the channel's data messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Trades | Self::CryptoTrades => "t",
            Self::Quotes | Self::CryptoQuotes => "q",
            Self::Bars | Self::CryptoBars => "b",
            Self::DailyBars | Self::CryptoDailyBars => "d",
            Self::Statuses => "s",
            Self::Lulds => "l",
        }
    }

    fn add_to(&self, subscriptions: &mut Subscriptions, symbol: &str) {
        let symbols = match self {
            Self::Trades | Self::CryptoTrades => &mut subscriptions.trades,
            Self::Quotes | Self::CryptoQuotes => &mut subscriptions.quotes,
            Self::Bars | Self::CryptoBars => &mut subscriptions.bars,
            Self::DailyBars | Self::CryptoDailyBars => &mut subscriptions.daily_bars,
            Self::Statuses => &mut subscriptions.statuses,
            Self::Lulds => &mut subscriptions.lulds,
        };

        if !symbols.iter().any(|existing| existing == symbol) {
            symbols.push(symbol.to_owned());
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.market() {
            Market::Equity => f.write_str(self.wire_name()),
            Market::Crypto => write!(f, "crypto {}", self.wire_name()),
        }
    }
}

/// The server refused the handshake, retrying with the same credentials cannot help.
#[derive(Debug)]
pub struct StreamRejection {
    pub code: u16,
    pub message: String,
}

impl Display for StreamRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "stream rejected the connection ({}): {}", self.code, self.message)
    }
}

impl Error for StreamRejection {}

struct Registration {
    channel: Channel,
    symbol: String,
    handler: Handler,
}

enum SessionEnd {
    Stopped,
    Disconnected,
}

/// A market data websocket connection for one market, with reconnects.
pub struct StreamTransport {
    url: String,
    market: Market,
    key_id: String,
    secret_key: String,
    max_reconnect_attempts: u32,
    registrations: Vec<Registration>,
}

impl StreamTransport {
    pub fn new(config: &Config, market: Market) -> Self {
        let base = config.urls.alpaca_stream_url.trim_end_matches('/');
        let url = match market {
            Market::Equity => format!("{base}/v2/{}", config.urls.alpaca_stream_endpoint),
            Market::Crypto => format!("{base}/v1beta3/crypto/{}", config.urls.crypto_location),
        };

        Self {
            url,
            market,
            key_id: config.keys.alpaca_key_id.clone(),
            secret_key: config.keys.alpaca_secret_key.clone(),
            max_reconnect_attempts: config.stream.max_reconnect_attempts.max(1),
            registrations: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Routes data messages of `channel` for `symbol` (or every symbol with `*`) to `handler`.
    pub fn register(&mut self, channel: Channel, symbol: &str, handler: Handler) -> anyhow::Result<()> {
        if channel.market() != self.market {
            return Err(anyhow!(
                "Cannot register {channel} on a {:?} stream",
                self.market
            ));
        }

        self.registrations.push(Registration {
            channel,
            symbol: symbol.to_owned(),
            handler,
        });
        Ok(())
    }

    pub fn subscriptions(&self) -> Subscriptions {
        let mut subscriptions = Subscriptions::default();
        for registration in &self.registrations {
            registration
                .channel
                .add_to(&mut subscriptions, &registration.symbol);
        }
        subscriptions
    }

    /// Runs until stopped, reconnecting after unexpected disconnects.
    ///
    /// Fails when the server rejects the handshake or after too many consecutive failed
    /// connection attempts.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.registrations.is_empty() {
            return Err(anyhow!("No channels were registered on the stream"));
        }

        let mut failures = 0u32;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let connection = tokio::select! {
                connection = self.connect() => connection,
                _ = wait_for_stop(&mut stop) => return Ok(()),
            };

            match connection {
                Ok(socket) => {
                    failures = 0;
                    backoff = INITIAL_BACKOFF;
                    info!("Connected to {}", self.url);

                    match self.session(socket, &mut stop).await {
                        Ok(SessionEnd::Stopped) => {
                            info!("Stream closed");
                            return Ok(());
                        }
                        Ok(SessionEnd::Disconnected) => warn!("Stream disconnected unexpectedly"),
                        Err(error) => warn!("Stream connection failed: {error:?}"),
                    }
                }
                Err(error) if error.downcast_ref::<StreamRejection>().is_some() => {
                    return Err(error.context("Failed to authenticate with the stream"));
                }
                Err(error) => {
                    failures += 1;
                    if failures >= self.max_reconnect_attempts {
                        return Err(error.context(format!(
                            "Giving up on the stream after {failures} failed connection attempts"
                        )));
                    }
                    warn!("Failed to connect ({failures}/{}): {error:?}", self.max_reconnect_attempts);
                }
            }

            debug!("Reconnecting in {backoff:?}");
            tokio::select! {
                _ = sleep(backoff) => (),
                _ = wait_for_stop(&mut stop) => return Ok(()),
            }
            backoff = next_backoff(backoff);
        }
    }

    async fn session(
        &mut self,
        socket: WebSocket,
        stop: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        let (mut send, mut recv) = socket.split();

        let subscriptions = self.subscriptions();
        send.send(Message::Text(StreamAction::Subscribe(&subscriptions).to_json()?))
            .await
            .context("Failed to send subscribe action")?;

        let mut ping_check = interval_at(Instant::now() + PING_FREQUENCY, PING_FREQUENCY);
        let mut last_message_recv_time = Instant::now();
        let mut pong_pending = false;

        loop {
            tokio::select! {
                _ = wait_for_stop(stop) => {
                    if let Err(error) = send.send(Message::Close(None)).await {
                        warn!("Failed to send close message: {error:?}");
                    }
                    return Ok(SessionEnd::Stopped);
                }
                _ = ping_check.tick() => {
                    if pong_pending {
                        error!("WebSocket stream timed out");
                        let _ = send.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Disconnected);
                    }

                    if last_message_recv_time.elapsed() >= PING_FREQUENCY {
                        send.send(Message::Ping(vec![0xde, 0xad, 0xbe, 0xef]))
                            .await
                            .context("Failed to send ping")?;
                        pong_pending = true;
                    }
                }
                message = recv.next() => {
                    let message = match message {
                        Some(message) => message.context("WebSocket stream entered erroneous state")?,
                        None => return Ok(SessionEnd::Disconnected),
                    };
                    last_message_recv_time = Instant::now();

                    match message {
                        Message::Text(text) => self.handle_frame(&text),
                        Message::Ping(data) => {
                            // Graceful error handling here doesn't gain us a whole lot
                            let _ = send.send(Message::Pong(data)).await;
                        }
                        Message::Pong(_) => pong_pending = false,
                        Message::Close(_) => return Ok(SessionEnd::Disconnected),
                        message @ (Message::Binary(_) | Message::Frame(_)) => {
                            warn!("Received unexpected message type: {message:?}");
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match parse_frame(text) {
            Ok(items) => items.into_iter().for_each(|item| self.dispatch(item)),
            Err(error) => warn!("Received malformed incoming message: {error:?}"),
        }
    }

    /// Hands a data message to every matching handler. Handler errors are logged and dropped.
    pub fn dispatch(&mut self, item: StreamItem) {
        let (tag, record) = match item {
            StreamItem::Data { tag, record } => (tag, record),
            StreamItem::Control(ControlMessage::Subscription(subscriptions)) => {
                info!("Subscribed to {subscriptions:?}");
                return;
            }
            StreamItem::Control(ControlMessage::Error { code, msg }) => {
                warn!("Received error message with code {code}: {msg}");
                return;
            }
            StreamItem::Control(message @ ControlMessage::Success { .. }) => {
                warn!("Received unexpected success status message: {message:?}");
                return;
            }
        };

        let symbol = record.get("S").and_then(Value::as_str).unwrap_or_default().to_owned();
        let mut delivered = false;

        for registration in self.registrations.iter_mut().filter(|registration| {
            registration.channel.tag() == tag
                && (registration.symbol == "*" || registration.symbol == symbol)
        }) {
            delivered = true;
            if let Err(error) = (registration.handler)(record.clone()) {
                error!(
                    "Handler for {} of {symbol} failed: {error:?}",
                    registration.channel
                );
            }
        }

        if !delivered {
            debug!("No handler for {tag} message of {symbol}");
        }
    }

    async fn connect(&self) -> anyhow::Result<WebSocket> {
        let (mut socket, response) = connect_async(self.url.as_str()).await?;
        let status = response.status();
        if !status.is_success() && !status.is_informational() {
            return Err(anyhow!(
                "Received unsuccessful status response while establishing stream connection: {}",
                status
            ));
        }

        check_status(&mut socket, SuccessMessage::Connected).await?;

        socket
            .send(Message::Text(
                StreamAction::Authenticate {
                    key: &self.key_id,
                    secret: &self.secret_key,
                }
                .to_json()?,
            ))
            .await?;

        check_status(&mut socket, SuccessMessage::Authenticated).await?;

        Ok(socket)
    }
}

async fn check_status(socket: &mut WebSocket, expected_status: SuccessMessage) -> anyhow::Result<()> {
    let response = match socket.next().await {
        Some(response) => response?,
        None => return Err(anyhow!("Socket closed unexpectedly")),
    };

    let text = match response {
        Message::Text(text) => text,
        _ => {
            return Err(anyhow!(
                "Received unexpected message type during connection handshake"
            ))
        }
    };

    let mut items = parse_frame(&text)?;
    if items.len() != 1 {
        return Err(anyhow!(
            "Expected to receive one message, found {}",
            items.len()
        ));
    }

    match items.remove(0) {
        StreamItem::Control(ControlMessage::Success { msg }) if msg == expected_status => Ok(()),
        StreamItem::Control(ControlMessage::Success { msg }) => Err(anyhow!(
            "Expected status {expected_status:?} but got status {msg:?}"
        )),
        StreamItem::Control(ControlMessage::Error { code, msg }) => {
            Err(StreamRejection { code, message: msg }.into())
        }
        item => Err(anyhow!("Expected status message, but received {item:?}")),
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
pub async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn config() -> Config {
        testing::config(&[])
    }

    fn recorder() -> (Arc<Mutex<Vec<RawRecord>>>, Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Box::new({
            let seen = Arc::clone(&seen);
            move |record| {
                seen.lock().unwrap().push(record);
                Ok(())
            }
        });
        (seen, handler)
    }

    fn data(value: serde_json::Value) -> StreamItem {
        match value {
            serde_json::Value::Object(record) => StreamItem::Data {
                tag: record["T"].as_str().unwrap().to_owned(),
                record,
            },
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn endpoints_per_market() {
        let config = config();
        assert_eq!(
            StreamTransport::new(&config, Market::Equity).url(),
            "wss://stream.data.alpaca.markets/v2/iex"
        );
        assert_eq!(
            StreamTransport::new(&config, Market::Crypto).url(),
            "wss://stream.data.alpaca.markets/v1beta3/crypto/us"
        );
    }

    #[test]
    fn channels_must_match_the_market() {
        let mut transport = StreamTransport::new(&config(), Market::Crypto);
        let (_, handler) = recorder();
        assert!(transport.register(Channel::Bars, "AAPL", handler).is_err());

        let (_, handler) = recorder();
        assert!(transport.register(Channel::CryptoBars, "BTC/USD", handler).is_ok());
    }

    #[test]
    fn subscriptions_group_symbols_by_channel() {
        let mut transport = StreamTransport::new(&config(), Market::Equity);
        for channel in [Channel::Trades, Channel::Bars, Channel::Statuses] {
            let (_, handler) = recorder();
            transport.register(channel, "AAPL", handler).unwrap();
        }
        let (_, handler) = recorder();
        transport.register(Channel::Bars, "AAPL", handler).unwrap();

        let subscriptions = transport.subscriptions();
        assert_eq!(subscriptions.trades, vec!["AAPL"]);
        assert_eq!(subscriptions.bars, vec!["AAPL"]);
        assert_eq!(subscriptions.statuses, vec!["AAPL"]);
        assert!(subscriptions.quotes.is_empty());
    }

    #[test]
    fn data_messages_reach_matching_handlers() {
        let mut transport = StreamTransport::new(&config(), Market::Equity);
        let (bars, handler) = recorder();
        transport.register(Channel::Bars, "AAPL", handler).unwrap();
        let (trades, handler) = recorder();
        transport.register(Channel::Trades, "*", handler).unwrap();

        transport.dispatch(data(json!({ "T": "b", "S": "AAPL", "c": 1 })));
        transport.dispatch(data(json!({ "T": "b", "S": "MSFT", "c": 2 })));
        transport.dispatch(data(json!({ "T": "t", "S": "MSFT", "p": 3 })));
        transport.dispatch(data(json!({ "T": "q", "S": "AAPL", "ap": 4 })));

        assert_eq!(bars.lock().unwrap().len(), 1);
        assert_eq!(trades.lock().unwrap().len(), 1);
        assert_eq!(trades.lock().unwrap()[0]["S"], "MSFT");
    }

    #[test]
    fn handler_errors_do_not_stop_delivery() {
        let mut transport = StreamTransport::new(&config(), Market::Equity);
        transport
            .register(Channel::Bars, "AAPL", Box::new(|_| Err(anyhow!("boom"))))
            .unwrap();
        let (bars, handler) = recorder();
        transport.register(Channel::Bars, "AAPL", handler).unwrap();

        transport.handle_frame(r#"[{"T":"b","S":"AAPL"},{"T":"b","S":"AAPL"}]"#);
        assert_eq!(bars.lock().unwrap().len(), 2);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn stop_signal_resolves_waiters() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_stop(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_stop(&mut rx).await;
    }
}
