use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context};
use common::config::Config;
use entity::data::{Bar, MarketEvent};
use history::BarStore;
use log::{debug, error, info, trace, warn};
use rest::{AlpacaRestApi, BarQuery, Broker};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::{
    runtime::{self, Runtime},
    sync::oneshot,
};

use super::{
    orders::OrderPlacer,
    strategy::{self, DecisionContext, Observation, PositionSnapshot, PositionState, Strategy},
};
use crate::context::AppContext;

const QUERY_ATTEMPTS: u32 = 3;
const QUERY_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub events: u64,
    pub bars_accepted: u64,
    pub orders_placed: u64,
    pub failures: u64,
}

/// Resolves once the dispatcher is ready to consume events, or with the error that stopped it.
pub type Ready = oneshot::Receiver<anyhow::Result<()>>;

/// Starts the dispatcher on its own thread, which connects to the broker and warms up the
/// strategy before it starts taking events off the queue.
pub fn spawn(context: AppContext) -> anyhow::Result<(JoinHandle<()>, Ready)> {
    let (ready_tx, ready_rx) = oneshot::channel();

    let handle = thread::Builder::new()
        .name("dispatcher".to_owned())
        .spawn(move || {
            let runtime = match runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    let error = anyhow!(error).context("Failed to build dispatcher runtime");
                    let _ = ready_tx.send(Err(error));
                    return;
                }
            };

            let setup = runtime.block_on(async {
                let broker = AlpacaRestApi::new(Arc::clone(&context.config)).await?;
                let store = open_store(&context.config).await?;

                let mut dispatcher = Dispatcher::new(context, broker, store);
                dispatcher.warm_up().await;
                anyhow::Ok(dispatcher)
            });

            match setup {
                Ok(dispatcher) => {
                    let _ = ready_tx.send(Ok(()));
                    dispatcher.run(&runtime);
                }
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                }
            }
        })
        .context("Failed to spawn dispatcher thread")?;

    Ok((handle, ready_rx))
}

async fn open_store(config: &Config) -> anyhow::Result<Option<BarStore>> {
    if !config.storage.save_data {
        return Ok(None);
    }

    let store = BarStore::open(&config.storage.database_url)
        .await
        .with_context(|| format!("Failed to open bar store at {}", config.storage.database_url))?;
    Ok(Some(store))
}

/// Consumes the event queue and drives the strategy for the configured symbol.
pub struct Dispatcher<B> {
    context: AppContext,
    broker: B,
    store: Option<BarStore>,
    strategy: Box<dyn Strategy>,
    placer: OrderPlacer,
    retry_delay: Duration,
    stats: DispatchStats,
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(context: AppContext, broker: B, store: Option<BarStore>) -> Self {
        let strategy = strategy::from_config(&context.config);
        Self::with_strategy(context, broker, store, strategy)
    }

    pub fn with_strategy(
        context: AppContext,
        broker: B,
        store: Option<BarStore>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        let placer = OrderPlacer::new(&context.config);

        Self {
            context,
            broker,
            store,
            strategy,
            placer,
            retry_delay: QUERY_RETRY_DELAY,
            stats: DispatchStats::default(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[cfg(test)]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    fn symbol(&self) -> &str {
        &self.context.config.trading.symbol
    }

    /// Seeds the strategy with recent history, from the local store when it holds enough bars and
    /// from the REST API otherwise. Failures only cost the strategy its head start.
    pub async fn warm_up(&mut self) {
        let config = Arc::clone(&self.context.config);
        let wanted = config.strategy.long_window;

        let mut bars = match &self.store {
            Some(store) => store
                .recent_bars(self.symbol(), wanted)
                .await
                .unwrap_or_else(|error| {
                    warn!("Failed to read stored bars: {error:?}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        if bars.len() < wanted {
            let end = OffsetDateTime::now_utc();
            let exchanges: &[String] = if config.trading.is_crypto() {
                config.trading.allowed_crypto_exchanges.as_slice()
            } else {
                &[]
            };
            let query = BarQuery {
                symbol: &config.trading.symbol,
                timeframe: config.trading.bar_size.timeframe(),
                start: end - time::Duration::hours(i64::from(config.trading.history_lookback_hours)),
                end: Some(end),
                exchanges,
            };

            match self.broker.bars(query).await {
                Ok(fetched) => {
                    debug!("Fetched {} historical bars", fetched.len());
                    for bar in &fetched {
                        self.persist(bar).await;
                    }
                    if fetched.len() > bars.len() {
                        bars = fetched;
                    }
                }
                Err(error) => warn!("Failed to fetch historical bars: {error:?}"),
            }
        }

        let accepted = bars
            .iter()
            .filter(|bar| self.strategy.observe(bar) == Observation::Accepted)
            .count();
        info!(
            "Warmed up {} strategy for {} with {accepted} bars",
            self.strategy.name(),
            self.symbol()
        );
    }

    /// Blocks on the queue until it is closed and drained. Every event taken is acknowledged,
    /// including those whose handling failed or panicked.
    pub fn run(mut self, runtime: &Runtime) {
        let queue = self.context.queue.clone();
        info!("Dispatcher started");

        while let Some(event) = queue.get() {
            self.stats.events += 1;

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(self.handle(event))));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.stats.failures += 1;
                    error!("Failed to process event: {error:?}");
                }
                Err(_) => {
                    self.stats.failures += 1;
                    error!("Dispatcher panicked while processing an event");
                }
            }

            queue.task_done();
            debug!("{:?}", self.stats);
        }

        if let Some(store) = &self.store {
            runtime.block_on(store.close());
        }
        info!("Dispatcher stopped: {:?}", self.stats);
    }

    pub async fn handle(&mut self, event: MarketEvent) -> anyhow::Result<()> {
        match event {
            MarketEvent::Bar(bar) => self.on_bar(bar).await,
            other => {
                trace!("Ignoring {} for {}", other.kind(), other.symbol());
                Ok(())
            }
        }
    }

    async fn on_bar(&mut self, bar: Bar) -> anyhow::Result<()> {
        if bar.symbol != self.symbol() {
            debug!("Ignoring bar for {}", bar.symbol);
            return Ok(());
        }

        match self.strategy.observe(&bar) {
            Observation::Accepted => self.persist(&bar).await,
            Observation::Duplicate => {
                debug!("Duplicate bar at {} from {:?}", bar.time, bar.exchange);
                self.persist(&bar).await;
                return Ok(());
            }
            Observation::Filtered => return Ok(()),
        }
        self.stats.bars_accepted += 1;

        let position = self.fetch_position().await;
        let cash = if position.state == PositionState::Flat {
            self.fetch_cash().await
        } else {
            None
        };

        let decision = self.strategy.decide(&DecisionContext {
            bar: &bar,
            position,
            cash,
        });

        let action = match decision {
            Some(action) => action,
            None => {
                debug!("No action on bar closing at {}", bar.close);
                return Ok(());
            }
        };

        info!("Signal to {} {} of {}: {}", action.side, action.qty, bar.symbol, action.reason);
        self.placer.place(&self.broker, &action).await?;
        self.stats.orders_placed += 1;
        Ok(())
    }

    async fn persist(&self, bar: &Bar) {
        if let Some(store) = &self.store {
            if let Err(error) = store.record_bar(bar).await {
                warn!("Failed to store bar: {error:?}");
            }
        }
    }

    async fn fetch_position(&self) -> PositionSnapshot {
        let symbol = self.symbol();
        let position = self
            .retry("position", || self.broker.position(symbol))
            .await
            .flatten();
        PositionSnapshot::from_position(position.as_ref())
    }

    async fn fetch_cash(&self) -> Option<Decimal> {
        self.retry("account", || self.broker.account())
            .await
            .map(|account| account.cash)
    }

    /// Retries a query a few times, then gives up and reports it as absent.
    async fn retry<T, F, Fut>(&self, what: &str, mut query: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        for attempt in 1..=QUERY_ATTEMPTS {
            match query().await {
                Ok(value) => return Some(value),
                Err(error) => {
                    warn!("Failed to fetch {what} (attempt {attempt}/{QUERY_ATTEMPTS}): {error:?}");
                    if attempt < QUERY_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, bar, position, MockBroker};
    use entity::trading::{OrderSide, OrderTimeInForce};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    const CROSSOVER: &[(&str, &str)] = &[("SHORT_WINDOW", "2"), ("LONG_WINDOW", "5")];

    fn dispatcher(
        vars: &[(&str, &str)],
        broker: MockBroker,
        store: Option<BarStore>,
    ) -> Dispatcher<MockBroker> {
        Dispatcher::new(testing::context(vars), broker, store).with_retry_delay(Duration::ZERO)
    }

    fn rising(symbol: &str) -> Vec<MarketEvent> {
        [1, 1, 1, 1, 2]
            .into_iter()
            .enumerate()
            .map(|(n, close)| MarketEvent::Bar(bar(symbol, n as i64, Decimal::from(close))))
            .collect()
    }

    #[tokio::test]
    async fn buys_on_a_cross_up() {
        let mut dispatcher = dispatcher(CROSSOVER, MockBroker::with_cash(dec!(1000)), None);
        for event in rising("AAPL") {
            dispatcher.handle(event).await.unwrap();
        }

        let orders = dispatcher.broker.submitted();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].qty, dec!(400));
        assert_eq!(orders[0].time_in_force, OrderTimeInForce::Day);
        assert_eq!(dispatcher.stats().bars_accepted, 5);
        assert_eq!(dispatcher.stats().orders_placed, 1);
    }

    #[tokio::test]
    async fn other_symbols_and_event_kinds_are_skipped() {
        let mut dispatcher = dispatcher(CROSSOVER, MockBroker::with_cash(dec!(1000)), None);
        for event in rising("MSFT") {
            dispatcher.handle(event).await.unwrap();
        }

        assert!(dispatcher.broker.submitted().is_empty());
        assert_eq!(dispatcher.stats().bars_accepted, 0);
        assert_eq!(dispatcher.broker.position_queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_bars_do_not_trigger_decisions() {
        let mut dispatcher = dispatcher(CROSSOVER, MockBroker::with_cash(dec!(1000)), None);
        let first = bar("AAPL", 0, dec!(1));
        dispatcher.handle(MarketEvent::Bar(first.clone())).await.unwrap();
        dispatcher.handle(MarketEvent::Bar(first)).await.unwrap();

        assert_eq!(dispatcher.stats().bars_accepted, 1);
        assert_eq!(dispatcher.broker.position_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cross_down_sells_the_open_position() {
        let broker = MockBroker::with_cash(dec!(1000));
        *broker.position.lock().unwrap() = Some(position("AAPL", dec!(12), dec!(3)));

        let mut dispatcher = dispatcher(CROSSOVER, broker, None);
        for (n, close) in [dec!(3), dec!(3), dec!(3), dec!(3), dec!(2.95)].into_iter().enumerate() {
            dispatcher
                .handle(MarketEvent::Bar(bar("AAPL", n as i64, close)))
                .await
                .unwrap();
        }

        let orders = dispatcher.broker.submitted();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].qty, dec!(12));
    }

    #[tokio::test]
    async fn bars_from_disallowed_exchanges_are_not_stored() {
        let vars = [
            ("SYMBOL", "BTC/USD"),
            ("ALLOWED_CRYPTO_EXCHANGES", "CBSE"),
            ("SHORT_WINDOW", "2"),
            ("LONG_WINDOW", "5"),
        ];
        let store = BarStore::in_memory().await.unwrap();
        let mut dispatcher = dispatcher(&vars, MockBroker::with_cash(dec!(1000)), Some(store.clone()));

        let mut ersx = bar("BTC/USD", 0, dec!(41000));
        ersx.exchange = "ERSX".to_owned();
        let mut cbse = bar("BTC/USD", 0, dec!(41010));
        cbse.exchange = "CBSE".to_owned();
        dispatcher.handle(MarketEvent::Bar(ersx)).await.unwrap();
        dispatcher.handle(MarketEvent::Bar(cbse)).await.unwrap();

        let stored = store.bars(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].exchange, "CBSE");
        assert_eq!(dispatcher.stats().bars_accepted, 1);
    }

    #[tokio::test]
    async fn position_queries_are_retried() {
        let broker = MockBroker::with_cash(dec!(1000));
        broker.position_failures.store(2, Ordering::SeqCst);

        let dispatcher = dispatcher(CROSSOVER, broker, None);
        let snapshot = dispatcher.fetch_position().await;

        assert_eq!(snapshot.state, PositionState::Flat);
        assert_eq!(dispatcher.broker.position_queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_no_position() {
        let broker = MockBroker::with_cash(dec!(1000));
        *broker.position.lock().unwrap() = Some(position("AAPL", dec!(5), dec!(1)));
        broker.position_failures.store(10, Ordering::SeqCst);

        let dispatcher = dispatcher(CROSSOVER, broker, None);
        assert_eq!(dispatcher.fetch_position().await, PositionSnapshot::flat());
        assert_eq!(dispatcher.broker.position_queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_orders_surface_as_errors() {
        let broker = MockBroker::with_cash(dec!(1000));
        broker.reject_orders.store(true, Ordering::SeqCst);

        let mut dispatcher = dispatcher(CROSSOVER, broker, None);
        let mut results = Vec::new();
        for event in rising("AAPL") {
            results.push(dispatcher.handle(event).await);
        }

        assert!(results[..4].iter().all(Result::is_ok));
        assert!(results[4].is_err());
        assert_eq!(dispatcher.stats().orders_placed, 0);
    }

    #[tokio::test]
    async fn warm_up_uses_rest_history_and_persists_it() {
        let mut broker = MockBroker::with_cash(dec!(1000));
        broker.history = (0..4).map(|n| bar("AAPL", n, dec!(1))).collect();
        let store = BarStore::in_memory().await.unwrap();

        let mut dispatcher = dispatcher(CROSSOVER, broker, Some(store.clone()));
        dispatcher.warm_up().await;
        assert_eq!(store.bars(None).await.unwrap().len(), 4);

        // The fifth live bar completes the long window.
        dispatcher
            .handle(MarketEvent::Bar(bar("AAPL", 4, dec!(2))))
            .await
            .unwrap();
        assert_eq!(dispatcher.broker.submitted().len(), 1);
        assert_eq!(store.bars(None).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn warm_up_prefers_a_full_local_history() {
        let store = BarStore::in_memory().await.unwrap();
        for n in 0..5 {
            store.record_bar(&bar("AAPL", n, dec!(1))).await.unwrap();
        }

        let mut broker = MockBroker::with_cash(dec!(1000));
        broker.history = (0..5).map(|n| bar("AAPL", n, dec!(50))).collect();

        let mut dispatcher = dispatcher(CROSSOVER, broker, Some(store));
        dispatcher.warm_up().await;

        // Stored closes of 1 keep the window flat, so a close of 2 crosses up.
        dispatcher
            .handle(MarketEvent::Bar(bar("AAPL", 5, dec!(2))))
            .await
            .unwrap();
        assert_eq!(dispatcher.broker.submitted().len(), 1);
    }

    struct Exploding;

    impl Strategy for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn observe(&mut self, bar: &Bar) -> Observation {
            if bar.close > dec!(1) {
                panic!("boom");
            }
            Observation::Accepted
        }

        fn decide(&mut self, _context: &DecisionContext<'_>) -> Option<strategy::Action> {
            None
        }
    }

    #[test]
    fn run_survives_panics_and_acknowledges_every_event() {
        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let context = testing::context(&[]);
        let dispatcher = Dispatcher::with_strategy(
            context.clone(),
            MockBroker::with_cash(dec!(1000)),
            None,
            Box::new(Exploding),
        )
        .with_retry_delay(Duration::ZERO);

        for (n, close) in [dec!(1), dec!(5), dec!(1)].into_iter().enumerate() {
            context
                .queue
                .put(MarketEvent::Bar(bar("AAPL", n as i64, close)))
                .unwrap();
        }
        context.queue.close();

        dispatcher.run(&runtime);
        assert_eq!(context.queue.unfinished(), 0);
        assert!(context.queue.is_empty());
    }
}
