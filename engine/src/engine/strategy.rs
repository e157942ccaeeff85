use std::fmt::{self, Display, Formatter};

use common::config::{Config, RearmPolicy, StrategyConfig, StrategyKind};
use entity::{
    data::Bar,
    trading::{OrderSide, Position, Side},
};
use log::{debug, info};
use rust_decimal::{Decimal, RoundingStrategy};

use super::window::PriceWindow;

/// What a strategy did with a bar handed to [`Strategy::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Accepted,
    Duplicate,
    Filtered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub state: PositionState,
    /// Always non-negative, the direction lives in `state`.
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
}

impl PositionSnapshot {
    pub fn flat() -> Self {
        Self {
            state: PositionState::Flat,
            qty: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
        }
    }

    pub fn from_position(position: Option<&Position>) -> Self {
        let position = match position {
            Some(position) if !position.qty.is_zero() => position,
            _ => return Self::flat(),
        };

        let state = match position.side {
            Side::Long if position.qty.is_sign_positive() => PositionState::Long,
            _ => PositionState::Short,
        };

        Self {
            state,
            qty: position.qty.abs(),
            avg_entry_price: position.avg_entry_price,
        }
    }
}

pub struct DecisionContext<'a> {
    pub bar: &'a Bar,
    pub position: PositionSnapshot,
    /// Only fetched while flat. `None` when unknown.
    pub cash: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReason {
    Entry,
    CrossDown,
    StopLoss,
    TakeProfit,
    Cover,
    BelowAverage,
    AboveAverage,
    AverageCrossed,
}

impl Display for ActionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entry => "entry signal",
            Self::CrossDown => "short average crossed below long average",
            Self::StopLoss => "stop-loss",
            Self::TakeProfit => "take-profit",
            Self::Cover => "covering short position",
            Self::BelowAverage => "close below average",
            Self::AboveAverage => "close above average",
            Self::AverageCrossed => "close crossed the average",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub side: OrderSide,
    pub qty: Decimal,
    pub reason: ActionReason,
}

impl Action {
    fn buy(qty: Decimal, reason: ActionReason) -> Self {
        Self {
            side: OrderSide::Buy,
            qty,
            reason,
        }
    }

    fn sell(qty: Decimal, reason: ActionReason) -> Self {
        Self {
            side: OrderSide::Sell,
            qty,
            reason,
        }
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Folds a bar into the strategy's state.
    fn observe(&mut self, bar: &Bar) -> Observation;

    /// Called once per accepted bar, after [`observe`](Strategy::observe).
    fn decide(&mut self, context: &DecisionContext<'_>) -> Option<Action>;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn observe(&mut self, bar: &Bar) -> Observation {
        (**self).observe(bar)
    }

    fn decide(&mut self, context: &DecisionContext<'_>) -> Option<Action> {
        (**self).decide(context)
    }
}

/// Builds the strategy selected in the config, wrapped in an exchange filter for crypto symbols.
pub fn from_config(config: &Config) -> Box<dyn Strategy> {
    let trading = &config.trading;
    let strategy: Box<dyn Strategy> = match config.strategy.kind {
        StrategyKind::Crossover => Box::new(MovingAverageCrossover::new(
            &config.strategy,
            trading.capital_utilization,
        )),
        StrategyKind::Average => Box::new(PriceVsAverage::new(
            config.strategy.long_window,
            trading.quantity,
        )),
    };

    if trading.is_crypto() && !trading.allowed_crypto_exchanges.is_empty() {
        Box::new(ExchangeFilter::new(
            strategy,
            trading.allowed_crypto_exchanges.clone(),
        ))
    } else {
        strategy
    }
}

/// Quantity to buy with `utilization` of `cash` at `price`, truncated to two decimal places.
pub fn target_quantity(cash: Decimal, price: Decimal, utilization: Decimal) -> Decimal {
    if cash <= Decimal::ZERO || price <= Decimal::ZERO || utilization <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    cash.checked_div(price)
        .and_then(|units| units.checked_mul(utilization))
        .map(|qty| qty.round_dp_with_strategy(2, RoundingStrategy::ToZero))
        .unwrap_or(Decimal::ZERO)
}

fn observe_into(window: &mut PriceWindow, bar: &Bar) -> Observation {
    if window.push(bar.time, &bar.exchange, bar.close) {
        Observation::Accepted
    } else {
        Observation::Duplicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inhibit {
    Forever,
    UntilCrossDown,
    ForBars(u32),
}

/// Goes long when the short moving average is above the long one and exits on a cross-down,
/// a stop-loss or a take-profit.
pub struct MovingAverageCrossover {
    window: PriceWindow,
    short_window: usize,
    long_window: usize,
    stop_loss: Decimal,
    take_profit: Decimal,
    utilization: Decimal,
    rearm: RearmPolicy,
    inhibit: Option<Inhibit>,
}

impl MovingAverageCrossover {
    pub fn new(config: &StrategyConfig, utilization: Decimal) -> Self {
        Self {
            window: PriceWindow::new(config.long_window),
            short_window: config.short_window,
            long_window: config.long_window,
            stop_loss: config.stop_loss,
            take_profit: config.take_profit,
            utilization,
            rearm: config.rearm,
            inhibit: None,
        }
    }

    #[cfg(test)]
    pub fn window(&self) -> &PriceWindow {
        &self.window
    }

    #[cfg(test)]
    pub fn is_inhibited(&self) -> bool {
        self.inhibit.is_some()
    }

    fn breach(&self, bar: &Bar, position: &PositionSnapshot) -> Option<ActionReason> {
        let entry = position.avg_entry_price;
        if entry <= Decimal::ZERO {
            return None;
        }

        let floor = entry * (Decimal::ONE - self.stop_loss);
        let ceiling = entry * (Decimal::ONE + self.take_profit);

        if bar.close <= floor {
            Some(ActionReason::StopLoss)
        } else if bar.high >= ceiling {
            Some(ActionReason::TakeProfit)
        } else {
            None
        }
    }

    fn arm_inhibit(&mut self) {
        self.inhibit = match self.rearm {
            RearmPolicy::Never => Some(Inhibit::Forever),
            RearmPolicy::CrossDown => Some(Inhibit::UntilCrossDown),
            RearmPolicy::AfterBars(0) => None,
            RearmPolicy::AfterBars(bars) => Some(Inhibit::ForBars(bars)),
        };
    }

    fn advance_inhibit(&mut self, bullish: bool) {
        self.inhibit = match self.inhibit {
            Some(Inhibit::UntilCrossDown) if !bullish => None,
            Some(Inhibit::ForBars(0)) => None,
            Some(Inhibit::ForBars(remaining)) => Some(Inhibit::ForBars(remaining - 1)),
            other => other,
        };

        if let Some(inhibit) = self.inhibit {
            debug!("Entries still inhibited: {inhibit:?}");
        }
    }
}

impl Strategy for MovingAverageCrossover {
    fn name(&self) -> &'static str {
        "moving-average crossover"
    }

    fn observe(&mut self, bar: &Bar) -> Observation {
        observe_into(&mut self.window, bar)
    }

    fn decide(&mut self, context: &DecisionContext<'_>) -> Option<Action> {
        let (short, long) = match (
            self.window.sma(self.short_window),
            self.window.sma(self.long_window),
        ) {
            (Some(short), Some(long)) => (short, long),
            _ => {
                debug!(
                    "Not enough bars for a decision ({}/{})",
                    self.window.len(),
                    self.long_window
                );
                return None;
            }
        };

        let bullish = short > long;
        self.advance_inhibit(bullish);
        debug!("Short average {short}, long average {long}");

        let position = &context.position;
        match position.state {
            PositionState::Long => {
                if let Some(reason) = self.breach(context.bar, position) {
                    info!("{reason} triggered at {}", context.bar.close);
                    self.arm_inhibit();
                    return Some(Action::sell(position.qty, reason));
                }

                (!bullish).then(|| Action::sell(position.qty, ActionReason::CrossDown))
            }
            PositionState::Short => {
                bullish.then(|| Action::buy(position.qty, ActionReason::Cover))
            }
            PositionState::Flat => {
                if !bullish || self.inhibit.is_some() {
                    return None;
                }

                let qty = target_quantity(
                    context.cash.unwrap_or(Decimal::ZERO),
                    context.bar.close,
                    self.utilization,
                );
                if qty.is_zero() {
                    debug!("Not enough cash to buy at {}", context.bar.close);
                    return None;
                }

                Some(Action::buy(qty, ActionReason::Entry))
            }
        }
    }
}

/// Trades the latest close against the mean of a full window: buys below the mean, sells above
/// it, and closes positions once the price returns to the mean.
pub struct PriceVsAverage {
    window: PriceWindow,
    quantity: Decimal,
}

impl PriceVsAverage {
    pub fn new(window_size: usize, quantity: Decimal) -> Self {
        Self {
            window: PriceWindow::new(window_size),
            quantity,
        }
    }
}

impl Strategy for PriceVsAverage {
    fn name(&self) -> &'static str {
        "price versus average"
    }

    fn observe(&mut self, bar: &Bar) -> Observation {
        observe_into(&mut self.window, bar)
    }

    fn decide(&mut self, context: &DecisionContext<'_>) -> Option<Action> {
        if !self.window.is_full() {
            debug!(
                "Not enough bars for a decision ({}/{})",
                self.window.len(),
                self.window.capacity()
            );
            return None;
        }

        let mean = self.window.mean()?;
        let close = context.bar.close;
        let position = &context.position;
        debug!("Close {close}, mean {mean}");

        match position.state {
            PositionState::Flat if mean > close => {
                Some(Action::buy(self.quantity, ActionReason::BelowAverage))
            }
            PositionState::Flat if mean < close => {
                Some(Action::sell(self.quantity, ActionReason::AboveAverage))
            }
            PositionState::Flat => None,
            PositionState::Long => {
                (close <= mean).then(|| Action::sell(position.qty, ActionReason::AverageCrossed))
            }
            PositionState::Short => {
                (close >= mean).then(|| Action::buy(position.qty, ActionReason::AverageCrossed))
            }
        }
    }
}

/// Drops bars from exchanges outside the allowed set before they reach the inner strategy.
/// Bars without an exchange always pass.
pub struct ExchangeFilter<S> {
    inner: S,
    allowed: Vec<String>,
}

impl<S: Strategy> ExchangeFilter<S> {
    pub fn new(inner: S, allowed: Vec<String>) -> Self {
        Self { inner, allowed }
    }

    fn allows(&self, exchange: &str) -> bool {
        exchange.is_empty()
            || self
                .allowed
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(exchange))
    }
}

impl<S: Strategy> Strategy for ExchangeFilter<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn observe(&mut self, bar: &Bar) -> Observation {
        if !self.allows(&bar.exchange) {
            debug!("Ignoring bar from exchange {}", bar.exchange);
            return Observation::Filtered;
        }

        self.inner.observe(bar)
    }

    fn decide(&mut self, context: &DecisionContext<'_>) -> Option<Action> {
        self.inner.decide(context)
    }
}
