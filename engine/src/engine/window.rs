use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use time::OffsetDateTime;

/// The most recent closes, oldest first, evicted in arrival order once full.
///
/// Each exchange only moves forward in time: a point at or before the newest one accepted from
/// the same exchange is rejected, even after that point has been evicted.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    capacity: usize,
    closes: VecDeque<Decimal>,
    newest: HashMap<String, OffsetDateTime>,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            closes: VecDeque::with_capacity(capacity),
            newest: HashMap::new(),
        }
    }

    /// Returns `false` without changing anything when the point replays or predates what the
    /// window already saw from `exchange`.
    pub fn push(&mut self, time: OffsetDateTime, exchange: &str, close: Decimal) -> bool {
        if self.is_stale(time, exchange) {
            return false;
        }

        if self.closes.len() == self.capacity {
            self.closes.pop_front();
        }

        self.newest.insert(exchange.to_owned(), time);
        self.closes.push_back(close);
        true
    }

    fn is_stale(&self, time: OffsetDateTime, exchange: &str) -> bool {
        self.newest
            .get(exchange)
            .map_or(false, |&newest| time <= newest)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_full(&self) -> bool {
        self.closes.len() == self.capacity
    }

    #[cfg(test)]
    pub fn closes(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.closes.iter().copied()
    }

    /// Mean of the newest `n` closes, `None` until `n` points are held.
    pub fn sma(&self, n: usize) -> Option<Decimal> {
        if n == 0 || n > self.closes.len() {
            return None;
        }

        let sum = self
            .closes
            .iter()
            .skip(self.closes.len() - n)
            .try_fold(Decimal::ZERO, |sum, close| sum.checked_add(*close))?;
        sum.checked_div(Decimal::from(n))
    }

    pub fn mean(&self) -> Option<Decimal> {
        self.sma(self.closes.len())
    }
}
