//! OHLC bars and the per-instrument bar series.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLC bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OhlcBar {
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
}

impl OhlcBar {
    /// Create a bar.
    #[must_use]
    pub const fn new(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            open,
            high,
            low,
            close,
        }
    }
}

/// A bar together with its timestamp, as exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedBar {
    /// Bar start time.
    pub timestamp: NaiveDateTime,
    /// Prices.
    #[serde(flatten)]
    pub bar: OhlcBar,
}

/// Bars ordered by timestamp.
///
/// Inserting a timestamp that is already present keeps the first bar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarSeries {
    bars: BTreeMap<NaiveDateTime, OhlcBar>,
}

impl BarSeries {
    /// Create an empty series.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bars: BTreeMap::new(),
        }
    }

    /// Insert a bar. Returns `false` if `timestamp` was already present.
    pub fn insert(&mut self, timestamp: NaiveDateTime, bar: OhlcBar) -> bool {
        match self.bars.entry(timestamp) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(bar);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Bar at `timestamp`.
    #[must_use]
    pub fn get(&self, timestamp: &NaiveDateTime) -> Option<&OhlcBar> {
        self.bars.get(timestamp)
    }

    /// Number of bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether the series is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Earliest timestamp.
    #[must_use]
    pub fn first_timestamp(&self) -> Option<NaiveDateTime> {
        self.bars.keys().next().copied()
    }

    /// Latest timestamp.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.bars.keys().next_back().copied()
    }

    /// Bars in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = TimedBar> + '_ {
        self.bars
            .iter()
            .map(|(&timestamp, &bar)| TimedBar { timestamp, bar })
    }
}
