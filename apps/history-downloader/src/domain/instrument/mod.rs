//! Instrument Catalog Types
//!
//! Identity, resolved contract details, live quote and downloaded history for
//! one tradable instrument.
//!
//! An instrument is keyed by `{security_type}_{symbol}_{exchange}`, e.g.
//! `FUT_ES_GLOBEX`. A futures request usually resolves to several contract
//! months; the first one reported (the front month) becomes active.

mod bars;
mod timestamp;

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use bars::{BarSeries, OhlcBar, TimedBar};
pub use timestamp::{REQUEST_FORMAT, TimestampError, format_request_timestamp, parse_timestamp};

// =============================================================================
// Identity
// =============================================================================

/// Security type codes understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    /// Common stock or ETF.
    #[serde(rename = "STK")]
    Stock,
    /// Exchange-traded future.
    #[serde(rename = "FUT")]
    Future,
    /// Exchange-traded option.
    #[serde(rename = "OPT")]
    Option,
    /// Cash index.
    #[serde(rename = "IND")]
    Index,
    /// Spot currency pair.
    #[serde(rename = "CASH")]
    Forex,
}

impl SecurityType {
    /// Wire code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Future => "FUT",
            Self::Option => "OPT",
            Self::Index => "IND",
            Self::Forex => "CASH",
        }
    }

    /// Parse a wire code, case-insensitively.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            "STK" => Some(Self::Stock),
            "FUT" => Some(Self::Future),
            "OPT" => Some(Self::Option),
            "IND" => Some(Self::Index),
            "CASH" => Some(Self::Forex),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog key of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    /// Derive the key from its identifying fields.
    #[must_use]
    pub fn build(security_type: SecurityType, symbol: &str, exchange: &str) -> Self {
        Self(format!(
            "{}_{}_{}",
            security_type.as_str(),
            symbol.trim().to_uppercase(),
            exchange.trim().to_uppercase()
        ))
    }

    /// Wrap an already-formatted key.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstrumentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What the caller asks the service to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Security type.
    pub security_type: SecurityType,
    /// Underlying symbol, e.g. `ES`.
    pub symbol: String,
    /// Listing exchange, e.g. `GLOBEX`.
    pub exchange: String,
    /// Trading currency.
    pub currency: String,
}

impl InstrumentSpec {
    /// Create a USD-denominated spec.
    #[must_use]
    pub fn new(security_type: SecurityType, symbol: &str, exchange: &str) -> Self {
        Self {
            security_type,
            symbol: symbol.trim().to_uppercase(),
            exchange: exchange.trim().to_uppercase(),
            currency: "USD".to_string(),
        }
    }

    /// Catalog key for this spec.
    #[must_use]
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::build(self.security_type, &self.symbol, &self.exchange)
    }
}

/// One resolved contract variant as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDetails {
    /// Service-assigned contract id.
    pub contract_id: i64,
    /// Security type.
    pub security_type: SecurityType,
    /// Underlying symbol.
    pub symbol: String,
    /// Exchange-local symbol, e.g. `ESH0`.
    pub local_symbol: String,
    /// Listing exchange.
    pub exchange: String,
    /// Trading currency.
    pub currency: String,
    /// Descriptive name.
    pub long_name: String,
    /// Last trading day, for expiring contracts.
    pub last_trade_date: Option<NaiveDate>,
    /// Minimum price increment.
    pub min_tick: Decimal,
}

// =============================================================================
// Quote
// =============================================================================

/// Latest top-of-book values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Last trade.
    pub last: Option<Decimal>,
}

/// Which quote field a price tick updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickField {
    /// Best bid.
    Bid,
    /// Best ask.
    Ask,
    /// Last trade.
    Last,
}

impl Quote {
    /// Apply one tick.
    pub fn apply(&mut self, field: TickField, value: Decimal) {
        match field {
            TickField::Bid => self.bid = Some(value),
            TickField::Ask => self.ask = Some(value),
            TickField::Last => self.last = Some(value),
        }
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// A catalog entry's data.
#[derive(Debug, Clone)]
pub struct Instrument {
    key: InstrumentKey,
    spec: InstrumentSpec,
    variants: Vec<ContractDetails>,
    active: Option<usize>,
    /// Live quote.
    pub quote: Quote,
    /// Earliest timestamp with data, once known.
    pub head_timestamp: Option<NaiveDateTime>,
    /// End of the next one-day request.
    pub cursor: Option<NaiveDateTime>,
    /// Downloaded bars.
    pub bars: BarSeries,
    /// Days given up on after repeated request failures.
    pub skipped_days: Vec<NaiveDate>,
    /// Days finished, successfully or skipped.
    pub days_completed: u32,
}

impl Instrument {
    /// Create an unresolved instrument.
    #[must_use]
    pub fn new(spec: InstrumentSpec) -> Self {
        Self {
            key: spec.key(),
            spec,
            variants: Vec::new(),
            active: None,
            quote: Quote::default(),
            head_timestamp: None,
            cursor: None,
            bars: BarSeries::new(),
            skipped_days: Vec::new(),
            days_completed: 0,
        }
    }

    /// Catalog key.
    #[must_use]
    pub const fn key(&self) -> &InstrumentKey {
        &self.key
    }

    /// Spec the instrument was requested with.
    #[must_use]
    pub const fn spec(&self) -> &InstrumentSpec {
        &self.spec
    }

    /// All variants reported so far.
    #[must_use]
    pub fn variants(&self) -> &[ContractDetails] {
        &self.variants
    }

    /// Record one reported variant. Duplicate contract ids are ignored.
    pub fn add_variant(&mut self, details: ContractDetails) -> bool {
        if self
            .variants
            .iter()
            .any(|v| v.contract_id == details.contract_id)
        {
            return false;
        }
        self.variants.push(details);
        true
    }

    /// Make the first reported variant active.
    pub fn activate_front(&mut self) -> Option<&ContractDetails> {
        if self.variants.is_empty() {
            return None;
        }
        self.active = Some(0);
        self.variants.first()
    }

    /// Active variant, once resolved.
    #[must_use]
    pub fn active_contract(&self) -> Option<&ContractDetails> {
        self.active.and_then(|i| self.variants.get(i))
    }

    /// Whether an active variant is chosen.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.active.is_some()
    }

    /// Clear download progress so the history can be fetched again.
    ///
    /// Bars already downloaded are kept.
    pub fn reset_download(&mut self) {
        self.head_timestamp = None;
        self.cursor = None;
        self.skipped_days.clear();
        self.days_completed = 0;
    }

    /// Observer-facing copy without the bar data.
    #[must_use]
    pub fn snapshot(&self) -> InstrumentSnapshot {
        let active = self.active_contract();
        InstrumentSnapshot {
            key: self.key.clone(),
            security_type: self.spec.security_type,
            symbol: self.spec.symbol.clone(),
            exchange: self.spec.exchange.clone(),
            local_symbol: active.map(|c| c.local_symbol.clone()),
            long_name: active.map(|c| c.long_name.clone()),
            expiration: active.and_then(|c| c.last_trade_date),
            variants: self.variants.len(),
            quote: self.quote,
            head_timestamp: self.head_timestamp,
            cursor: self.cursor,
            bar_count: self.bars.len(),
            days_completed: self.days_completed,
            skipped_days: self.skipped_days.clone(),
        }
    }
}

/// Serializable view of an [`Instrument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    /// Catalog key.
    pub key: InstrumentKey,
    /// Security type.
    pub security_type: SecurityType,
    /// Symbol.
    pub symbol: String,
    /// Exchange.
    pub exchange: String,
    /// Active variant's local symbol.
    pub local_symbol: Option<String>,
    /// Active variant's name.
    pub long_name: Option<String>,
    /// Active variant's expiration.
    pub expiration: Option<NaiveDate>,
    /// Number of variants reported.
    pub variants: usize,
    /// Live quote.
    pub quote: Quote,
    /// Earliest available data.
    pub head_timestamp: Option<NaiveDateTime>,
    /// Download cursor.
    pub cursor: Option<NaiveDateTime>,
    /// Bars downloaded.
    pub bar_count: usize,
    /// Days finished.
    pub days_completed: u32,
    /// Days skipped.
    pub skipped_days: Vec<NaiveDate>,
}
