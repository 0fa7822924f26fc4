//! Simulated Trading-Data Service
//!
//! In-process [`ProtocolClient`] that answers requests the way the real
//! gateway does: asynchronously, through the connection's callback buffer.
//! Bars are generated deterministically so downloads are reproducible.
//!
//! # Behaviour
//!
//! - Connecting pushes `ConnectionAccepted` and a 2104 farm status message,
//!   or error 502 when refusing.
//! - Detail requests report one record per configured contract month, then
//!   the end marker. Unknown instruments get error 200.
//! - Bar requests cover `(end - 1 day, end]`, weekdays within session hours,
//!   never before the head timestamp.
//!
//! Test hooks can refuse connections, drop the socket, and fail chosen days.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Endpoint, HeadTimestampQuery, HistoricalQuery, MessageSource, ProtocolCallback,
    ProtocolClient, RawBar, TickKind, TransportError,
};
use crate::domain::correlation::RequestId;
use crate::domain::instrument::{
    ContractDetails, InstrumentKey, InstrumentSpec, SecurityType, TickField,
};

/// Wire format of timestamps in replies.
const REPLY_FORMAT: &str = "%Y%m%d  %H:%M:%S";

const CODE_CONNECT_FAIL: i32 = 502;
const CODE_NO_DEFINITION: i32 = 200;
const CODE_HMDS_ERROR: i32 = 162;
const CODE_INVALID_REQUEST: i32 = 321;
const CODE_FARM_OK: i32 = 2104;

// =============================================================================
// Configuration
// =============================================================================

/// One instrument the simulator knows about.
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    /// Spec that resolves to this instrument.
    pub spec: InstrumentSpec,
    /// Contract months, front first.
    pub variants: Vec<ContractDetails>,
    /// Earliest data available.
    pub head_timestamp: NaiveDateTime,
    /// Centre of the generated price wave.
    pub base_price: Decimal,
}

impl SimulatedInstrument {
    /// A future with one contract month per expiry, front first.
    #[must_use]
    pub fn future(
        symbol: &str,
        exchange: &str,
        expiries: &[NaiveDate],
        head_timestamp: NaiveDateTime,
        base_price: Decimal,
    ) -> Self {
        let spec = InstrumentSpec::new(SecurityType::Future, symbol, exchange);
        let symbol_seed: i64 = spec.symbol.bytes().map(i64::from).sum();
        let variants = expiries
            .iter()
            .map(|expiry| ContractDetails {
                contract_id: symbol_seed * 1_000_000
                    + i64::from(expiry.year()) * 100
                    + i64::from(expiry.month()),
                security_type: SecurityType::Future,
                symbol: spec.symbol.clone(),
                local_symbol: local_symbol(&spec.symbol, *expiry),
                exchange: spec.exchange.clone(),
                currency: spec.currency.clone(),
                long_name: format!("{} futures", spec.symbol),
                last_trade_date: Some(*expiry),
                min_tick: Decimal::new(25, 2),
            })
            .collect();

        Self {
            spec,
            variants,
            head_timestamp,
            base_price,
        }
    }

    /// Catalog key.
    #[must_use]
    pub fn key(&self) -> InstrumentKey {
        self.spec.key()
    }
}

/// Simulator setup.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Known instruments.
    pub instruments: Vec<SimulatedInstrument>,
    /// First bar of each trading day.
    pub session_open: NaiveTime,
    /// No bars at or after this time.
    pub session_close: NaiveTime,
    /// Reported on connect.
    pub next_valid_id: u32,
}

impl SimulatorConfig {
    /// ES and NQ with five days of history before `today`.
    #[must_use]
    pub fn demo(today: NaiveDate) -> Self {
        let expiries = quarterly_expiries(today, 2);
        let head = (today - TimeDelta::days(5)).and_time(NaiveTime::MIN);
        Self {
            instruments: vec![
                SimulatedInstrument::future("ES", "GLOBEX", &expiries, head, Decimal::new(4_800, 0)),
                SimulatedInstrument::future("NQ", "GLOBEX", &expiries, head, Decimal::new(16_900, 0)),
            ],
            ..Self::default()
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            session_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            next_valid_id: 1,
        }
    }
}

/// Third Friday of each quarterly month strictly after `today`'s month.
fn quarterly_expiries(today: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let Some(first_of_month) = today.with_day(1) else {
        return Vec::new();
    };
    (1..=12u32)
        .filter_map(|offset| first_of_month.checked_add_months(Months::new(offset)))
        .filter(|month| month.month() % 3 == 0)
        .filter_map(third_friday)
        .take(count)
        .collect()
}

fn third_friday(first_of_month: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(
        first_of_month.year(),
        first_of_month.month(),
        Weekday::Fri,
        3,
    )
}

/// Exchange-local symbol, e.g. `ESH0` for March 2020.
fn local_symbol(symbol: &str, expiry: NaiveDate) -> String {
    const MONTH_CODES: [char; 12] = ['F', 'G', 'H', 'J', 'K', 'M', 'N', 'Q', 'U', 'V', 'X', 'Z'];
    let code = MONTH_CODES[expiry.month0() as usize];
    format!("{symbol}{code}{}", expiry.year().rem_euclid(10))
}

/// Parse `"<n> <unit>"` bar sizes.
fn parse_bar_size(raw: &str) -> Option<TimeDelta> {
    let mut parts = raw.split_whitespace();
    let count: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if count <= 0 || parts.next().is_some() {
        return None;
    }
    match unit {
        "sec" | "secs" => Some(TimeDelta::seconds(count)),
        "min" | "mins" => Some(TimeDelta::minutes(count)),
        "hour" | "hours" => Some(TimeDelta::hours(count)),
        "day" | "days" => Some(TimeDelta::days(count)),
        _ => None,
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Inbound side of one simulated connection.
#[derive(Default)]
pub struct SimulatedConnection {
    buffer: Mutex<VecDeque<ProtocolCallback>>,
    wake: Arc<Notify>,
    closed: CancellationToken,
}

impl SimulatedConnection {
    fn push(&self, callback: ProtocolCallback) {
        self.buffer.lock().push_back(callback);
        self.wake.notify_one();
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl MessageSource for SimulatedConnection {
    fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn drain(&self) -> Vec<ProtocolCallback> {
        self.buffer.lock().drain(..).collect()
    }
}

// =============================================================================
// Service
// =============================================================================

/// Request as received by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedRequest {
    /// Server clock.
    CurrentTime,
    /// Contract details.
    InstrumentDetails {
        /// Request id.
        id: RequestId,
        /// Requested key.
        key: InstrumentKey,
    },
    /// Head timestamp.
    HeadTimestamp {
        /// Request id.
        id: RequestId,
    },
    /// One page of bars.
    HistoricalBars {
        /// Request id.
        id: RequestId,
        /// Window end.
        end: NaiveDateTime,
    },
    /// Bar request cancellation.
    CancelHistoricalBars {
        /// Request id.
        id: RequestId,
    },
    /// Tick subscription.
    PriceTicks {
        /// Request id.
        id: RequestId,
        /// Stream kind.
        kind: TickKind,
    },
}

#[derive(Default)]
struct ServiceState {
    connection: Option<Arc<SimulatedConnection>>,
    refuse_connections: bool,
    connects: u32,
    failing_days: HashMap<NaiveDate, u32>,
    requests: Vec<SimulatedRequest>,
}

struct Shared {
    config: SimulatorConfig,
    state: Mutex<ServiceState>,
}

/// Simulated service. Clones share state, so tests can keep a handle after
/// boxing one into a session.
#[derive(Clone)]
pub struct SimulatedService {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SimulatedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SimulatedService")
            .field("instruments", &self.shared.config.instruments.len())
            .field("connected", &state.connection.is_some())
            .field("requests", &state.requests.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedService {
    /// Create a simulator.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ServiceState::default()),
            }),
        }
    }

    /// Answer future connects with error 502.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_connections = refuse;
    }

    /// Close the socket from the service side.
    pub fn drop_connection(&self) {
        if let Some(connection) = self.shared.state.lock().connection.take() {
            tracing::info!("Simulator dropping connection");
            connection.close();
        }
    }

    /// Fail the next `times` bar requests whose window ends on `day`.
    pub fn fail_day(&self, day: NaiveDate, times: u32) {
        self.shared.state.lock().failing_days.insert(day, times);
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<SimulatedRequest> {
        self.shared.state.lock().requests.clone()
    }

    /// Number of accepted or refused connects.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.shared.state.lock().connects
    }

    fn instrument_by_key(&self, key: &InstrumentKey) -> Option<&SimulatedInstrument> {
        self.shared
            .config
            .instruments
            .iter()
            .find(|instrument| &instrument.key() == key)
    }

    fn instrument_for(&self, contract: &ContractDetails) -> Option<&SimulatedInstrument> {
        let key = InstrumentKey::build(contract.security_type, &contract.symbol, &contract.exchange);
        self.instrument_by_key(&key)
    }

    /// Record the request and return the live connection.
    fn accept(&self, request: SimulatedRequest) -> Result<Arc<SimulatedConnection>, TransportError> {
        let mut state = self.shared.state.lock();
        let connection = state
            .connection
            .clone()
            .ok_or(TransportError::NotConnected)?;
        state.requests.push(request);
        Ok(connection)
    }

    fn bars_for(
        &self,
        instrument: &SimulatedInstrument,
        min_tick: Decimal,
        end: NaiveDateTime,
        step: TimeDelta,
    ) -> Vec<RawBar> {
        let config = &self.shared.config;
        let start = end - TimeDelta::days(1);
        let mut bars = Vec::new();

        let mut day = start.date();
        while day <= end.date() {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let close = day.and_time(config.session_close);
                let mut at = day.and_time(config.session_open);
                while at < close {
                    if at > start && at <= end && at >= instrument.head_timestamp {
                        bars.push(wave_bar(instrument.base_price, min_tick, at, step));
                    }
                    at += step;
                }
            }
            let Some(next) = day.succ_opt() else {
                break;
            };
            day = next;
        }
        bars
    }
}

/// Triangle wave around `base`, twenty steps per leg.
fn wave_bar(base: Decimal, tick: Decimal, at: NaiveDateTime, step: TimeDelta) -> RawBar {
    let step_secs = step.num_seconds().max(1);
    let index = at.and_utc().timestamp() / step_secs;
    let offset = (index.rem_euclid(40) - 20).abs();
    let open = base + Decimal::from(offset) * tick;
    let close = if index.rem_euclid(40) < 20 { open - tick } else { open + tick };

    RawBar {
        date: at.format(REPLY_FORMAT).to_string(),
        open,
        high: open.max(close) + tick,
        low: open.min(close) - tick,
        close,
    }
}

impl ProtocolClient for SimulatedService {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Arc<dyn MessageSource>, TransportError> {
        let mut state = self.shared.state.lock();
        if let Some(previous) = state.connection.take() {
            previous.close();
        }

        state.connects += 1;
        let connection = Arc::new(SimulatedConnection::default());
        if state.refuse_connections {
            tracing::info!(endpoint = %endpoint, "Simulator refusing connection");
            connection.push(ProtocolCallback::ProtocolError {
                request_id: None,
                code: CODE_CONNECT_FAIL,
                message: "Couldn't connect to TWS".to_string(),
            });
        } else {
            tracing::info!(endpoint = %endpoint, "Simulator accepted connection");
            connection.push(ProtocolCallback::ConnectionAccepted {
                next_valid_id: self.shared.config.next_valid_id,
            });
            connection.push(ProtocolCallback::ProtocolError {
                request_id: None,
                code: CODE_FARM_OK,
                message: "Market data farm connection is OK:usfarm".to_string(),
            });
        }
        state.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.shared.state.lock().connection.take() {
            connection.close();
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().connection.is_some()
    }

    fn request_current_time(&mut self) -> Result<(), TransportError> {
        let connection = self.accept(SimulatedRequest::CurrentTime)?;
        connection.push(ProtocolCallback::CurrentTime {
            epoch_seconds: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    fn request_instrument_details(
        &mut self,
        id: RequestId,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        let key = spec.key();
        let connection = self.accept(SimulatedRequest::InstrumentDetails {
            id,
            key: key.clone(),
        })?;

        let Some(instrument) = self.instrument_by_key(&key) else {
            connection.push(ProtocolCallback::ProtocolError {
                request_id: Some(id),
                code: CODE_NO_DEFINITION,
                message: "No security definition has been found for the request".to_string(),
            });
            return Ok(());
        };

        for details in &instrument.variants {
            connection.push(ProtocolCallback::InstrumentDetail {
                request_id: id,
                details: details.clone(),
            });
        }
        connection.push(ProtocolCallback::InstrumentDetailEnd { request_id: id });
        Ok(())
    }

    fn request_head_timestamp(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        _query: &HeadTimestampQuery,
    ) -> Result<(), TransportError> {
        let connection = self.accept(SimulatedRequest::HeadTimestamp { id })?;
        match self.instrument_for(contract) {
            Some(instrument) => connection.push(ProtocolCallback::HeadTimestamp {
                request_id: id,
                timestamp: instrument.head_timestamp.format(REPLY_FORMAT).to_string(),
            }),
            None => connection.push(ProtocolCallback::ProtocolError {
                request_id: Some(id),
                code: CODE_NO_DEFINITION,
                message: "No security definition has been found for the request".to_string(),
            }),
        }
        Ok(())
    }

    fn request_historical_bars(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        query: &HistoricalQuery,
    ) -> Result<(), TransportError> {
        let connection = self.accept(SimulatedRequest::HistoricalBars { id, end: query.end })?;

        let injected_failure = {
            let mut state = self.shared.state.lock();
            match state.failing_days.get_mut(&query.end.date()) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if injected_failure {
            tracing::debug!(request_id = %id, day = %query.end.date(), "Simulator failing bar request");
            connection.push(ProtocolCallback::ProtocolError {
                request_id: Some(id),
                code: CODE_HMDS_ERROR,
                message: "Historical Market Data Service error message:HMDS query returned no data"
                    .to_string(),
            });
            return Ok(());
        }

        let (Some(instrument), Some(step)) =
            (self.instrument_for(contract), parse_bar_size(&query.bar_size))
        else {
            connection.push(ProtocolCallback::ProtocolError {
                request_id: Some(id),
                code: CODE_INVALID_REQUEST,
                message: format!("Error validating request: bar size {:?}", query.bar_size),
            });
            return Ok(());
        };

        for bar in self.bars_for(instrument, contract.min_tick, query.end, step) {
            connection.push(ProtocolCallback::Bar { request_id: id, bar });
        }
        connection.push(ProtocolCallback::BarStreamEnd { request_id: id });
        Ok(())
    }

    fn cancel_historical_bars(&mut self, id: RequestId) -> Result<(), TransportError> {
        self.accept(SimulatedRequest::CancelHistoricalBars { id })?;
        tracing::debug!(request_id = %id, "Simulator bar request cancelled");
        Ok(())
    }

    fn request_price_ticks(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        kind: TickKind,
    ) -> Result<(), TransportError> {
        let connection = self.accept(SimulatedRequest::PriceTicks { id, kind })?;
        let Some(instrument) = self.instrument_for(contract) else {
            return Ok(());
        };

        let base = instrument.base_price;
        let tick = |field, value| ProtocolCallback::PriceTick {
            request_id: id,
            field,
            value,
        };
        match kind {
            TickKind::Last => connection.push(tick(TickField::Last, base)),
            TickKind::BidAsk => {
                connection.push(tick(TickField::Bid, base - contract.min_tick));
                connection.push(tick(TickField::Ask, base + contract.min_tick));
            }
        }
        Ok(())
    }
}
