//! Port Interfaces
//!
//! Contracts between the session core and its adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`ProtocolClient`]: request side of the trading-data service
//! - [`MessageSource`]: inbound side of one open connection
//! - [`ReaderLauncher`]: starts/stops the loop draining a `MessageSource`
//! - [`NotificationSink`]: observer fan-out
//! - [`Clock`]: wall clock, injectable for tests
//!
//! ## Inbound Data
//!
//! - [`ProtocolCallback`]: every callback the service can deliver

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::domain::correlation::RequestId;
use crate::domain::instrument::{
    ContractDetails, InstrumentKey, InstrumentSnapshot, InstrumentSpec, TickField,
};

// =============================================================================
// Transport
// =============================================================================

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Client id presented to the service.
    pub client_id: i32,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (client {})", self.host, self.port, self.client_id)
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Socket could not be opened.
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed {
        /// Target endpoint.
        endpoint: String,
        /// Failure description.
        reason: String,
    },
    /// A request was issued without an open connection.
    #[error("not connected")]
    NotConnected,
    /// The connection closed while sending.
    #[error("connection closed")]
    Closed,
}

/// Inbound side of an open connection.
///
/// The transport pushes decoded callbacks into an internal buffer and
/// notifies [`wake_signal`](Self::wake_signal); the reader drains the buffer.
pub trait MessageSource: Send + Sync {
    /// Signal raised whenever new messages are buffered.
    fn wake_signal(&self) -> Arc<Notify>;

    /// Cancelled when the connection closes.
    fn closed(&self) -> CancellationToken;

    /// Take every buffered callback.
    fn drain(&self) -> Vec<ProtocolCallback>;
}

/// Parameters for a head-timestamp request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadTimestampQuery {
    /// Data type, e.g. `TRADES`.
    pub what_to_show: String,
    /// Regular trading hours only.
    pub use_rth: bool,
}

/// Parameters for one page of historical bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalQuery {
    /// End of the window.
    pub end: NaiveDateTime,
    /// Window length, e.g. `1 D`.
    pub duration: String,
    /// Bar size, e.g. `1 min`.
    pub bar_size: String,
    /// Data type, e.g. `TRADES`.
    pub what_to_show: String,
    /// Regular trading hours only.
    pub use_rth: bool,
}

/// Tick stream to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    /// Trade prints.
    Last,
    /// Bid/ask updates.
    BidAsk,
}

/// Request side of the service.
///
/// All methods are non-blocking: they enqueue the request and return.
pub trait ProtocolClient: Send {
    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the socket cannot open.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Arc<dyn MessageSource>, TransportError>;

    /// Close the connection. No-op when already closed.
    fn disconnect(&mut self);

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;

    /// Ask for the server clock.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn request_current_time(&mut self) -> Result<(), TransportError>;

    /// Ask for contract details.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn request_instrument_details(
        &mut self,
        id: RequestId,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError>;

    /// Ask for the earliest available data timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn request_head_timestamp(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        query: &HeadTimestampQuery,
    ) -> Result<(), TransportError>;

    /// Ask for one page of historical bars.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn request_historical_bars(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        query: &HistoricalQuery,
    ) -> Result<(), TransportError>;

    /// Cancel an outstanding bar request.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn cancel_historical_bars(&mut self, id: RequestId) -> Result<(), TransportError>;

    /// Subscribe to live ticks.
    ///
    /// # Errors
    ///
    /// Returns an error when not connected.
    fn request_price_ticks(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        kind: TickKind,
    ) -> Result<(), TransportError>;
}

/// Starts and stops the reader loop for a connection.
pub trait ReaderLauncher: Send {
    /// Begin draining `source` into the session's inbound queue.
    fn start(&mut self, source: Arc<dyn MessageSource>);

    /// Stop the running loop, if any.
    fn stop(&mut self);

    /// Whether a loop is running.
    fn is_running(&self) -> bool;
}

// =============================================================================
// Inbound Callbacks
// =============================================================================

/// Bar as delivered on the wire, before timestamp parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBar {
    /// Bar start, service-formatted.
    pub date: String,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
}

/// Every callback the service delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCallback {
    /// Handshake completed; carries the first usable id.
    ConnectionAccepted {
        /// Lowest id the service will accept.
        next_valid_id: u32,
    },
    /// Handshake refused.
    ConnectionRejected {
        /// Service error code.
        code: i32,
    },
    /// The socket dropped.
    ConnectionLost,
    /// Server clock reply.
    CurrentTime {
        /// Seconds since the Unix epoch.
        epoch_seconds: i64,
    },
    /// One contract detail record.
    InstrumentDetail {
        /// Correlated request.
        request_id: RequestId,
        /// Reported contract.
        details: ContractDetails,
    },
    /// No more detail records for the request.
    InstrumentDetailEnd {
        /// Correlated request.
        request_id: RequestId,
    },
    /// Earliest available data.
    HeadTimestamp {
        /// Correlated request.
        request_id: RequestId,
        /// Service-formatted timestamp.
        timestamp: String,
    },
    /// One historical bar.
    Bar {
        /// Correlated request.
        request_id: RequestId,
        /// Bar values.
        bar: RawBar,
    },
    /// No more bars for the request.
    BarStreamEnd {
        /// Correlated request.
        request_id: RequestId,
    },
    /// Live price update.
    PriceTick {
        /// Correlated subscription.
        request_id: RequestId,
        /// Field updated.
        field: TickField,
        /// New value.
        value: Decimal,
    },
    /// Error or informational message.
    ProtocolError {
        /// Correlated request, if any.
        request_id: Option<RequestId>,
        /// Service error code.
        code: i32,
        /// Service message.
        message: String,
    },
}

impl ProtocolCallback {
    /// Metric/log label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionAccepted { .. } => "connection_accepted",
            Self::ConnectionRejected { .. } => "connection_rejected",
            Self::ConnectionLost => "connection_lost",
            Self::CurrentTime { .. } => "current_time",
            Self::InstrumentDetail { .. } => "instrument_detail",
            Self::InstrumentDetailEnd { .. } => "instrument_detail_end",
            Self::HeadTimestamp { .. } => "head_timestamp",
            Self::Bar { .. } => "bar",
            Self::BarStreamEnd { .. } => "bar_stream_end",
            Self::PriceTick { .. } => "price_tick",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Connection flag flipped.
    ConnectionStatusChanged {
        /// New value.
        connected: bool,
    },
    /// First detail record seen for a key.
    InstrumentAdded {
        /// Catalog key.
        key: InstrumentKey,
    },
    /// Active variant chosen.
    InstrumentResolved {
        /// Instrument state at resolution.
        snapshot: InstrumentSnapshot,
    },
    /// One day finished.
    DownloadProgress {
        /// Catalog key.
        key: InstrumentKey,
        /// Day just finished.
        day: NaiveDate,
        /// Bars held so far.
        bar_count: usize,
        /// Days finished so far.
        days_completed: u32,
    },
    /// Download reached its terminal state.
    DownloadFinished {
        /// Catalog key.
        key: InstrumentKey,
        /// Bars held.
        bar_count: usize,
        /// Days given up on.
        skipped_days: Vec<NaiveDate>,
    },
    /// Download stopped by a lost connection or a cancel.
    DownloadInterrupted {
        /// Catalog key.
        key: InstrumentKey,
    },
}

/// Observer fan-out.
pub trait NotificationSink: Send + Sync {
    /// Publish to every current subscriber. Never blocks.
    fn publish(&self, notification: Notification);
}

// =============================================================================
// Clock
// =============================================================================

/// Wall clock in the service's local time.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> NaiveDateTime;
}

/// Host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
