//! Hand-written fakes for the service tests.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Endpoint, HeadTimestampQuery, HistoricalQuery, MessageSource, Notification, NotificationSink,
    ProtocolCallback, ProtocolClient, ReaderLauncher, TickKind, TransportError,
};
use crate::domain::correlation::RequestId;
use crate::domain::instrument::{ContractDetails, InstrumentKey, InstrumentSpec, SecurityType};

/// Request as seen by [`FakeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRequest {
    InstrumentDetails { id: RequestId, key: InstrumentKey },
    HeadTimestamp { id: RequestId },
    HistoricalBars { id: RequestId, end: NaiveDateTime },
    CancelHistoricalBars { id: RequestId },
    PriceTicks { id: RequestId, kind: TickKind },
}

impl SentRequest {
    pub const fn id(&self) -> RequestId {
        match self {
            Self::InstrumentDetails { id, .. }
            | Self::HeadTimestamp { id }
            | Self::HistoricalBars { id, .. }
            | Self::CancelHistoricalBars { id }
            | Self::PriceTicks { id, .. } => *id,
        }
    }
}

/// Source that never produces anything.
#[derive(Default)]
pub struct SilentSource {
    wake: Arc<Notify>,
    closed: CancellationToken,
}

impl MessageSource for SilentSource {
    fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn drain(&self) -> Vec<ProtocolCallback> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct FakeClient {
    pub connected: bool,
    pub refuse_connect: bool,
    pub time_requests: u32,
    pub sent: Vec<SentRequest>,
}

impl FakeClient {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn record(&mut self, request: SentRequest) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.sent.push(request);
        Ok(())
    }
}

impl ProtocolClient for FakeClient {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Arc<dyn MessageSource>, TransportError> {
        if self.refuse_connect {
            return Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "refused".to_string(),
            });
        }
        self.connected = true;
        Ok(Arc::new(SilentSource::default()))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn request_current_time(&mut self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.time_requests += 1;
        Ok(())
    }

    fn request_instrument_details(
        &mut self,
        id: RequestId,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        self.record(SentRequest::InstrumentDetails { id, key: spec.key() })
    }

    fn request_head_timestamp(
        &mut self,
        id: RequestId,
        _contract: &ContractDetails,
        _query: &HeadTimestampQuery,
    ) -> Result<(), TransportError> {
        self.record(SentRequest::HeadTimestamp { id })
    }

    fn request_historical_bars(
        &mut self,
        id: RequestId,
        _contract: &ContractDetails,
        query: &HistoricalQuery,
    ) -> Result<(), TransportError> {
        self.record(SentRequest::HistoricalBars { id, end: query.end })
    }

    fn cancel_historical_bars(&mut self, id: RequestId) -> Result<(), TransportError> {
        self.record(SentRequest::CancelHistoricalBars { id })
    }

    fn request_price_ticks(
        &mut self,
        id: RequestId,
        _contract: &ContractDetails,
        kind: TickKind,
    ) -> Result<(), TransportError> {
        self.record(SentRequest::PriceTicks { id, kind })
    }
}

/// Client whose state the test keeps a handle to after boxing it.
#[derive(Debug, Clone, Default)]
pub struct SharedClient(pub Arc<Mutex<FakeClient>>);

impl SharedClient {
    pub fn sent(&self) -> Vec<SentRequest> {
        self.0.lock().sent.clone()
    }

    pub fn last_sent(&self) -> Option<SentRequest> {
        self.0.lock().sent.last().cloned()
    }
}

impl ProtocolClient for SharedClient {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Arc<dyn MessageSource>, TransportError> {
        self.0.lock().connect(endpoint)
    }

    fn disconnect(&mut self) {
        self.0.lock().disconnect();
    }

    fn is_connected(&self) -> bool {
        self.0.lock().is_connected()
    }

    fn request_current_time(&mut self) -> Result<(), TransportError> {
        self.0.lock().request_current_time()
    }

    fn request_instrument_details(
        &mut self,
        id: RequestId,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        self.0.lock().request_instrument_details(id, spec)
    }

    fn request_head_timestamp(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        query: &HeadTimestampQuery,
    ) -> Result<(), TransportError> {
        self.0.lock().request_head_timestamp(id, contract, query)
    }

    fn request_historical_bars(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        query: &HistoricalQuery,
    ) -> Result<(), TransportError> {
        self.0.lock().request_historical_bars(id, contract, query)
    }

    fn cancel_historical_bars(&mut self, id: RequestId) -> Result<(), TransportError> {
        self.0.lock().cancel_historical_bars(id)
    }

    fn request_price_ticks(
        &mut self,
        id: RequestId,
        contract: &ContractDetails,
        kind: TickKind,
    ) -> Result<(), TransportError> {
        self.0.lock().request_price_ticks(id, contract, kind)
    }
}

#[derive(Debug, Default)]
pub struct FakeReader {
    pub running: bool,
    pub starts: u32,
}

impl ReaderLauncher for FakeReader {
    fn start(&mut self, _source: Arc<dyn MessageSource>) {
        self.running = true;
        self.starts += 1;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    published: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    /// Everything published since the last call.
    pub fn taken(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.published.lock())
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, notification: Notification) {
        self.published.lock().push(notification);
    }
}

pub fn es_spec() -> InstrumentSpec {
    InstrumentSpec::new(SecurityType::Future, "ES", "GLOBEX")
}

pub fn es_contract() -> ContractDetails {
    contract(495_512_557, "ESH0", NaiveDate::from_ymd_opt(2020, 3, 20))
}

pub fn contract(contract_id: i64, local_symbol: &str, expiry: Option<NaiveDate>) -> ContractDetails {
    ContractDetails {
        contract_id,
        security_type: SecurityType::Future,
        symbol: "ES".to_string(),
        local_symbol: local_symbol.to_string(),
        exchange: "GLOBEX".to_string(),
        currency: "USD".to_string(),
        long_name: "E-mini S&P 500".to_string(),
        last_trade_date: expiry,
        min_tick: dec!(0.25),
    }
}
