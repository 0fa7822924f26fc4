//! Session Orchestrator
//!
//! Owns the connection machine, the instrument catalog, one download machine
//! per instrument and the request correlation registry. Every inbound
//! callback and every public operation runs through `&mut Session` on a
//! single worker, so nothing here is shared or locked.
//!
//! # Callback Routing
//!
//! Correlated callbacks are resolved through the registry to the instrument
//! they belong to and turned into typed machine events. Unknown request ids
//! are logged and dropped.
//!
//! # Protocol Error Classification
//!
//! | Condition                                   | Handling                  |
//! |---------------------------------------------|---------------------------|
//! | code in lost-connection list                | `LostConnection`          |
//! | code in refused list while connecting       | `ConnectionRejected`      |
//! | id of an outstanding head/bar request       | download `RequestFailed`  |
//! | id of an outstanding detail/tick request    | request dropped           |
//! | code in informational list                  | debug log                 |
//! | anything else                               | warn log                  |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::application::ports::{
    Clock, Endpoint, Notification, NotificationSink, ProtocolCallback, ProtocolClient,
    ReaderLauncher, TickKind,
};
use crate::application::services::SessionError;
use crate::application::services::connectivity::{
    self, ConnectivityActions, ConnectivityEvent, ConnectivityMachine, ConnectivityState,
    LinkStatus,
};
use crate::application::services::download::{
    self, DayProgress, DownloadActions, DownloadEvent, DownloadEventKind, DownloadMachine,
    DownloadState,
};
use crate::domain::correlation::{
    CorrelationRegistry, RequestId, RequestIdAllocator, RequestKind, RequestRecord,
};
use crate::domain::fsm::{FireOutcome, MachineDefinition};
use crate::domain::instrument::{
    Instrument, InstrumentKey, InstrumentSnapshot, InstrumentSpec, SecurityType, TimedBar,
};
use crate::infrastructure::config::{DownloaderConfig, ErrorCodeSettings, HistorySettings};
use crate::infrastructure::metrics::{self, ErrorClass};

/// Adapters the session drives.
pub struct SessionDeps {
    /// Request side of the service.
    pub client: Box<dyn ProtocolClient>,
    /// Reader loop control.
    pub reader: Box<dyn ReaderLauncher>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Observer fan-out.
    pub notifications: Arc<dyn NotificationSink>,
}

#[derive(Debug)]
struct CatalogEntry {
    instrument: Instrument,
    download: Option<DownloadMachine>,
    progress: DayProgress,
    resume_download: bool,
}

impl CatalogEntry {
    fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            download: None,
            progress: DayProgress::default(),
            resume_download: false,
        }
    }

    fn download_running(&self) -> bool {
        self.download
            .as_ref()
            .is_some_and(|machine| machine.is_started() && !machine.is_finished())
    }
}

/// The service facade.
pub struct Session {
    client: Box<dyn ProtocolClient>,
    reader: Box<dyn ReaderLauncher>,
    clock: Arc<dyn Clock>,
    notifications: Arc<dyn NotificationSink>,
    endpoint: Endpoint,
    history: HistorySettings,
    error_codes: ErrorCodeSettings,
    registry: CorrelationRegistry,
    ids: RequestIdAllocator,
    catalog: BTreeMap<InstrumentKey, CatalogEntry>,
    pending: BTreeMap<InstrumentKey, InstrumentSpec>,
    connectivity: ConnectivityMachine,
    download_definition: Arc<MachineDefinition<DownloadState, DownloadEventKind>>,
    link: LinkStatus,
    server_time_offset: Option<TimeDelta>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("state", &self.connectivity.state())
            .field("instruments", &self.catalog.len())
            .field("outstanding", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and start its connectivity machine.
    ///
    /// # Errors
    ///
    /// Returns an error if a machine definition is invalid.
    pub fn new(config: &DownloaderConfig, deps: SessionDeps) -> Result<Self, SessionError> {
        let connectivity = ConnectivityMachine::new(Arc::new(connectivity::definition()?));
        let download_definition = Arc::new(download::definition()?);

        let mut session = Self {
            client: deps.client,
            reader: deps.reader,
            clock: deps.clock,
            notifications: deps.notifications,
            endpoint: config.endpoint.endpoint(),
            history: config.history.clone(),
            error_codes: config.error_codes.clone(),
            registry: CorrelationRegistry::new(),
            ids: RequestIdAllocator::new(),
            catalog: BTreeMap::new(),
            pending: BTreeMap::new(),
            connectivity,
            download_definition,
            link: LinkStatus::default(),
            server_time_offset: None,
        };

        let mut actions = ConnectivityActions {
            client: session.client.as_mut(),
            reader: session.reader.as_mut(),
            endpoint: &session.endpoint,
            link: &mut session.link,
            notifications: session.notifications.as_ref(),
        };
        session.connectivity.start(&mut actions)?;
        Ok(session)
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Build the catalog key for an instrument.
    #[must_use]
    pub fn build_instrument_key(
        security_type: SecurityType,
        symbol: &str,
        exchange: &str,
    ) -> InstrumentKey {
        InstrumentKey::build(security_type, symbol, exchange)
    }

    /// Ask the connectivity machine to connect.
    ///
    /// Returns the state reached; `TryConnection` means the handshake is
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry action fails.
    pub fn connect(&mut self) -> Result<ConnectivityState, SessionError> {
        if self.connectivity.state() == ConnectivityState::NotConnected {
            self.drive_connectivity(ConnectivityEvent::ServiceAvailable)?;
        }
        self.drive_connectivity(ConnectivityEvent::Connect)?;
        Ok(self.connectivity.state())
    }

    /// Shut the session down; the connectivity machine terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry action fails.
    pub fn disconnect(&mut self) -> Result<ConnectivityState, SessionError> {
        self.drive_connectivity(ConnectivityEvent::Finished)?;
        self.pending.clear();
        for entry in self.catalog.values_mut() {
            entry.resume_download = false;
        }
        Ok(self.connectivity.state())
    }

    /// Request contract details for `spec`.
    ///
    /// Resolution completes asynchronously; observers get `InstrumentAdded`
    /// and `InstrumentResolved`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] without a connection, or a
    /// transport error if the request cannot be sent.
    pub fn resolve_instrument(&mut self, spec: InstrumentSpec) -> Result<InstrumentKey, SessionError> {
        if !self.link.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let key = spec.key();
        if self.pending.contains_key(&key) {
            tracing::debug!(key = %key, "Instrument resolution already pending");
            return Ok(key);
        }

        self.request_details(&key, &spec)?;
        self.pending.insert(key.clone(), spec);
        Ok(key)
    }

    /// Start downloading history for a resolved instrument.
    ///
    /// # Errors
    ///
    /// Returns an error if the instrument is unknown or unresolved, a download
    /// is already running, there is no connection, or the first request fails.
    pub fn download_history(&mut self, key: &InstrumentKey) -> Result<(), SessionError> {
        let entry = self
            .catalog
            .get(key)
            .ok_or_else(|| SessionError::InstrumentNotFound(key.clone()))?;
        if !entry.instrument.is_resolved() {
            return Err(SessionError::InstrumentNotResolved(key.clone()));
        }
        if entry.download_running() {
            return Err(SessionError::DownloadInProgress(key.clone()));
        }
        if !self.link.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.start_download(key)
    }

    /// Stop a running download. Returns whether one was running.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InstrumentNotFound`] for an unknown key.
    pub fn cancel_download(&mut self, key: &InstrumentKey) -> Result<bool, SessionError> {
        let entry = self
            .catalog
            .get_mut(key)
            .ok_or_else(|| SessionError::InstrumentNotFound(key.clone()))?;
        entry.resume_download = false;
        if !entry.download_running() {
            return Ok(false);
        }

        tracing::info!(key = %key, "Download cancelled");
        self.interrupt_download(key);
        Ok(true)
    }

    /// Snapshot of one instrument.
    #[must_use]
    pub fn instrument(&self, key: &InstrumentKey) -> Option<InstrumentSnapshot> {
        self.catalog.get(key).map(|entry| entry.instrument.snapshot())
    }

    /// Snapshots of every catalog entry, ordered by key.
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentSnapshot> {
        self.catalog
            .values()
            .map(|entry| entry.instrument.snapshot())
            .collect()
    }

    /// Downloaded bars for one instrument, oldest first.
    #[must_use]
    pub fn bars(&self, key: &InstrumentKey) -> Option<Vec<TimedBar>> {
        self.catalog
            .get(key)
            .map(|entry| entry.instrument.bars.iter().collect())
    }

    /// Current connectivity state.
    #[must_use]
    pub const fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    /// Whether the connection is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Download state for one instrument; `None` when no download has run.
    #[must_use]
    pub fn download_state(&self, key: &InstrumentKey) -> Option<DownloadState> {
        self.catalog
            .get(key)
            .and_then(|entry| entry.download.as_ref())
            .map(DownloadMachine::state)
    }

    /// Whether the connection failed and an automatic reconnect is due.
    #[must_use]
    pub fn reconnect_wanted(&self) -> bool {
        self.link.reconnect_wanted && self.connectivity.state() == ConnectivityState::NotConnected
    }

    /// Server clock minus local clock, once known.
    #[must_use]
    pub const fn server_time_offset(&self) -> Option<TimeDelta> {
        self.server_time_offset
    }

    /// Number of outstanding correlated requests.
    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.registry.len()
    }

    // =========================================================================
    // Callback Handling
    // =========================================================================

    /// Route one inbound callback.
    ///
    /// # Errors
    ///
    /// Returns an error if a machine rejects the resulting event or an entry
    /// action fails. Unknown request ids are not errors.
    pub fn handle_callback(&mut self, callback: ProtocolCallback) -> Result<(), SessionError> {
        let name = callback.name();
        metrics::record_callback(name);
        tracing::trace!(callback = name, "Callback received");

        match callback {
            ProtocolCallback::ConnectionAccepted { next_valid_id } => {
                self.ids.advance_to(next_valid_id);
                self.drive_connectivity(ConnectivityEvent::ConnectionAccepted { next_valid_id })?;
            }
            ProtocolCallback::ConnectionRejected { code } => {
                self.drive_connectivity(ConnectivityEvent::ConnectionRejected {
                    code: Some(code),
                    reason: "handshake refused".to_string(),
                })?;
            }
            ProtocolCallback::ConnectionLost => {
                self.drive_connectivity(ConnectivityEvent::LostConnection { code: None })?;
            }
            ProtocolCallback::CurrentTime { epoch_seconds } => {
                self.on_current_time(epoch_seconds);
            }
            ProtocolCallback::InstrumentDetail {
                request_id,
                details,
            } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Peek) else {
                    return Ok(());
                };
                let entry = self.catalog_entry(&record.subject);
                if entry.instrument.add_variant(details) {
                    tracing::debug!(
                        key = %record.subject,
                        variants = entry.instrument.variants().len(),
                        "Contract variant recorded"
                    );
                }
            }
            ProtocolCallback::InstrumentDetailEnd { request_id } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Untrack) else {
                    return Ok(());
                };
                self.on_details_complete(&record.subject);
            }
            ProtocolCallback::HeadTimestamp {
                request_id,
                timestamp,
            } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Resolve) else {
                    return Ok(());
                };
                self.drive_download(&record.subject, DownloadEvent::HeadTimeStamp { timestamp })?;
            }
            ProtocolCallback::Bar { request_id, bar } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Resolve) else {
                    return Ok(());
                };
                self.drive_download(&record.subject, DownloadEvent::Bar(bar))?;
            }
            ProtocolCallback::BarStreamEnd { request_id } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Untrack) else {
                    return Ok(());
                };
                self.drive_download(&record.subject, DownloadEvent::EndOfRequest)?;
            }
            ProtocolCallback::PriceTick {
                request_id,
                field,
                value,
            } => {
                let Some(record) = self.correlate(request_id, name, RegistryLookup::Resolve) else {
                    return Ok(());
                };
                if let Some(entry) = self.catalog.get_mut(&record.subject) {
                    entry.instrument.quote.apply(field, value);
                }
            }
            ProtocolCallback::ProtocolError {
                request_id,
                code,
                message,
            } => {
                self.on_protocol_error(request_id, code, message)?;
            }
        }

        metrics::set_outstanding_requests(self.registry.len());
        Ok(())
    }

    fn correlate(
        &mut self,
        id: RequestId,
        callback: &'static str,
        lookup: RegistryLookup,
    ) -> Option<RequestRecord> {
        let record = match lookup {
            RegistryLookup::Peek => self.registry.peek(id).cloned(),
            RegistryLookup::Resolve => self.registry.resolve(id).ok(),
            RegistryLookup::Untrack => self.registry.untrack(id),
        };
        if record.is_none() {
            metrics::record_uncorrelated_callback(callback);
            tracing::warn!(request_id = %id, callback, "Dropping callback for unknown request");
        }
        record
    }

    fn on_current_time(&mut self, epoch_seconds: i64) {
        let Some(server) = DateTime::<Utc>::from_timestamp(epoch_seconds, 0) else {
            tracing::warn!(epoch_seconds, "Server time out of range");
            return;
        };
        let offset = server - Utc::now();
        self.server_time_offset = Some(offset);
        tracing::info!(
            server_time = %server,
            offset_ms = offset.num_milliseconds(),
            "Server time synchronized"
        );
    }

    fn on_details_complete(&mut self, key: &InstrumentKey) {
        self.pending.remove(key);
        let Some(entry) = self.catalog.get_mut(key) else {
            tracing::warn!(key = %key, "No contract matched the instrument request");
            return;
        };
        let variants = entry.instrument.variants().len();
        let Some(active) = entry.instrument.activate_front() else {
            tracing::warn!(key = %key, "Instrument has no variants");
            return;
        };
        tracing::info!(
            key = %key,
            local_symbol = %active.local_symbol,
            variants,
            "Instrument resolved"
        );
        self.notifications.publish(Notification::InstrumentResolved {
            snapshot: entry.instrument.snapshot(),
        });
        self.subscribe_ticks(key);
    }

    fn on_protocol_error(
        &mut self,
        request_id: Option<RequestId>,
        code: i32,
        message: String,
    ) -> Result<(), SessionError> {
        let codes = &self.error_codes;

        if codes.lost_connection.contains(&code) {
            metrics::record_protocol_error(ErrorClass::ConnectionLost);
            tracing::warn!(code, %message, "Service reports connection loss");
            self.drive_connectivity(ConnectivityEvent::LostConnection { code: Some(code) })?;
            return Ok(());
        }

        if codes.connect_refused.contains(&code)
            && self.connectivity.state() == ConnectivityState::TryConnection
        {
            metrics::record_protocol_error(ErrorClass::ConnectRefused);
            self.drive_connectivity(ConnectivityEvent::ConnectionRejected {
                code: Some(code),
                reason: message,
            })?;
            return Ok(());
        }

        if let Some(id) = request_id
            && let Some(record) = self.registry.untrack(id)
        {
            metrics::record_protocol_error(ErrorClass::RequestFailed);
            match record.kind {
                RequestKind::HeadTimestamp | RequestKind::HistoricalBars => {
                    tracing::warn!(
                        key = %record.subject,
                        request_id = %id,
                        code,
                        %message,
                        "Download request failed"
                    );
                    self.drive_download(
                        &record.subject,
                        DownloadEvent::RequestFailed { code, message },
                    )?;
                }
                RequestKind::InstrumentDetails => {
                    tracing::warn!(
                        key = %record.subject,
                        code,
                        %message,
                        "Instrument request failed, dropping it"
                    );
                    self.pending.remove(&record.subject);
                }
                RequestKind::PriceTicks => {
                    tracing::warn!(
                        key = %record.subject,
                        code,
                        %message,
                        "Tick subscription failed, dropping it"
                    );
                }
            }
            return Ok(());
        }

        if codes.informational.contains(&code) {
            metrics::record_protocol_error(ErrorClass::Informational);
            tracing::debug!(code, %message, "Service status");
        } else {
            metrics::record_protocol_error(ErrorClass::Unclassified);
            tracing::warn!(?request_id, code, %message, "Unhandled service error");
        }
        Ok(())
    }

    // =========================================================================
    // Machine Plumbing
    // =========================================================================

    fn drive_connectivity(
        &mut self,
        event: ConnectivityEvent,
    ) -> Result<FireOutcome<ConnectivityState>, SessionError> {
        let was_connected = self.link.is_connected();
        let mut actions = ConnectivityActions {
            client: self.client.as_mut(),
            reader: self.reader.as_mut(),
            endpoint: &self.endpoint,
            link: &mut self.link,
            notifications: self.notifications.as_ref(),
        };
        let outcome = self.connectivity.fire(event, &mut actions)?;

        match (was_connected, self.link.is_connected()) {
            (false, true) => self.on_link_up(),
            (true, false) => self.on_link_down(),
            _ => {}
        }
        Ok(outcome)
    }

    fn on_link_up(&mut self) {
        let pending: Vec<(InstrumentKey, InstrumentSpec)> = self
            .pending
            .iter()
            .map(|(key, spec)| (key.clone(), spec.clone()))
            .collect();
        for (key, spec) in pending {
            if let Err(e) = self.request_details(&key, &spec) {
                tracing::warn!(key = %key, error = %e, "Could not re-request instrument");
            }
        }

        let resolved: BTreeSet<InstrumentKey> = self
            .catalog
            .iter()
            .filter(|(_, entry)| entry.instrument.is_resolved())
            .map(|(key, _)| key.clone())
            .collect();
        for key in resolved {
            self.subscribe_ticks(&key);
            let resume = self
                .catalog
                .get_mut(&key)
                .is_some_and(|entry| std::mem::take(&mut entry.resume_download));
            if resume {
                tracing::info!(key = %key, "Restarting interrupted download");
                if let Err(e) = self.start_download(&key) {
                    tracing::error!(key = %key, error = %e, "Could not restart download");
                }
            }
        }
    }

    fn on_link_down(&mut self) {
        for (key, entry) in &mut self.catalog {
            if entry.download_running() {
                entry.download = None;
                entry.progress.clear();
                entry.resume_download = true;
                tracing::warn!(key = %key, "Download interrupted by connection loss");
                self.notifications
                    .publish(Notification::DownloadInterrupted { key: key.clone() });
            }
        }
        let dropped = self.registry.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Outstanding requests dropped with the connection");
        }
        metrics::set_outstanding_requests(0);
    }

    fn drive_download(&mut self, key: &InstrumentKey, event: DownloadEvent) -> Result<(), SessionError> {
        let Some(entry) = self.catalog.get_mut(key) else {
            return Err(SessionError::InstrumentNotFound(key.clone()));
        };
        let Some(machine) = entry.download.as_mut() else {
            tracing::debug!(key = %key, ?event, "No download running, dropping event");
            return Ok(());
        };

        let mut actions = DownloadActions {
            instrument: &mut entry.instrument,
            progress: &mut entry.progress,
            registry: &mut self.registry,
            ids: &mut self.ids,
            client: self.client.as_mut(),
            clock: self.clock.as_ref(),
            settings: &self.history,
            notifications: self.notifications.as_ref(),
        };
        if let Err(e) = machine.fire(event, &mut actions) {
            tracing::warn!(key = %key, error = %e, "Download step failed, abandoning download");
            self.interrupt_download(key);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the download for `key`, cancelling its outstanding request.
    fn interrupt_download(&mut self, key: &InstrumentKey) {
        let Some(entry) = self.catalog.get_mut(key) else {
            return;
        };
        if let Some(id) = entry.progress.active_request
            && let Some(record) = self.registry.untrack(id)
            && record.kind == RequestKind::HistoricalBars
            && let Err(e) = self.client.cancel_historical_bars(id)
        {
            tracing::warn!(key = %key, request_id = %id, error = %e, "Cancel request failed");
        }
        entry.download = None;
        entry.progress.clear();
        metrics::set_outstanding_requests(self.registry.len());

        self.notifications
            .publish(Notification::DownloadInterrupted { key: key.clone() });
    }

    fn start_download(&mut self, key: &InstrumentKey) -> Result<(), SessionError> {
        let Some(entry) = self.catalog.get_mut(key) else {
            return Err(SessionError::InstrumentNotFound(key.clone()));
        };
        entry.instrument.reset_download();
        entry.progress.clear();

        let mut machine = DownloadMachine::new(Arc::clone(&self.download_definition));
        let mut actions = DownloadActions {
            instrument: &mut entry.instrument,
            progress: &mut entry.progress,
            registry: &mut self.registry,
            ids: &mut self.ids,
            client: self.client.as_mut(),
            clock: self.clock.as_ref(),
            settings: &self.history,
            notifications: self.notifications.as_ref(),
        };
        if let Err(e) = machine.start(&mut actions) {
            entry.progress.clear();
            return Err(e);
        }
        entry.download = Some(machine);

        tracing::info!(key = %key, "Download started");
        Ok(())
    }

    fn catalog_entry(&mut self, key: &InstrumentKey) -> &mut CatalogEntry {
        let notifications = &self.notifications;
        let pending = &self.pending;
        self.catalog.entry(key.clone()).or_insert_with(|| {
            let spec = pending.get(key).cloned().unwrap_or_else(|| spec_from_key(key));
            tracing::info!(key = %key, "Instrument added");
            notifications.publish(Notification::InstrumentAdded { key: key.clone() });
            CatalogEntry::new(Instrument::new(spec))
        })
    }

    fn request_details(&mut self, key: &InstrumentKey, spec: &InstrumentSpec) -> Result<(), SessionError> {
        let id = self.ids.allocate(&self.registry);
        self.registry
            .track(id, key.clone(), true, RequestKind::InstrumentDetails)?;
        if let Err(e) = self.client.request_instrument_details(id, spec) {
            self.registry.untrack(id);
            return Err(e.into());
        }
        metrics::record_request(RequestKind::InstrumentDetails);
        tracing::debug!(key = %key, request_id = %id, "Instrument details requested");
        Ok(())
    }

    fn subscribe_ticks(&mut self, key: &InstrumentKey) {
        if !self.history.subscribe_ticks {
            return;
        }
        let Some(contract) = self
            .catalog
            .get(key)
            .and_then(|entry| entry.instrument.active_contract())
            .cloned()
        else {
            return;
        };

        for kind in [TickKind::Last, TickKind::BidAsk] {
            let id = self.ids.allocate(&self.registry);
            if let Err(e) = self
                .registry
                .track(id, key.clone(), true, RequestKind::PriceTicks)
            {
                tracing::error!(key = %key, error = %e, "Could not track tick subscription");
                continue;
            }
            match self.client.request_price_ticks(id, &contract, kind) {
                Ok(()) => metrics::record_request(RequestKind::PriceTicks),
                Err(e) => {
                    self.registry.untrack(id);
                    tracing::warn!(key = %key, ?kind, error = %e, "Tick subscription failed");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RegistryLookup {
    Peek,
    Resolve,
    Untrack,
}

/// Rebuild a spec from a key when a detail arrives for an unknown request.
fn spec_from_key(key: &InstrumentKey) -> InstrumentSpec {
    let mut parts = key.as_str().splitn(3, '_');
    let security_type = parts
        .next()
        .and_then(SecurityType::from_code)
        .unwrap_or(SecurityType::Stock);
    let symbol = parts.next().unwrap_or_default();
    let exchange = parts.next().unwrap_or_default();
    InstrumentSpec::new(security_type, symbol, exchange)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::{FixedClock, RawBar};
    use crate::application::services::test_support::{
        FakeReader, RecordingSink, SentRequest, SharedClient, contract, es_contract, es_spec,
    };
    use crate::domain::instrument::TickField;

    struct Rig {
        session: Session,
        client: SharedClient,
        sink: Arc<RecordingSink>,
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 3)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn rig() -> Rig {
        let client = SharedClient::default();
        let sink = Arc::new(RecordingSink::default());
        let session = Session::new(
            &DownloaderConfig::default(),
            SessionDeps {
                client: Box::new(client.clone()),
                reader: Box::new(FakeReader::default()),
                clock: Arc::new(FixedClock(now())),
                notifications: sink.clone(),
            },
        )
        .unwrap();
        Rig {
            session,
            client,
            sink,
        }
    }

    fn connected_rig() -> Rig {
        let mut rig = rig();
        assert_eq!(rig.session.connect().unwrap(), ConnectivityState::TryConnection);
        rig.session
            .handle_callback(ProtocolCallback::ConnectionAccepted { next_valid_id: 100 })
            .unwrap();
        assert!(rig.session.is_connected());
        rig.sink.taken();
        rig
    }

    /// Resolve ES with one variant; returns its key.
    fn resolve_es(rig: &mut Rig) -> InstrumentKey {
        let key = rig.session.resolve_instrument(es_spec()).unwrap();
        let id = rig.client.last_sent().unwrap().id();
        rig.session
            .handle_callback(ProtocolCallback::InstrumentDetail {
                request_id: id,
                details: es_contract(),
            })
            .unwrap();
        rig.session
            .handle_callback(ProtocolCallback::InstrumentDetailEnd { request_id: id })
            .unwrap();
        key
    }

    fn last_bar_request(rig: &Rig) -> RequestId {
        rig.client
            .sent()
            .iter()
            .rev()
            .find_map(|r| match r {
                SentRequest::HistoricalBars { id, .. } | SentRequest::HeadTimestamp { id } => {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn new_session_is_not_connected() {
        let rig = rig();
        assert_eq!(rig.session.connectivity_state(), ConnectivityState::NotConnected);
        assert!(!rig.session.is_connected());
    }

    #[test]
    fn build_instrument_key_formats() {
        assert_eq!(
            Session::build_instrument_key(SecurityType::Future, "es", "globex").as_str(),
            "FUT_ES_GLOBEX"
        );
    }

    #[test]
    fn connect_accept_and_lose() {
        let mut rig = rig();
        rig.session.connect().unwrap();
        rig.session
            .handle_callback(ProtocolCallback::ConnectionAccepted { next_valid_id: 1 })
            .unwrap();
        assert_eq!(rig.session.connectivity_state(), ConnectivityState::Connected);

        rig.session
            .handle_callback(ProtocolCallback::ProtocolError {
                request_id: None,
                code: 1100,
                message: "Connectivity between IB and TWS has been lost".to_string(),
            })
            .unwrap();

        assert_eq!(rig.session.connectivity_state(), ConnectivityState::NotConnected);
        assert!(!rig.session.is_connected());
        assert!(rig.session.reconnect_wanted());
        assert_eq!(
            rig.sink.taken(),
            vec![
                Notification::ConnectionStatusChanged { connected: true },
                Notification::ConnectionStatusChanged { connected: false },
            ]
        );
    }

    #[test]
    fn refused_code_while_connecting_rejects() {
        let mut rig = rig();
        rig.session.connect().unwrap();

        rig.session
            .handle_callback(ProtocolCallback::ProtocolError {
                request_id: None,
                code: 502,
                message: "Couldn't connect to TWS".to_string(),
            })
            .unwrap();

        assert_eq!(rig.session.connectivity_state(), ConnectivityState::NotConnected);
        assert!(rig.session.reconnect_wanted());
    }

    #[test]
    fn accepted_id_floors_allocation() {
        let mut rig = connected_rig();
        rig.session.resolve_instrument(es_spec()).unwrap();
        assert_eq!(rig.client.last_sent().unwrap().id(), RequestId::new(100));
    }

    #[test]
    fn resolve_requires_connection() {
        let mut rig = rig();
        assert_eq!(
            rig.session.resolve_instrument(es_spec()),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn resolution_adds_then_resolves_front_month() {
        let mut rig = connected_rig();
        let key = rig.session.resolve_instrument(es_spec()).unwrap();
        let id = rig.client.last_sent().unwrap().id();

        for (cid, local) in [(1, "ESH0"), (2, "ESM0"), (1, "ESH0")] {
            rig.session
                .handle_callback(ProtocolCallback::InstrumentDetail {
                    request_id: id,
                    details: contract(cid, local, None),
                })
                .unwrap();
        }
        rig.session
            .handle_callback(ProtocolCallback::InstrumentDetailEnd { request_id: id })
            .unwrap();

        let published = rig.sink.taken();
        assert_eq!(published[0], Notification::InstrumentAdded { key: key.clone() });
        let Notification::InstrumentResolved { snapshot } = &published[1] else {
            panic!("expected resolution, got {published:?}");
        };
        assert_eq!(snapshot.local_symbol.as_deref(), Some("ESH0"));
        assert_eq!(snapshot.variants, 2);
        assert_eq!(published.len(), 2);

        // Detail request is gone; two tick subscriptions remain.
        assert_eq!(rig.session.outstanding_requests(), 2);
        let tick_kinds: Vec<TickKind> = rig
            .client
            .sent()
            .iter()
            .filter_map(|r| match r {
                SentRequest::PriceTicks { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(tick_kinds, vec![TickKind::Last, TickKind::BidAsk]);
    }

    #[test]
    fn price_ticks_update_quote() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        let tick_id = rig.client.last_sent().unwrap().id();

        rig.session
            .handle_callback(ProtocolCallback::PriceTick {
                request_id: tick_id,
                field: TickField::Bid,
                value: dec!(3230.25),
            })
            .unwrap();

        assert_eq!(
            rig.session.instrument(&key).unwrap().quote.bid,
            Some(dec!(3230.25))
        );
    }

    #[test]
    fn unknown_request_ids_are_dropped() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        let before = rig.session.instrument(&key).unwrap();
        rig.sink.taken();

        rig.session
            .handle_callback(ProtocolCallback::Bar {
                request_id: RequestId::new(9999),
                bar: RawBar {
                    date: "20200102  09:30:00".to_string(),
                    open: dec!(1),
                    high: dec!(1),
                    low: dec!(1),
                    close: dec!(1),
                },
            })
            .unwrap();
        rig.session
            .handle_callback(ProtocolCallback::BarStreamEnd {
                request_id: RequestId::new(9999),
            })
            .unwrap();

        assert_eq!(rig.session.instrument(&key).unwrap(), before);
        assert!(rig.sink.taken().is_empty());
    }

    #[test]
    fn download_pages_until_head_day() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        assert_eq!(
            rig.session.download_state(&key),
            Some(DownloadState::GetHeadTimeStamp)
        );

        rig.session
            .handle_callback(ProtocolCallback::HeadTimestamp {
                request_id: last_bar_request(&rig),
                timestamp: "20200101  00:00:00".to_string(),
            })
            .unwrap();

        for minute in 0..3 {
            let id = last_bar_request(&rig);
            rig.session
                .handle_callback(ProtocolCallback::Bar {
                    request_id: id,
                    bar: RawBar {
                        date: format!("20200102  09:3{minute}:00"),
                        open: dec!(10),
                        high: dec!(11),
                        low: dec!(9),
                        close: dec!(10.5),
                    },
                })
                .unwrap();
            rig.session
                .handle_callback(ProtocolCallback::BarStreamEnd { request_id: id })
                .unwrap();
        }

        assert_eq!(rig.session.download_state(&key), Some(DownloadState::Terminate));
        let ends: Vec<NaiveDateTime> = rig
            .client
            .sent()
            .iter()
            .filter_map(|r| match r {
                SentRequest::HistoricalBars { end, .. } => Some(*end),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 3);
        assert_eq!(rig.session.bars(&key).unwrap().len(), 3);
        // Only the two tick subscriptions stay tracked.
        assert_eq!(rig.session.outstanding_requests(), 2);
        assert!(matches!(
            rig.sink.taken().last(),
            Some(Notification::DownloadFinished { bar_count: 3, .. })
        ));
    }

    #[test]
    fn bar_request_error_becomes_request_failed() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        rig.session
            .handle_callback(ProtocolCallback::HeadTimestamp {
                request_id: last_bar_request(&rig),
                timestamp: "20200103".to_string(),
            })
            .unwrap();
        let failed = last_bar_request(&rig);

        rig.session
            .handle_callback(ProtocolCallback::ProtocolError {
                request_id: Some(failed),
                code: 162,
                message: "HMDS query returned no data".to_string(),
            })
            .unwrap();

        // Retried with a fresh id for the same day.
        let retry = last_bar_request(&rig);
        assert_ne!(retry, failed);
        assert_eq!(
            rig.session.download_state(&key),
            Some(DownloadState::DownloadHistoricalData)
        );
    }

    #[test]
    fn download_guards() {
        let mut rig = connected_rig();
        let unknown = InstrumentKey::new("FUT_NQ_GLOBEX");
        assert_eq!(
            rig.session.download_history(&unknown),
            Err(SessionError::InstrumentNotFound(unknown))
        );

        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        assert_eq!(
            rig.session.download_history(&key),
            Err(SessionError::DownloadInProgress(key.clone()))
        );
    }

    #[test]
    fn unparseable_head_timestamp_finishes_download() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();

        rig.session
            .handle_callback(ProtocolCallback::HeadTimestamp {
                request_id: last_bar_request(&rig),
                timestamp: "garbage".to_string(),
            })
            .unwrap();

        assert_eq!(rig.session.download_state(&key), Some(DownloadState::Terminate));
        rig.session.download_history(&key).unwrap();
        assert_eq!(
            rig.session.download_state(&key),
            Some(DownloadState::GetHeadTimeStamp)
        );
    }

    #[test]
    fn send_failure_while_paging_abandons_download() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        rig.session
            .handle_callback(ProtocolCallback::HeadTimestamp {
                request_id: last_bar_request(&rig),
                timestamp: "20200101  00:00:00".to_string(),
            })
            .unwrap();
        let day = last_bar_request(&rig);
        rig.sink.taken();

        rig.client.0.lock().connected = false;
        let result = rig
            .session
            .handle_callback(ProtocolCallback::BarStreamEnd { request_id: day });

        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(rig.session.download_state(&key), None);
        assert!(!rig.session.registry.contains(day));
        // The completed day is reported before the next request fails.
        assert!(matches!(
            rig.sink.taken().as_slice(),
            [
                Notification::DownloadProgress { .. },
                Notification::DownloadInterrupted { .. }
            ]
        ));

        rig.client.0.lock().connected = true;
        rig.session.download_history(&key).unwrap();
        assert_eq!(
            rig.session.download_state(&key),
            Some(DownloadState::GetHeadTimeStamp)
        );
    }

    #[test]
    fn cancel_download_interrupts() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        rig.sink.taken();

        assert!(rig.session.cancel_download(&key).unwrap());
        assert!(!rig.session.cancel_download(&key).unwrap());

        assert_eq!(rig.session.download_state(&key), None);
        assert_eq!(
            rig.sink.taken(),
            vec![Notification::DownloadInterrupted { key }]
        );
    }

    #[test]
    fn lost_connection_interrupts_and_reconnect_resumes() {
        let mut rig = connected_rig();
        let key = resolve_es(&mut rig);
        rig.session.download_history(&key).unwrap();
        rig.sink.taken();

        rig.session
            .handle_callback(ProtocolCallback::ConnectionLost)
            .unwrap();

        assert_eq!(rig.session.outstanding_requests(), 0);
        assert_eq!(rig.session.download_state(&key), None);
        assert!(
            rig.sink
                .taken()
                .contains(&Notification::DownloadInterrupted { key: key.clone() })
        );

        rig.session.connect().unwrap();
        rig.session
            .handle_callback(ProtocolCallback::ConnectionAccepted { next_valid_id: 1 })
            .unwrap();

        assert_eq!(
            rig.session.download_state(&key),
            Some(DownloadState::GetHeadTimeStamp)
        );
        // Head timestamp plus two tick subscriptions.
        assert_eq!(rig.session.outstanding_requests(), 3);
    }

    #[test]
    fn informational_and_unknown_errors_change_nothing() {
        let mut rig = connected_rig();
        for code in [2104, 321] {
            rig.session
                .handle_callback(ProtocolCallback::ProtocolError {
                    request_id: None,
                    code,
                    message: "status".to_string(),
                })
                .unwrap();
        }
        assert_eq!(rig.session.connectivity_state(), ConnectivityState::Connected);
        assert!(rig.sink.taken().is_empty());
    }

    #[test]
    fn detail_request_error_drops_pending() {
        let mut rig = connected_rig();
        rig.session.resolve_instrument(es_spec()).unwrap();
        let id = rig.client.last_sent().unwrap().id();

        rig.session
            .handle_callback(ProtocolCallback::ProtocolError {
                request_id: Some(id),
                code: 200,
                message: "No security definition has been found".to_string(),
            })
            .unwrap();

        assert_eq!(rig.session.outstanding_requests(), 0);
        assert!(rig.session.instruments().is_empty());
    }

    #[test]
    fn current_time_sets_offset() {
        let mut rig = connected_rig();
        rig.session
            .handle_callback(ProtocolCallback::CurrentTime {
                epoch_seconds: Utc::now().timestamp(),
            })
            .unwrap();
        let offset = rig.session.server_time_offset().unwrap();
        assert!(offset.num_seconds().abs() <= 2);
    }

    #[test]
    fn disconnect_terminates() {
        let mut rig = connected_rig();
        assert_eq!(rig.session.disconnect().unwrap(), ConnectivityState::Terminate);
        assert!(!rig.session.is_connected());
        assert!(!rig.session.reconnect_wanted());
        assert!(!rig.client.0.lock().connected);
    }

    #[test]
    fn spec_from_key_round_trips() {
        let key = es_spec().key();
        assert_eq!(spec_from_key(&key), es_spec());
    }
}
