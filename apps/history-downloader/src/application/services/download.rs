//! Historical Download State Machine
//!
//! One machine per instrument. Pages one day of bars at a time backward from
//! "now" until the head timestamp's day has been fetched.
//!
//! ```text
//! Initialize ─► GetHeadTimeStamp ─HeadTimeStamp─► TimeStampReceived
//!                                                      │ StartDownload
//!                                                      │ (RequestFailed ► Terminate)
//!                                                      ▼
//!            ┌──────DownloadNextDay────────── DownloadHistoricalData
//!            │                                  │ Bar        │ EndOfRequest
//!            │                                  ▼            │ RequestFailed
//!            │                            DataReceived ◄┐    │
//!            │                              │ Bar ──────┘    │
//!            │                              ▼ EndOfRequest   │
//!            └──────────────────────── DataRequestDone ◄─────┘
//!                                           │ Finished
//!                                           ▼
//!                                       Terminate
//! ```

use chrono::{Days, NaiveDateTime};

use crate::application::ports::{
    Clock, HeadTimestampQuery, HistoricalQuery, Notification, NotificationSink, ProtocolClient,
    RawBar, TransportError,
};
use crate::application::services::SessionError;
use crate::domain::correlation::{CorrelationRegistry, RequestId, RequestIdAllocator, RequestKind};
use crate::domain::fsm::{EntryActions, FsmError, MachineDefinition, Outbox, Signal, StateMachine};
use crate::domain::instrument::{ContractDetails, Instrument, OhlcBar, parse_timestamp};
use crate::infrastructure::config::HistorySettings;
use crate::infrastructure::metrics::{self, DayOutcome};

/// Machine name used in logs.
pub const MACHINE_NAME: &str = "download";

/// Error code carried by failures detected locally instead of reported by the
/// service.
pub const LOCAL_FAILURE_CODE: i32 = -1;

/// Download workflow states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    /// Not started.
    Initialize,
    /// Waiting for the head timestamp.
    GetHeadTimeStamp,
    /// Head timestamp parsed.
    TimeStampReceived,
    /// Day request outstanding, no bars yet.
    DownloadHistoricalData,
    /// Receiving bars for the current day.
    DataReceived,
    /// Current day request ended.
    DataRequestDone,
    /// Download over.
    Terminate,
}

impl DownloadState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Initialize,
        Self::GetHeadTimeStamp,
        Self::TimeStampReceived,
        Self::DownloadHistoricalData,
        Self::DataReceived,
        Self::DataRequestDone,
        Self::Terminate,
    ];
}

/// Event kinds of the download machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadEventKind {
    /// Initial state entered.
    Initialized,
    /// Head timestamp arrived.
    HeadTimeStamp,
    /// Begin paging.
    StartDownload,
    /// One bar arrived.
    Bar,
    /// Day request ended.
    EndOfRequest,
    /// Request the next (earlier) day.
    DownloadNextDay,
    /// Horizon reached.
    Finished,
    /// Service reported an error for the outstanding request.
    RequestFailed,
}

/// Download events with their payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Initial state entered.
    Initialized,
    /// Head timestamp arrived.
    HeadTimeStamp {
        /// Service-formatted timestamp.
        timestamp: String,
    },
    /// Begin paging.
    StartDownload,
    /// One bar arrived.
    Bar(RawBar),
    /// Day request ended.
    EndOfRequest,
    /// Request the next (earlier) day.
    DownloadNextDay,
    /// Horizon reached.
    Finished,
    /// Service reported an error for the outstanding request.
    RequestFailed {
        /// Service error code.
        code: i32,
        /// Service message.
        message: String,
    },
}

impl Signal for DownloadEvent {
    type Kind = DownloadEventKind;

    fn kind(&self) -> DownloadEventKind {
        match self {
            Self::Initialized => DownloadEventKind::Initialized,
            Self::HeadTimeStamp { .. } => DownloadEventKind::HeadTimeStamp,
            Self::StartDownload => DownloadEventKind::StartDownload,
            Self::Bar(_) => DownloadEventKind::Bar,
            Self::EndOfRequest => DownloadEventKind::EndOfRequest,
            Self::DownloadNextDay => DownloadEventKind::DownloadNextDay,
            Self::Finished => DownloadEventKind::Finished,
            Self::RequestFailed { .. } => DownloadEventKind::RequestFailed,
        }
    }
}

/// Running download machine.
pub type DownloadMachine = StateMachine<DownloadState, DownloadEvent>;

/// Build the download transition table.
///
/// # Errors
///
/// Returns [`FsmError::InvalidDefinition`] if the table is inconsistent.
pub fn definition() -> Result<MachineDefinition<DownloadState, DownloadEventKind>, FsmError> {
    use DownloadEventKind as E;
    use DownloadState as S;

    MachineDefinition::builder(MACHINE_NAME)
        .states(S::ALL)
        .events([
            E::Initialized,
            E::HeadTimeStamp,
            E::StartDownload,
            E::Bar,
            E::EndOfRequest,
            E::DownloadNextDay,
            E::Finished,
            E::RequestFailed,
        ])
        .initial(S::Initialize)
        .terminal(S::Terminate)
        .transition(S::Initialize, E::Initialized, S::GetHeadTimeStamp)
        .transition(S::GetHeadTimeStamp, E::HeadTimeStamp, S::TimeStampReceived)
        .transition(S::GetHeadTimeStamp, E::RequestFailed, S::Terminate)
        .transition(S::TimeStampReceived, E::StartDownload, S::DownloadHistoricalData)
        .transition(S::TimeStampReceived, E::RequestFailed, S::Terminate)
        .transition(S::DownloadHistoricalData, E::Bar, S::DataReceived)
        .transition(S::DownloadHistoricalData, E::EndOfRequest, S::DataRequestDone)
        .transition(S::DownloadHistoricalData, E::RequestFailed, S::DataRequestDone)
        .transition(S::DataReceived, E::Bar, S::DataReceived)
        .transition(S::DataReceived, E::EndOfRequest, S::DataRequestDone)
        .transition(S::DataReceived, E::RequestFailed, S::DataRequestDone)
        .transition(S::DataRequestDone, E::DownloadNextDay, S::DownloadHistoricalData)
        .transition(S::DataRequestDone, E::Finished, S::Terminate)
        .build()
}

// =============================================================================
// Day Progress
// =============================================================================

/// Request bookkeeping for the day being fetched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DayProgress {
    /// Outstanding bar or head-timestamp request.
    pub active_request: Option<RequestId>,
    /// Failed attempts on the current day.
    pub retries: u32,
}

impl DayProgress {
    /// Forget everything about the current day.
    pub const fn clear(&mut self) {
        self.active_request = None;
        self.retries = 0;
    }
}

// =============================================================================
// Entry Actions
// =============================================================================

/// Collaborators the download entry actions drive.
pub struct DownloadActions<'a> {
    /// Instrument being downloaded.
    pub instrument: &'a mut Instrument,
    /// Request bookkeeping for the current day.
    pub progress: &'a mut DayProgress,
    /// Session-wide correlation registry.
    pub registry: &'a mut CorrelationRegistry,
    /// Session-wide id source.
    pub ids: &'a mut RequestIdAllocator,
    /// Request side of the service.
    pub client: &'a mut dyn ProtocolClient,
    /// Source of "now" for the first cursor.
    pub clock: &'a dyn Clock,
    /// Request parameters.
    pub settings: &'a HistorySettings,
    /// Observer fan-out.
    pub notifications: &'a dyn NotificationSink,
}

impl DownloadActions<'_> {
    fn contract(&self) -> Result<ContractDetails, SessionError> {
        self.instrument
            .active_contract()
            .cloned()
            .ok_or_else(|| SessionError::InstrumentNotResolved(self.instrument.key().clone()))
    }

    fn missing(state: DownloadState, what: &str) -> SessionError {
        FsmError::entry_action(MACHINE_NAME, state, format!("{what} is not set")).into()
    }

    fn unexpected(state: DownloadState, trigger: Option<&DownloadEvent>) -> SessionError {
        FsmError::entry_action(MACHINE_NAME, state, format!("unexpected trigger {trigger:?}"))
            .into()
    }

    /// Track `id`, then send with `send`; untrack again if sending fails.
    fn issue(
        &mut self,
        kind: RequestKind,
        persistent: bool,
        send: impl FnOnce(&mut dyn ProtocolClient, RequestId) -> Result<(), TransportError>,
    ) -> Result<RequestId, SessionError> {
        let id = self.ids.allocate(self.registry);
        self.registry
            .track(id, self.instrument.key().clone(), persistent, kind)?;

        if let Err(e) = send(&mut *self.client, id) {
            self.registry.untrack(id);
            return Err(e.into());
        }

        metrics::record_request(kind);
        metrics::set_outstanding_requests(self.registry.len());
        self.progress.active_request = Some(id);
        Ok(id)
    }

    fn request_head_timestamp(&mut self) -> Result<(), SessionError> {
        let contract = self.contract()?;
        let query = HeadTimestampQuery {
            what_to_show: self.settings.what_to_show.clone(),
            use_rth: self.settings.use_rth,
        };
        let id = self.issue(RequestKind::HeadTimestamp, false, |client, id| {
            client.request_head_timestamp(id, &contract, &query)
        })?;
        tracing::debug!(key = %self.instrument.key(), request_id = %id, "Head timestamp requested");
        Ok(())
    }

    fn start_from_head(
        &mut self,
        trigger: Option<&DownloadEvent>,
        outbox: &mut Outbox<DownloadEvent>,
    ) -> Result<(), SessionError> {
        let Some(DownloadEvent::HeadTimeStamp { timestamp }) = trigger else {
            return Err(Self::unexpected(DownloadState::TimeStampReceived, trigger));
        };
        self.progress.active_request = None;

        let head = match parse_timestamp(timestamp) {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(key = %self.instrument.key(), error = %e, "Unusable head timestamp");
                outbox.emit(DownloadEvent::RequestFailed {
                    code: LOCAL_FAILURE_CODE,
                    message: e.to_string(),
                });
                return Ok(());
            }
        };
        let now = self.clock.now();
        self.instrument.head_timestamp = Some(head);
        self.instrument.cursor = Some(now);
        tracing::info!(
            key = %self.instrument.key(),
            head = %head,
            start = %now,
            "Head timestamp received, starting download"
        );
        outbox.emit(DownloadEvent::StartDownload);
        Ok(())
    }

    fn request_day(&mut self) -> Result<(), SessionError> {
        let end = self
            .instrument
            .cursor
            .ok_or_else(|| Self::missing(DownloadState::DownloadHistoricalData, "cursor"))?;
        let contract = self.contract()?;
        let query = HistoricalQuery {
            end,
            duration: self.settings.duration.clone(),
            bar_size: self.settings.bar_size.clone(),
            what_to_show: self.settings.what_to_show.clone(),
            use_rth: self.settings.use_rth,
        };
        let id = self.issue(RequestKind::HistoricalBars, true, |client, id| {
            client.request_historical_bars(id, &contract, &query)
        })?;
        tracing::debug!(
            key = %self.instrument.key(),
            request_id = %id,
            end = %end,
            attempt = self.progress.retries + 1,
            "Day requested"
        );
        Ok(())
    }

    fn store_bar(&mut self, trigger: Option<&DownloadEvent>) -> Result<(), SessionError> {
        let Some(DownloadEvent::Bar(raw)) = trigger else {
            return Err(Self::unexpected(DownloadState::DataReceived, trigger));
        };

        match parse_timestamp(&raw.date) {
            Ok(timestamp) => {
                let bar = OhlcBar::new(raw.open, raw.high, raw.low, raw.close);
                if self.instrument.bars.insert(timestamp, bar) {
                    metrics::record_bar_stored();
                }
            }
            Err(e) => {
                tracing::warn!(key = %self.instrument.key(), error = %e, "Dropping bar");
            }
        }
        Ok(())
    }

    fn finish_request(
        &mut self,
        trigger: Option<&DownloadEvent>,
        outbox: &mut Outbox<DownloadEvent>,
    ) -> Result<(), SessionError> {
        self.progress.active_request = None;

        match trigger {
            Some(DownloadEvent::EndOfRequest) => {
                metrics::record_day(DayOutcome::Completed);
                self.advance(outbox)
            }
            Some(DownloadEvent::RequestFailed { code, message }) => {
                if self.progress.retries < self.settings.max_day_retries {
                    self.progress.retries += 1;
                    tracing::warn!(
                        key = %self.instrument.key(),
                        code,
                        %message,
                        retry = self.progress.retries,
                        "Day request failed, retrying"
                    );
                    metrics::record_day(DayOutcome::Retried);
                    outbox.emit(DownloadEvent::DownloadNextDay);
                    return Ok(());
                }

                let cursor = self
                    .instrument
                    .cursor
                    .ok_or_else(|| Self::missing(DownloadState::DataRequestDone, "cursor"))?;
                tracing::warn!(
                    key = %self.instrument.key(),
                    code,
                    %message,
                    day = %cursor.date(),
                    "Day request failed repeatedly, skipping day"
                );
                self.instrument.skipped_days.push(cursor.date());
                metrics::record_day(DayOutcome::Skipped);
                self.advance(outbox)
            }
            other => Err(Self::unexpected(DownloadState::DataRequestDone, other)),
        }
    }

    /// Move the cursor one day back and decide whether to continue.
    fn advance(&mut self, outbox: &mut Outbox<DownloadEvent>) -> Result<(), SessionError> {
        let state = DownloadState::DataRequestDone;
        let cursor = self
            .instrument
            .cursor
            .ok_or_else(|| Self::missing(state, "cursor"))?;
        let head = self
            .instrument
            .head_timestamp
            .ok_or_else(|| Self::missing(state, "head timestamp"))?;

        let day = cursor.date();
        let next: NaiveDateTime = cursor
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| Self::missing(state, "previous day"))?;

        self.progress.retries = 0;
        self.instrument.days_completed += 1;
        self.instrument.cursor = Some(next);

        self.notifications.publish(Notification::DownloadProgress {
            key: self.instrument.key().clone(),
            day,
            bar_count: self.instrument.bars.len(),
            days_completed: self.instrument.days_completed,
        });

        if next.date() >= head.date() {
            outbox.emit(DownloadEvent::DownloadNextDay);
        } else {
            outbox.emit(DownloadEvent::Finished);
        }
        Ok(())
    }

    fn finish(&mut self, trigger: Option<&DownloadEvent>) {
        self.progress.clear();
        if let Some(DownloadEvent::RequestFailed { code, message }) = trigger {
            tracing::warn!(
                key = %self.instrument.key(),
                code,
                %message,
                "Head timestamp unavailable, nothing to download"
            );
        }
        tracing::info!(
            key = %self.instrument.key(),
            bars = self.instrument.bars.len(),
            days = self.instrument.days_completed,
            skipped = self.instrument.skipped_days.len(),
            "Download finished"
        );
        self.notifications.publish(Notification::DownloadFinished {
            key: self.instrument.key().clone(),
            bar_count: self.instrument.bars.len(),
            skipped_days: self.instrument.skipped_days.clone(),
        });
    }
}

impl EntryActions<DownloadState, DownloadEvent> for DownloadActions<'_> {
    type Error = SessionError;

    fn on_entry(
        &mut self,
        state: DownloadState,
        trigger: Option<&DownloadEvent>,
        outbox: &mut Outbox<DownloadEvent>,
    ) -> Result<(), SessionError> {
        match state {
            DownloadState::Initialize => {
                outbox.emit(DownloadEvent::Initialized);
                Ok(())
            }
            DownloadState::GetHeadTimeStamp => self.request_head_timestamp(),
            DownloadState::TimeStampReceived => self.start_from_head(trigger, outbox),
            DownloadState::DownloadHistoricalData => self.request_day(),
            DownloadState::DataReceived => self.store_bar(trigger),
            DownloadState::DataRequestDone => self.finish_request(trigger, outbox),
            DownloadState::Terminate => {
                self.finish(trigger);
                Ok(())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
