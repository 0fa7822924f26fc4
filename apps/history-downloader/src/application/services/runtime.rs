//! Session Worker
//!
//! The worker task is the only owner of the [`Session`]. The reader task
//! pushes protocol callbacks and [`SessionHandle`] pushes commands onto the
//! same bounded queue, so both are handled one at a time in arrival order.
//!
//! The worker also owns the reconnect timer: whenever the session lands in
//! `NotConnected` after a failure, it waits a backoff delay and connects
//! again.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ProtocolCallback;
use crate::application::services::connectivity::ConnectivityState;
use crate::application::services::download::DownloadState;
use crate::application::services::{Session, SessionError};
use crate::domain::instrument::{InstrumentKey, InstrumentSnapshot, InstrumentSpec, TimedBar};
use crate::infrastructure::config::ReconnectSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::reconnect::{ReconnectConfig, ReconnectPolicy};

/// Reply channel for a fallible command.
pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// One item on the inbound queue.
#[derive(Debug)]
pub enum SessionInput {
    /// Callback delivered by the reader.
    Callback(ProtocolCallback),
    /// Public operation from a [`SessionHandle`].
    Command(SessionCommand),
}

/// Public operations, each with its reply channel.
#[derive(Debug)]
pub enum SessionCommand {
    /// Connect to the service.
    Connect {
        /// Reply with the state reached.
        reply: Reply<ConnectivityState>,
    },
    /// Shut the connection down for good.
    Disconnect {
        /// Reply with the state reached.
        reply: Reply<ConnectivityState>,
    },
    /// Resolve an instrument.
    ResolveInstrument {
        /// What to resolve.
        spec: InstrumentSpec,
        /// Reply with the catalog key.
        reply: Reply<InstrumentKey>,
    },
    /// Start a download.
    DownloadHistory {
        /// Instrument to download.
        key: InstrumentKey,
        /// Reply once the first request is out.
        reply: Reply<()>,
    },
    /// Stop a download.
    CancelDownload {
        /// Instrument to stop.
        key: InstrumentKey,
        /// Reply with whether a download was running.
        reply: Reply<bool>,
    },
    /// Read one instrument.
    Instrument {
        /// Instrument to read.
        key: InstrumentKey,
        /// Reply with the snapshot.
        reply: oneshot::Sender<Option<InstrumentSnapshot>>,
    },
    /// Read the whole catalog.
    Instruments {
        /// Reply with every snapshot.
        reply: oneshot::Sender<Vec<InstrumentSnapshot>>,
    },
    /// Read downloaded bars.
    Bars {
        /// Instrument to read.
        key: InstrumentKey,
        /// Reply with the bars, oldest first.
        reply: oneshot::Sender<Option<Vec<TimedBar>>>,
    },
    /// Read the connectivity state.
    ConnectivityState {
        /// Reply with the state.
        reply: oneshot::Sender<ConnectivityState>,
    },
    /// Read a download state.
    DownloadState {
        /// Instrument to read.
        key: InstrumentKey,
        /// Reply with the state, if a download has run.
        reply: oneshot::Sender<Option<DownloadState>>,
    },
}

/// Sending half of the inbound queue.
pub type InboundSender = mpsc::Sender<SessionInput>;

/// Receiving half of the inbound queue.
pub type InboundReceiver = mpsc::Receiver<SessionInput>;

/// Create the bounded inbound queue.
#[must_use]
pub fn inbound_channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

// =============================================================================
// Worker
// =============================================================================

/// Worker loop owning the session.
pub struct SessionRuntime {
    session: Session,
    inbound: InboundReceiver,
    reconnect: Option<ReconnectPolicy>,
    reconnect_at: Option<Instant>,
    gave_up: bool,
    cancel: CancellationToken,
}

impl SessionRuntime {
    /// Create a worker. Reconnects are scheduled only when enabled in
    /// `reconnect`.
    #[must_use]
    pub fn new(
        session: Session,
        inbound: InboundReceiver,
        reconnect: &ReconnectSettings,
        cancel: CancellationToken,
    ) -> Self {
        let reconnect = reconnect
            .enabled
            .then(|| ReconnectPolicy::new(ReconnectConfig::from_settings(reconnect)));
        Self {
            session,
            inbound,
            reconnect,
            reconnect_at: None,
            gave_up: false,
            cancel,
        }
    }

    /// Spawn the worker on the current runtime.
    ///
    /// The task yields the session back when the loop ends.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Session> {
        tokio::spawn(self.run())
    }

    /// Process inputs until cancelled or every sender is gone.
    pub async fn run(mut self) -> Session {
        tracing::info!("Session worker started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Session worker cancelled");
                    break;
                }
                input = self.inbound.recv() => {
                    let Some(input) = input else {
                        tracing::debug!("Inbound queue closed");
                        break;
                    };
                    self.process(input);
                }
                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect_now();
                }
            }
            self.schedule_reconnect();
        }

        if self.session.connectivity_state() != ConnectivityState::Terminate
            && let Err(e) = self.session.disconnect()
        {
            tracing::warn!(error = %e, "Disconnect on worker exit failed");
        }
        tracing::info!("Session worker stopped");
        self.session
    }

    fn process(&mut self, input: SessionInput) {
        match input {
            SessionInput::Callback(callback) => {
                let name = callback.name();
                if let Err(e) = self.session.handle_callback(callback) {
                    tracing::error!(callback = name, error = %e, "Callback handling failed");
                }
            }
            SessionInput::Command(command) => self.execute(command),
        }
    }

    fn execute(&mut self, command: SessionCommand) {
        let session = &mut self.session;
        match command {
            SessionCommand::Connect { reply } => {
                self.reconnect_at = None;
                self.gave_up = false;
                let _ = reply.send(session.connect());
            }
            SessionCommand::Disconnect { reply } => {
                self.reconnect_at = None;
                let _ = reply.send(session.disconnect());
            }
            SessionCommand::ResolveInstrument { spec, reply } => {
                let _ = reply.send(session.resolve_instrument(spec));
            }
            SessionCommand::DownloadHistory { key, reply } => {
                let _ = reply.send(session.download_history(&key));
            }
            SessionCommand::CancelDownload { key, reply } => {
                let _ = reply.send(session.cancel_download(&key));
            }
            SessionCommand::Instrument { key, reply } => {
                let _ = reply.send(session.instrument(&key));
            }
            SessionCommand::Instruments { reply } => {
                let _ = reply.send(session.instruments());
            }
            SessionCommand::Bars { key, reply } => {
                let _ = reply.send(session.bars(&key));
            }
            SessionCommand::ConnectivityState { reply } => {
                let _ = reply.send(session.connectivity_state());
            }
            SessionCommand::DownloadState { key, reply } => {
                let _ = reply.send(session.download_state(&key));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(policy) = self.reconnect.as_mut() else {
            return;
        };

        if self.session.is_connected() {
            if policy.attempt_count() > 0 {
                policy.reset();
                self.gave_up = false;
            }
            return;
        }
        if self.reconnect_at.is_some() || self.gave_up || !self.session.reconnect_wanted() {
            return;
        }

        if let Some(delay) = policy.next_delay() {
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnect scheduled"
            );
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            tracing::error!(
                attempts = policy.attempt_count(),
                "Reconnect attempts exhausted"
            );
            self.gave_up = true;
        }
    }

    fn reconnect_now(&mut self) {
        metrics::record_reconnect();
        match self.session.connect() {
            Ok(state) => tracing::info!(?state, "Reconnect attempted"),
            Err(e) => tracing::error!(error = %e, "Reconnect failed"),
        }
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Async front end for the session worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inbound: InboundSender,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Handle sending on `inbound`; `cancel` stops the worker.
    #[must_use]
    pub const fn new(inbound: InboundSender, cancel: CancellationToken) -> Self {
        Self { inbound, cancel }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbound
            .send(SessionInput::Command(command(reply)))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Connect to the service. The handshake completes asynchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or an entry action fails.
    pub async fn connect(&self) -> Result<ConnectivityState, SessionError> {
        self.call(|reply| SessionCommand::Connect { reply }).await?
    }

    /// Close the connection for good.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or an entry action fails.
    pub async fn disconnect(&self) -> Result<ConnectivityState, SessionError> {
        self.call(|reply| SessionCommand::Disconnect { reply }).await?
    }

    /// Resolve an instrument; returns its catalog key.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the request cannot be sent.
    pub async fn resolve_instrument(&self, spec: InstrumentSpec) -> Result<InstrumentKey, SessionError> {
        self.call(|reply| SessionCommand::ResolveInstrument { spec, reply })
            .await?
    }

    /// Start downloading history for a resolved instrument.
    ///
    /// # Errors
    ///
    /// See [`Session::download_history`].
    pub async fn download_history(&self, key: InstrumentKey) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::DownloadHistory { key, reply })
            .await?
    }

    /// Stop a download; returns whether one was running.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown key or a closed worker.
    pub async fn cancel_download(&self, key: InstrumentKey) -> Result<bool, SessionError> {
        self.call(|reply| SessionCommand::CancelDownload { key, reply })
            .await?
    }

    /// Snapshot of one instrument.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] if the worker is gone.
    pub async fn instrument(&self, key: InstrumentKey) -> Result<Option<InstrumentSnapshot>, SessionError> {
        self.call(|reply| SessionCommand::Instrument { key, reply })
            .await
    }

    /// Snapshots of the whole catalog.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] if the worker is gone.
    pub async fn instruments(&self) -> Result<Vec<InstrumentSnapshot>, SessionError> {
        self.call(|reply| SessionCommand::Instruments { reply }).await
    }

    /// Downloaded bars, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] if the worker is gone.
    pub async fn bars(&self, key: InstrumentKey) -> Result<Option<Vec<TimedBar>>, SessionError> {
        self.call(|reply| SessionCommand::Bars { key, reply }).await
    }

    /// Current connectivity state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] if the worker is gone.
    pub async fn connectivity_state(&self) -> Result<ConnectivityState, SessionError> {
        self.call(|reply| SessionCommand::ConnectivityState { reply })
            .await
    }

    /// Download state for one instrument.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] if the worker is gone.
    pub async fn download_state(&self, key: InstrumentKey) -> Result<Option<DownloadState>, SessionError> {
        self.call(|reply| SessionCommand::DownloadState { key, reply })
            .await
    }

    /// Disconnect, then stop the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the disconnect fails; the worker is stopped anyway.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let result = self.disconnect().await;
        self.cancel.cancel();
        result.map(|_| ())
    }

    /// Whether the worker has stopped receiving.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

// =============================================================================
// Tests
// =============================================================================
