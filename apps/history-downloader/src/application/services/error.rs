//! Session error type.

use crate::application::ports::TransportError;
use crate::domain::correlation::RegistryError;
use crate::domain::fsm::FsmError;
use crate::domain::instrument::{InstrumentKey, TimestampError};

/// Errors surfaced by the session and its state machines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// State machine misuse or definition problem.
    #[error(transparent)]
    Fsm(#[from] FsmError),

    /// Request id bookkeeping failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Transport refused a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Service sent an unparseable timestamp.
    #[error(transparent)]
    InvalidTimestamp(#[from] TimestampError),

    /// Operation needs an open connection.
    #[error("not connected to the service")]
    NotConnected,

    /// Key is not in the catalog.
    #[error("instrument {0} is not in the catalog")]
    InstrumentNotFound(InstrumentKey),

    /// Instrument has no active contract yet.
    #[error("instrument {0} is not resolved")]
    InstrumentNotResolved(InstrumentKey),

    /// A download for the instrument is already running.
    #[error("download for {0} is already in progress")]
    DownloadInProgress(InstrumentKey),

    /// The session worker has stopped.
    #[error("session is closed")]
    SessionClosed,
}
