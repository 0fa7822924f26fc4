//! Application Services
//!
//! - `connectivity`: connect / fail / reconnect state machine
//! - `download`: per-instrument historical download state machine
//! - `session`: orchestrator owning the machines, catalog and registry
//! - `runtime`: single-consumer worker loop and its async handle

/// Connectivity state machine and its entry actions.
pub mod connectivity;

/// Historical download state machine and its entry actions.
pub mod download;

mod error;

/// Single-consumer worker loop and async handle.
pub mod runtime;

/// Orchestrator owning the catalog, registry and machines.
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::SessionError;
pub use runtime::{
    InboundReceiver, InboundSender, SessionCommand, SessionHandle, SessionInput, SessionRuntime,
    inbound_channel,
};
pub use session::{Session, SessionDeps};
