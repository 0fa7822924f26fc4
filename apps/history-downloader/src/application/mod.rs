//! Application Layer - Use cases and port definitions.
//!
//! This layer holds the protocol state machines, the session that drives
//! them, and the port interfaces the session talks to adapters through.

/// Port interfaces for the service transport, reader, clock and observers.
pub mod ports;

/// State machines, session orchestration and the session worker.
pub mod services;
