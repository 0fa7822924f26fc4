#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! History Downloader - Instrument Resolution and Backfill
//!
//! Talks to a trading-data service over an asynchronous request/callback
//! protocol. Each request carries an id; replies arrive later on a reader
//! loop and are routed back to the instrument that asked. Two state machines
//! drive the work: one for the connection, one per instrument for paging
//! historical bars backward one day at a time until the data horizon.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and algorithms
//!   - `fsm`: Table-driven state machine engine
//!   - `correlation`: Request id registry and allocator
//!   - `instrument`: Instrument catalog, bar series, timestamps
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Protocol client, reader, clock and observer interfaces
//!   - `services`: Connectivity/download machines, session, worker loop
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `config`: Environment configuration
//!   - `reader`: Reader loop task
//!   - `notifications`: Broadcast fan-out to observers
//!   - `simulator`: In-process simulated service
//!   - `export`: JSON bar files
//!   - `reconnect`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! service ──► reader loop ──► inbound queue ──► session worker
//!                                   ▲               │
//!             SessionHandle ────────┘               ├─► registry ──► state machine
//!                                                   └─► outbound requests ──► service
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - State machines, correlation and catalog types.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::correlation::{
    CorrelationRegistry, RegistryError, RequestId, RequestIdAllocator, RequestKind, RequestRecord,
};
pub use domain::fsm::{FireOutcome, FsmError, MachineDefinition, StateMachine};
pub use domain::instrument::{
    ContractDetails, Instrument, InstrumentKey, InstrumentSnapshot, InstrumentSpec, OhlcBar,
    SecurityType, TimedBar,
};

// Ports
pub use application::ports::{
    Clock, Endpoint, FixedClock, Notification, NotificationSink, ProtocolCallback,
    ProtocolClient, SystemClock,
};

// Services
pub use application::services::connectivity::ConnectivityState;
pub use application::services::download::DownloadState;
pub use application::services::{
    Session, SessionDeps, SessionError, SessionHandle, SessionRuntime, inbound_channel,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DownloaderConfig};

// Adapters (for integration tests)
pub use infrastructure::export::{ExportError, export_bars};
pub use infrastructure::notifications::NotificationHub;
pub use infrastructure::reader::ReaderTask;
pub use infrastructure::simulator::{
    SimulatedInstrument, SimulatedRequest, SimulatedService, SimulatorConfig,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
