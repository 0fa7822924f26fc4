//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loaded from the environment.
pub mod config;

/// JSON export of downloaded bars.
pub mod export;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Broadcast channel fan-out for session notifications.
pub mod notifications;

/// Reader loop moving callbacks onto the session queue.
pub mod reader;

/// Exponential backoff for scheduled reconnects.
pub mod reconnect;

/// In-process simulated trading-data service.
pub mod simulator;

/// OpenTelemetry tracing integration.
pub mod telemetry;
