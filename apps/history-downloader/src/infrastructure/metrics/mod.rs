//! Prometheus Metrics Module
//!
//! Exposes downloader metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Requests**: outbound requests by kind, outstanding correlations
//! - **Callbacks**: inbound callbacks by type, uncorrelated callbacks
//! - **Download**: bars stored, days completed and skipped
//! - **Connection**: connection flag, reconnect attempts, protocol errors
//!
//! Recording functions are no-ops until [`init_metrics`] installs the
//! exporter.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::domain::correlation::RequestKind;

// =============================================================================
// Exporter
// =============================================================================

/// Error type for metrics setup.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install the exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter with an HTTP listener on `port`.
///
/// A port of 0 leaves metrics disabled.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g. port already in use).
pub fn init_metrics(port: u16) -> Result<(), MetricsError> {
    if port == 0 {
        tracing::debug!("Prometheus metrics disabled");
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(%addr, "Prometheus metrics exporter started");
    Ok(())
}

fn register_metrics() {
    describe_counter!(
        "history_requests_total",
        "Outbound requests issued, by kind"
    );
    describe_gauge!(
        "history_outstanding_requests",
        "Requests currently tracked in the correlation registry"
    );
    describe_counter!(
        "history_callbacks_total",
        "Inbound callbacks processed, by type"
    );
    describe_counter!(
        "history_uncorrelated_callbacks_total",
        "Callbacks dropped because their request id was not tracked"
    );
    describe_counter!("history_bars_stored_total", "New bars stored");
    describe_counter!(
        "history_days_total",
        "Download days finished, by outcome"
    );
    describe_gauge!(
        "history_connected",
        "1 while the service connection is up"
    );
    describe_counter!(
        "history_reconnects_total",
        "Automatic reconnection attempts"
    );
    describe_counter!(
        "history_protocol_errors_total",
        "Protocol error callbacks, by classification"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// How a protocol error code was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection is gone.
    ConnectionLost,
    /// Connect attempt refused.
    ConnectRefused,
    /// Status message.
    Informational,
    /// Correlated request failed.
    RequestFailed,
    /// Anything else.
    Unclassified,
}

impl ErrorClass {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::ConnectRefused => "connect_refused",
            Self::Informational => "informational",
            Self::RequestFailed => "request_failed",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Outcome of one download day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOutcome {
    /// Bars received (possibly none).
    Completed,
    /// Failed request retried.
    Retried,
    /// Gave up on the day.
    Skipped,
}

impl DayOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Skipped => "skipped",
        }
    }
}

/// Record an outbound request.
pub fn record_request(kind: RequestKind) {
    counter!("history_requests_total", "kind" => kind.as_str()).increment(1);
}

/// Update the outstanding request gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_outstanding_requests(count: usize) {
    gauge!("history_outstanding_requests").set(count as f64);
}

/// Record an inbound callback.
pub fn record_callback(name: &'static str) {
    counter!("history_callbacks_total", "callback" => name).increment(1);
}

/// Record a callback whose request id was not tracked.
pub fn record_uncorrelated_callback(name: &'static str) {
    counter!("history_uncorrelated_callbacks_total", "callback" => name).increment(1);
}

/// Record a newly stored bar.
pub fn record_bar_stored() {
    counter!("history_bars_stored_total").increment(1);
}

/// Record a finished download day.
pub fn record_day(outcome: DayOutcome) {
    counter!("history_days_total", "outcome" => outcome.as_str()).increment(1);
}

/// Update the connection gauge.
pub fn set_connected(connected: bool) {
    gauge!("history_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record an automatic reconnection attempt.
pub fn record_reconnect() {
    counter!("history_reconnects_total").increment(1);
}

/// Record a classified protocol error.
pub fn record_protocol_error(class: ErrorClass) {
    counter!("history_protocol_errors_total", "class" => class.as_str()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_as_str() {
        assert_eq!(ErrorClass::ConnectionLost.as_str(), "connection_lost");
        assert_eq!(ErrorClass::ConnectRefused.as_str(), "connect_refused");
        assert_eq!(ErrorClass::Informational.as_str(), "informational");
        assert_eq!(ErrorClass::RequestFailed.as_str(), "request_failed");
        assert_eq!(ErrorClass::Unclassified.as_str(), "unclassified");
    }

    #[test]
    fn day_outcome_as_str() {
        assert_eq!(DayOutcome::Completed.as_str(), "completed");
        assert_eq!(DayOutcome::Retried.as_str(), "retried");
        assert_eq!(DayOutcome::Skipped.as_str(), "skipped");
    }

    #[test]
    fn disabled_port_is_a_no_op() {
        assert!(init_metrics(0).is_ok());
        record_request(RequestKind::HistoricalBars);
        set_connected(true);
    }
}
