//! Downloader Configuration Settings
//!
//! Configuration types for the downloader, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::Endpoint;
use crate::domain::instrument::{InstrumentSpec, SecurityType};

/// Service endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Host running the trading-data gateway.
    pub host: String,
    /// Gateway API port.
    pub port: u16,
    /// Client id presented on connect.
    pub client_id: i32,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 0,
        }
    }
}

impl EndpointSettings {
    /// Transport endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id,
        }
    }
}

/// Historical download settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySettings {
    /// Bar size per request, e.g. `1 min`.
    pub bar_size: String,
    /// Window per request, e.g. `1 D`.
    pub duration: String,
    /// Data type, e.g. `TRADES`.
    pub what_to_show: String,
    /// Regular trading hours only.
    pub use_rth: bool,
    /// Retries for one failed day before it is skipped.
    pub max_day_retries: u32,
    /// Subscribe to live ticks once an instrument resolves.
    pub subscribe_ticks: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            bar_size: "1 min".to_string(),
            duration: "1 D".to_string(),
            what_to_show: "TRADES".to_string(),
            use_rth: false,
            max_day_retries: 2,
            subscribe_ticks: true,
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Reconnect automatically after a lost connection.
    pub enabled: bool,
    /// Initial reconnection delay.
    pub delay_initial: Duration,
    /// Maximum reconnection delay.
    pub delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_initial: Duration::from_secs(1),
            delay_max: Duration::from_secs(64),
            delay_multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Queue and channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Inbound callback/command queue.
    pub inbound_capacity: usize,
    /// Each notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 4_096,
            notification_capacity: 1_024,
        }
    }
}

/// How protocol error codes are classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCodeSettings {
    /// Codes meaning the connection is gone.
    pub lost_connection: Vec<i32>,
    /// Codes meaning a connect attempt was refused.
    pub connect_refused: Vec<i32>,
    /// Status messages that are not errors.
    pub informational: Vec<i32>,
}

impl Default for ErrorCodeSettings {
    fn default() -> Self {
        Self {
            lost_connection: vec![504, 507, 1100, 1300, 2110],
            connect_refused: vec![502],
            informational: vec![2104, 2106, 2107, 2108, 2158],
        }
    }
}

/// Complete downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Service endpoint.
    pub endpoint: EndpointSettings,
    /// Download parameters.
    pub history: HistorySettings,
    /// Reconnection behaviour.
    pub reconnect: ReconnectSettings,
    /// Queue capacities.
    pub channels: ChannelSettings,
    /// Error code classification.
    pub error_codes: ErrorCodeSettings,
    /// Instruments to download.
    pub instruments: Vec<InstrumentSpec>,
    /// Where bar files are written.
    pub output_dir: PathBuf,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointSettings::default(),
            history: HistorySettings::default(),
            reconnect: ReconnectSettings::default(),
            channels: ChannelSettings::default(),
            error_codes: ErrorCodeSettings::default(),
            instruments: default_instruments(),
            output_dir: PathBuf::from("data"),
            metrics_port: 0,
        }
    }
}

impl DownloaderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to something unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoint = EndpointSettings {
            host: std::env::var("HISTORY_HOST").unwrap_or(defaults.endpoint.host),
            port: parse_env("HISTORY_PORT", defaults.endpoint.port)?,
            client_id: parse_env("HISTORY_CLIENT_ID", defaults.endpoint.client_id)?,
        };
        if endpoint.host.is_empty() {
            return Err(ConfigError::EmptyValue("HISTORY_HOST".to_string()));
        }

        let history = HistorySettings {
            bar_size: non_empty_env("HISTORY_BAR_SIZE", defaults.history.bar_size)?,
            duration: non_empty_env("HISTORY_DURATION", defaults.history.duration)?,
            what_to_show: non_empty_env("HISTORY_WHAT_TO_SHOW", defaults.history.what_to_show)?,
            use_rth: parse_env_bool("HISTORY_USE_RTH", defaults.history.use_rth)?,
            max_day_retries: parse_env(
                "HISTORY_MAX_DAY_RETRIES",
                defaults.history.max_day_retries,
            )?,
            subscribe_ticks: parse_env_bool(
                "HISTORY_SUBSCRIBE_TICKS",
                defaults.history.subscribe_ticks,
            )?,
        };

        let reconnect = ReconnectSettings {
            enabled: parse_env_bool("HISTORY_RECONNECT_ENABLED", defaults.reconnect.enabled)?,
            delay_initial: parse_env_duration_millis(
                "HISTORY_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect.delay_initial,
            )?,
            delay_max: parse_env_duration_secs(
                "HISTORY_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect.delay_max,
            )?,
            delay_multiplier: parse_env(
                "HISTORY_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect.delay_multiplier,
            )?,
            max_attempts: parse_env(
                "HISTORY_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?,
        };

        let channels = ChannelSettings {
            inbound_capacity: parse_env(
                "HISTORY_INBOUND_CAPACITY",
                defaults.channels.inbound_capacity,
            )?,
            notification_capacity: parse_env(
                "HISTORY_NOTIFICATION_CAPACITY",
                defaults.channels.notification_capacity,
            )?,
        };

        let error_codes = ErrorCodeSettings {
            lost_connection: match std::env::var("HISTORY_LOST_CONNECTION_CODES") {
                Ok(raw) => parse_codes("HISTORY_LOST_CONNECTION_CODES", &raw)?,
                Err(_) => defaults.error_codes.lost_connection,
            },
            ..defaults.error_codes
        };

        let instruments = match std::env::var("HISTORY_INSTRUMENTS") {
            Ok(raw) => parse_instruments(&raw)?,
            Err(_) => defaults.instruments,
        };

        let output_dir = std::env::var("HISTORY_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        Ok(Self {
            endpoint,
            history,
            reconnect,
            channels,
            error_codes,
            instruments,
            output_dir,
            metrics_port: parse_env("HISTORY_METRICS_PORT", defaults.metrics_port)?,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an unparseable value.
    #[error("environment variable {key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn default_instruments() -> Vec<InstrumentSpec> {
    vec![
        InstrumentSpec::new(SecurityType::Future, "ES", "GLOBEX"),
        InstrumentSpec::new(SecurityType::Future, "NQ", "GLOBEX"),
    ]
}

/// Parse `TYPE:SYMBOL:EXCHANGE[:CURRENCY]` entries separated by commas.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] for a malformed entry.
pub fn parse_instruments(raw: &str) -> Result<Vec<InstrumentSpec>, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: "HISTORY_INSTRUMENTS".to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let (code, symbol, exchange, currency) = match parts.as_slice() {
                [code, symbol, exchange] => (*code, *symbol, *exchange, None),
                [code, symbol, exchange, currency] => (*code, *symbol, *exchange, Some(*currency)),
                _ => return Err(invalid("expected TYPE:SYMBOL:EXCHANGE[:CURRENCY]")),
            };
            let security_type =
                SecurityType::from_code(code).ok_or_else(|| invalid("unknown security type"))?;
            if symbol.is_empty() || exchange.is_empty() {
                return Err(invalid("symbol and exchange are required"));
            }
            let mut spec = InstrumentSpec::new(security_type, symbol, exchange);
            if let Some(currency) = currency.filter(|c| !c.is_empty()) {
                spec.currency = currency.to_uppercase();
            }
            Ok(spec)
        })
        .collect()
}

fn parse_codes(key: &str, raw: &str) -> Result<Vec<i32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            code.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: format!("{code:?} is not an integer"),
            })
        })
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
            reason: "unparseable".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
            reason: "expected true/false".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty_env(key: &str, default: String) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Ok(raw) => Ok(raw.trim().to_string()),
        Err(_) => Ok(default),
    }
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env::<u64>(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_env::<u64>(key, default_ms).map(Duration::from_millis)
}
