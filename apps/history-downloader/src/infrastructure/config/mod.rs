//! Configuration Module
//!
//! Environment-driven configuration for the downloader.

mod settings;

pub use settings::{
    ChannelSettings, ConfigError, DownloaderConfig, EndpointSettings, ErrorCodeSettings,
    HistorySettings, ReconnectSettings, parse_instruments,
};
