//! Notification Broadcast Hub
//!
//! Fans session notifications out to any number of observers using tokio
//! broadcast channels. Publishing never blocks the session worker; a slow
//! observer lags and loses the oldest messages instead.
//!
//! # Channels
//!
//! - connection: connection status changes
//! - catalog: instrument added / resolved
//! - downloads: progress, finished, interrupted

use tokio::sync::broadcast;

use crate::application::ports::{Notification, NotificationSink};
use crate::infrastructure::config::ChannelSettings;

/// Connection flag change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Whether the connection is up.
    pub connected: bool,
}

/// Central hub for all notification channels.
#[derive(Debug)]
pub struct NotificationHub {
    connection_tx: broadcast::Sender<ConnectionStatus>,
    catalog_tx: broadcast::Sender<Notification>,
    downloads_tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    /// Create a hub whose channels each hold `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            connection_tx: broadcast::channel(capacity).0,
            catalog_tx: broadcast::channel(capacity).0,
            downloads_tx: broadcast::channel(capacity).0,
        }
    }

    /// Create a hub from channel settings.
    #[must_use]
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self::new(settings.notification_capacity)
    }

    /// Receiver for connection status changes.
    #[must_use]
    pub fn connection_rx(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.connection_tx.subscribe()
    }

    /// Receiver for instrument catalog notifications.
    #[must_use]
    pub fn catalog_rx(&self) -> broadcast::Receiver<Notification> {
        self.catalog_tx.subscribe()
    }

    /// Receiver for download notifications.
    #[must_use]
    pub fn downloads_rx(&self) -> broadcast::Receiver<Notification> {
        self.downloads_tx.subscribe()
    }

    /// Total receivers across all channels.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.connection_tx.receiver_count()
            + self.catalog_tx.receiver_count()
            + self.downloads_tx.receiver_count()
    }

    /// Send a notification on its channel.
    ///
    /// Returns the number of receivers that got it, or `None` if the channel
    /// has no receivers.
    #[must_use]
    pub fn send(&self, notification: Notification) -> Option<usize> {
        match notification {
            Notification::ConnectionStatusChanged { connected } => {
                self.connection_tx.send(ConnectionStatus { connected }).ok()
            }
            Notification::InstrumentAdded { .. } | Notification::InstrumentResolved { .. } => {
                self.catalog_tx.send(notification).ok()
            }
            Notification::DownloadProgress { .. }
            | Notification::DownloadFinished { .. }
            | Notification::DownloadInterrupted { .. } => self.downloads_tx.send(notification).ok(),
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::from_settings(&ChannelSettings::default())
    }
}

impl NotificationSink for NotificationHub {
    fn publish(&self, notification: Notification) {
        if self.send(notification).is_none() {
            tracing::trace!("Notification published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::InstrumentKey;

    #[test]
    fn routes_by_kind() {
        let hub = NotificationHub::new(16);
        let mut connection = hub.connection_rx();
        let mut catalog = hub.catalog_rx();
        let mut downloads = hub.downloads_rx();

        hub.publish(Notification::ConnectionStatusChanged { connected: true });
        hub.publish(Notification::InstrumentAdded {
            key: InstrumentKey::new("FUT_ES_GLOBEX"),
        });
        hub.publish(Notification::DownloadInterrupted {
            key: InstrumentKey::new("FUT_ES_GLOBEX"),
        });

        assert_eq!(
            connection.try_recv().unwrap(),
            ConnectionStatus { connected: true }
        );
        assert!(matches!(
            catalog.try_recv().unwrap(),
            Notification::InstrumentAdded { .. }
        ));
        assert!(matches!(
            downloads.try_recv().unwrap(),
            Notification::DownloadInterrupted { .. }
        ));
        assert!(catalog.try_recv().is_err());
    }

    #[test]
    fn send_without_receivers_returns_none() {
        let hub = NotificationHub::new(4);
        assert_eq!(hub.receiver_count(), 0);
        assert!(
            hub.send(Notification::ConnectionStatusChanged { connected: false })
                .is_none()
        );
    }

    #[test]
    fn every_subscriber_gets_a_copy() {
        let hub = NotificationHub::new(4);
        let mut first = hub.connection_rx();
        let mut second = hub.connection_rx();

        assert_eq!(
            hub.send(Notification::ConnectionStatusChanged { connected: true }),
            Some(2)
        );
        assert!(first.try_recv().unwrap().connected);
        assert!(second.try_recv().unwrap().connected);
    }
}
