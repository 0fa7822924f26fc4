//! Connectivity State Machine
//!
//! Governs the connect / fail / reconnect lifecycle of the single service
//! connection.
//!
//! ```text
//! Initialize ──Initialized──► NotConnected ──ServiceAvailable──► ReadyToConnect
//!                                  ▲                                   │ Connect
//!                                  │ Disconnected                      ▼
//!                          FailedConnection ◄──ConnectionRejected── TryConnection
//!                                  ▲                                   │ ConnectionAccepted
//!                                  └──────────LostConnection────── Connected
//! ```
//!
//! `Finished` moves any live state to `Terminate`.

use crate::application::ports::{
    Endpoint, Notification, NotificationSink, ProtocolClient, ReaderLauncher,
};
use crate::application::services::SessionError;
use crate::domain::fsm::{EntryActions, FsmError, MachineDefinition, Outbox, Signal, StateMachine};
use crate::infrastructure::metrics;

/// Machine name used in logs.
pub const MACHINE_NAME: &str = "connectivity";

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not started.
    Initialize,
    /// Idle, no connection.
    NotConnected,
    /// Service reachable, waiting for a connect request.
    ReadyToConnect,
    /// Socket open, waiting for the handshake.
    TryConnection,
    /// Handshake done.
    Connected,
    /// Tearing down after a failure.
    FailedConnection,
    /// Session over.
    Terminate,
}

impl ConnectivityState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Initialize,
        Self::NotConnected,
        Self::ReadyToConnect,
        Self::TryConnection,
        Self::Connected,
        Self::FailedConnection,
        Self::Terminate,
    ];
}

/// Event kinds of the connectivity machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityEventKind {
    /// Initial state entered.
    Initialized,
    /// Service is believed reachable.
    ServiceAvailable,
    /// Caller asked to connect.
    Connect,
    /// Handshake completed.
    ConnectionAccepted,
    /// Connect attempt failed.
    ConnectionRejected,
    /// Established connection dropped.
    LostConnection,
    /// Teardown finished.
    Disconnected,
    /// Session shutting down.
    Finished,
}

/// Connectivity events with their payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Initial state entered.
    Initialized,
    /// Service is believed reachable.
    ServiceAvailable,
    /// Caller asked to connect.
    Connect,
    /// Handshake completed.
    ConnectionAccepted {
        /// First usable request id.
        next_valid_id: u32,
    },
    /// Connect attempt failed.
    ConnectionRejected {
        /// Service error code, when the service sent one.
        code: Option<i32>,
        /// Description.
        reason: String,
    },
    /// Established connection dropped.
    LostConnection {
        /// Service error code, when the loss was reported as an error.
        code: Option<i32>,
    },
    /// Teardown finished.
    Disconnected,
    /// Session shutting down.
    Finished,
}

impl Signal for ConnectivityEvent {
    type Kind = ConnectivityEventKind;

    fn kind(&self) -> ConnectivityEventKind {
        match self {
            Self::Initialized => ConnectivityEventKind::Initialized,
            Self::ServiceAvailable => ConnectivityEventKind::ServiceAvailable,
            Self::Connect => ConnectivityEventKind::Connect,
            Self::ConnectionAccepted { .. } => ConnectivityEventKind::ConnectionAccepted,
            Self::ConnectionRejected { .. } => ConnectivityEventKind::ConnectionRejected,
            Self::LostConnection { .. } => ConnectivityEventKind::LostConnection,
            Self::Disconnected => ConnectivityEventKind::Disconnected,
            Self::Finished => ConnectivityEventKind::Finished,
        }
    }
}

/// Running connectivity machine.
pub type ConnectivityMachine = StateMachine<ConnectivityState, ConnectivityEvent>;

/// Build the connectivity transition table.
///
/// # Errors
///
/// Returns [`FsmError::InvalidDefinition`] if the table is inconsistent.
pub fn definition() -> Result<MachineDefinition<ConnectivityState, ConnectivityEventKind>, FsmError>
{
    use ConnectivityEventKind as E;
    use ConnectivityState as S;

    MachineDefinition::builder(MACHINE_NAME)
        .states(S::ALL)
        .events([
            E::Initialized,
            E::ServiceAvailable,
            E::Connect,
            E::ConnectionAccepted,
            E::ConnectionRejected,
            E::LostConnection,
            E::Disconnected,
            E::Finished,
        ])
        .initial(S::Initialize)
        .terminal(S::Terminate)
        .transition(S::Initialize, E::Initialized, S::NotConnected)
        .transition(S::NotConnected, E::ServiceAvailable, S::ReadyToConnect)
        .transition(S::ReadyToConnect, E::Connect, S::TryConnection)
        .transition(S::TryConnection, E::ConnectionAccepted, S::Connected)
        .transition(S::TryConnection, E::ConnectionRejected, S::FailedConnection)
        .transition(S::TryConnection, E::LostConnection, S::FailedConnection)
        .transition(S::Connected, E::LostConnection, S::FailedConnection)
        .transition(S::FailedConnection, E::Disconnected, S::NotConnected)
        .transition(S::NotConnected, E::Finished, S::Terminate)
        .transition(S::ReadyToConnect, E::Finished, S::Terminate)
        .transition(S::TryConnection, E::Finished, S::Terminate)
        .transition(S::Connected, E::Finished, S::Terminate)
        .build()
}

// =============================================================================
// Link Status
// =============================================================================

/// Connection flag and failure bookkeeping shared with observers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    connected: bool,
    /// A failure happened and no connection has succeeded since.
    pub reconnect_wanted: bool,
    /// Description of the last failure.
    pub last_failure: Option<String>,
}

impl LinkStatus {
    /// Whether the connection is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Flip the flag, publishing only on change.
    pub fn set_connected(&mut self, connected: bool, notifications: &dyn NotificationSink) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        metrics::set_connected(connected);
        notifications.publish(Notification::ConnectionStatusChanged { connected });
    }
}

// =============================================================================
// Entry Actions
// =============================================================================

/// Collaborators the connectivity entry actions drive.
pub struct ConnectivityActions<'a> {
    /// Request side of the service.
    pub client: &'a mut dyn ProtocolClient,
    /// Reader loop control.
    pub reader: &'a mut dyn ReaderLauncher,
    /// Where to connect.
    pub endpoint: &'a Endpoint,
    /// Connection flag.
    pub link: &'a mut LinkStatus,
    /// Observer fan-out.
    pub notifications: &'a dyn NotificationSink,
}

impl ConnectivityActions<'_> {
    fn close_transport(&mut self) {
        self.reader.stop();
        self.client.disconnect();
        self.link.set_connected(false, self.notifications);
    }
}

impl EntryActions<ConnectivityState, ConnectivityEvent> for ConnectivityActions<'_> {
    type Error = SessionError;

    fn on_entry(
        &mut self,
        state: ConnectivityState,
        trigger: Option<&ConnectivityEvent>,
        outbox: &mut Outbox<ConnectivityEvent>,
    ) -> Result<(), SessionError> {
        match state {
            ConnectivityState::Initialize => {
                outbox.emit(ConnectivityEvent::Initialized);
            }
            ConnectivityState::NotConnected => {
                tracing::debug!("Connection idle");
            }
            ConnectivityState::ReadyToConnect => {
                tracing::debug!(endpoint = %self.endpoint, "Ready to connect");
            }
            ConnectivityState::TryConnection => match self.client.connect(self.endpoint) {
                Ok(source) => {
                    self.reader.start(source);
                    tracing::info!(endpoint = %self.endpoint, "Transport open, awaiting handshake");
                }
                Err(e) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "Connect attempt failed");
                    outbox.emit(ConnectivityEvent::ConnectionRejected {
                        code: None,
                        reason: e.to_string(),
                    });
                }
            },
            ConnectivityState::Connected => {
                if let Err(e) = self.client.request_current_time() {
                    tracing::warn!(error = %e, "Time synchronization request failed");
                }
                self.link.reconnect_wanted = false;
                self.link.last_failure = None;
                self.link.set_connected(true, self.notifications);
                tracing::info!(endpoint = %self.endpoint, "Connected");
            }
            ConnectivityState::FailedConnection => {
                let reason = match trigger {
                    Some(ConnectivityEvent::ConnectionRejected { code, reason }) => {
                        format!("rejected (code {code:?}): {reason}")
                    }
                    Some(ConnectivityEvent::LostConnection { code }) => {
                        format!("lost (code {code:?})")
                    }
                    other => {
                        return Err(FsmError::entry_action(
                            MACHINE_NAME,
                            state,
                            format!("unexpected trigger {other:?}"),
                        )
                        .into());
                    }
                };
                tracing::warn!(endpoint = %self.endpoint, %reason, "Connection failed");
                self.close_transport();
                self.link.reconnect_wanted = true;
                self.link.last_failure = Some(reason);
                outbox.emit(ConnectivityEvent::Disconnected);
            }
            ConnectivityState::Terminate => {
                self.close_transport();
                self.link.reconnect_wanted = false;
                tracing::info!("Connectivity terminated");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::services::test_support::{FakeClient, FakeReader, RecordingSink};
    use crate::domain::fsm::FireOutcome;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 0,
        }
    }

    struct Rig {
        client: FakeClient,
        reader: FakeReader,
        link: LinkStatus,
        sink: RecordingSink,
        endpoint: Endpoint,
        machine: ConnectivityMachine,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                client: FakeClient::default(),
                reader: FakeReader::default(),
                link: LinkStatus::default(),
                sink: RecordingSink::default(),
                endpoint: endpoint(),
                machine: ConnectivityMachine::new(Arc::new(definition().unwrap())),
            }
        }

        fn start(&mut self) {
            let mut actions = ConnectivityActions {
                client: &mut self.client,
                reader: &mut self.reader,
                endpoint: &self.endpoint,
                link: &mut self.link,
                notifications: &self.sink,
            };
            self.machine.start(&mut actions).unwrap();
        }

        fn fire(&mut self, event: ConnectivityEvent) -> FireOutcome<ConnectivityState> {
            let mut actions = ConnectivityActions {
                client: &mut self.client,
                reader: &mut self.reader,
                endpoint: &self.endpoint,
                link: &mut self.link,
                notifications: &self.sink,
            };
            self.machine.fire(event, &mut actions).unwrap()
        }
    }

    #[test]
    fn definition_is_valid() {
        let def = definition().unwrap();
        assert_eq!(def.initial(), ConnectivityState::Initialize);
        assert!(def.is_terminal(ConnectivityState::Terminate));
    }

    #[test]
    fn start_lands_in_not_connected() {
        let mut rig = Rig::new();
        rig.start();
        assert_eq!(rig.machine.state(), ConnectivityState::NotConnected);
        assert!(!rig.link.is_connected());
    }

    #[test]
    fn connect_accept_lose_cycle() {
        let mut rig = Rig::new();
        rig.start();

        rig.fire(ConnectivityEvent::ServiceAvailable);
        rig.fire(ConnectivityEvent::Connect);
        assert_eq!(rig.machine.state(), ConnectivityState::TryConnection);
        assert!(rig.client.connected);
        assert!(rig.reader.running);

        rig.fire(ConnectivityEvent::ConnectionAccepted { next_valid_id: 1 });
        assert_eq!(rig.machine.state(), ConnectivityState::Connected);
        assert!(rig.link.is_connected());
        assert_eq!(rig.client.time_requests, 1);

        let outcome = rig.fire(ConnectivityEvent::LostConnection { code: Some(1100) });
        assert_eq!(
            outcome,
            FireOutcome::Moved {
                from: ConnectivityState::Connected,
                to: ConnectivityState::FailedConnection
            }
        );
        // FailedConnection chains Disconnected straight back to NotConnected.
        assert_eq!(rig.machine.state(), ConnectivityState::NotConnected);
        assert!(!rig.link.is_connected());
        assert!(rig.link.reconnect_wanted);
        assert!(!rig.client.connected);
        assert!(!rig.reader.running);

        assert_eq!(
            rig.sink.taken(),
            vec![
                Notification::ConnectionStatusChanged { connected: true },
                Notification::ConnectionStatusChanged { connected: false },
            ]
        );
    }

    #[test]
    fn failed_connection_rejects_unexpected_trigger() {
        let mut rig = Rig::new();
        rig.start();
        let mut outbox = Outbox::new();
        let mut actions = ConnectivityActions {
            client: &mut rig.client,
            reader: &mut rig.reader,
            endpoint: &rig.endpoint,
            link: &mut rig.link,
            notifications: &rig.sink,
        };

        let err = actions
            .on_entry(
                ConnectivityState::FailedConnection,
                Some(&ConnectivityEvent::Connect),
                &mut outbox,
            )
            .unwrap_err();

        assert!(matches!(err, SessionError::Fsm(FsmError::EntryAction { .. })));
        assert!(outbox.is_empty());
        assert!(!rig.link.reconnect_wanted);
    }

    #[test]
    fn synchronous_connect_failure_is_a_rejection() {
        let mut rig = Rig::new();
        rig.client.refuse_connect = true;
        rig.start();

        rig.fire(ConnectivityEvent::ServiceAvailable);
        rig.fire(ConnectivityEvent::Connect);

        assert_eq!(rig.machine.state(), ConnectivityState::NotConnected);
        assert!(rig.link.reconnect_wanted);
        assert!(rig.link.last_failure.as_deref().unwrap().starts_with("rejected"));
        assert!(!rig.reader.running);
        // Flag never went up, so nothing was published.
        assert!(rig.sink.taken().is_empty());
    }

    #[test]
    fn lost_connection_while_idle_is_ignored() {
        let mut rig = Rig::new();
        rig.start();

        let outcome = rig.fire(ConnectivityEvent::LostConnection { code: Some(504) });

        assert_eq!(
            outcome,
            FireOutcome::Ignored {
                state: ConnectivityState::NotConnected
            }
        );
    }

    #[test]
    fn finished_terminates_and_closes() {
        let mut rig = Rig::new();
        rig.start();
        rig.fire(ConnectivityEvent::ServiceAvailable);
        rig.fire(ConnectivityEvent::Connect);
        rig.fire(ConnectivityEvent::ConnectionAccepted { next_valid_id: 1 });

        rig.fire(ConnectivityEvent::Finished);

        assert!(rig.machine.is_finished());
        assert!(!rig.link.is_connected());
        assert!(!rig.link.reconnect_wanted);
        assert!(!rig.client.connected);
    }
}
