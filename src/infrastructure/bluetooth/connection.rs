//! BLE Connection Module
//!
//! Opens the logical connection to the selected device and tracks its link
//! state.

use crate::domain::models::{ConnectionState, DeviceHandle};
use crate::infrastructure::bluetooth::backend::{
    BleBackend, ConnectionStateStream, ConnectionStream,
};
use crate::infrastructure::bluetooth::session::{SessionEvent, Subscription};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    /// Whether the link may legitimately move from `from` to `to`.
    pub fn is_expected(&self) -> bool {
        use ConnectionState::*;
        matches!(
            (self.from, self.to),
            (Idle, Connecting)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Connected)
                | (_, Disconnected)
        )
    }
}

/// Link state of the current session.
///
/// Transitions are only observed and logged; the session itself is driven
/// by the connection stream.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Returns the transition, or `None` if already there.
    pub fn apply(&mut self, next: ConnectionState) -> Option<Transition> {
        if self.state == next {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
        };
        if transition.is_expected() {
            match next {
                ConnectionState::Connecting => info!("connecting..."),
                ConnectionState::Connected => info!("connected!"),
                ConnectionState::Disconnecting => info!("disconnecting..."),
                ConnectionState::Disconnected => info!("disconnected"),
                ConnectionState::Idle => {}
            }
        } else {
            warn!(
                "Unexpected connection transition {} -> {}",
                transition.from, transition.to
            );
        }

        self.state = next;
        Some(transition)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the two long-lived tasks of a connection attempt.
pub struct Connector {
    backend: Arc<dyn BleBackend>,
    auto_connect: bool,
}

impl Connector {
    pub fn new(backend: Arc<dyn BleBackend>, auto_connect: bool) -> Self {
        Self {
            backend,
            auto_connect,
        }
    }

    /// Register for link state changes of `device` and forward them.
    pub fn observe_state(
        &self,
        device: &DeviceHandle,
        epoch: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Subscription {
        let states = self.backend.observe_connection_state(device);
        Subscription::spawn("connection-state", forward_states(states, epoch, events))
    }

    /// Open the connection to `device`. The returned subscription is the
    /// session: disposing it closes the link.
    pub fn connect(
        &self,
        device: &DeviceHandle,
        epoch: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Subscription {
        info!("connecting to {}", device);
        let connection = self.backend.establish_connection(device, self.auto_connect);
        Subscription::spawn(
            "connection",
            drive_connection(connection, device.clone(), epoch, events),
        )
    }
}

async fn forward_states(
    mut states: ConnectionStateStream,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(item) = states.next().await {
        match item {
            Ok(state) => {
                if events
                    .send(SessionEvent::StateChanged { epoch, state })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("Connection state observation failed: {}", e);
                return;
            }
        }
    }
    info!("state change complete!");
}

async fn drive_connection(
    mut connection: ConnectionStream,
    device: DeviceHandle,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(item) = connection.next().await {
        let event = match item {
            Ok(connection) => SessionEvent::Connected { epoch, connection },
            Err(error) => {
                error!("Device disconnected: {}: {}", device, error);
                let _ = events.send(SessionEvent::ConnectionLost { epoch, error });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }

    info!("connection complete!");
    let _ = events.send(SessionEvent::ConnectionClosed { epoch });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::BleError;
    use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedConfig};

    fn device() -> DeviceHandle {
        DeviceHandle::new(0x42, Some("Counter".to_string()))
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut machine = ConnectionStateMachine::new();
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ] {
            let transition = machine.apply(next).unwrap();
            assert!(transition.is_expected());
        }
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_machine_ignores_repeats() {
        let mut machine = ConnectionStateMachine::new();
        assert!(machine.apply(ConnectionState::Connecting).is_some());
        assert!(machine.apply(ConnectionState::Connecting).is_none());
    }

    #[test]
    fn test_unexpected_transition_is_still_applied() {
        let mut machine = ConnectionStateMachine::new();
        let transition = machine.apply(ConnectionState::Connected).unwrap();
        assert!(!transition.is_expected());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnecting_can_return_to_connected() {
        let transition = Transition {
            from: ConnectionState::Disconnecting,
            to: ConnectionState::Connected,
        };
        assert!(transition.is_expected());
    }

    #[tokio::test]
    async fn test_connect_reports_handle_with_auto_connect() {
        let backend = SimulatedBackend::new(SimulatedConfig::default());
        let connector = Connector::new(Arc::new(backend.clone()), true);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _state = connector.observe_state(&device(), 3, tx.clone());
        let _session = connector.connect(&device(), 3, tx);

        let mut connected = false;
        let mut states = Vec::new();
        while !connected || states.len() < 2 {
            match rx.recv().await.unwrap() {
                SessionEvent::Connected { epoch, .. } => {
                    assert_eq!(epoch, 3);
                    connected = true;
                }
                SessionEvent::StateChanged { state, .. } => states.push(state),
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(backend.connect_calls(), vec![(0x42, true)]);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_loss() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            connect_error: Some(BleError::ConnectionFailed("status 133".to_string())),
            ..Default::default()
        });
        let connector = Connector::new(Arc::new(backend), true);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _session = connector.connect(&device(), 1, tx);

        match rx.recv().await.unwrap() {
            SessionEvent::ConnectionLost { epoch, error } => {
                assert_eq!(epoch, 1);
                assert!(matches!(error, BleError::ConnectionFailed(_)));
            }
            _ => panic!("expected connection loss"),
        }
    }

    #[tokio::test]
    async fn test_disposing_session_closes_link() {
        let backend = SimulatedBackend::new(SimulatedConfig::default());
        let connector = Connector::new(Arc::new(backend.clone()), true);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = connector.connect(&device(), 1, tx);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Connected { .. }
        ));
        assert_eq!(backend.connected_address(), Some(0x42));

        session.dispose();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(backend.connected_address(), None);
    }
}
