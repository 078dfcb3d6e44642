//! Session state owned by the Bluetooth service.

use crate::domain::models::{BondState, ConnectionState, DeviceHandle, ScanOutcome};
use crate::infrastructure::bluetooth::backend::GattConnection;
use crate::infrastructure::bluetooth::error::{BleError, GattOperation};
use crate::infrastructure::bluetooth::protocol::DEFAULT_MTU;
use futures::future::{AbortHandle, Abortable, Aborted};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::trace;

/// A spawned task that can be cancelled from the owning session.
pub struct Subscription {
    label: &'static str,
    handle: AbortHandle,
    task: JoinHandle<Result<(), Aborted>>,
}

impl Subscription {
    pub fn spawn<F>(label: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let task = tokio::spawn(Abortable::new(future, registration));
        Self {
            label,
            handle,
            task,
        }
    }

    pub fn dispose(&self) {
        if !self.handle.is_aborted() {
            trace!("Disposing {}", self.label);
            self.handle.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Results reported back to the service by its tasks.
///
/// Session-scoped events carry the epoch they were started in; the service
/// drops any whose epoch is no longer current.
pub enum SessionEvent {
    ScanFinished {
        scan: u64,
        outcome: ScanOutcome,
    },
    StateChanged {
        epoch: u64,
        state: ConnectionState,
    },
    Connected {
        epoch: u64,
        connection: Arc<dyn GattConnection>,
    },
    ConnectionLost {
        epoch: u64,
        error: BleError,
    },
    ConnectionClosed {
        epoch: u64,
    },
    MtuNegotiated {
        epoch: u64,
        mtu: u16,
    },
    BondingRequired {
        epoch: u64,
        operation: GattOperation,
    },
    BondProgress {
        cycle: u64,
        state: BondState,
    },
    BondFinished {
        cycle: u64,
        state: BondState,
    },
    BondInitiationFailed {
        cycle: u64,
        error: BleError,
    },
}

/// Selected device, live connection and negotiated MTU of the one active
/// session, together with every task scoped to it.
pub struct Session {
    epoch: u64,
    device: Option<DeviceHandle>,
    connection: Option<Arc<dyn GattConnection>>,
    mtu: u16,
    state_observer: Option<Subscription>,
    connection_subscription: Option<Subscription>,
    operations: Vec<Subscription>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            device: None,
            connection: None,
            mtu: DEFAULT_MTU,
            state_observer: None,
            connection_subscription: None,
            operations: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn select_device(&mut self, device: DeviceHandle) {
        self.device = Some(device);
    }

    pub fn connection(&self) -> Option<Arc<dyn GattConnection>> {
        self.connection.clone()
    }

    pub fn attach_connection(&mut self, connection: Arc<dyn GattConnection>) {
        self.connection = Some(connection);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    pub fn set_state_observer(&mut self, subscription: Subscription) {
        if let Some(previous) = self.state_observer.replace(subscription) {
            previous.dispose();
        }
    }

    pub fn set_connection_subscription(&mut self, subscription: Subscription) {
        if let Some(previous) = self.connection_subscription.replace(subscription) {
            previous.dispose();
        }
    }

    /// Keep an operation task alive until it completes or the session ends.
    pub fn track(&mut self, subscription: Subscription) {
        self.operations
            .retain(|s| !(s.is_finished() || s.is_disposed()));
        self.operations.push(subscription);
    }

    /// Tear down everything scoped to the session and start a new epoch.
    /// Safe to call in any state, any number of times.
    pub fn reset(&mut self) {
        if let Some(observer) = self.state_observer.take() {
            observer.dispose();
        }
        if let Some(connection) = self.connection_subscription.take() {
            connection.dispose();
        }
        for operation in self.operations.drain(..) {
            operation.dispose();
        }
        self.connection = None;
        self.device = None;
        self.mtu = DEFAULT_MTU;
        self.epoch += 1;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reset();
    }
}
