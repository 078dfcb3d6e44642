//! In-process counter peripheral.
//!
//! Behaves like the real device as seen through [`BleBackend`]: it
//! advertises the counter service, answers reads with the current count,
//! increments on every trigger write and notifies subscribers. Reads and
//! writes can be made to require bonding, and faults can be injected for
//! each operation.

use crate::domain::models::{
    BondState, BondStateChange, ConnectionState, DeviceHandle, ScanResult,
};
use crate::infrastructure::bluetooth::backend::{
    broadcast_stream, BleBackend, BondStateStream, ConnectionStateStream, ConnectionStream,
    GattConnection, NotificationStream, ScanFilter, ScanStream,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::protocol::{
    COUNTER_CHAR_UUID, SERVICE_UUID, TRIGGER_CHAR_UUID,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use uuid::Uuid;

/// Time the simulated OS takes to answer a pairing request.
const BOND_DELAY: Duration = Duration::from_millis(300);

const EVENT_CAPACITY: usize = 64;

/// One advertisement, delivered `delay` after the previous one.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub delay: Duration,
    pub device: DeviceHandle,
    pub service_uuids: Vec<Uuid>,
    pub signal_strength: i16,
}

impl Advertisement {
    /// An advertisement of the counter service.
    pub fn counter(device: DeviceHandle, delay: Duration) -> Self {
        Self {
            delay,
            device,
            service_uuids: vec![SERVICE_UUID],
            signal_strength: -60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub advertisements: Vec<Advertisement>,
    /// Delivered after the last advertisement; without it the scan runs
    /// until dropped.
    pub scan_error: Option<BleError>,
    pub connect_error: Option<BleError>,
    /// MTU the peripheral supports; `None` rejects MTU requests.
    pub negotiated_mtu: Option<u16>,
    pub initial_count: u8,
    /// Reads and writes fail with an access error until bonded.
    pub requires_bonding: bool,
    /// Final pairing state; `None` leaves pairing pending forever.
    pub bond_outcome: Option<BondState>,
    pub bond_error: Option<BleError>,
    pub read_error: Option<BleError>,
    pub write_error: Option<BleError>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            advertisements: vec![Advertisement::counter(
                DeviceHandle::new(0x0000_C0FF_EE00_0001, Some("BLE Counter".to_string())),
                Duration::from_millis(400),
            )],
            scan_error: None,
            connect_error: None,
            negotiated_mtu: Some(247),
            initial_count: 0,
            requires_bonding: true,
            bond_outcome: Some(BondState::Bonded),
            bond_error: None,
            read_error: None,
            write_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct PeripheralState {
    counter: u8,
    bonded: bool,
    connected: Option<u64>,
    scans: usize,
    connect_calls: Vec<(u64, bool)>,
    mtu_requests: Vec<u16>,
    notification_setups: usize,
    reads: usize,
    writes: usize,
    bond_requests: usize,
}

struct Inner {
    config: SimulatedConfig,
    state: Mutex<PeripheralState>,
    link_events: broadcast::Sender<(u64, ConnectionState)>,
    link_loss: broadcast::Sender<u64>,
    bond_events: broadcast::Sender<BondStateChange>,
    notifications: broadcast::Sender<(u64, Result<u8, BleError>)>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_link(&self, address: u64, state: ConnectionState) {
        debug!("Simulated link {:#X}: {}", address, state);
        let _ = self.link_events.send((address, state));
    }

    fn publish_bond(&self, device: &DeviceHandle, state: BondState) {
        debug!("Simulated bond state for {}: {:?}", device, state);
        let _ = self.bond_events.send(BondStateChange {
            device: device.clone(),
            state,
        });
    }

    fn disconnect(&self, address: u64, graceful: bool) {
        {
            let mut state = self.state();
            if state.connected == Some(address) {
                state.connected = None;
            }
        }
        if graceful {
            self.publish_link(address, ConnectionState::Disconnecting);
        }
        self.publish_link(address, ConnectionState::Disconnected);
    }

    fn authorize(&self, state: &PeripheralState, uuid: Uuid) -> Result<(), BleError> {
        if self.config.requires_bonding && !state.bonded {
            return Err(BleError::CharacteristicAccess {
                uuid,
                reason: "insufficient authentication".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<Inner>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = PeripheralState {
            counter: config.initial_count,
            ..Default::default()
        };
        let (link_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (link_loss, _) = broadcast::channel(EVENT_CAPACITY);
        let (bond_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (notifications, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                link_events,
                link_loss,
                bond_events,
                notifications,
            }),
        }
    }

    /// Set the counter as if changed on the peripheral and notify.
    pub fn push_counter(&self, value: u8) {
        let address = {
            let mut state = self.inner.state();
            state.counter = value;
            state.connected
        };
        if let Some(address) = address {
            let _ = self.inner.notifications.send((address, Ok(value)));
        }
    }

    /// Fail every open notification stream of the connected link.
    pub fn fail_notifications(&self, error: BleError) {
        if let Some(address) = self.inner.state().connected {
            info!("Simulating notification failure for {:#X}", address);
            let _ = self.inner.notifications.send((address, Err(error)));
        }
    }

    /// Drop the radio link to `address` without the central asking.
    pub fn drop_link(&self, address: u64) {
        info!("Simulating link loss for {:#X}", address);
        let _ = self.inner.link_loss.send(address);
    }

    /// Deliver a pairing-state broadcast as the OS would.
    pub fn broadcast_bond_state(&self, change: BondStateChange) {
        let _ = self.inner.bond_events.send(change);
    }

    pub fn counter(&self) -> u8 {
        self.inner.state().counter
    }

    pub fn is_bonded(&self) -> bool {
        self.inner.state().bonded
    }

    pub fn connected_address(&self) -> Option<u64> {
        self.inner.state().connected
    }

    pub fn scan_count(&self) -> usize {
        self.inner.state().scans
    }

    pub fn connect_calls(&self) -> Vec<(u64, bool)> {
        self.inner.state().connect_calls.clone()
    }

    pub fn mtu_requests(&self) -> Vec<u16> {
        self.inner.state().mtu_requests.clone()
    }

    pub fn notification_setups(&self) -> usize {
        self.inner.state().notification_setups
    }

    pub fn read_count(&self) -> usize {
        self.inner.state().reads
    }

    pub fn write_count(&self) -> usize {
        self.inner.state().writes
    }

    pub fn bond_requests(&self) -> usize {
        self.inner.state().bond_requests
    }

    /// Number of registered pairing-state observers.
    pub fn bond_observers(&self) -> usize {
        self.inner.bond_events.receiver_count()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

/// Marks the link down when the connection stream goes away.
struct LinkGuard {
    inner: Arc<Inner>,
    address: u64,
    lost: bool,
}

impl LinkGuard {
    fn lose(&mut self) {
        self.lost = true;
        self.inner.disconnect(self.address, false);
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if !self.lost {
            self.inner.disconnect(self.address, true);
        }
    }
}

enum Link {
    Pending {
        inner: Arc<Inner>,
        address: u64,
        loss: broadcast::Receiver<u64>,
    },
    Up {
        guard: LinkGuard,
        loss: broadcast::Receiver<u64>,
    },
    Down,
}

#[async_trait]
impl BleBackend for SimulatedBackend {
    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream, BleError> {
        self.inner.state().scans += 1;

        let matching: Vec<Advertisement> = self
            .inner
            .config
            .advertisements
            .iter()
            .filter(|adv| adv.service_uuids.contains(&filter.service_uuid))
            .cloned()
            .collect();

        let tail: ScanStream = match self.inner.config.scan_error.clone() {
            Some(error) => stream::once(async move { Err(error) }).boxed(),
            None => stream::pending().boxed(),
        };

        let found = stream::iter(matching).then(|adv| async move {
            tokio::time::sleep(adv.delay).await;
            Ok(ScanResult {
                device: adv.device,
                signal_strength: adv.signal_strength,
            })
        });

        Ok(found.chain(tail).boxed())
    }

    fn observe_connection_state(&self, device: &DeviceHandle) -> ConnectionStateStream {
        let address = device.address;
        broadcast_stream(self.inner.link_events.subscribe())
            .filter_map(move |(link, state)| async move { (link == address).then_some(Ok(state)) })
            .boxed()
    }

    fn establish_connection(
        &self,
        device: &DeviceHandle,
        auto_connect: bool,
    ) -> ConnectionStream {
        self.inner
            .state()
            .connect_calls
            .push((device.address, auto_connect));

        let start = Link::Pending {
            inner: self.inner.clone(),
            address: device.address,
            loss: self.inner.link_loss.subscribe(),
        };

        stream::unfold(start, |link| async move {
            match link {
                Link::Pending {
                    inner,
                    address,
                    loss,
                } => {
                    inner.publish_link(address, ConnectionState::Connecting);
                    tokio::task::yield_now().await;

                    if let Some(error) = inner.config.connect_error.clone() {
                        inner.publish_link(address, ConnectionState::Disconnected);
                        return Some((Err(error), Link::Down));
                    }

                    inner.state().connected = Some(address);
                    inner.publish_link(address, ConnectionState::Connected);

                    let connection: Arc<dyn GattConnection> = Arc::new(SimulatedConnection {
                        inner: inner.clone(),
                        address,
                    });
                    let guard = LinkGuard {
                        inner,
                        address,
                        lost: false,
                    };
                    Some((Ok(connection), Link::Up { guard, loss }))
                }
                Link::Up { mut guard, mut loss } => {
                    loop {
                        match loss.recv().await {
                            Ok(lost) if lost == guard.address => break,
                            Ok(_) | Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => futures::future::pending::<()>().await,
                        }
                    }
                    guard.lose();
                    Some((Err(BleError::Disconnected), Link::Down))
                }
                Link::Down => None,
            }
        })
        .boxed()
    }

    fn bond_state_changes(&self) -> BondStateStream {
        broadcast_stream(self.inner.bond_events.subscribe())
    }

    async fn create_bond(&self, device: &DeviceHandle) -> Result<(), BleError> {
        self.inner.state().bond_requests += 1;

        if let Some(error) = self.inner.config.bond_error.clone() {
            return Err(error);
        }

        self.inner.publish_bond(device, BondState::Bonding);
        tokio::time::sleep(BOND_DELAY).await;

        match self.inner.config.bond_outcome {
            Some(BondState::Bonded) => {
                self.inner.state().bonded = true;
                self.inner.publish_bond(device, BondState::Bonded);
            }
            Some(state) => self.inner.publish_bond(device, state),
            None => debug!("Simulated pairing for {} left unanswered", device),
        }
        Ok(())
    }
}

struct SimulatedConnection {
    inner: Arc<Inner>,
    address: u64,
}

#[async_trait]
impl GattConnection for SimulatedConnection {
    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError> {
        self.inner.state().mtu_requests.push(mtu);
        match self.inner.config.negotiated_mtu {
            Some(supported) => Ok(supported.min(mtu)),
            None => Err(BleError::Platform(
                "MTU request rejected by peripheral".to_string(),
            )),
        }
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        if uuid != COUNTER_CHAR_UUID {
            return Err(BleError::CharacteristicNotFound(uuid));
        }

        let mut state = self.inner.state();
        state.reads += 1;
        if let Some(error) = self.inner.config.read_error.clone() {
            return Err(error);
        }
        self.inner.authorize(&state, uuid)?;
        Ok(vec![state.counter])
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<Vec<u8>, BleError> {
        if uuid != TRIGGER_CHAR_UUID {
            return Err(BleError::CharacteristicNotFound(uuid));
        }

        let counter = {
            let mut state = self.inner.state();
            state.writes += 1;
            if let Some(error) = self.inner.config.write_error.clone() {
                return Err(error);
            }
            self.inner.authorize(&state, uuid)?;
            state.counter = state.counter.wrapping_add(1);
            state.counter
        };

        let _ = self.inner.notifications.send((self.address, Ok(counter)));
        Ok(value.to_vec())
    }

    async fn setup_notification(&self, uuid: Uuid) -> Result<NotificationStream, BleError> {
        if uuid != COUNTER_CHAR_UUID {
            return Err(BleError::CharacteristicNotFound(uuid));
        }

        self.inner.state().notification_setups += 1;
        let address = self.address;
        Ok(broadcast_stream(self.inner.notifications.subscribe())
            .filter_map(move |(link, value)| async move {
                (link == address).then(|| value.map(|count| vec![count]))
            })
            .boxed())
    }
}
