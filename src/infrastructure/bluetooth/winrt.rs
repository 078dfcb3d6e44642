//! Windows Bluetooth LE backend.
//!
//! WinRT reports everything through event handlers. Each handler forwards
//! into a tokio channel, and a [`Registration`] kept next to the receiver
//! removes the handler when the stream is dropped.

use crate::domain::models::{
    BondState, BondStateChange, ConnectionState, DeviceHandle, Permission, PermissionGrant,
    ScanResult,
};
use crate::infrastructure::bluetooth::backend::{
    broadcast_stream, BleBackend, BondStateStream, ConnectionStateStream, ConnectionStream,
    GattConnection, NotificationStream, ScanFilter, ScanMode, ScanStream,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::permissions::PermissionGate;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError,
    BluetoothLEDevice,
};
use windows::Devices::Enumeration::DevicePairingResultStatus;
use windows::Devices::Radios::RadioState;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

const EVENT_CAPACITY: usize = 16;

// ATT errors that mean the link is not sufficiently secured.
const ATT_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
const ATT_INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
const ATT_INSUFFICIENT_KEY_SIZE: u8 = 0x0C;
const ATT_INSUFFICIENT_ENCRYPTION: u8 = 0x0F;

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

/// Runs its cleanup once, on drop.
struct Registration(Option<Box<dyn FnOnce() + Send>>);

impl Registration {
    fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cleanup)))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

fn channel_stream<T: Send + 'static>(
    receiver: mpsc::UnboundedReceiver<T>,
    registration: Registration,
) -> BoxStream<'static, T> {
    stream::unfold(
        (receiver, registration),
        |(mut receiver, registration)| async move {
            let item = receiver.recv().await?;
            Some((item, (receiver, registration)))
        },
    )
    .boxed()
}

async fn open_device(address: u64) -> Result<BluetoothLEDevice, BleError> {
    BluetoothLEDevice::FromBluetoothAddressAsync(address)?
        .await
        .map_err(|e| BleError::ConnectionFailed(format!("{:#X}: {}", address, e)))
}

fn read_buffer(buffer: &IBuffer) -> Result<Vec<u8>, BleError> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// Map a GATT status to the error kinds the session reacts to.
fn check_status(
    uuid: Uuid,
    status: GattCommunicationStatus,
    protocol_error: Option<u8>,
) -> Result<(), BleError> {
    match status {
        GattCommunicationStatus::Success => Ok(()),
        GattCommunicationStatus::Unreachable => {
            Err(BleError::Timeout(format!("{} unreachable", uuid)))
        }
        GattCommunicationStatus::AccessDenied => Err(BleError::CharacteristicAccess {
            uuid,
            reason: "access denied".to_string(),
        }),
        GattCommunicationStatus::ProtocolError => match protocol_error {
            Some(
                code @ (ATT_INSUFFICIENT_AUTHENTICATION
                | ATT_INSUFFICIENT_AUTHORIZATION
                | ATT_INSUFFICIENT_KEY_SIZE
                | ATT_INSUFFICIENT_ENCRYPTION),
            ) => Err(BleError::CharacteristicAccess {
                uuid,
                reason: format!("ATT error {:#04X}", code),
            }),
            Some(code) => Err(BleError::Platform(format!(
                "{}: ATT error {:#04X}",
                uuid, code
            ))),
            None => Err(BleError::Platform(format!("{}: protocol error", uuid))),
        },
        other => Err(BleError::Platform(format!("{}: {:?}", uuid, other))),
    }
}

/// Bluetooth LE through the WinRT Devices.Bluetooth APIs.
pub struct WinRtBackend {
    bond_events: broadcast::Sender<BondStateChange>,
}

impl WinRtBackend {
    pub fn new() -> Self {
        let (bond_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { bond_events }
    }

    fn publish_bond(&self, device: &DeviceHandle, state: BondState) {
        let _ = self.bond_events.send(BondStateChange {
            device: device.clone(),
            state,
        });
    }
}

impl Default for WinRtBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleBackend for WinRtBackend {
    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream, BleError> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(match filter.mode {
            ScanMode::LowPower => BluetoothLEScanningMode::Passive,
            ScanMode::Balanced | ScanMode::LowLatency => BluetoothLEScanningMode::Active,
        })?;
        watcher
            .AdvertisementFilter()?
            .Advertisement()?
            .ServiceUuids()?
            .Append(guid(filter.service_uuid))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let found = tx.clone();
        let received = watcher.Received(&TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let device = DeviceHandle::new(
                        args.BluetoothAddress()?,
                        (!name.is_empty()).then_some(name),
                    );
                    let _ = found.send(Ok(ScanResult {
                        device,
                        signal_strength: args.RawSignalStrengthInDBm()?,
                    }));
                }
                Ok(())
            },
        ))?;

        let stopped = watcher.Stopped(&TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let status = args.Error()?;
                    if status != BluetoothError::Success {
                        let _ = tx.send(Err(BleError::ScanFailed(format!("{:?}", status))));
                    }
                }
                Ok(())
            },
        ))?;

        watcher.Start()?;
        info!("Advertisement watcher started");

        let registration = Registration::new(move || {
            info!("Stopping BLE scan...");
            let _ = watcher.Stop();
            let _ = watcher.RemoveReceived(received);
            let _ = watcher.RemoveStopped(stopped);
        });
        Ok(channel_stream(rx, registration))
    }

    fn observe_connection_state(&self, device: &DeviceHandle) -> ConnectionStateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let registered: Arc<Mutex<Option<(BluetoothLEDevice, i64)>>> = Arc::default();

        let slot = registered.clone();
        let address = device.address;
        let task = tokio::spawn(async move {
            let device = match open_device(address).await {
                Ok(device) => device,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let handler = TypedEventHandler::new(
                move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                    if let Some(dev) = dev.as_ref() {
                        let state = match dev.ConnectionStatus()? {
                            BluetoothConnectionStatus::Connected => ConnectionState::Connected,
                            _ => ConnectionState::Disconnected,
                        };
                        let _ = tx.send(Ok(state));
                    }
                    Ok(())
                },
            );
            match device.ConnectionStatusChanged(&handler) {
                Ok(token) => {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some((device, token))
                }
                Err(e) => warn!("Failed to observe connection status: {}", e),
            }
        });

        let registration = Registration::new(move || {
            task.abort();
            if let Some((device, token)) = registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
        });
        channel_stream(rx, registration)
    }

    fn establish_connection(&self, device: &DeviceHandle, auto_connect: bool) -> ConnectionStream {
        let start = Link::Pending {
            address: device.address,
            auto_connect,
        };

        stream::unfold(start, |link| async move {
            match link {
                Link::Pending {
                    address,
                    auto_connect,
                } => match connect(address, auto_connect).await {
                    Ok((connection, lost)) => {
                        let handle: Arc<dyn GattConnection> = connection.clone();
                        Some((Ok(handle), Link::Up { connection, lost }))
                    }
                    Err(e) => Some((Err(e), Link::Down)),
                },
                Link::Up {
                    connection,
                    mut lost,
                } => {
                    lost.next().await;
                    info!("Link to {:#X} lost", connection.address);
                    connection.close();
                    Some((Err(BleError::Disconnected), Link::Down))
                }
                Link::Down => None,
            }
        })
        .boxed()
    }

    fn bond_state_changes(&self) -> BondStateStream {
        broadcast_stream(self.bond_events.subscribe())
    }

    async fn create_bond(&self, device: &DeviceHandle) -> Result<(), BleError> {
        let le_device = open_device(device.address).await?;
        let pairing = le_device.DeviceInformation()?.Pairing()?;

        if pairing.IsPaired()? {
            info!("{} already paired", device);
            self.publish_bond(device, BondState::Bonded);
            return Ok(());
        }
        if !pairing.CanPair()? {
            return Err(BleError::BondingFailed(format!("{} cannot pair", device)));
        }

        self.publish_bond(device, BondState::Bonding);
        let result = pairing.PairAsync()?.await?;
        let status = result.Status()?;
        info!("Pairing result for {}: {:?}", device, status);

        let state = if status == DevicePairingResultStatus::Paired
            || status == DevicePairingResultStatus::AlreadyPaired
        {
            BondState::Bonded
        } else {
            BondState::None
        };
        self.publish_bond(device, state);
        Ok(())
    }
}

enum Link {
    Pending {
        address: u64,
        auto_connect: bool,
    },
    Up {
        connection: Arc<WinRtConnection>,
        lost: BoxStream<'static, ()>,
    },
    Down,
}

async fn connect(
    address: u64,
    auto_connect: bool,
) -> Result<(Arc<WinRtConnection>, BoxStream<'static, ()>), BleError> {
    let device = open_device(address).await?;
    info!("Device opened: {:?}", device.Name()?);

    let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
    session.SetMaintainConnection(auto_connect)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let token = device.ConnectionStatusChanged(&TypedEventHandler::new(
        move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    let _ = tx.send(());
                }
            }
            Ok(())
        },
    ))?;
    let watched = device.clone();
    let lost = channel_stream(
        rx,
        Registration::new(move || {
            let _ = watched.RemoveConnectionStatusChanged(token);
        }),
    );

    let connection = Arc::new(WinRtConnection::open(address, device, session).await?);
    Ok((connection, lost))
}

/// GATT access to the counter service of one device.
pub struct WinRtConnection {
    address: u64,
    device: BluetoothLEDevice,
    session: GattSession,
    service: GattDeviceService,
    characteristics: HashMap<Uuid, GattCharacteristic>,
}

impl WinRtConnection {
    async fn open(
        address: u64,
        device: BluetoothLEDevice,
        session: GattSession,
    ) -> Result<Self, BleError> {
        use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

        let services = device
            .GetGattServicesForUuidWithCacheModeAsync(guid(SERVICE_UUID), BluetoothCacheMode::Uncached)?
            .await?;
        check_status(SERVICE_UUID, services.Status()?, None)?;

        let services = services.Services()?;
        if services.Size()? == 0 {
            return Err(BleError::ConnectionFailed(
                "counter service not found".to_string(),
            ));
        }
        let service = services.GetAt(0)?;
        let access = service.RequestAccessAsync()?.await?;
        debug!("Service access status: {:?}", access);

        let result = service.GetCharacteristicsAsync()?.await?;
        check_status(SERVICE_UUID, result.Status()?, None)?;

        let found = result.Characteristics()?;
        let mut characteristics = HashMap::new();
        for i in 0..found.Size()? {
            let characteristic = found.GetAt(i)?;
            let uuid = Uuid::from_u128(characteristic.Uuid()?.to_u128());
            characteristics.insert(uuid, characteristic);
        }
        info!("Found {} characteristics", characteristics.len());

        Ok(Self {
            address,
            device,
            session,
            service,
            characteristics,
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&GattCharacteristic, BleError> {
        self.characteristics
            .get(&uuid)
            .ok_or(BleError::CharacteristicNotFound(uuid))
    }

    fn close(&self) {
        let _ = self.service.Close();
        let _ = self.session.Close();
        let _ = self.device.Close();
    }
}

#[async_trait]
impl GattConnection for WinRtConnection {
    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError> {
        // Windows negotiates the MTU itself; report what it settled on.
        let negotiated = self.session.MaxPduSize()?;
        debug!("Requested MTU {}, link uses {}", mtu, negotiated);
        Ok(negotiated)
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        let result = self
            .characteristic(uuid)?
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let protocol_error = result.ProtocolError().and_then(|e| e.Value()).ok();
        check_status(uuid, result.Status()?, protocol_error)?;
        read_buffer(&result.Value()?)
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<Vec<u8>, BleError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;

        let result = self
            .characteristic(uuid)?
            .WriteValueWithResultAsync(&buffer)?
            .await?;
        let protocol_error = result.ProtocolError().and_then(|e| e.Value()).ok();
        check_status(uuid, result.Status()?, protocol_error)?;
        Ok(value.to_vec())
    }

    async fn setup_notification(&self, uuid: Uuid) -> Result<NotificationStream, BleError> {
        let characteristic = self.characteristic(uuid)?.clone();

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        check_status(uuid, status, None)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = characteristic.ValueChanged(&TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let _ = tx.send(read_buffer(&args.CharacteristicValue()?));
                }
                Ok(())
            },
        ))?;
        info!("Notifications enabled on {}", uuid);

        let registration = Registration::new(move || {
            let _ = characteristic.RemoveValueChanged(token);
            let _ = characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            );
        });
        Ok(channel_stream(rx, registration))
    }
}

/// Maps adapter availability onto the required permissions. Windows has no
/// runtime prompt for Bluetooth or location.
pub struct WinRtPermissionGate;

#[async_trait]
impl PermissionGate for WinRtPermissionGate {
    async fn request(&self, permissions: &[Permission]) -> Vec<PermissionGrant> {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(op) => op.await.ok(),
            Err(_) => None,
        };
        let Some(adapter) = adapter else {
            error!("No Bluetooth adapter available");
            return permissions.iter().copied().map(PermissionGrant::denied).collect();
        };

        let radio_on = match adapter.GetRadioAsync() {
            Ok(op) => op
                .await
                .and_then(|radio| radio.State())
                .map(|state| state == RadioState::On)
                .unwrap_or(false),
            Err(_) => false,
        };
        let low_energy = adapter.IsLowEnergySupported().unwrap_or(false);
        debug!("Adapter radio on: {}, LE supported: {}", radio_on, low_energy);

        permissions
            .iter()
            .map(|permission| match permission {
                Permission::CoarseLocation => PermissionGrant::granted(*permission),
                Permission::Bluetooth if radio_on => PermissionGrant::granted(*permission),
                Permission::BluetoothAdmin if low_energy => PermissionGrant::granted(*permission),
                _ => PermissionGrant::denied(*permission),
            })
            .collect()
    }
}
