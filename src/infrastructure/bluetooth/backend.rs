//! Platform BLE boundary.
//!
//! Everything below these traits belongs to the host Bluetooth stack. The
//! streams they return are lazy and live as long as the caller holds them:
//! dropping a scan stream stops scanning, dropping a connection stream
//! tears the link down, and dropping a bond-state stream deregisters the
//! broadcast observer.

use crate::domain::models::{BondStateChange, ConnectionState, DeviceHandle, ScanResult};
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use uuid::Uuid;

pub type ScanStream = BoxStream<'static, Result<ScanResult, BleError>>;
pub type ConnectionStateStream = BoxStream<'static, Result<ConnectionState, BleError>>;
pub type ConnectionStream = BoxStream<'static, Result<Arc<dyn GattConnection>, BleError>>;
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>, BleError>>;
pub type BondStateStream = BoxStream<'static, BondStateChange>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// Advertisement filter and scan settings.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub mode: ScanMode,
}

impl ScanFilter {
    pub fn for_service(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            mode: ScanMode::LowLatency,
        }
    }
}

#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Start a filtered scan. Every matching advertisement is delivered,
    /// including repeats from the same device.
    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream, BleError>;

    /// Observe link state changes of `device`. Registration happens when
    /// this is called, not when the stream is first polled.
    fn observe_connection_state(&self, device: &DeviceHandle) -> ConnectionStateStream;

    /// Open a logical connection. The stream yields the connection handle
    /// once established and then stays pending for the life of the link; an
    /// error item means the link failed.
    fn establish_connection(&self, device: &DeviceHandle, auto_connect: bool)
        -> ConnectionStream;

    /// Register an observer for pairing-state broadcasts of all devices.
    /// Registration happens when this is called.
    fn bond_state_changes(&self) -> BondStateStream;

    /// Ask the OS to pair with `device`. Progress is reported only through
    /// [`BleBackend::bond_state_changes`].
    async fn create_bond(&self, device: &DeviceHandle) -> Result<(), BleError>;
}

/// A live GATT session with one peripheral.
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// Request `mtu` and return the value the link settled on.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError>;

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, BleError>;

    /// Write `value` and return the bytes the stack reports as written.
    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<Vec<u8>, BleError>;

    /// Enable notifications on `uuid`. They stay enabled while the returned
    /// stream is held.
    async fn setup_notification(&self, uuid: Uuid) -> Result<NotificationStream, BleError>;
}

/// Adapt a broadcast subscription into a stream. Dropping the stream drops
/// the receiver, which deregisters it from the sender.
pub fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Observer lagged; {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
