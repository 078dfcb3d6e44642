use std::fmt;

/// A peripheral found by a scan.
///
/// Identity is the Bluetooth address; the advertised name is informational
/// and may change between advertisements.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub address: u64,
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(address: u64, name: Option<String>) -> Self {
        Self { address, name }
    }

    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown",
        }
    }

    /// Address formatted as `AA:BB:CC:DD:EE:FF`.
    pub fn mac_address(&self) -> String {
        let bytes = self.address.to_be_bytes();
        bytes[2..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceHandle {}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.display_name(), self.mac_address())
    }
}

/// One advertisement matching the scan filter.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub device: DeviceHandle,
    pub signal_strength: i16,
}

/// How a scan window ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Selected(DeviceHandle),
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// OS pairing state as delivered by bond-state broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    /// Not bonded: either never paired, cleared, or pairing failed.
    None,
    Bonding,
    Bonded,
}

impl BondState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::None | Self::Bonded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondStateChange {
    pub device: DeviceHandle,
    pub state: BondState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    CoarseLocation,
    Bluetooth,
    BluetoothAdmin,
}

/// Everything the screen needs before it may scan.
pub const REQUIRED_PERMISSIONS: [Permission; 3] = [
    Permission::CoarseLocation,
    Permission::Bluetooth,
    Permission::BluetoothAdmin,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGrant {
    pub permission: Permission,
    pub status: PermissionStatus,
}

impl PermissionGrant {
    pub fn granted(permission: Permission) -> Self {
        Self {
            permission,
            status: PermissionStatus::Granted,
        }
    }

    pub fn denied(permission: Permission) -> Self {
        Self {
            permission,
            status: PermissionStatus::Denied,
        }
    }
}

/// Requests from the screen to the Bluetooth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    WriteTrigger,
    Disconnect,
}

/// Notifications from the Bluetooth service to the screen.
#[derive(Debug, Clone)]
pub enum AppEvent {
    PermissionsGranted,
    PermissionsDenied(Vec<Permission>),
    ScanStarted,
    ScanFinished(ScanOutcome),
    ConnectionState(ConnectionState),
    MtuChanged(u16),
    CounterValue(u8),
    BondState(BondState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
