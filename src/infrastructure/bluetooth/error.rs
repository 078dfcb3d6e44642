//! BLE error kinds and their classification.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum BleError {
    /// The peripheral refused a characteristic operation, typically because
    /// the link is not authenticated.
    #[error("characteristic {uuid} access failed: {reason}")]
    CharacteristicAccess { uuid: Uuid, reason: String },

    #[error("GATT operation timed out: {0}")]
    Timeout(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("characteristic value is empty")]
    EmptyPayload,

    #[error("bonding failed: {0}")]
    BondingFailed(String),

    #[error("platform error: {0}")]
    Platform(String),
}

impl BleError {
    /// Access errors and callback timeouts on a characteristic mean the
    /// peripheral wants an authenticated (bonded) link.
    pub fn requires_bonding(&self) -> bool {
        matches!(self, Self::CharacteristicAccess { .. } | Self::Timeout(_))
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for BleError {
    fn from(error: windows::core::Error) -> Self {
        Self::Platform(error.to_string())
    }
}

/// GATT operations whose failure may call for bonding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    Read,
    Write,
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// What to do about a failed read or write.
#[derive(Debug, Clone)]
pub enum GattFailure {
    BondingRequired(BleError),
    Other(BleError),
}

impl GattFailure {
    pub fn classify(error: BleError) -> Self {
        if error.requires_bonding() {
            Self::BondingRequired(error)
        } else {
            Self::Other(error)
        }
    }
}
