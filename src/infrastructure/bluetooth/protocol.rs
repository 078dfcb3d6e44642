//! Counter Peripheral Protocol
//!
//! Identifiers and value encoding of the counter service exposed by the
//! peripheral.

use crate::infrastructure::bluetooth::error::BleError;
use std::time::Duration;
use uuid::Uuid;

/// Service UUID advertised by the peripheral; used as the scan filter.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x795090c7_420d_4048_a24e_18e60180e23c);

/// Counter characteristic: read and notify, one unsigned byte.
pub const COUNTER_CHAR_UUID: Uuid = Uuid::from_u128(0x31517c58_66bf_470c_b662_e352a6c80cba);

/// Trigger characteristic: writing to it increments the counter.
pub const TRIGGER_CHAR_UUID: Uuid = Uuid::from_u128(0x0b89d2d4_0ea6_4141_86bb_0c5fb91ab14a);

pub const SCAN_TIMEOUT_MS: u64 = 5_000;

/// ATT MTU every session starts with.
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU a central may request.
pub const MAX_MTU: u16 = 517;

/// Value written to the trigger characteristic.
pub const TRIGGER_VALUE: [u8; 1] = [0x00];

pub fn scan_timeout() -> Duration {
    Duration::from_millis(SCAN_TIMEOUT_MS)
}

/// Decode a counter value. Only the first byte is significant.
pub fn decode_counter(value: &[u8]) -> Result<u8, BleError> {
    value.first().copied().ok_or(BleError::EmptyPayload)
}
