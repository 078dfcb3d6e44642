//! Screen state, folded from the service's events.

use crate::domain::models::{
    AppEvent, BondState, ConnectionState, DeviceHandle, MessageSeverity, ScanOutcome,
    StatusMessage,
};
use crate::infrastructure::bluetooth::protocol::DEFAULT_MTU;
use std::time::{Duration, Instant};

pub const PERMISSIONS_DENIED_TOAST: &str = "Required permissions not granted! We need them all!!!";
pub const NO_DEVICE_TOAST: &str = "No device found!";
pub const TOAST_DURATION: Duration = Duration::from_millis(3500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPhase {
    Pending,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct ScreenState {
    pub permissions: PermissionPhase,
    pub connection: ConnectionState,
    pub device: Option<DeviceHandle>,
    pub counter: Option<u8>,
    pub mtu: u16,
    pub bond: BondState,
    pub scanning: bool,
    pub status: Option<StatusMessage>,
    toasts: Vec<Toast>,
    close_at: Option<Instant>,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            permissions: PermissionPhase::Pending,
            connection: ConnectionState::Idle,
            device: None,
            counter: None,
            mtu: DEFAULT_MTU,
            bond: BondState::None,
            scanning: false,
            status: None,
            toasts: Vec::new(),
            close_at: None,
        }
    }
}

impl ScreenState {
    pub fn apply(&mut self, event: AppEvent, now: Instant) {
        match event {
            AppEvent::PermissionsGranted => self.permissions = PermissionPhase::Granted,
            AppEvent::PermissionsDenied(_) => {
                self.permissions = PermissionPhase::Denied;
                self.toast(PERMISSIONS_DENIED_TOAST, now);
                self.close_at = Some(now + TOAST_DURATION);
            }
            AppEvent::ScanStarted => self.scanning = true,
            AppEvent::ScanFinished(outcome) => {
                self.scanning = false;
                match outcome {
                    ScanOutcome::Selected(device) => self.device = Some(device),
                    ScanOutcome::NotFound => self.toast(NO_DEVICE_TOAST, now),
                    ScanOutcome::Failed(_) => {}
                }
            }
            AppEvent::ConnectionState(state) => {
                self.connection = state;
                if state == ConnectionState::Disconnected {
                    self.device = None;
                }
            }
            AppEvent::MtuChanged(mtu) => self.mtu = mtu,
            AppEvent::CounterValue(value) => self.counter = Some(value),
            AppEvent::BondState(state) => self.bond = state,
            AppEvent::LogMessage(message) => self.status = Some(message),
        }
    }

    fn toast(&mut self, message: &str, now: Instant) {
        self.toasts.push(Toast {
            message: message.to_string(),
            expires_at: now + TOAST_DURATION,
        });
    }

    /// Drop expired toasts.
    pub fn expire(&mut self, now: Instant) {
        self.toasts.retain(|toast| toast.expires_at > now);
    }

    pub fn toasts(&self) -> &[Toast] {
        &self.toasts
    }

    /// The screen finishes once the permission toast has been shown.
    pub fn should_close(&self, now: Instant) -> bool {
        self.close_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn can_scan(&self) -> bool {
        self.permissions == PermissionPhase::Granted
    }

    pub fn can_write(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn counter_text(&self) -> String {
        self.counter
            .map(|value| value.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn status_is_error(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.severity == MessageSeverity::Error)
            .unwrap_or(false)
    }
}
