//! BLE Scanner Module
//!
//! Finds the counter peripheral within a bounded scan window.

use crate::domain::models::{DeviceHandle, ScanOutcome};
use crate::infrastructure::bluetooth::backend::{BleBackend, ScanFilter, ScanStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace};

/// BLE Scanner for discovering counter peripherals
pub struct BleScanner {
    backend: Arc<dyn BleBackend>,
    filter: ScanFilter,
    timeout: Duration,
}

impl BleScanner {
    pub fn new(backend: Arc<dyn BleBackend>, filter: ScanFilter, timeout: Duration) -> Self {
        Self {
            backend,
            filter,
            timeout,
        }
    }

    /// Scan for one window and pick the device to connect to.
    ///
    /// `current` is the device already selected, if any; it is never picked
    /// again. The scan stops as soon as a device is selected, when the
    /// window elapses, or on the first scan error.
    pub async fn find_device(&self, current: Option<DeviceHandle>) -> ScanOutcome {
        info!(
            "Starting BLE scan for service UUID: {}",
            self.filter.service_uuid
        );

        let stream = match self.backend.scan(&self.filter).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                return ScanOutcome::Failed(e.to_string());
            }
        };

        match tokio::time::timeout(self.timeout, select_first_new(stream, current)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                info!("No new device within {:?}", self.timeout);
                ScanOutcome::NotFound
            }
        }
    }
}

async fn select_first_new(mut stream: ScanStream, current: Option<DeviceHandle>) -> ScanOutcome {
    while let Some(item) = stream.next().await {
        match item {
            Ok(result) if current.as_ref() == Some(&result.device) => {
                trace!("Skipping current device {}", result.device);
            }
            Ok(result) => {
                info!(
                    "Found {} ({} dBm)",
                    result.device, result.signal_strength
                );
                return ScanOutcome::Selected(result.device);
            }
            Err(e) => {
                error!("Scan failed: {}", e);
                return ScanOutcome::Failed(e.to_string());
            }
        }
    }

    ScanOutcome::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::BleError;
    use crate::infrastructure::bluetooth::protocol::{self, SERVICE_UUID};
    use crate::infrastructure::bluetooth::simulated::{
        Advertisement, SimulatedBackend, SimulatedConfig,
    };

    fn scanner_for(config: SimulatedConfig) -> (BleScanner, SimulatedBackend) {
        let backend = SimulatedBackend::new(config);
        let scanner = BleScanner::new(
            Arc::new(backend.clone()),
            ScanFilter::for_service(SERVICE_UUID),
            protocol::scan_timeout(),
        );
        (scanner, backend)
    }

    fn device(address: u64) -> DeviceHandle {
        DeviceHandle::new(address, Some(format!("Counter {}", address)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_first_match() {
        let (scanner, _) = scanner_for(SimulatedConfig {
            advertisements: vec![
                Advertisement::counter(device(1), Duration::from_millis(100)),
                Advertisement::counter(device(2), Duration::from_millis(100)),
            ],
            ..Default::default()
        });

        assert_eq!(
            scanner.find_device(None).await,
            ScanOutcome::Selected(device(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_current_device() {
        let (scanner, _) = scanner_for(SimulatedConfig {
            advertisements: vec![
                Advertisement::counter(device(1), Duration::from_millis(100)),
                Advertisement::counter(device(1), Duration::from_millis(100)),
                Advertisement::counter(device(2), Duration::from_millis(100)),
            ],
            ..Default::default()
        });

        assert_eq!(
            scanner.find_device(Some(device(1))).await,
            ScanOutcome::Selected(device(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_match() {
        let (scanner, _) = scanner_for(SimulatedConfig {
            advertisements: vec![Advertisement::counter(
                device(1),
                Duration::from_millis(100),
            )],
            ..Default::default()
        });

        let started = tokio::time::Instant::now();
        assert_eq!(
            scanner.find_device(Some(device(1))).await,
            ScanOutcome::NotFound
        );
        assert!(started.elapsed() >= Duration::from_millis(protocol::SCAN_TIMEOUT_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_after_window_is_not_selected() {
        let (scanner, _) = scanner_for(SimulatedConfig {
            advertisements: vec![Advertisement::counter(device(1), Duration::from_secs(6))],
            ..Default::default()
        });

        assert_eq!(scanner.find_device(None).await, ScanOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_error_terminates() {
        let (scanner, backend) = scanner_for(SimulatedConfig {
            advertisements: Vec::new(),
            scan_error: Some(BleError::ScanFailed("adapter off".to_string())),
            ..Default::default()
        });

        assert!(matches!(
            scanner.find_device(None).await,
            ScanOutcome::Failed(_)
        ));
        assert_eq!(backend.scan_count(), 1);
    }
}
