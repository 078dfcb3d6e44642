use ble_counter::domain::settings::SettingsService;
use ble_counter::infrastructure::bluetooth::backend::BleBackend;
use ble_counter::infrastructure::bluetooth::service::{BluetoothService, SessionConfig};
use ble_counter::infrastructure::bluetooth::simulated::SimulatedBackend;
use ble_counter::infrastructure::logging;
use ble_counter::infrastructure::permissions::{PermissionGate, StaticPermissionGate};
use ble_counter::presentation::app::BleCounterApp;
use eframe::egui;
use std::sync::Arc;

type Platform = (Arc<dyn BleBackend>, Arc<dyn PermissionGate>);

fn platform(simulated: bool) -> anyhow::Result<Platform> {
    if simulated {
        tracing::info!("Using simulated counter peripheral");
        return Ok((
            Arc::new(SimulatedBackend::default()),
            Arc::new(StaticPermissionGate::granting_all()),
        ));
    }

    #[cfg(windows)]
    {
        use ble_counter::infrastructure::bluetooth::winrt::{WinRtBackend, WinRtPermissionGate};
        Ok((Arc::new(WinRtBackend::new()), Arc::new(WinRtPermissionGate)))
    }
    #[cfg(not(windows))]
    {
        anyhow::bail!("No Bluetooth backend for this platform; run with --simulated")
    }
}

fn main() -> anyhow::Result<()> {
    let simulated = std::env::args().skip(1).any(|arg| arg == "--simulated");

    let settings = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting BLE Counter");
    tracing::debug!("Settings loaded from {}", settings.path().display());
    if !settings.path().exists() {
        if let Err(e) = settings.save() {
            tracing::warn!("Could not write default settings: {}", e);
        }
    }

    let (backend, permissions) = platform(simulated)?;
    let service = BluetoothService::spawn(
        backend,
        permissions,
        SessionConfig::from_settings(&settings.get().ble),
    )?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([520.0, 640.0])
            .with_title("BLE Counter"),
        ..Default::default()
    };

    eframe::run_native(
        "BLE Counter",
        options,
        Box::new(|cc| Ok(Box::new(BleCounterApp::new(cc, service)))),
    )
    .map_err(|e| anyhow::anyhow!("{}", e))
}
