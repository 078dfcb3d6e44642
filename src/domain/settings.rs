use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Peripheral identifiers and session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_counter_uuid")]
    pub counter_char_uuid: Uuid,
    #[serde(default = "default_trigger_uuid")]
    pub trigger_char_uuid: Uuid,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_trigger_value")]
    pub trigger_value: Vec<u8>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            counter_char_uuid: default_counter_uuid(),
            trigger_char_uuid: default_trigger_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            requested_mtu: default_requested_mtu(),
            auto_connect: default_true(),
            trigger_value: default_trigger_value(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_counter".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_counter_uuid() -> Uuid {
    protocol::COUNTER_CHAR_UUID
}
fn default_trigger_uuid() -> Uuid {
    protocol::TRIGGER_CHAR_UUID
}
fn default_scan_timeout_ms() -> u64 {
    protocol::SCAN_TIMEOUT_MS
}
fn default_requested_mtu() -> u16 {
    protocol::MAX_MTU
}
fn default_trigger_value() -> Vec<u8> {
    protocol::TRIGGER_VALUE.to_vec()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Loads settings from `path`, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleCounter");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ble_counter_settings_{}_{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir.join("settings.json")
    }

    #[test]
    fn test_defaults_carry_wire_identifiers() {
        let ble = BleSettings::default();
        assert_eq!(
            ble.service_uuid.to_string(),
            "795090c7-420d-4048-a24e-18e60180e23c"
        );
        assert_eq!(
            ble.counter_char_uuid.to_string(),
            "31517c58-66bf-470c-b662-e352a6c80cba"
        );
        assert_eq!(
            ble.trigger_char_uuid.to_string(),
            "0b89d2d4-0ea6-4141-86bb-0c5fb91ab14a"
        );
        assert_eq!(ble.scan_timeout_ms, 5000);
        assert_eq!(ble.requested_mtu, 517);
        assert_eq!(ble.trigger_value, vec![0]);
        assert!(ble.auto_connect);
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "ble": { "scan_timeout_ms": 1500 } }"#).unwrap();
        assert_eq!(settings.ble.scan_timeout_ms, 1500);
        assert_eq!(settings.ble.requested_mtu, 517);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = scratch_path("missing");
        let _ = fs::remove_file(&path);
        let service = SettingsService::from_path(path);
        assert_eq!(service.get().ble.scan_timeout_ms, 5000);
    }

    #[test]
    fn test_save_and_reload() {
        let path = scratch_path("roundtrip");
        let mut service = SettingsService::from_path(path.clone());
        service.settings.ble.requested_mtu = 247;
        service.settings.log_settings.level = "debug".to_string();
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().ble.requested_mtu, 247);
        assert_eq!(reloaded.get().log_settings.level, "debug");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let path = scratch_path("corrupt");
        fs::write(&path, "{ not json").unwrap();
        let service = SettingsService::from_path(path.clone());
        assert_eq!(service.get().ble.requested_mtu, 517);
        let _ = fs::remove_file(path);
    }
}
