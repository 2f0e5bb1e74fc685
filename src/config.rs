//! Device configuration
//!
//! Static per-device resources: bar sizes, rotation capabilities, which
//! hardware keys exist and key timing. Loaded once from TOML at startup;
//! runtime tunables live in [`crate::settings`] instead.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};
use crate::geometry::Rotation;

/// Hardware keys present on the device (bit mask)
pub mod hardware_keys {
    pub const HOME: u32 = 0x01;
    pub const BACK: u32 = 0x02;
    pub const MENU: u32 = 0x04;
    pub const ASSIST: u32 = 0x08;
    pub const APP_SWITCH: u32 = 0x10;
}

/// Screen layout family chosen from display size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiLayout {
    /// Pick from the shortest side in dp
    #[default]
    Auto,
    Phone,
    Phablet,
    Tablet,
}

/// What a long press on power does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongPressOnPower {
    Nothing,
    #[default]
    GlobalActions,
    ShutOff,
    ShutOffNoConfirm,
}

/// Display and rotation resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_true")]
    pub has_navigation_bar: bool,
    #[serde(default = "default_status_bar_height")]
    pub status_bar_height: i32,
    #[serde(default = "default_nav_height")]
    pub navigation_bar_height: i32,
    #[serde(default = "default_nav_height_landscape")]
    pub navigation_bar_height_landscape: i32,
    #[serde(default = "default_nav_width")]
    pub navigation_bar_width: i32,
    #[serde(default)]
    pub reverse_default_rotation: bool,
    #[serde(default)]
    pub allow_all_rotations: bool,
    #[serde(default = "default_true")]
    pub support_auto_rotation: bool,
    /// Rotation forced while the lid is open (none = no preference)
    #[serde(default)]
    pub lid_open_rotation: Option<Rotation>,
    #[serde(default)]
    pub lid_controls_sleep: bool,
    #[serde(default)]
    pub car_dock_rotation: Option<Rotation>,
    #[serde(default)]
    pub desk_dock_rotation: Option<Rotation>,
    #[serde(default = "default_true")]
    pub car_dock_enables_accelerometer: bool,
    #[serde(default = "default_true")]
    pub desk_dock_enables_accelerometer: bool,
    /// Rotation forced while HDMI is plugged (none = landscape)
    #[serde(default)]
    pub hdmi_rotation: Option<Rotation>,
    #[serde(default = "default_true")]
    pub hdmi_rotation_lock: bool,
    #[serde(default)]
    pub device_hardware_keys: u32,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_density")]
    pub density_dpi: i32,
    #[serde(default)]
    pub ui_layout: UiLayout,
    /// Launch the dock home activity when entering car/desk mode
    #[serde(default = "default_true")]
    pub enable_car_dock_home: bool,
    #[serde(default)]
    pub enable_desk_dock_home: bool,
}

fn default_true() -> bool { true }
fn default_status_bar_height() -> i32 { 50 }
fn default_nav_height() -> i32 { 96 }
fn default_nav_height_landscape() -> i32 { 80 }
fn default_nav_width() -> i32 { 80 }
fn default_density() -> i32 { 320 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            has_navigation_bar: true,
            status_bar_height: default_status_bar_height(),
            navigation_bar_height: default_nav_height(),
            navigation_bar_height_landscape: default_nav_height_landscape(),
            navigation_bar_width: default_nav_width(),
            reverse_default_rotation: false,
            allow_all_rotations: false,
            support_auto_rotation: true,
            lid_open_rotation: None,
            lid_controls_sleep: false,
            car_dock_rotation: None,
            desk_dock_rotation: None,
            car_dock_enables_accelerometer: true,
            desk_dock_enables_accelerometer: true,
            hdmi_rotation: None,
            hdmi_rotation_lock: true,
            device_hardware_keys: 0,
            headless: false,
            density_dpi: default_density(),
            ui_layout: UiLayout::Auto,
            enable_car_dock_home: true,
            enable_desk_dock_home: false,
        }
    }
}

impl DeviceConfig {
    pub fn has_hardware_key(&self, key: u32) -> bool {
        self.device_hardware_keys & key != 0
    }
}

/// Key timing and behavior resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_timeout_ms")]
    pub long_press_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub global_action_key_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub key_repeat_timeout_ms: u64,
    /// Delay between media key repeats once the repeat has started
    #[serde(default = "default_key_repeat_delay_ms")]
    pub key_repeat_delay_ms: u64,
    #[serde(default = "default_true")]
    pub screenshot_chord_enabled: bool,
    #[serde(default)]
    pub long_press_on_power: LongPressOnPower,
    /// Allow users to remap hardware key behaviors from settings
    #[serde(default)]
    pub hardware_key_rebinding: bool,
    #[serde(default)]
    pub enable_shift_menu_bug_reports: bool,
    #[serde(default = "default_back_kill_timeout_ms")]
    pub back_kill_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 { 500 }
fn default_key_repeat_delay_ms() -> u64 { 50 }
fn default_back_kill_timeout_ms() -> u64 { 2000 }

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            long_press_timeout_ms: default_timeout_ms(),
            global_action_key_timeout_ms: default_timeout_ms(),
            key_repeat_timeout_ms: default_timeout_ms(),
            key_repeat_delay_ms: default_key_repeat_delay_ms(),
            screenshot_chord_enabled: true,
            long_press_on_power: LongPressOnPower::GlobalActions,
            hardware_key_rebinding: false,
            enable_shift_menu_bug_reports: false,
            back_kill_timeout_ms: default_back_kill_timeout_ms(),
        }
    }
}

/// System chrome timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromeConfig {
    /// How long a hidden navigation bar stays forced visible after a touch
    #[serde(default = "default_force_clear_ms")]
    pub force_clear_nav_duration_ms: u64,
}

fn default_force_clear_ms() -> u64 { 1000 }

impl Default for ChromeConfig {
    fn default() -> Self {
        Self { force_clear_nav_duration_ms: default_force_clear_ms() }
    }
}

/// Complete device configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub chrome: ChromeConfig,
}

impl PolicyConfig {
    /// Default location, next to the other shell state
    pub fn default_path() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(|home| {
            PathBuf::from(home).join(".config/phone-policy/policy.toml")
        })
    }

    /// Load config from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = Self::from_toml(&contents)?;
                tracing::info!("Loaded policy config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No policy config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(PolicyError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match toml::to_string_pretty(self) {
            Ok(text) => {
                if let Err(e) = fs::write(path, text) {
                    tracing::warn!("Failed to save policy config: {:?}", e);
                } else {
                    tracing::info!("Saved policy config to {:?}", path);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize policy config: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = PolicyConfig::from_toml("").unwrap();
        assert!(config.device.has_navigation_bar);
        assert_eq!(config.input.long_press_timeout_ms, 500);
        assert_eq!(config.chrome.force_clear_nav_duration_ms, 1000);
        assert_eq!(config.input.long_press_on_power, LongPressOnPower::GlobalActions);
    }

    #[test]
    fn test_partial_sections() {
        let config = PolicyConfig::from_toml(
            r#"
            [device]
            lid_open_rotation = "90"
            device_hardware_keys = 0x1f
            ui_layout = "tablet"

            [input]
            long_press_on_power = "shut_off_no_confirm"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.lid_open_rotation, Some(Rotation::Rot90));
        assert!(config.device.has_hardware_key(hardware_keys::ASSIST));
        assert_eq!(config.device.ui_layout, UiLayout::Tablet);
        assert_eq!(config.input.long_press_on_power, LongPressOnPower::ShutOffNoConfirm);
        assert_eq!(config.device.status_bar_height, 50);
    }

    #[test]
    fn test_bad_toml_is_error() {
        assert!(PolicyConfig::from_toml("[device]\nheadless = 3").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = PolicyConfig::load(Path::new("/nonexistent/policy.toml")).unwrap();
        assert!(!config.device.headless);
    }
}
