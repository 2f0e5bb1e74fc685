//! Rotation resolver
//!
//! Decides which of the four physical rotations the display should use.
//! Everything the decision depends on is captured in a [`RotationInputs`]
//! snapshot so that [`resolve_rotation`] stays a pure function.

use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::geometry::{Rotation, ScreenOrientation};

/// Which physical rotation is portrait, landscape and so on.
///
/// Derived once from the natural display size at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrientationMapping {
    pub landscape: Rotation,
    pub seascape: Rotation,
    pub portrait: Rotation,
    pub upside_down: Rotation,
}

impl Default for OrientationMapping {
    fn default() -> Self {
        Self::from_display(0, 1, false)
    }
}

impl OrientationMapping {
    pub fn from_display(width: i32, height: i32, reverse_default_rotation: bool) -> Self {
        if width > height {
            // Landscape-natural panel
            let (portrait, upside_down) = if reverse_default_rotation {
                (Rotation::Rot90, Rotation::Rot270)
            } else {
                (Rotation::Rot270, Rotation::Rot90)
            };
            Self { landscape: Rotation::Rot0, seascape: Rotation::Rot180, portrait, upside_down }
        } else {
            let (landscape, seascape) = if reverse_default_rotation {
                (Rotation::Rot270, Rotation::Rot90)
            } else {
                (Rotation::Rot90, Rotation::Rot270)
            };
            Self { portrait: Rotation::Rot0, upside_down: Rotation::Rot180, landscape, seascape }
        }
    }

    pub fn is_any_portrait(&self, rotation: Rotation) -> bool {
        rotation == self.portrait || rotation == self.upside_down
    }

    pub fn is_landscape_or_seascape(&self, rotation: Rotation) -> bool {
        rotation == self.landscape || rotation == self.seascape
    }
}

/// Dock state reported by the dock observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockMode {
    #[default]
    Undocked,
    Desk,
    Car,
    LeDesk,
    HeDesk,
}

impl DockMode {
    pub fn is_desk(self) -> bool {
        matches!(self, DockMode::Desk | DockMode::LeDesk | DockMode::HeDesk)
    }
}

/// UI mode reported by the UI mode manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMode {
    #[default]
    Normal,
    Car,
    Desk,
}

/// Lid switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LidState {
    #[default]
    Absent,
    Closed,
    Open,
}

/// User rotation preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRotationMode {
    /// Follow the accelerometer
    Free,
    #[default]
    Locked,
}

/// Mutable device state that feeds the resolver
#[derive(Debug, Clone, Serialize)]
pub struct RotationState {
    pub mapping: OrientationMapping,
    pub lid: LidState,
    pub dock_mode: DockMode,
    pub ui_mode: UiMode,
    pub hdmi_plugged: bool,
    pub wifi_display_connected: bool,
    /// Rotation forced while an external display is connected
    pub hdmi_rotation: Rotation,
    pub user_rotation_mode: UserRotationMode,
    pub user_rotation: Rotation,
    /// Allowed angle bits, -1 = device default
    pub user_rotation_angles: i64,
    pub current_app_orientation: ScreenOrientation,
    /// Last rotation reported by the window server
    pub current_rotation: Rotation,
    pub sensor_enabled: bool,
    /// Latest sensor proposal, if any
    pub proposed_rotation: Option<Rotation>,
    pub screen_on_early: bool,
}

impl Default for RotationState {
    fn default() -> Self {
        let mapping = OrientationMapping::default();
        Self {
            mapping,
            lid: LidState::Absent,
            dock_mode: DockMode::Undocked,
            ui_mode: UiMode::Normal,
            hdmi_plugged: false,
            wifi_display_connected: false,
            hdmi_rotation: mapping.landscape,
            user_rotation_mode: UserRotationMode::Locked,
            user_rotation: Rotation::Rot0,
            user_rotation_angles: -1,
            current_app_orientation: ScreenOrientation::Unspecified,
            current_rotation: Rotation::Rot0,
            sensor_enabled: false,
            proposed_rotation: None,
            screen_on_early: false,
        }
    }
}

/// Device resources the resolver reads
#[derive(Debug, Clone, Copy)]
pub struct RotationConfig {
    pub lid_open_rotation: Option<Rotation>,
    pub car_dock_rotation: Option<Rotation>,
    pub desk_dock_rotation: Option<Rotation>,
    pub car_dock_enables_accelerometer: bool,
    pub desk_dock_enables_accelerometer: bool,
    pub hdmi_rotation_lock: bool,
    pub allow_all_rotations: bool,
}

impl From<&DeviceConfig> for RotationConfig {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            lid_open_rotation: device.lid_open_rotation,
            car_dock_rotation: device.car_dock_rotation,
            desk_dock_rotation: device.desk_dock_rotation,
            car_dock_enables_accelerometer: device.car_dock_enables_accelerometer,
            desk_dock_enables_accelerometer: device.desk_dock_enables_accelerometer,
            hdmi_rotation_lock: device.hdmi_rotation_lock,
            allow_all_rotations: device.allow_all_rotations,
        }
    }
}

/// Consistent snapshot taken under the rotation lock
#[derive(Debug, Clone)]
pub struct RotationInputs {
    pub state: RotationState,
    pub config: RotationConfig,
}

/// Allowed-angle mask with the device default filled in
pub fn effective_rotation_angles(angles: i64, allow_all_rotations: bool) -> u32 {
    if angles < 0 {
        if allow_all_rotations {
            1 | 2 | 4 | 8
        } else {
            // Everything but upside down
            1 | 2 | 8
        }
    } else {
        (angles & 0xf) as u32
    }
}

/// The rotation the device would like before the app's request is applied
fn preferred_rotation(inputs: &RotationInputs, orientation: ScreenOrientation, last: Rotation) -> Option<Rotation> {
    let state = &inputs.state;
    let config = &inputs.config;
    let sensor_rotation = state.proposed_rotation.unwrap_or(last);

    if state.lid == LidState::Open {
        if let Some(rotation) = config.lid_open_rotation {
            return Some(rotation);
        }
    }

    if state.dock_mode == DockMode::Car
        && (config.car_dock_enables_accelerometer || config.car_dock_rotation.is_some())
    {
        return if config.car_dock_enables_accelerometer {
            Some(sensor_rotation)
        } else {
            config.car_dock_rotation
        };
    }

    if state.dock_mode.is_desk()
        && (config.desk_dock_enables_accelerometer || config.desk_dock_rotation.is_some())
    {
        return if config.desk_dock_enables_accelerometer {
            Some(sensor_rotation)
        } else {
            config.desk_dock_rotation
        };
    }

    if (state.hdmi_plugged || state.wifi_display_connected) && config.hdmi_rotation_lock {
        return Some(state.hdmi_rotation);
    }

    let free_form = state.user_rotation_mode == UserRotationMode::Free
        && matches!(orientation, ScreenOrientation::User | ScreenOrientation::Unspecified);
    if free_form || orientation.follows_sensor() {
        let angles = effective_rotation_angles(state.user_rotation_angles, config.allow_all_rotations);
        return if angles & sensor_rotation.angle_bit() != 0 {
            Some(sensor_rotation)
        } else {
            Some(last)
        };
    }

    if state.user_rotation_mode == UserRotationMode::Locked && orientation != ScreenOrientation::NoSensor {
        return Some(state.user_rotation);
    }

    None
}

/// Pick the display rotation for the app's `orientation` request.
///
/// Always returns a concrete rotation.
pub fn resolve_rotation(inputs: &RotationInputs, orientation: ScreenOrientation, last: Rotation) -> Rotation {
    let mapping = &inputs.state.mapping;
    let preferred = preferred_rotation(inputs, orientation, last);
    let portrait = preferred.filter(|r| mapping.is_any_portrait(*r));
    let landscape = preferred.filter(|r| mapping.is_landscape_or_seascape(*r));

    match orientation {
        ScreenOrientation::Portrait => portrait.unwrap_or(mapping.portrait),
        ScreenOrientation::Landscape => landscape.unwrap_or(mapping.landscape),
        ScreenOrientation::ReversePortrait => portrait.unwrap_or(mapping.upside_down),
        ScreenOrientation::ReverseLandscape => landscape.unwrap_or(mapping.seascape),
        ScreenOrientation::SensorLandscape => landscape
            .or_else(|| Some(last).filter(|r| mapping.is_landscape_or_seascape(*r)))
            .unwrap_or(mapping.landscape),
        ScreenOrientation::SensorPortrait => portrait
            .or_else(|| Some(last).filter(|r| mapping.is_any_portrait(*r)))
            .unwrap_or(mapping.portrait),
        _ => preferred.unwrap_or(Rotation::Rot0),
    }
}

/// Can `rotation` be used for `orientation` without a configuration flip
pub fn rotation_has_compatible_metrics(
    mapping: &OrientationMapping,
    orientation: ScreenOrientation,
    rotation: Rotation,
) -> bool {
    match orientation {
        ScreenOrientation::Portrait | ScreenOrientation::ReversePortrait | ScreenOrientation::SensorPortrait => {
            mapping.is_any_portrait(rotation)
        }
        ScreenOrientation::Landscape
        | ScreenOrientation::ReverseLandscape
        | ScreenOrientation::SensorLandscape => mapping.is_landscape_or_seascape(rotation),
        _ => true,
    }
}

/// Whether the orientation sensor should run (screen state aside)
pub fn need_sensor_running(state: &RotationState, config: &RotationConfig) -> bool {
    if state.current_app_orientation.follows_sensor() {
        return true;
    }
    if (config.car_dock_enables_accelerometer && state.dock_mode == DockMode::Car)
        || (config.desk_dock_enables_accelerometer && state.dock_mode.is_desk())
    {
        return true;
    }
    // A locked user rotation keeps the sensor off
    state.user_rotation_mode != UserRotationMode::Locked
}

/// Sensor transition requested by [`update_orientation_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorChange {
    Enable,
    Disable,
}

/// Recompute sensor state; returns the change to apply, if any
pub fn update_orientation_listener(
    state: &mut RotationState,
    config: &RotationConfig,
    can_detect_orientation: bool,
) -> Option<SensorChange> {
    if !can_detect_orientation {
        return None;
    }
    let want = state.screen_on_early && need_sensor_running(state, config);
    match (want, state.sensor_enabled) {
        (true, false) => {
            state.sensor_enabled = true;
            Some(SensorChange::Enable)
        }
        (false, true) => {
            state.sensor_enabled = false;
            state.proposed_rotation = None;
            Some(SensorChange::Disable)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RotationInputs {
        RotationInputs { state: RotationState::default(), config: RotationConfig::from(&DeviceConfig::default()) }
    }

    #[test]
    fn test_mapping_portrait_natural() {
        let m = OrientationMapping::from_display(720, 1280, false);
        assert_eq!(m.portrait, Rotation::Rot0);
        assert_eq!(m.landscape, Rotation::Rot90);
        assert_eq!(m.seascape, Rotation::Rot270);
        let r = OrientationMapping::from_display(720, 1280, true);
        assert_eq!(r.landscape, Rotation::Rot270);
    }

    #[test]
    fn test_mapping_landscape_natural() {
        let m = OrientationMapping::from_display(1280, 800, false);
        assert_eq!(m.landscape, Rotation::Rot0);
        assert_eq!(m.portrait, Rotation::Rot270);
        assert_eq!(m.upside_down, Rotation::Rot90);
    }

    #[test]
    fn test_lid_forced_landscape_rejected_for_portrait_app() {
        let mut i = inputs();
        i.state.lid = LidState::Open;
        i.config.lid_open_rotation = Some(Rotation::Rot90);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Portrait, Rotation::Rot0), Rotation::Rot0);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Landscape, Rotation::Rot0), Rotation::Rot90);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot0), Rotation::Rot90);
    }

    #[test]
    fn test_sensor_filtered_by_angles() {
        let mut i = inputs();
        i.state.user_rotation_mode = UserRotationMode::Free;
        i.state.proposed_rotation = Some(Rotation::Rot180);
        // 180 not allowed by default
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot90), Rotation::Rot90);
        i.config.allow_all_rotations = true;
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot90), Rotation::Rot180);
        i.state.user_rotation_angles = 1;
        assert_eq!(resolve_rotation(&i, ScreenOrientation::User, Rotation::Rot90), Rotation::Rot90);
    }

    #[test]
    fn test_locked_user_rotation() {
        let mut i = inputs();
        i.state.user_rotation = Rotation::Rot90;
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot0), Rotation::Rot90);
        // NOSENSOR ignores the lock
        assert_eq!(resolve_rotation(&i, ScreenOrientation::NoSensor, Rotation::Rot90), Rotation::Rot0);
    }

    #[test]
    fn test_dock_overrides_hdmi() {
        let mut i = inputs();
        i.state.hdmi_plugged = true;
        i.state.hdmi_rotation = Rotation::Rot90;
        i.state.dock_mode = DockMode::Car;
        i.state.proposed_rotation = Some(Rotation::Rot270);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot0), Rotation::Rot270);
        i.state.dock_mode = DockMode::Undocked;
        assert_eq!(resolve_rotation(&i, ScreenOrientation::Unspecified, Rotation::Rot0), Rotation::Rot90);
    }

    #[test]
    fn test_sensor_landscape_keeps_last() {
        let mut i = inputs();
        i.state.proposed_rotation = Some(Rotation::Rot0);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::SensorLandscape, Rotation::Rot270), Rotation::Rot270);
        assert_eq!(resolve_rotation(&i, ScreenOrientation::SensorLandscape, Rotation::Rot0), Rotation::Rot90);
    }

    #[test]
    fn test_always_concrete() {
        let orientations = [
            ScreenOrientation::Unspecified,
            ScreenOrientation::Landscape,
            ScreenOrientation::Portrait,
            ScreenOrientation::User,
            ScreenOrientation::Behind,
            ScreenOrientation::Sensor,
            ScreenOrientation::NoSensor,
            ScreenOrientation::SensorLandscape,
            ScreenOrientation::SensorPortrait,
            ScreenOrientation::ReverseLandscape,
            ScreenOrientation::ReversePortrait,
            ScreenOrientation::FullSensor,
        ];
        let mut i = inputs();
        for mode in [UserRotationMode::Free, UserRotationMode::Locked] {
            i.state.user_rotation_mode = mode;
            for o in orientations {
                for last in Rotation::ALL {
                    let r = resolve_rotation(&i, o, last);
                    assert!(Rotation::ALL.contains(&r));
                    assert!(rotation_has_compatible_metrics(&i.state.mapping, o, r));
                }
            }
        }
    }

    #[test]
    fn test_sensor_listener_transitions() {
        let mut state = RotationState::default();
        let config = RotationConfig::from(&DeviceConfig::default());
        state.user_rotation_mode = UserRotationMode::Free;
        assert_eq!(update_orientation_listener(&mut state, &config, true), None);
        state.screen_on_early = true;
        assert_eq!(update_orientation_listener(&mut state, &config, true), Some(SensorChange::Enable));
        assert_eq!(update_orientation_listener(&mut state, &config, true), None);
        state.screen_on_early = false;
        assert_eq!(update_orientation_listener(&mut state, &config, true), Some(SensorChange::Disable));
        assert_eq!(update_orientation_listener(&mut state, &config, false), None);
    }
}
