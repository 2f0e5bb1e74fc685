//! Device state feeding the rotation resolver
//!
//! Lid, external displays, dock and UI mode, the orientation sensor and the
//! user rotation lock. Every change is recorded under the rotation lock and
//! then turned into a window server rotation update once the lock is gone.

use tracing::{debug, info, warn};

use crate::geometry::{Rotation, ScreenOrientation};
use crate::input::keys::KeyCode;
use crate::policy::PhonePolicy;
use crate::rotation::{
    self, resolve_rotation, DockMode, LidState, RotationConfig, RotationInputs, SensorChange, UiMode,
    UserRotationMode,
};
use crate::settings::keys;

impl PhonePolicy {
    fn rotation_inputs(&self) -> RotationInputs {
        RotationInputs {
            state: self.rotation().clone(),
            config: RotationConfig::from(&self.config.device),
        }
    }

    /// Rotation the display should use for an app asking for `orientation`
    pub fn rotation_for_orientation(&self, orientation: ScreenOrientation, last: Rotation) -> Rotation {
        let inputs = self.rotation_inputs();
        let rotation = resolve_rotation(&inputs, orientation, last);
        debug!(?orientation, ?last, ?rotation, "Resolved rotation");
        rotation
    }

    pub fn rotation_has_compatible_metrics(&self, orientation: ScreenOrientation, rotation: Rotation) -> bool {
        let mapping = self.rotation().mapping;
        rotation::rotation_has_compatible_metrics(&mapping, orientation, rotation)
    }

    /// Orientation requested by the top app changed
    pub fn set_current_orientation(&self, orientation: ScreenOrientation) {
        let changed = {
            let mut state = self.rotation();
            std::mem::replace(&mut state.current_app_orientation, orientation) != orientation
        };
        if changed {
            debug!(?orientation, "App orientation changed");
            self.update_orientation_listener();
        }
    }

    /// Rotation the window server settled on
    pub fn set_rotation(&self, rotation: Rotation) {
        self.rotation().current_rotation = rotation;
        self.services.orientation.set_current_rotation(rotation);
    }

    /// Lock to `rotation`, or let the sensor decide
    pub fn set_user_rotation_mode(&self, mode: UserRotationMode, rotation: Rotation) {
        let store = &self.settings_store;
        let user = self.current_user();
        info!(?mode, ?rotation, "User rotation mode");
        match mode {
            UserRotationMode::Locked => {
                store.put_int(user, keys::USER_ROTATION, rotation.index() as i64);
                store.put_int(user, keys::ACCELEROMETER_ROTATION, 0);
            }
            UserRotationMode::Free => store.put_int(user, keys::ACCELEROMETER_ROTATION, 1),
        }
    }

    /// The orientation sensor proposed a new rotation
    pub fn on_proposed_rotation_changed(&self, rotation: Rotation) {
        let accepted = {
            let mut state = self.rotation();
            if state.sensor_enabled {
                state.proposed_rotation = Some(rotation);
            }
            state.sensor_enabled
        };
        if accepted {
            debug!(?rotation, "Sensor proposed rotation");
            self.update_rotation(false);
        } else {
            debug!(?rotation, "Ignoring proposal while the sensor is off");
        }
    }

    pub fn notify_lid_switch_changed(&self, lid_open: bool) {
        if self.config.device.headless {
            return;
        }
        let lid = if lid_open { LidState::Open } else { LidState::Closed };
        {
            let mut state = self.rotation();
            if state.lid == lid {
                return;
            }
            state.lid = lid;
        }
        info!(?lid, "Lid switch changed");
        self.apply_lid_switch_state();
        self.update_rotation(true);

        let now = self.now_ms();
        if lid_open {
            if self.keyguard_showing_and_not_hidden() {
                self.keyguard_call("on_wake_key", |k| k.on_wake_key_when_keyguard_showing(KeyCode::Power));
            } else {
                self.services.power.wake_up(now);
            }
        } else if !self.config.device.lid_controls_sleep {
            self.services.power.user_activity(now);
        }
    }

    /// Sleep right away when the lid is shut on a device whose lid controls sleep
    fn apply_lid_switch_state(&self) {
        let closed = self.rotation().lid == LidState::Closed;
        if closed && self.config.device.lid_controls_sleep {
            info!("Lid closed, going to sleep");
            self.services.power.go_to_sleep(self.now_ms());
        }
    }

    pub fn set_hdmi_plugged(&self, plugged: bool) {
        let changed = {
            let mut state = self.rotation();
            std::mem::replace(&mut state.hdmi_plugged, plugged) != plugged
        };
        if changed {
            info!(plugged, "HDMI plug changed");
            self.update_rotation(true);
        }
    }

    pub fn set_wifi_display_connected(&self, connected: bool) {
        let changed = {
            let mut state = self.rotation();
            std::mem::replace(&mut state.wifi_display_connected, connected) != connected
        };
        if changed {
            info!(connected, "Wireless display changed");
            self.update_rotation(true);
        }
    }

    pub fn set_dock_mode(&self, mode: DockMode) {
        let changed = {
            let mut state = self.rotation();
            std::mem::replace(&mut state.dock_mode, mode) != mode
        };
        if changed {
            info!(?mode, "Dock mode changed");
            self.update_orientation_listener();
            self.update_rotation(true);
        }
    }

    pub fn set_ui_mode(&self, mode: UiMode) {
        let changed = {
            let mut state = self.rotation();
            std::mem::replace(&mut state.ui_mode, mode) != mode
        };
        if changed {
            info!(?mode, "UI mode changed");
            self.update_rotation(true);
        }
    }

    pub(crate) fn is_docked(&self) -> bool {
        self.rotation().dock_mode != DockMode::Undocked
    }

    /// Boot animation is done and the screen can come on
    pub fn enable_screen_after_boot(&self) {
        info!("Enabling screen after boot");
        self.apply_lid_switch_state();
        self.update_rotation(true);
    }

    /// Turn the orientation sensor on or off to match current state
    pub fn update_orientation_listener(&self) {
        if !self.config.device.support_auto_rotation {
            return;
        }
        let can_detect = self.services.orientation.can_detect_orientation();
        let config = RotationConfig::from(&self.config.device);
        let change = rotation::update_orientation_listener(&mut self.rotation(), &config, can_detect);
        match change {
            Some(SensorChange::Enable) => {
                debug!("Enabling orientation sensor");
                self.services.orientation.enable();
            }
            Some(SensorChange::Disable) => {
                debug!("Disabling orientation sensor");
                self.services.orientation.disable();
            }
            None => {}
        }
    }

    /// Ask the window server to re-run rotation
    pub(crate) fn update_rotation(&self, always_send_configuration: bool) {
        if let Err(e) = self.services.window_manager.update_rotation(always_send_configuration) {
            warn!("Failed to update rotation: {}", e);
        }
    }
}
