//! Runtime settings
//!
//! The policy treats settings storage as an external key-value store with
//! per-user scoping and change notification. [`PolicySettings`] is the
//! snapshot the policy works from; it is re-read on every change.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use serde::Serialize;
use tracing::warn;

use crate::config::{hardware_keys, PolicyConfig, UiLayout};
use crate::geometry::Rotation;
use crate::input::actions::{FamilyBehavior, KeyAction, KeyBehaviors};

/// Android-style user id
pub type UserId = u32;

/// The device owner
pub const USER_OWNER: UserId = 0;

/// Setting names
pub mod keys {
    pub const END_BUTTON_BEHAVIOR: &str = "end_button_behavior";
    pub const INCALL_POWER_BUTTON_BEHAVIOR: &str = "incall_power_button_behavior";
    pub const RING_HOME_BUTTON_BEHAVIOR: &str = "ring_home_button_behavior";
    pub const VOLUME_WAKE_SCREEN: &str = "volume_wake_screen";
    pub const VOLBTN_MUSIC_CONTROLS: &str = "volbtn_music_controls";
    pub const NAVIGATION_BAR_CAN_MOVE: &str = "navigation_bar_can_move";
    pub const NAVIGATION_BAR_SHOW: &str = "navigation_bar_show";
    pub const NAVIGATION_BAR_HEIGHT: &str = "navigation_bar_height";
    pub const NAVIGATION_BAR_HEIGHT_LANDSCAPE: &str = "navigation_bar_height_landscape";
    pub const NAVIGATION_BAR_WIDTH: &str = "navigation_bar_width";
    pub const HARDWARE_KEY_REBINDING: &str = "hardware_key_rebinding";
    pub const KEY_HOME_ACTION: &str = "key_home_action";
    pub const KEY_HOME_LONG_PRESS_ACTION: &str = "key_home_long_press_action";
    pub const KEY_BACK_ACTION: &str = "key_back_action";
    pub const KEY_BACK_LONG_PRESS_ACTION: &str = "key_back_long_press_action";
    pub const KEY_MENU_ACTION: &str = "key_menu_action";
    pub const KEY_MENU_LONG_PRESS_ACTION: &str = "key_menu_long_press_action";
    pub const KEY_ASSIST_ACTION: &str = "key_assist_action";
    pub const KEY_ASSIST_LONG_PRESS_ACTION: &str = "key_assist_long_press_action";
    pub const KEY_APP_SWITCH_ACTION: &str = "key_app_switch_action";
    pub const KEY_APP_SWITCH_LONG_PRESS_ACTION: &str = "key_app_switch_long_press_action";
    pub const EXPANDED_DESKTOP_STATE: &str = "expanded_desktop_state";
    pub const EXPANDED_DESKTOP_MODE: &str = "expanded_desktop_mode";
    pub const HIDE_STATUSBAR: &str = "hide_statusbar";
    pub const TOGGLE_NOTIFICATION_SHADE: &str = "toggle_notification_shade";
    pub const USER_ROTATION: &str = "user_rotation";
    pub const ACCELEROMETER_ROTATION: &str = "accelerometer_rotation";
    pub const ACCELEROMETER_ROTATION_ANGLES: &str = "accelerometer_rotation_angles";
    pub const SCREEN_OFF_TIMEOUT: &str = "screen_off_timeout";
    pub const DEFAULT_INPUT_METHOD: &str = "default_input_method";
    pub const USER_UI_MODE: &str = "user_ui_mode";
    pub const HAPTIC_FEEDBACK_ENABLED: &str = "haptic_feedback_enabled";
}

/// END_CALL short press goes home
pub const END_BUTTON_BEHAVIOR_HOME: i64 = 0x1;
/// END_CALL short press puts the device to sleep
pub const END_BUTTON_BEHAVIOR_SLEEP: i64 = 0x2;
pub const INCALL_POWER_BUTTON_BEHAVIOR_HANGUP: i64 = 0x2;
pub const RING_HOME_BUTTON_BEHAVIOR_ANSWER: i64 = 0x2;

/// Notified after a setting changes
pub trait SettingsObserver: Send + Sync {
    fn on_setting_changed(&self, key: &str, user: UserId);
}

/// Per-user key-value settings storage
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, user: UserId, key: &str) -> Option<String>;
    fn put_string(&self, user: UserId, key: &str, value: &str);
    fn subscribe(&self, observer: Weak<dyn SettingsObserver>);

    /// Integer setting; unparsable values are logged and replaced by `default`
    fn get_int(&self, user: UserId, key: &str, default: i64) -> i64 {
        match self.get_string(user, key) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %value, "Ignoring non-integer setting");
                default
            }),
            None => default,
        }
    }

    fn put_int(&self, user: UserId, key: &str, value: i64) {
        self.put_string(user, key, &value.to_string());
    }
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<(UserId, String), String>,
    observers: Vec<Weak<dyn SettingsObserver>>,
}

/// In-process settings store
#[derive(Default)]
pub struct MemorySettings {
    inner: Mutex<MemoryInner>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed values without notifying observers
    pub fn with_values<'a>(user: UserId, values: impl IntoIterator<Item = (&'a str, String)>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock().unwrap_or_else(|e| e.into_inner());
            for (key, value) in values {
                inner.values.insert((user, key.to_string()), value);
            }
        }
        store
    }
}

impl SettingsStore for MemorySettings {
    fn get_string(&self, user: UserId, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values.get(&(user, key.to_string())).cloned()
    }

    fn put_string(&self, user: UserId, key: &str, value: &str) {
        let observers: Vec<_> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.values.insert((user, key.to_string()), value.to_string());
            inner.observers.retain(|o| o.strong_count() > 0);
            inner.observers.clone()
        };
        // Observers may read the store back, so call them unlocked
        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.on_setting_changed(key, user);
        }
    }

    fn subscribe(&self, observer: Weak<dyn SettingsObserver>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.observers.push(observer);
    }
}

/// Snapshot of every tunable the policy reads from settings
#[derive(Debug, Clone, Serialize)]
pub struct PolicySettings {
    pub end_button_behavior: i64,
    pub incall_power_hangup: bool,
    pub ring_home_answers: bool,
    pub volume_wake_screen: bool,
    pub volbtn_music_controls: bool,
    pub navigation_bar_can_move: bool,
    pub has_navigation_bar: bool,
    pub navigation_bar_height: i32,
    pub navigation_bar_height_landscape: i32,
    pub navigation_bar_width: i32,
    pub key_behaviors: KeyBehaviors,
    pub expanded_desktop_state: i64,
    pub expanded_desktop_mode: i64,
    pub hide_statusbar: bool,
    pub toggle_notification_shade: bool,
    pub user_rotation: Rotation,
    /// Accelerometer rotation enabled (free rotation mode)
    pub accelerometer_rotation: bool,
    /// Allowed rotation angle bits, -1 = device default
    pub rotation_angles: i64,
    /// Keyguard lock timeout in ms (the screen-off timeout)
    pub lock_screen_timeout_ms: u64,
    pub has_soft_input: bool,
    pub ui_layout: UiLayout,
    pub haptic_feedback_enabled: bool,
}

impl PolicySettings {
    /// Read the full snapshot for `user`
    pub fn read(store: &dyn SettingsStore, user: UserId, config: &PolicyConfig) -> Self {
        let device = &config.device;
        let flag = |key: &str, default: bool| store.get_int(user, key, default as i64) == 1;

        let rebinding = flag(keys::HARDWARE_KEY_REBINDING, config.input.hardware_key_rebinding);
        let key_behaviors = read_key_behaviors(store, user, config, rebinding);

        let has_navigation_bar = flag(keys::NAVIGATION_BAR_SHOW, device.has_navigation_bar);
        let expanded_desktop_state = store.get_int(user, keys::EXPANDED_DESKTOP_STATE, 0);
        let expanded_desktop_mode = store.get_int(user, keys::EXPANDED_DESKTOP_MODE, 0);

        // Expanded desktop (modes 1 and 3) and nav-less devices get a zero sized bar
        let zero_nav = (expanded_desktop_state == 1
            && (expanded_desktop_mode == 1 || expanded_desktop_mode == 3))
            || !has_navigation_bar;
        let dim = |key: &str, default: i32| {
            if zero_nav {
                0
            } else {
                store.get_int(user, key, default as i64) as i32
            }
        };

        let user_rotation = Rotation::from_index(store.get_int(user, keys::USER_ROTATION, 0))
            .unwrap_or_else(|| {
                warn!("Invalid user rotation setting, using 0");
                Rotation::Rot0
            });

        let ui_layout = match store.get_int(user, keys::USER_UI_MODE, -1) {
            0 => UiLayout::Phone,
            1 => UiLayout::Tablet,
            2 => UiLayout::Phablet,
            _ => device.ui_layout,
        };

        let timeout = store.get_int(user, keys::SCREEN_OFF_TIMEOUT, 0);

        Self {
            end_button_behavior: store.get_int(user, keys::END_BUTTON_BEHAVIOR, END_BUTTON_BEHAVIOR_SLEEP),
            incall_power_hangup: store.get_int(user, keys::INCALL_POWER_BUTTON_BEHAVIOR, 0x1)
                & INCALL_POWER_BUTTON_BEHAVIOR_HANGUP
                != 0,
            ring_home_answers: store.get_int(user, keys::RING_HOME_BUTTON_BEHAVIOR, 0x1)
                & RING_HOME_BUTTON_BEHAVIOR_ANSWER
                != 0,
            volume_wake_screen: flag(keys::VOLUME_WAKE_SCREEN, false),
            volbtn_music_controls: flag(keys::VOLBTN_MUSIC_CONTROLS, true),
            navigation_bar_can_move: flag(keys::NAVIGATION_BAR_CAN_MOVE, true),
            has_navigation_bar,
            navigation_bar_height: dim(keys::NAVIGATION_BAR_HEIGHT, device.navigation_bar_height),
            navigation_bar_height_landscape: dim(
                keys::NAVIGATION_BAR_HEIGHT_LANDSCAPE,
                device.navigation_bar_height_landscape,
            ),
            navigation_bar_width: dim(keys::NAVIGATION_BAR_WIDTH, device.navigation_bar_width),
            key_behaviors,
            expanded_desktop_state,
            expanded_desktop_mode,
            hide_statusbar: flag(keys::HIDE_STATUSBAR, false),
            toggle_notification_shade: flag(keys::TOGGLE_NOTIFICATION_SHADE, false),
            user_rotation,
            accelerometer_rotation: store.get_int(user, keys::ACCELEROMETER_ROTATION, 0) != 0,
            rotation_angles: store.get_int(user, keys::ACCELEROMETER_ROTATION_ANGLES, -1),
            lock_screen_timeout_ms: timeout.max(0) as u64,
            has_soft_input: store
                .get_string(user, keys::DEFAULT_INPUT_METHOD)
                .map(|id| !id.is_empty())
                .unwrap_or(false),
            ui_layout,
            haptic_feedback_enabled: flag(keys::HAPTIC_FEEDBACK_ENABLED, true),
        }
    }

    /// Expanded desktop hides the navigation bar (modes 1 and 3)
    pub fn expanded_hides_navigation(&self) -> bool {
        self.expanded_desktop_state == 1 && (self.expanded_desktop_mode == 1 || self.expanded_desktop_mode == 3)
    }

    /// Expanded desktop hides the status bar (modes 2 and 3)
    pub fn expanded_hides_status_bar(&self) -> bool {
        self.expanded_desktop_state == 1 && (self.expanded_desktop_mode == 2 || self.expanded_desktop_mode == 3)
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self::read(&MemorySettings::new(), USER_OWNER, &PolicyConfig::default())
    }
}

fn read_key_behaviors(
    store: &dyn SettingsStore,
    user: UserId,
    config: &PolicyConfig,
    rebinding: bool,
) -> KeyBehaviors {
    let device = &config.device;
    let has_app_switch = device.has_hardware_key(hardware_keys::APP_SWITCH);
    let has_assist = device.has_hardware_key(hardware_keys::ASSIST);

    let lookup = |key: &str, default: KeyAction| -> KeyAction {
        if !rebinding {
            return default;
        }
        match store.get_string(user, key) {
            Some(value) => KeyAction::parse(&value),
            None => default,
        }
    };

    KeyBehaviors {
        home: FamilyBehavior {
            press: lookup(keys::KEY_HOME_ACTION, KeyAction::Home),
            long_press: lookup(
                keys::KEY_HOME_LONG_PRESS_ACTION,
                if has_app_switch { KeyAction::Nothing } else { KeyAction::AppSwitch },
            ),
        },
        back: FamilyBehavior {
            press: lookup(keys::KEY_BACK_ACTION, KeyAction::Back),
            long_press: lookup(keys::KEY_BACK_LONG_PRESS_ACTION, KeyAction::Nothing),
        },
        menu: FamilyBehavior {
            press: lookup(keys::KEY_MENU_ACTION, KeyAction::Menu),
            long_press: lookup(
                keys::KEY_MENU_LONG_PRESS_ACTION,
                if has_assist { KeyAction::Nothing } else { KeyAction::Search },
            ),
        },
        assist: FamilyBehavior {
            press: lookup(keys::KEY_ASSIST_ACTION, KeyAction::Search),
            long_press: lookup(keys::KEY_ASSIST_LONG_PRESS_ACTION, KeyAction::VoiceSearch),
        },
        app_switch: FamilyBehavior {
            press: lookup(keys::KEY_APP_SWITCH_ACTION, KeyAction::AppSwitch),
            long_press: lookup(keys::KEY_APP_SWITCH_LONG_PRESS_ACTION, KeyAction::Nothing),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(AtomicUsize);

    impl SettingsObserver for Counter {
        fn on_setting_changed(&self, _key: &str, _user: UserId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_defaults() {
        let s = PolicySettings::default();
        assert_eq!(s.end_button_behavior, END_BUTTON_BEHAVIOR_SLEEP);
        assert!(s.volbtn_music_controls);
        assert!(!s.volume_wake_screen);
        assert_eq!(s.rotation_angles, -1);
        assert_eq!(s.key_behaviors.home.long_press, KeyAction::AppSwitch);
        assert_eq!(s.key_behaviors.menu.long_press, KeyAction::Search);
    }

    #[test]
    fn test_rebinding_reads_overrides() {
        let store = MemorySettings::new();
        store.put_int(USER_OWNER, keys::HARDWARE_KEY_REBINDING, 1);
        store.put_string(USER_OWNER, keys::KEY_BACK_LONG_PRESS_ACTION, "11");
        store.put_string(USER_OWNER, keys::KEY_MENU_ACTION, "intent:#Intent;action=foo;end");
        let s = PolicySettings::read(&store, USER_OWNER, &PolicyConfig::default());
        assert_eq!(s.key_behaviors.back.long_press, KeyAction::KillApp);
        assert!(matches!(s.key_behaviors.menu.press, KeyAction::Intent(_)));
    }

    #[test]
    fn test_overrides_ignored_without_rebinding() {
        let store = MemorySettings::new();
        store.put_string(USER_OWNER, keys::KEY_BACK_LONG_PRESS_ACTION, "11");
        let s = PolicySettings::read(&store, USER_OWNER, &PolicyConfig::default());
        assert_eq!(s.key_behaviors.back.long_press, KeyAction::Nothing);
    }

    #[test]
    fn test_expanded_desktop_zeroes_nav_bar() {
        let store = MemorySettings::new();
        store.put_int(USER_OWNER, keys::EXPANDED_DESKTOP_STATE, 1);
        store.put_int(USER_OWNER, keys::EXPANDED_DESKTOP_MODE, 3);
        let s = PolicySettings::read(&store, USER_OWNER, &PolicyConfig::default());
        assert_eq!(s.navigation_bar_height, 0);
        assert_eq!(s.navigation_bar_width, 0);
        assert!(s.expanded_hides_status_bar());
    }

    #[test]
    fn test_observer_notified_and_per_user() {
        let store = MemorySettings::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<dyn SettingsObserver> = Arc::downgrade(&counter) as Weak<dyn SettingsObserver>;
        store.subscribe(weak);
        store.put_int(10, keys::USER_ROTATION, 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_int(10, keys::USER_ROTATION, 0), 1);
        assert_eq!(store.get_int(USER_OWNER, keys::USER_ROTATION, 0), 0);
    }

    #[test]
    fn test_bad_int_uses_default() {
        let store = MemorySettings::with_values(USER_OWNER, [(keys::SCREEN_OFF_TIMEOUT, "soon".to_string())]);
        assert_eq!(store.get_int(USER_OWNER, keys::SCREEN_OFF_TIMEOUT, 30), 30);
    }
}
