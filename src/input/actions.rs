//! Configurable hardware key behaviors and the actions they trigger

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::handler::PolicyMessage;
use crate::input::keys::KeyCode;
use crate::policy::PhonePolicy;
use crate::services::{close_reason, HapticEffect, Intent};
use crate::settings::keys;

/// Something a key press can be bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Nothing,
    Home,
    Back,
    Menu,
    AppSwitch,
    Search,
    VoiceSearch,
    InAppSearch,
    Power,
    Notifications,
    Expanded,
    KillApp,
    LastApp,
    CustomApp,
    Widgets,
    /// Launch this intent URI
    Intent(String),
}

impl KeyAction {
    /// Parse a stored behavior: an action number, or anything else as an
    /// intent URI
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.parse::<i64>() {
            Ok(code) => Self::from_code(code).unwrap_or_else(|| {
                warn!(code, "Unknown key action, ignoring");
                KeyAction::Nothing
            }),
            Err(_) => KeyAction::Intent(value.to_string()),
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => KeyAction::Nothing,
            1 => KeyAction::Home,
            2 => KeyAction::Back,
            3 => KeyAction::Menu,
            4 => KeyAction::AppSwitch,
            5 => KeyAction::Search,
            6 => KeyAction::VoiceSearch,
            7 => KeyAction::InAppSearch,
            8 => KeyAction::Power,
            9 => KeyAction::Notifications,
            10 => KeyAction::Expanded,
            11 => KeyAction::KillApp,
            12 => KeyAction::LastApp,
            13 => KeyAction::CustomApp,
            14 => KeyAction::Widgets,
            _ => return None,
        })
    }
}

impl fmt::Display for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAction::Intent(uri) => write!(f, "intent({})", uri),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Hardware keys with a press/long-press behavior pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFamily {
    Home,
    Back,
    Menu,
    Assist,
    AppSwitch,
}

impl KeyFamily {
    pub const ALL: [KeyFamily; 5] =
        [KeyFamily::Home, KeyFamily::Back, KeyFamily::Menu, KeyFamily::Assist, KeyFamily::AppSwitch];

    pub fn from_code(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Home => Some(KeyFamily::Home),
            KeyCode::Back => Some(KeyFamily::Back),
            KeyCode::Menu => Some(KeyFamily::Menu),
            KeyCode::Assist => Some(KeyFamily::Assist),
            KeyCode::AppSwitch => Some(KeyFamily::AppSwitch),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            KeyFamily::Home => 0,
            KeyFamily::Back => 1,
            KeyFamily::Menu => 2,
            KeyFamily::Assist => 3,
            KeyFamily::AppSwitch => 4,
        }
    }

    /// Press action the application handles itself when left unchanged
    pub fn default_press(self) -> KeyAction {
        match self {
            KeyFamily::Home => KeyAction::Home,
            KeyFamily::Back => KeyAction::Back,
            KeyFamily::Menu => KeyAction::Menu,
            KeyFamily::Assist => KeyAction::Search,
            KeyFamily::AppSwitch => KeyAction::AppSwitch,
        }
    }

    /// A rebound short press is performed by the policy instead of the app
    pub fn uses_custom_action(self) -> bool {
        matches!(self, KeyFamily::Back | KeyFamily::Menu)
    }

    /// The policy owns the key; the app never sees it
    pub fn always_consumed(self) -> bool {
        matches!(self, KeyFamily::Home | KeyFamily::Assist | KeyFamily::AppSwitch)
    }
}

/// Press and long-press actions of one key family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyBehavior {
    pub press: KeyAction,
    pub long_press: KeyAction,
}

impl FamilyBehavior {
    /// Either action opens recents, so recents should be preloaded on down
    pub fn wants_recents(&self) -> bool {
        self.press == KeyAction::AppSwitch || self.long_press == KeyAction::AppSwitch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBehaviors {
    pub home: FamilyBehavior,
    pub back: FamilyBehavior,
    pub menu: FamilyBehavior,
    pub assist: FamilyBehavior,
    pub app_switch: FamilyBehavior,
}

impl KeyBehaviors {
    pub fn get(&self, family: KeyFamily) -> &FamilyBehavior {
        match family {
            KeyFamily::Home => &self.home,
            KeyFamily::Back => &self.back,
            KeyFamily::Menu => &self.menu,
            KeyFamily::Assist => &self.assist,
            KeyFamily::AppSwitch => &self.app_switch,
        }
    }
}

/// Delay before a kill-app action takes effect, short of the full back
/// kill timeout already spent holding the key
const KILL_APP_LEAD_MS: u64 = 500;

impl PhonePolicy {
    /// Carry out a configured key action
    pub(crate) fn perform_key_action(&self, action: &KeyAction) {
        debug!(action = %action, "Performing key action");
        let launcher = &self.services.launcher;
        match action {
            KeyAction::Nothing => {}
            KeyAction::Home => self.launch_home_from_hotkey(),
            KeyAction::Back => self.trigger_virtual_keypress(KeyCode::Back),
            KeyAction::Menu => self.trigger_virtual_keypress(KeyCode::Menu),
            KeyAction::InAppSearch => self.trigger_virtual_keypress(KeyCode::Search),
            KeyAction::AppSwitch => {
                self.close_system_windows(Some(close_reason::RECENT_APPS));
                let toggled = self.services.status_bar.call("toggle_recent_apps", |s| s.toggle_recent_apps());
                if toggled.is_some() {
                    self.keys().recent_apps_preloaded = false;
                } else {
                    error!("Could not show recent apps");
                }
            }
            KeyAction::Search => self.launch_assist_action(),
            KeyAction::VoiceSearch => self.launch_assist_long_press_action(),
            KeyAction::KillApp => {
                let delay = self.config.input.back_kill_timeout_ms.saturating_sub(KILL_APP_LEAD_MS);
                self.scheduler.post_delayed(PolicyMessage::KillForegroundApp, Duration::from_millis(delay));
            }
            KeyAction::Widgets => {
                if self.services.status_bar.call("toggle_widgets", |s| s.toggle_widgets()).is_none() {
                    error!("Could not toggle navigation bar widgets");
                }
            }
            KeyAction::LastApp => {
                if let Err(e) = launcher.switch_to_last_app() {
                    warn!("Could not switch to last app: {}", e);
                }
            }
            KeyAction::Power => self.services.power.go_to_sleep(self.clock.now_ms()),
            KeyAction::Notifications => {
                if self
                    .services
                    .status_bar
                    .call("toggle_notification_shade", |s| s.toggle_notification_shade())
                    .is_none()
                {
                    error!("Could not toggle notification shade");
                }
            }
            KeyAction::Expanded => self.toggle_expanded_desktop(),
            KeyAction::CustomApp => debug!("Custom app action has no launcher binding"),
            KeyAction::Intent(uri) => match Intent::parse_uri(uri) {
                Ok(intent) => {
                    if let Err(e) = launcher.start_activity(&intent) {
                        warn!(uri = %uri, "Could not launch key action intent: {}", e);
                    }
                }
                Err(e) => warn!(uri = %uri, "Ignoring key action: {}", e),
            },
        }
    }

    fn toggle_expanded_desktop(&self) {
        let (state, mode) = {
            let settings = self.settings();
            (settings.expanded_desktop_state, settings.expanded_desktop_mode)
        };
        let store = &self.settings_store;
        let user = self.current_user();
        if state == 0 && mode == 0 {
            // Turning on for the first time: hide the status bar only
            store.put_int(user, keys::EXPANDED_DESKTOP_MODE, 2);
        }
        store.put_int(user, keys::EXPANDED_DESKTOP_STATE, if state == 0 { 1 } else { 0 });
    }

    pub(crate) fn trigger_virtual_keypress(&self, code: KeyCode) {
        if let Err(e) = self.services.launcher.inject_virtual_key(code) {
            warn!(key = ?code, "Could not inject virtual key: {}", e);
        }
    }

    pub(crate) fn launch_assist_action(&self) {
        self.close_system_windows(Some(close_reason::ASSIST));
        if let Err(e) = self.services.launcher.start_activity(&Intent::Assist) {
            warn!("No activity to handle assist action: {}", e);
        }
    }

    pub(crate) fn launch_assist_long_press_action(&self) {
        self.haptic(HapticEffect::LongPress);
        self.close_system_windows(Some(close_reason::ASSIST));
        if let Err(e) = self.services.launcher.start_activity(&Intent::VoiceAssist) {
            warn!("No activity to handle voice assist action: {}", e);
        }
    }

    /// Runs on the handler once the kill-app delay expires
    pub(crate) fn kill_foreground_app(&self) {
        match self.services.launcher.kill_foreground_app() {
            Ok(true) => {
                info!("Killed foreground app");
                self.haptic(HapticEffect::LongPress);
            }
            Ok(false) => debug!("No foreground app to kill"),
            Err(e) => warn!("Could not kill foreground app: {}", e),
        }
    }
}
