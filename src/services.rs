//! Collaborator capabilities
//!
//! The policy talks to the rest of the system only through these traits.
//! Every call can fail with a [`RemoteError`]; callers on the input path log
//! the failure and carry on. Services the policy looks up lazily (status bar,
//! telephony, audio) sit behind a [`CachedService`] that drops the handle on
//! failure so the next use re-acquires it.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{LaunchError, RemoteResult};
use crate::input::keys::{KeyCode, KeyEvent, MetaState};
use crate::settings::UserId;
use crate::window::{SystemUiFlags, WindowId};

/// Callback run once when an asynchronous step completes
pub type Completion = Box<dyn FnOnce() + Send>;

/// Window server hooks the policy may call, never while holding its own locks
pub trait WindowManagerFuncs: Send + Sync {
    fn reevaluate_status_bar_visibility(&self) -> RemoteResult<()>;
    fn switch_keyboard_layout(&self, device_id: i32, direction: i32) -> RemoteResult<()>;
    fn update_rotation(&self, always_send_configuration: bool) -> RemoteResult<()>;
    /// Install or remove the touch catcher shown while navigation is hidden
    fn set_hidden_nav_consumer(&self, installed: bool) -> RemoteResult<()>;
    fn shutdown(&self, confirm: bool) -> RemoteResult<()>;
    fn set_event_dispatching(&self, enabled: bool) -> RemoteResult<()>;
    /// Run `done` once `window` has drawn. Returns false when there is no
    /// such window to wait for, in which case `done` is dropped unrun.
    fn wait_for_window_drawn(&self, window: WindowId, done: Completion) -> RemoteResult<bool>;
}

/// Why the screen went off
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffReason {
    User,
    Timeout,
    ProximitySensor,
}

/// Lock screen mediator
pub trait KeyguardMediator: Send + Sync {
    fn on_screen_turned_off(&self, why: OffReason) -> RemoteResult<()>;
    /// Show the keyguard if needed; `shown` receives its window, if any
    fn on_screen_turned_on(&self, shown: Option<Box<dyn FnOnce(Option<WindowId>) + Send>>) -> RemoteResult<()>;
    fn is_showing(&self) -> bool;
    fn is_showing_and_not_hidden(&self) -> bool;
    fn is_secure(&self) -> bool;
    fn is_input_restricted(&self) -> bool;
    /// Can be finished without asking the user to authenticate
    fn is_dismissable(&self) -> bool;
    fn set_hidden(&self, hidden: bool) -> RemoteResult<()>;
    fn keyguard_done(&self, authenticated: bool, wake_up: bool) -> RemoteResult<()>;
    fn dismiss(&self) -> RemoteResult<()>;
    fn verify_unlock(&self, result: Box<dyn FnOnce(bool) + Send>) -> RemoteResult<()>;
    fn on_wake_key_when_keyguard_showing(&self, code: KeyCode) -> RemoteResult<()>;
    fn on_wake_motion_when_keyguard_showing(&self) -> RemoteResult<()>;
    /// Lock after the screen-on timeout; `options` come from `lock_now`
    fn do_keyguard_timeout(&self, options: Option<&str>) -> RemoteResult<()>;
    fn user_activity(&self) -> RemoteResult<()>;
    fn set_current_user(&self, user: UserId) -> RemoteResult<()>;
    fn on_system_ready(&self) -> RemoteResult<()>;
    fn on_booted(&self) -> RemoteResult<()>;
    fn show_assistant(&self) -> RemoteResult<()>;
}

/// System chrome service (status bar, panels, recents)
pub trait StatusBarService: Send + Sync {
    fn set_system_ui_visibility(&self, visibility: SystemUiFlags, mask: u32) -> RemoteResult<()>;
    fn top_app_window_changed(&self, needs_menu: bool) -> RemoteResult<()>;
    fn collapse_panels(&self) -> RemoteResult<()>;
    fn toggle_recent_apps(&self) -> RemoteResult<()>;
    fn preload_recent_apps(&self) -> RemoteResult<()>;
    fn cancel_preload_recent_apps(&self) -> RemoteResult<()>;
    fn toggle_notification_shade(&self) -> RemoteResult<()>;
    fn toggle_widgets(&self) -> RemoteResult<()>;
    fn set_current_user(&self, user: UserId) -> RemoteResult<()>;
}

pub trait TelephonyService: Send + Sync {
    fn is_ringing(&self) -> RemoteResult<bool>;
    fn is_offhook(&self) -> RemoteResult<bool>;
    fn is_idle(&self) -> RemoteResult<bool>;
    fn silence_ringer(&self) -> RemoteResult<()>;
    /// Returns true if a call was actually hung up
    fn end_call(&self) -> RemoteResult<bool>;
    fn answer_ringing_call(&self) -> RemoteResult<()>;
}

/// Audio stream a volume key adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    VoiceCall,
    Music,
}

pub trait AudioService: Send + Sync {
    fn is_music_active(&self) -> RemoteResult<bool>;
    fn adjust_stream_volume(&self, stream: Stream, direction: i32) -> RemoteResult<()>;
    fn dispatch_media_key(&self, event: &KeyEvent) -> RemoteResult<()>;
}

/// Activity/intent targets the policy launches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Home,
    CarDockHome,
    DeskDockHome,
    Assist,
    VoiceAssist,
    Browser,
    Email,
    Contacts,
    Calendar,
    Music,
    Calculator,
    BugReport,
    /// Parsed `intent:` URI from a key behavior setting
    Uri(String),
}

impl Intent {
    /// Parse a user supplied intent URI
    pub fn parse_uri(uri: &str) -> Result<Self, LaunchError> {
        let uri = uri.trim();
        if uri.starts_with("intent:") || uri.contains("#Intent;") {
            Ok(Intent::Uri(uri.to_string()))
        } else {
            Err(LaunchError::InvalidUri(uri.to_string()))
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Uri(uri) => write!(f, "{}", uri),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Reasons passed when closing transient system dialogs
pub mod close_reason {
    pub const HOME_KEY: &str = "homekey";
    pub const RECENT_APPS: &str = "recentapps";
    pub const ASSIST: &str = "assist";
    pub const GLOBAL_ACTIONS: &str = "globalactions";
}

/// Activity manager and launcher side effects
pub trait ActivityLauncher: Send + Sync {
    fn start_activity(&self, intent: &Intent) -> Result<(), LaunchError>;
    /// Start `intent` only if it is not already in front. Returns false when
    /// it was already in front and nothing was started.
    fn start_activity_if_needed(&self, intent: &Intent) -> Result<bool, LaunchError>;
    fn send_close_system_windows(&self, reason: Option<&str>) -> RemoteResult<()>;
    fn stop_app_switches(&self) -> RemoteResult<()>;
    /// Force stop the foreground user app; true if something was killed
    fn kill_foreground_app(&self) -> RemoteResult<bool>;
    fn switch_to_last_app(&self) -> RemoteResult<()>;
    fn show_global_actions(&self, keyguard_showing: bool, device_provisioned: bool) -> RemoteResult<()>;
    /// Show (true) or dismiss (false) the Alt-Tab recent apps dialog.
    /// Dismissing with `switch` moves to the selected task.
    fn recent_apps_dialog(&self, show: bool, switch: bool) -> RemoteResult<()>;
    fn take_screenshot(&self) -> RemoteResult<()>;
    /// Inject a down/up pair for `code` as if from a virtual key
    fn inject_virtual_key(&self, code: KeyCode) -> RemoteResult<()>;
}

pub trait PowerManager: Send + Sync {
    fn go_to_sleep(&self, time_ms: u64);
    fn wake_up(&self, time_ms: u64);
    fn user_activity(&self, time_ms: u64);
}

/// Partial wake lock held across deferred media key dispatch
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Haptic effects the policy triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticEffect {
    VirtualKey,
    LongPress,
    SafeModeEnabled,
    SafeModeDisabled,
}

pub trait HapticFeedback: Send + Sync {
    fn perform(&self, effect: HapticEffect);
}

/// Optional vendor hook for extra device keys
pub trait DeviceKeyHandler: Send + Sync {
    /// True if the handler consumed the key
    fn handle_key_event(&self, event: &KeyEvent) -> RemoteResult<bool>;
}

/// Accelerometer based rotation proposals
pub trait OrientationListener: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn can_detect_orientation(&self) -> bool;
    fn set_current_rotation(&self, rotation: crate::geometry::Rotation);
}

/// Per-device key character map
pub trait KeyCharacterMap: Send + Sync {
    /// Substitute key for `code` when the app does not handle it
    fn fallback_action(&self, code: KeyCode, meta: MetaState) -> Option<(KeyCode, MetaState)>;
    /// Application bound to a search/meta shortcut on this key
    fn shortcut_intent(&self, code: KeyCode, meta: MetaState) -> Option<Intent>;
}

type Locator<T> = Box<dyn Fn() -> Option<Arc<T>> + Send + Sync>;

/// Lazily acquired service handle, dropped whenever a call fails
pub struct CachedService<T: ?Sized> {
    name: &'static str,
    locate: Locator<T>,
    handle: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> CachedService<T> {
    pub fn new(name: &'static str, locate: impl Fn() -> Option<Arc<T>> + Send + Sync + 'static) -> Self {
        Self { name, locate: Box::new(locate), handle: Mutex::new(None) }
    }

    /// Always resolves to `service`
    pub fn fixed(name: &'static str, service: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::new(name, move || Some(Arc::clone(&service)))
    }

    /// Never available
    pub fn absent(name: &'static str) -> Self {
        Self::new(name, || None)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            *handle = (self.locate)();
        }
        handle.clone()
    }

    pub fn invalidate(&self) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_cached(&self) -> bool {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Run `f` against the service. A missing service yields `None`; a
    /// failed call is logged, drops the handle, and yields `None`.
    pub fn call<R>(&self, op: &str, f: impl FnOnce(&T) -> RemoteResult<R>) -> Option<R> {
        let service = self.get()?;
        match f(&*service) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(service = self.name, op, "Remote call failed: {}", e);
                self.invalidate();
                None
            }
        }
    }
}

/// Every collaborator the policy talks to
pub struct Collaborators {
    pub window_manager: Arc<dyn WindowManagerFuncs>,
    pub keyguard: Option<Arc<dyn KeyguardMediator>>,
    pub status_bar: CachedService<dyn StatusBarService>,
    pub telephony: CachedService<dyn TelephonyService>,
    pub audio: CachedService<dyn AudioService>,
    pub launcher: Arc<dyn ActivityLauncher>,
    pub power: Arc<dyn PowerManager>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub haptics: Arc<dyn HapticFeedback>,
    pub device_key_handler: Option<Arc<dyn DeviceKeyHandler>>,
    pub orientation: Arc<dyn OrientationListener>,
    pub key_map: Arc<dyn KeyCharacterMap>,
}
