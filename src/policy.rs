//! The phone window policy
//!
//! [`PhonePolicy`] is shared between the input reader, the input dispatcher,
//! the window server's layout thread and the policy handler. Each concern
//! keeps its state behind its own mutex. Locks are never nested and no
//! collaborator is called while one is held: state is read or updated in a
//! short block and the resulting side effects run after the guard drops.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::admission::{self, AddPermission, AddRequest, AddWindowResult, SingletonRegistry};
use crate::chrome::ChromeState;
use crate::config::PolicyConfig;
use crate::display::LayoutState;
use crate::handler::{Clock, MessageHandler, PolicyMessage, PolicyScheduler};
use crate::input::KeyState;
use crate::keyguard::ScreenState;
use crate::rotation::{RotationState, UserRotationMode};
use crate::services::{Collaborators, HapticEffect, KeyguardMediator};
use crate::settings::{PolicySettings, SettingsObserver, SettingsStore, UserId, USER_OWNER};
use crate::window::{HeldPermissions, SystemUiFlags, WindowAttrs, WindowFlags, WindowRef};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Window manager policy for a phone
pub struct PhonePolicy {
    pub(crate) self_ref: Weak<PhonePolicy>,
    pub(crate) config: PolicyConfig,
    pub(crate) services: Collaborators,
    pub(crate) scheduler: Arc<dyn PolicyScheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings_store: Arc<dyn SettingsStore>,

    settings: Mutex<Arc<PolicySettings>>,
    layout: Mutex<LayoutState>,
    rotation: Mutex<RotationState>,
    keys: Mutex<KeyState>,
    chrome: Mutex<ChromeState>,
    screen: Mutex<ScreenState>,
    windows: Mutex<SingletonRegistry>,

    booted: AtomicBool,
    system_ready: AtomicBool,
    safe_mode: AtomicBool,
    current_user: AtomicU32,
}

impl PhonePolicy {
    /// Build the policy and subscribe it to settings changes. Attach the
    /// returned handle to the scheduler before posting anything.
    pub fn new(
        config: PolicyConfig,
        services: Collaborators,
        scheduler: Arc<dyn PolicyScheduler>,
        clock: Arc<dyn Clock>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Arc<Self> {
        let settings = PolicySettings::read(&*settings_store, USER_OWNER, &config);
        let keys = KeyState::new(config.input.screenshot_chord_enabled);
        let policy = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            services,
            scheduler,
            clock,
            settings_store,
            settings: Mutex::new(Arc::new(settings)),
            layout: Mutex::new(LayoutState::default()),
            rotation: Mutex::new(RotationState::default()),
            keys: Mutex::new(keys),
            chrome: Mutex::new(ChromeState::default()),
            screen: Mutex::new(ScreenState::default()),
            windows: Mutex::new(SingletonRegistry::new()),
            booted: AtomicBool::new(false),
            system_ready: AtomicBool::new(false),
            safe_mode: AtomicBool::new(false),
            current_user: AtomicU32::new(USER_OWNER),
        });
        let observer: Weak<dyn SettingsObserver> = Arc::downgrade(&policy) as Weak<dyn SettingsObserver>;
        policy.settings_store.subscribe(observer);
        policy.apply_rotation_settings(&policy.settings());
        info!(headless = policy.config.device.headless, "Phone policy created");
        policy
    }

    pub(crate) fn keys(&self) -> MutexGuard<'_, KeyState> {
        lock(&self.keys)
    }

    pub(crate) fn chrome(&self) -> MutexGuard<'_, ChromeState> {
        lock(&self.chrome)
    }

    pub(crate) fn screen(&self) -> MutexGuard<'_, ScreenState> {
        lock(&self.screen)
    }

    pub(crate) fn rotation(&self) -> MutexGuard<'_, RotationState> {
        lock(&self.rotation)
    }

    pub(crate) fn layout(&self) -> MutexGuard<'_, LayoutState> {
        lock(&self.layout)
    }

    pub(crate) fn windows(&self) -> MutexGuard<'_, SingletonRegistry> {
        lock(&self.windows)
    }

    #[cfg(test)]
    pub(crate) fn windows_locked(&self) -> bool {
        self.windows.try_lock().is_err()
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Arc<PolicySettings> {
        Arc::clone(&lock(&self.settings))
    }

    pub fn current_user(&self) -> UserId {
        self.current_user.load(Ordering::SeqCst)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    pub fn is_system_ready(&self) -> bool {
        self.system_ready.load(Ordering::SeqCst)
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    /// Run `f` against the keyguard mediator, logging failures
    pub(crate) fn keyguard_call<R>(
        &self,
        op: &str,
        f: impl FnOnce(&dyn KeyguardMediator) -> crate::error::RemoteResult<R>,
    ) -> Option<R> {
        let keyguard = self.services.keyguard.as_ref()?;
        match f(keyguard.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op, "Keyguard call failed: {}", e);
                None
            }
        }
    }

    pub(crate) fn keyguard_showing(&self) -> bool {
        self.services.keyguard.as_ref().is_some_and(|k| k.is_showing())
    }

    pub(crate) fn keyguard_showing_and_not_hidden(&self) -> bool {
        self.services.keyguard.as_ref().is_some_and(|k| k.is_showing_and_not_hidden())
    }

    /// Keyguard on screen, or restricting key input behind a hidden keyguard
    pub(crate) fn keyguard_on(&self) -> bool {
        self.keyguard_showing_and_not_hidden()
            || self.services.keyguard.as_ref().is_some_and(|k| k.is_input_restricted())
    }

    pub(crate) fn close_system_windows(&self, reason: Option<&str>) {
        if !self.is_system_ready() {
            return;
        }
        if let Err(e) = self.services.launcher.send_close_system_windows(reason) {
            warn!(?reason, "Failed to close system windows: {}", e);
        }
    }

    pub(crate) fn haptic(&self, effect: HapticEffect) {
        let always = matches!(effect, HapticEffect::SafeModeEnabled | HapticEffect::SafeModeDisabled);
        if !always && !self.settings().haptic_feedback_enabled {
            return;
        }
        self.services.haptics.perform(effect);
    }

    /// Flags of the topmost fullscreen window from the last pass
    pub(crate) fn top_fullscreen_flags(&self) -> WindowFlags {
        self.top_fullscreen_window().map(|w| w.attrs().flags).unwrap_or_default()
    }

    fn apply_rotation_settings(&self, settings: &PolicySettings) -> bool {
        let mode = if settings.accelerometer_rotation { UserRotationMode::Free } else { UserRotationMode::Locked };
        let mut state = self.rotation();
        let changed = state.user_rotation_mode != mode
            || state.user_rotation != settings.user_rotation
            || state.user_rotation_angles != settings.rotation_angles;
        state.user_rotation_mode = mode;
        state.user_rotation = settings.user_rotation;
        state.user_rotation_angles = settings.rotation_angles;
        changed
    }

    /// Re-read every setting for the current user
    pub fn update_settings(&self) {
        let user = self.current_user();
        let settings = Arc::new(PolicySettings::read(&*self.settings_store, user, &self.config));
        debug!(user, "Settings updated");
        *lock(&self.settings) = Arc::clone(&settings);

        let rotation_changed = self.apply_rotation_settings(&settings);
        let decor_changed = self.refresh_decor_metrics();
        if rotation_changed || decor_changed {
            self.update_orientation_listener();
            self.update_rotation(true);
        }
    }

    /// The rest of the system is up: services can be called
    pub fn system_ready(&self) {
        info!("System ready");
        self.keyguard_call("on_system_ready", |k| k.on_system_ready());
        self.system_ready.store(true, Ordering::SeqCst);
        self.update_orientation_listener();
        self.scheduler.post(PolicyMessage::UpdateSettings);
    }

    /// Boot finished; keys do nothing before this
    pub fn system_booted(&self) {
        info!("System booted");
        self.booted.store(true, Ordering::SeqCst);
        self.keyguard_call("on_booted", |k| k.on_booted());
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.safe_mode.store(safe_mode, Ordering::SeqCst);
        self.haptic(if safe_mode { HapticEffect::SafeModeEnabled } else { HapticEffect::SafeModeDisabled });
    }

    /// Foreground user switched
    pub fn set_current_user(&self, user: UserId) {
        info!(user, "Switching user");
        self.current_user.store(user, Ordering::SeqCst);
        self.keyguard_call("set_current_user", |k| k.set_current_user(user));
        self.services.status_bar.call("set_current_user", |s| s.set_current_user(user));
        self.set_last_input_method_window(None, None);
        self.chrome().last_system_ui_flags = SystemUiFlags::empty();
        self.update_settings();
    }

    pub fn check_add_permission(&self, attrs: &WindowAttrs, held: HeldPermissions) -> AddPermission {
        admission::check_add_permission(attrs.window_type, held)
    }

    pub fn check_show_to_owner_only(&self, attrs: &WindowAttrs, held: HeldPermissions) -> bool {
        admission::check_show_to_owner_only(attrs, held)
    }

    pub fn adjust_window_params(&self, attrs: &mut WindowAttrs) {
        admission::adjust_window_params(attrs);
    }

    pub fn prepare_add_window(&self, win: &WindowRef, held: HeldPermissions) -> AddWindowResult {
        let window_type = win.attrs().window_type;
        let existing = self.windows().registered(window_type);
        let request = AddRequest::snapshot(win, existing.as_ref());
        self.windows().prepare_add_window(win, request, held)
    }

    pub fn remove_window(&self, win: &WindowRef) {
        let id = win.id();
        self.windows().remove_window(id);
    }

    /// Human readable state for diagnostics
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PhonePolicy");
        let _ = writeln!(
            out,
            "  booted={} system_ready={} safe_mode={} user={}",
            self.is_booted(),
            self.is_system_ready(),
            self.is_safe_mode(),
            self.current_user()
        );

        section(&mut out, "settings", &*self.settings());
        section(&mut out, "rotation", &*self.rotation());
        let layout = {
            let layout = self.layout();
            json!({
                "display": layout.display,
                "metrics": layout.engine.metrics(),
                "regions": layout.engine.regions(),
                "nav_bar_on_bottom": layout.engine.nav_bar_on_bottom(),
                "last_input_method_target": layout.last_input_method_target,
            })
        };
        section(&mut out, "layout", &layout);
        let keys = {
            let keys = self.keys();
            json!({
                "keys": keys.keys(),
                "chord": keys.chord,
                "power": keys.power,
                "volume_music": keys.volume_music,
                "media_repeat_pending": keys.media_repeat_pending,
                "recent_apps_preloaded": keys.recent_apps_preloaded,
            })
        };
        section(&mut out, "keys", &keys);
        let chrome = self.chrome().summary();
        section(&mut out, "chrome", &chrome);
        section(&mut out, "screen", &*self.screen());
        let windows = self.windows().ids();
        section(&mut out, "windows", &windows);
        out
    }
}

fn section<T: Serialize + ?Sized>(out: &mut String, name: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            let _ = writeln!(out, "{}:", name);
            for line in json.lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }
        Err(e) => {
            let _ = writeln!(out, "{}: <unavailable: {}>", name, e);
        }
    }
}

impl MessageHandler for PhonePolicy {
    fn handle_message(&self, message: PolicyMessage) {
        debug!(?message, "Handling policy message");
        match message {
            PolicyMessage::PowerLongPress => self.power_long_press(),
            PolicyMessage::ScreenshotChord => self.take_screenshot(),
            PolicyMessage::KeyLongPress { family, press_id } => self.key_long_press(family, press_id),
            PolicyMessage::VolumeMusicLongPress { code, press_id } => self.volume_music_long_press(code, press_id),
            PolicyMessage::KillForegroundApp => self.kill_foreground_app(),
            PolicyMessage::DispatchMediaKey(event) => self.dispatch_media_key_with_wake_lock(event),
            PolicyMessage::DispatchMediaKeyRepeat { event, seq } => {
                self.dispatch_media_key_repeat_with_wake_lock(event, seq)
            }
            PolicyMessage::ScreenLockTimeout => self.screen_lock_timeout(),
            PolicyMessage::ClearForcedNavigation => self.clear_forced_navigation(),
            PolicyMessage::CollapsePanels => self.collapse_panels(),
            PolicyMessage::UpdateSystemUiVisibility => self.send_system_ui_visibility(),
            PolicyMessage::KeyguardDone => {
                self.keyguard_call("keyguard_done", |k| k.keyguard_done(false, false));
            }
            PolicyMessage::KeyguardDismiss => {
                self.keyguard_call("dismiss", |k| k.dismiss());
            }
            PolicyMessage::UpdateSettings => self.update_settings(),
        }
    }
}

impl SettingsObserver for PhonePolicy {
    fn on_setting_changed(&self, key: &str, user: UserId) {
        if user == self.current_user() {
            debug!(key, "Setting changed");
            self.scheduler.post(PolicyMessage::UpdateSettings);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::keys;
    use crate::testing::{FakeWindow, Harness, LockCheckingWindow};
    use crate::window::WindowType;

    #[test]
    fn test_settings_change_is_picked_up_on_handler() {
        let h = Harness::new();
        assert!(!h.policy.settings().volume_wake_screen);
        h.settings.put_int(0, keys::VOLUME_WAKE_SCREEN, 1);
        // Nothing changes until the handler runs
        assert!(!h.policy.settings().volume_wake_screen);
        h.advance(0);
        assert!(h.policy.settings().volume_wake_screen);
    }

    #[test]
    fn test_other_users_settings_ignored() {
        let h = Harness::new();
        h.settings.put_int(10, keys::VOLUME_WAKE_SCREEN, 1);
        assert!(!h.scheduler.is_pending(crate::handler::TimerKey::Settings));
        h.advance(0);
        assert!(!h.policy.settings().volume_wake_screen);
    }

    #[test]
    fn test_user_switch_rereads_settings() {
        let h = Harness::new();
        h.settings.put_int(10, keys::VOLUME_WAKE_SCREEN, 1);
        h.policy.set_current_user(10);
        assert!(h.policy.settings().volume_wake_screen);
        assert_eq!(h.keyguard.users(), vec![10]);
        assert_eq!(h.status_bar.users(), vec![10]);
        assert!(h.policy.last_system_ui_flags().is_empty());
    }

    #[test]
    fn test_haptics_follow_setting_except_safe_mode() {
        let h = Harness::with_settings(&[(keys::HAPTIC_FEEDBACK_ENABLED, "0")]);
        h.policy.haptic(HapticEffect::VirtualKey);
        h.policy.set_safe_mode(true);
        assert_eq!(h.haptics.effects(), vec![HapticEffect::SafeModeEnabled]);
        assert!(h.policy.is_safe_mode());
    }

    #[test]
    fn test_rotation_settings_applied() {
        let h = Harness::with_settings(&[(keys::ACCELEROMETER_ROTATION, "1"), (keys::USER_ROTATION, "2")]);
        let state = h.policy.rotation().clone();
        assert_eq!(state.user_rotation_mode, UserRotationMode::Free);
        assert_eq!(state.user_rotation, crate::geometry::Rotation::Rot180);
    }

    #[test]
    fn test_close_system_windows_waits_for_ready() {
        let h = Harness::builder().system_ready(false).build();
        h.policy.close_system_windows(Some("test"));
        assert!(h.launcher.closes().is_empty());
        h.policy.system_ready();
        h.policy.close_system_windows(Some("test"));
        assert_eq!(h.launcher.closes(), vec![Some("test".to_string())]);
    }

    #[test]
    fn test_admission_wrappers() {
        let h = Harness::new();
        let bar = FakeWindow::new(1, WindowAttrs::new(WindowType::StatusBar)).into_ref();
        assert_eq!(h.policy.prepare_add_window(&bar, HeldPermissions::all()), AddWindowResult::Ok);
        let again = FakeWindow::new(2, WindowAttrs::new(WindowType::StatusBar)).into_ref();
        assert_eq!(
            h.policy.prepare_add_window(&again, HeldPermissions::all()),
            AddWindowResult::MultipleSingleton
        );
        h.policy.remove_window(&bar);
        assert_eq!(h.policy.prepare_add_window(&again, HeldPermissions::all()), AddWindowResult::Ok);
        assert_eq!(
            h.policy.check_add_permission(&WindowAttrs::new(WindowType::SystemAlert), HeldPermissions::empty()),
            AddPermission::Denied
        );
    }

    #[test]
    fn test_admission_reads_handles_outside_lock() {
        let h = Harness::new();
        let first = LockCheckingWindow::new(FakeWindow::new(1, WindowAttrs::new(WindowType::Keyguard)), &h.policy);
        let second = LockCheckingWindow::new(FakeWindow::new(2, WindowAttrs::new(WindowType::Keyguard)), &h.policy);
        let first_ref: WindowRef = first.clone();
        let second_ref: WindowRef = second.clone();

        assert_eq!(h.policy.prepare_add_window(&first_ref, HeldPermissions::all()), AddWindowResult::Ok);
        assert_eq!(
            h.policy.prepare_add_window(&second_ref, HeldPermissions::all()),
            AddWindowResult::MultipleSingleton
        );
        h.policy.remove_window(&first_ref);
        assert!(h.policy.dump().contains("windows:"));
        assert_eq!(first.calls_under_lock(), 0);
        assert_eq!(second.calls_under_lock(), 0);
    }

    #[test]
    fn test_dump_has_every_section() {
        let h = Harness::new();
        let dump = h.policy.dump();
        for name in ["settings:", "rotation:", "layout:", "keys:", "chrome:", "screen:", "windows:"] {
            assert!(dump.contains(name), "missing {}", name);
        }
        assert!(dump.contains("booted=true"));
    }

    #[test]
    fn test_keyguard_messages_reach_mediator() {
        let h = Harness::new();
        h.handle(PolicyMessage::KeyguardDone);
        h.handle(PolicyMessage::KeyguardDismiss);
        assert_eq!(h.keyguard.done_calls(), vec![(false, false)]);
        assert_eq!(h.keyguard.dismisses(), 1);
    }
}
