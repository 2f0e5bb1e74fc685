//! Recording collaborators and a harness wiring them to a policy on
//! virtual time

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::PolicyConfig;
use crate::error::{LaunchError, RemoteError, RemoteResult};
use crate::geometry::{Rect, Rotation};
use crate::handler::{Clock, ManualScheduler, MessageHandler, PolicyMessage};
use crate::input::keys::{KeyCode, KeyEvent, MetaState};
use crate::policy::PhonePolicy;
use crate::services::{
    ActivityLauncher, AudioService, CachedService, Collaborators, Completion, DeviceKeyHandler, HapticEffect,
    HapticFeedback, Intent, KeyCharacterMap, KeyguardMediator, OffReason, OrientationListener, PowerManager,
    StatusBarService, Stream, TelephonyService, WakeLock, WindowManagerFuncs,
};
use crate::settings::{keys, MemorySettings, SettingsStore, UserId, USER_OWNER};
use crate::window::{Gravity, HeldPermissions, PolicyWindow, SystemUiFlags, WindowAttrs, WindowFrames, WindowId, WindowRef};

pub use crate::replay::SimWindow as FakeWindow;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Settings
// ============================================================================

/// The harness's settings store, usable without the trait in scope
pub struct TestSettings(pub Arc<MemorySettings>);

impl TestSettings {
    pub fn put_int(&self, user: UserId, key: &str, value: i64) {
        SettingsStore::put_int(&*self.0, user, key, value);
    }

    pub fn put_string(&self, user: UserId, key: &str, value: &str) {
        SettingsStore::put_string(&*self.0, user, key, value);
    }

    pub fn get_int(&self, user: UserId, key: &str, default: i64) -> i64 {
        SettingsStore::get_int(&*self.0, user, key, default)
    }
}

// ============================================================================
// Keyguard
// ============================================================================

#[derive(Default)]
struct KeyguardLog {
    showing: bool,
    secure: bool,
    hidden: bool,
    shown_window: Option<WindowId>,
    unlock_fails: bool,
    dismisses: usize,
    done_calls: Vec<(bool, bool)>,
    hidden_calls: Vec<bool>,
    screen_offs: Vec<OffReason>,
    timeout_options: Vec<Option<String>>,
    wake_keys: Vec<KeyCode>,
    wake_motions: usize,
    users: Vec<UserId>,
}

#[derive(Default)]
pub struct RecordingKeyguard {
    log: Mutex<KeyguardLog>,
}

impl RecordingKeyguard {
    fn log(&self) -> MutexGuard<'_, KeyguardLog> {
        lock(&self.log)
    }

    pub fn set_showing(&self, showing: bool) {
        self.log().showing = showing;
    }

    pub fn set_secure(&self, secure: bool) {
        self.log().secure = secure;
    }

    pub fn set_hidden_state(&self, hidden: bool) {
        self.log().hidden = hidden;
    }

    pub fn set_shown_window(&self, window: Option<WindowId>) {
        self.log().shown_window = window;
    }

    pub fn set_unlock_result(&self, unlocked: bool) {
        self.log().unlock_fails = !unlocked;
    }

    pub fn dismisses(&self) -> usize {
        self.log().dismisses
    }

    pub fn done_calls(&self) -> Vec<(bool, bool)> {
        self.log().done_calls.clone()
    }

    pub fn hidden_calls(&self) -> Vec<bool> {
        self.log().hidden_calls.clone()
    }

    pub fn screen_offs(&self) -> Vec<OffReason> {
        self.log().screen_offs.clone()
    }

    pub fn timeouts(&self) -> usize {
        self.log().timeout_options.len()
    }

    pub fn timeout_options(&self) -> Vec<Option<String>> {
        self.log().timeout_options.clone()
    }

    pub fn wake_keys(&self) -> Vec<KeyCode> {
        self.log().wake_keys.clone()
    }

    pub fn wake_motions(&self) -> usize {
        self.log().wake_motions
    }

    pub fn users(&self) -> Vec<UserId> {
        self.log().users.clone()
    }
}

impl KeyguardMediator for RecordingKeyguard {
    fn on_screen_turned_off(&self, why: OffReason) -> RemoteResult<()> {
        self.log().screen_offs.push(why);
        Ok(())
    }

    fn on_screen_turned_on(&self, shown: Option<Box<dyn FnOnce(Option<WindowId>) + Send>>) -> RemoteResult<()> {
        let window = self.log().shown_window;
        if let Some(shown) = shown {
            shown(window);
        }
        Ok(())
    }

    fn is_showing(&self) -> bool {
        self.log().showing
    }

    fn is_showing_and_not_hidden(&self) -> bool {
        let log = self.log();
        log.showing && !log.hidden
    }

    fn is_secure(&self) -> bool {
        self.log().secure
    }

    fn is_input_restricted(&self) -> bool {
        self.log().showing
    }

    fn is_dismissable(&self) -> bool {
        !self.log().secure
    }

    fn set_hidden(&self, hidden: bool) -> RemoteResult<()> {
        let mut log = self.log();
        log.hidden = hidden;
        log.hidden_calls.push(hidden);
        Ok(())
    }

    fn keyguard_done(&self, authenticated: bool, wake_up: bool) -> RemoteResult<()> {
        self.log().done_calls.push((authenticated, wake_up));
        Ok(())
    }

    fn dismiss(&self) -> RemoteResult<()> {
        self.log().dismisses += 1;
        Ok(())
    }

    fn verify_unlock(&self, result: Box<dyn FnOnce(bool) + Send>) -> RemoteResult<()> {
        let unlocked = !self.log().unlock_fails;
        result(unlocked);
        Ok(())
    }

    fn on_wake_key_when_keyguard_showing(&self, code: KeyCode) -> RemoteResult<()> {
        self.log().wake_keys.push(code);
        Ok(())
    }

    fn on_wake_motion_when_keyguard_showing(&self) -> RemoteResult<()> {
        self.log().wake_motions += 1;
        Ok(())
    }

    fn do_keyguard_timeout(&self, options: Option<&str>) -> RemoteResult<()> {
        self.log().timeout_options.push(options.map(str::to_string));
        Ok(())
    }

    fn user_activity(&self) -> RemoteResult<()> {
        Ok(())
    }

    fn set_current_user(&self, user: UserId) -> RemoteResult<()> {
        self.log().users.push(user);
        Ok(())
    }

    fn on_system_ready(&self) -> RemoteResult<()> {
        Ok(())
    }

    fn on_booted(&self) -> RemoteResult<()> {
        Ok(())
    }

    fn show_assistant(&self) -> RemoteResult<()> {
        Ok(())
    }
}

// ============================================================================
// Status bar, telephony, audio
// ============================================================================

#[derive(Default)]
struct StatusBarLog {
    system_ui_updates: Vec<SystemUiFlags>,
    collapses: usize,
    recents_toggled: usize,
    preloads: usize,
    preload_cancels: usize,
    shade_toggles: usize,
    users: Vec<UserId>,
}

#[derive(Default)]
pub struct RecordingStatusBar {
    log: Mutex<StatusBarLog>,
}

impl RecordingStatusBar {
    fn log(&self) -> MutexGuard<'_, StatusBarLog> {
        lock(&self.log)
    }

    pub fn system_ui_updates(&self) -> Vec<SystemUiFlags> {
        self.log().system_ui_updates.clone()
    }

    pub fn collapses(&self) -> usize {
        self.log().collapses
    }

    pub fn recents_toggled(&self) -> usize {
        self.log().recents_toggled
    }

    pub fn preloads(&self) -> usize {
        self.log().preloads
    }

    pub fn preload_cancels(&self) -> usize {
        self.log().preload_cancels
    }

    pub fn shade_toggles(&self) -> usize {
        self.log().shade_toggles
    }

    pub fn users(&self) -> Vec<UserId> {
        self.log().users.clone()
    }
}

impl StatusBarService for RecordingStatusBar {
    fn set_system_ui_visibility(&self, visibility: SystemUiFlags, _mask: u32) -> RemoteResult<()> {
        self.log().system_ui_updates.push(visibility);
        Ok(())
    }

    fn top_app_window_changed(&self, _needs_menu: bool) -> RemoteResult<()> {
        Ok(())
    }

    fn collapse_panels(&self) -> RemoteResult<()> {
        self.log().collapses += 1;
        Ok(())
    }

    fn toggle_recent_apps(&self) -> RemoteResult<()> {
        self.log().recents_toggled += 1;
        Ok(())
    }

    fn preload_recent_apps(&self) -> RemoteResult<()> {
        self.log().preloads += 1;
        Ok(())
    }

    fn cancel_preload_recent_apps(&self) -> RemoteResult<()> {
        self.log().preload_cancels += 1;
        Ok(())
    }

    fn toggle_notification_shade(&self) -> RemoteResult<()> {
        self.log().shade_toggles += 1;
        Ok(())
    }

    fn toggle_widgets(&self) -> RemoteResult<()> {
        Ok(())
    }

    fn set_current_user(&self, user: UserId) -> RemoteResult<()> {
        self.log().users.push(user);
        Ok(())
    }
}

#[derive(Default)]
struct TelephonyLog {
    ringing: bool,
    offhook: bool,
    silenced: usize,
    ended: usize,
    answered: usize,
}

#[derive(Default)]
pub struct FakeTelephony {
    log: Mutex<TelephonyLog>,
}

impl FakeTelephony {
    fn log(&self) -> MutexGuard<'_, TelephonyLog> {
        lock(&self.log)
    }

    pub fn set_ringing(&self, ringing: bool) {
        self.log().ringing = ringing;
    }

    pub fn set_offhook(&self, offhook: bool) {
        self.log().offhook = offhook;
    }

    pub fn silenced(&self) -> usize {
        self.log().silenced
    }

    pub fn ended(&self) -> usize {
        self.log().ended
    }

    pub fn answered(&self) -> usize {
        self.log().answered
    }
}

impl TelephonyService for FakeTelephony {
    fn is_ringing(&self) -> RemoteResult<bool> {
        Ok(self.log().ringing)
    }

    fn is_offhook(&self) -> RemoteResult<bool> {
        Ok(self.log().offhook)
    }

    fn is_idle(&self) -> RemoteResult<bool> {
        let log = self.log();
        Ok(!log.ringing && !log.offhook)
    }

    fn silence_ringer(&self) -> RemoteResult<()> {
        self.log().silenced += 1;
        Ok(())
    }

    fn end_call(&self) -> RemoteResult<bool> {
        let mut log = self.log();
        log.ended += 1;
        Ok(log.offhook || log.ringing)
    }

    fn answer_ringing_call(&self) -> RemoteResult<()> {
        self.log().answered += 1;
        Ok(())
    }
}

#[derive(Default)]
struct AudioLog {
    music_active: bool,
    media_keys: Vec<KeyEvent>,
    volume_changes: Vec<(Stream, i32)>,
}

#[derive(Default)]
pub struct RecordingAudio {
    log: Mutex<AudioLog>,
}

impl RecordingAudio {
    fn log(&self) -> MutexGuard<'_, AudioLog> {
        lock(&self.log)
    }

    pub fn set_music_active(&self, active: bool) {
        self.log().music_active = active;
    }

    pub fn media_keys(&self) -> Vec<KeyEvent> {
        self.log().media_keys.clone()
    }

    pub fn volume_changes(&self) -> Vec<(Stream, i32)> {
        self.log().volume_changes.clone()
    }
}

impl AudioService for RecordingAudio {
    fn is_music_active(&self) -> RemoteResult<bool> {
        Ok(self.log().music_active)
    }

    fn adjust_stream_volume(&self, stream: Stream, direction: i32) -> RemoteResult<()> {
        self.log().volume_changes.push((stream, direction));
        Ok(())
    }

    fn dispatch_media_key(&self, event: &KeyEvent) -> RemoteResult<()> {
        self.log().media_keys.push(*event);
        Ok(())
    }
}

// ============================================================================
// Launcher, power, wake lock, haptics
// ============================================================================

#[derive(Default)]
struct LauncherLog {
    started: Vec<Intent>,
    in_front: Option<Intent>,
    closes: Vec<Option<String>>,
    global_actions_shown: usize,
    screenshots: usize,
    kills: usize,
    last_app_switches: usize,
    recent_dialog_calls: Vec<(bool, bool)>,
    injected: Vec<KeyCode>,
}

#[derive(Default)]
pub struct RecordingLauncher {
    log: Mutex<LauncherLog>,
}

impl RecordingLauncher {
    fn log(&self) -> MutexGuard<'_, LauncherLog> {
        lock(&self.log)
    }

    pub fn started(&self) -> Vec<Intent> {
        self.log().started.clone()
    }

    /// Activity already in front; launching it again is a no-op
    pub fn set_in_front(&self, intent: Option<Intent>) {
        self.log().in_front = intent;
    }

    pub fn closes(&self) -> Vec<Option<String>> {
        self.log().closes.clone()
    }

    pub fn global_actions_shown(&self) -> usize {
        self.log().global_actions_shown
    }

    pub fn screenshots(&self) -> usize {
        self.log().screenshots
    }

    pub fn kills(&self) -> usize {
        self.log().kills
    }

    pub fn last_app_switches(&self) -> usize {
        self.log().last_app_switches
    }

    pub fn recent_dialog_calls(&self) -> Vec<(bool, bool)> {
        self.log().recent_dialog_calls.clone()
    }

    pub fn injected(&self) -> Vec<KeyCode> {
        self.log().injected.clone()
    }
}

impl ActivityLauncher for RecordingLauncher {
    fn start_activity(&self, intent: &Intent) -> Result<(), LaunchError> {
        self.log().started.push(intent.clone());
        Ok(())
    }

    fn start_activity_if_needed(&self, intent: &Intent) -> Result<bool, LaunchError> {
        let mut log = self.log();
        if log.in_front.as_ref() == Some(intent) {
            return Ok(false);
        }
        log.started.push(intent.clone());
        Ok(true)
    }

    fn send_close_system_windows(&self, reason: Option<&str>) -> RemoteResult<()> {
        self.log().closes.push(reason.map(str::to_string));
        Ok(())
    }

    fn stop_app_switches(&self) -> RemoteResult<()> {
        Ok(())
    }

    fn kill_foreground_app(&self) -> RemoteResult<bool> {
        self.log().kills += 1;
        Ok(true)
    }

    fn switch_to_last_app(&self) -> RemoteResult<()> {
        self.log().last_app_switches += 1;
        Ok(())
    }

    fn show_global_actions(&self, _keyguard_showing: bool, _device_provisioned: bool) -> RemoteResult<()> {
        self.log().global_actions_shown += 1;
        Ok(())
    }

    fn recent_apps_dialog(&self, show: bool, switch: bool) -> RemoteResult<()> {
        self.log().recent_dialog_calls.push((show, switch));
        Ok(())
    }

    fn take_screenshot(&self) -> RemoteResult<()> {
        self.log().screenshots += 1;
        Ok(())
    }

    fn inject_virtual_key(&self, code: KeyCode) -> RemoteResult<()> {
        self.log().injected.push(code);
        Ok(())
    }
}

#[derive(Default)]
struct PowerLog {
    sleeps: usize,
    wakes: usize,
    activity: usize,
}

#[derive(Default)]
pub struct RecordingPower {
    log: Mutex<PowerLog>,
}

impl RecordingPower {
    pub fn sleeps(&self) -> usize {
        lock(&self.log).sleeps
    }

    pub fn wakes(&self) -> usize {
        lock(&self.log).wakes
    }

    pub fn activity(&self) -> usize {
        lock(&self.log).activity
    }
}

impl PowerManager for RecordingPower {
    fn go_to_sleep(&self, _time_ms: u64) {
        lock(&self.log).sleeps += 1;
    }

    fn wake_up(&self, _time_ms: u64) {
        lock(&self.log).wakes += 1;
    }

    fn user_activity(&self, _time_ms: u64) {
        lock(&self.log).activity += 1;
    }
}

#[derive(Default)]
struct WakeLockLog {
    acquired: usize,
    released: usize,
}

/// Counts acquisitions; `acquire_for_test` stands in for the queueing
/// stage's acquire when a test drives media dispatch directly
#[derive(Default)]
pub struct CountingWakeLock {
    log: Mutex<WakeLockLog>,
}

impl CountingWakeLock {
    pub fn acquired(&self) -> usize {
        lock(&self.log).acquired
    }

    pub fn released(&self) -> usize {
        lock(&self.log).released
    }

    pub fn held(&self) -> usize {
        let log = lock(&self.log);
        log.acquired.saturating_sub(log.released)
    }

    pub fn is_balanced(&self) -> bool {
        let log = lock(&self.log);
        log.acquired == log.released
    }

    pub fn acquire_for_test(&self) {
        self.acquire();
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) {
        lock(&self.log).acquired += 1;
    }

    fn release(&self) {
        lock(&self.log).released += 1;
    }
}

#[derive(Default)]
pub struct RecordingHaptics {
    effects: Mutex<Vec<HapticEffect>>,
}

impl RecordingHaptics {
    pub fn effects(&self) -> Vec<HapticEffect> {
        lock(&self.effects).clone()
    }
}

impl HapticFeedback for RecordingHaptics {
    fn perform(&self, effect: HapticEffect) {
        lock(&self.effects).push(effect);
    }
}

// ============================================================================
// Window manager, orientation, key map, device keys
// ============================================================================

#[derive(Default)]
struct WindowManagerLog {
    reevaluations: usize,
    layout_switches: Vec<i32>,
    rotation_updates: Vec<bool>,
    hidden_nav_consumer: bool,
    event_dispatching: Option<bool>,
    defer_draws: bool,
    pending_draws: Vec<Completion>,
}

#[derive(Default)]
pub struct RecordingWindowManager {
    log: Mutex<WindowManagerLog>,
}

impl RecordingWindowManager {
    fn log(&self) -> MutexGuard<'_, WindowManagerLog> {
        lock(&self.log)
    }

    pub fn reevaluations(&self) -> usize {
        self.log().reevaluations
    }

    pub fn layout_switches(&self) -> Vec<i32> {
        self.log().layout_switches.clone()
    }

    pub fn rotation_updates(&self) -> Vec<bool> {
        self.log().rotation_updates.clone()
    }

    pub fn hidden_nav_consumer(&self) -> bool {
        self.log().hidden_nav_consumer
    }

    pub fn event_dispatching(&self) -> Option<bool> {
        self.log().event_dispatching
    }

    /// Hold draw waits until `complete_draws`; otherwise report that
    /// there is nothing to wait for
    pub fn set_defer_draws(&self, defer: bool) {
        self.log().defer_draws = defer;
    }

    pub fn complete_draws(&self) {
        let pending = std::mem::take(&mut self.log().pending_draws);
        for done in pending {
            done();
        }
    }
}

impl WindowManagerFuncs for RecordingWindowManager {
    fn reevaluate_status_bar_visibility(&self) -> RemoteResult<()> {
        self.log().reevaluations += 1;
        Ok(())
    }

    fn switch_keyboard_layout(&self, _device_id: i32, direction: i32) -> RemoteResult<()> {
        self.log().layout_switches.push(direction);
        Ok(())
    }

    fn update_rotation(&self, always_send_configuration: bool) -> RemoteResult<()> {
        self.log().rotation_updates.push(always_send_configuration);
        Ok(())
    }

    fn set_hidden_nav_consumer(&self, installed: bool) -> RemoteResult<()> {
        self.log().hidden_nav_consumer = installed;
        Ok(())
    }

    fn shutdown(&self, _confirm: bool) -> RemoteResult<()> {
        Ok(())
    }

    fn set_event_dispatching(&self, enabled: bool) -> RemoteResult<()> {
        self.log().event_dispatching = Some(enabled);
        Ok(())
    }

    fn wait_for_window_drawn(&self, _window: WindowId, done: Completion) -> RemoteResult<bool> {
        let mut log = self.log();
        if log.defer_draws {
            log.pending_draws.push(done);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[derive(Default)]
struct OrientationLog {
    enabled: bool,
    current_rotation: Option<Rotation>,
}

#[derive(Default)]
pub struct FakeOrientation {
    log: Mutex<OrientationLog>,
}

impl FakeOrientation {
    pub fn enabled(&self) -> bool {
        lock(&self.log).enabled
    }

    pub fn current_rotation(&self) -> Option<Rotation> {
        lock(&self.log).current_rotation
    }
}

impl OrientationListener for FakeOrientation {
    fn enable(&self) {
        lock(&self.log).enabled = true;
    }

    fn disable(&self) {
        lock(&self.log).enabled = false;
    }

    fn can_detect_orientation(&self) -> bool {
        true
    }

    fn set_current_rotation(&self, rotation: Rotation) {
        lock(&self.log).current_rotation = Some(rotation);
    }
}

#[derive(Default)]
struct KeyMapEntries {
    shortcuts: Vec<(KeyCode, Intent)>,
    fallbacks: Vec<(KeyCode, KeyCode)>,
}

#[derive(Default)]
pub struct FakeKeyMap {
    entries: Mutex<KeyMapEntries>,
}

impl FakeKeyMap {
    pub fn add_shortcut(&self, code: KeyCode, intent: Intent) {
        lock(&self.entries).shortcuts.push((code, intent));
    }

    pub fn add_fallback(&self, from: KeyCode, to: KeyCode) {
        lock(&self.entries).fallbacks.push((from, to));
    }
}

impl KeyCharacterMap for FakeKeyMap {
    fn fallback_action(&self, code: KeyCode, meta: MetaState) -> Option<(KeyCode, MetaState)> {
        let entries = lock(&self.entries);
        entries.fallbacks.iter().find(|(from, _)| *from == code).map(|(_, to)| (*to, meta))
    }

    fn shortcut_intent(&self, code: KeyCode, _meta: MetaState) -> Option<Intent> {
        let entries = lock(&self.entries);
        entries.shortcuts.iter().find(|(c, _)| *c == code).map(|(_, intent)| intent.clone())
    }
}

struct FailingDeviceKeys;

impl DeviceKeyHandler for FailingDeviceKeys {
    fn handle_key_event(&self, _event: &KeyEvent) -> RemoteResult<bool> {
        Err(RemoteError::Died)
    }
}

// ============================================================================
// Windows
// ============================================================================

/// A window that notes every call made into it while the policy's
/// singleton registry is locked
pub struct LockCheckingWindow {
    inner: FakeWindow,
    policy: Weak<PhonePolicy>,
    calls_under_lock: AtomicUsize,
}

impl LockCheckingWindow {
    pub fn new(inner: FakeWindow, policy: &Arc<PhonePolicy>) -> Arc<Self> {
        Arc::new(Self { inner, policy: Arc::downgrade(policy), calls_under_lock: AtomicUsize::new(0) })
    }

    pub fn calls_under_lock(&self) -> usize {
        self.calls_under_lock.load(Ordering::SeqCst)
    }

    fn check(&self) {
        if self.policy.upgrade().is_some_and(|p| p.windows_locked()) {
            self.calls_under_lock.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl PolicyWindow for LockCheckingWindow {
    fn id(&self) -> WindowId {
        self.check();
        self.inner.id()
    }

    fn attrs(&self) -> WindowAttrs {
        self.check();
        self.inner.attrs()
    }

    fn surface_layer(&self) -> i32 {
        self.check();
        self.inner.surface_layer()
    }

    fn is_alive(&self) -> bool {
        self.check();
        self.inner.is_alive()
    }

    fn is_visible(&self) -> bool {
        self.check();
        self.inner.is_visible()
    }

    fn is_visible_or_behind_keyguard(&self) -> bool {
        self.check();
        self.inner.is_visible_or_behind_keyguard()
    }

    fn is_gone_for_layout(&self) -> bool {
        self.check();
        self.inner.is_gone_for_layout()
    }

    fn is_animating(&self) -> bool {
        self.check();
        self.inner.is_animating()
    }

    fn has_drawn(&self) -> bool {
        self.check();
        self.inner.has_drawn()
    }

    fn frame(&self) -> Rect {
        self.check();
        self.inner.frame()
    }

    fn display_frame(&self) -> Rect {
        self.check();
        self.inner.display_frame()
    }

    fn content_frame(&self) -> Rect {
        self.check();
        self.inner.content_frame()
    }

    fn visible_frame(&self) -> Rect {
        self.check();
        self.inner.visible_frame()
    }

    fn compute_frame(&self, frames: &WindowFrames) {
        self.check();
        self.inner.compute_frame(frames);
    }

    fn set_gravity(&self, gravity: Gravity) {
        self.check();
        self.inner.set_gravity(gravity);
    }

    fn show(&self, animate: bool) -> bool {
        self.check();
        self.inner.show(animate)
    }

    fn hide(&self, animate: bool) -> bool {
        self.check();
        self.inner.hide(animate)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct HarnessBuilder {
    config: PolicyConfig,
    settings: Vec<(String, String)>,
    booted: bool,
    system_ready: bool,
    device_key_handler_fails: bool,
}

impl HarnessBuilder {
    pub fn config(mut self, config: PolicyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.push((key.to_string(), value.to_string()));
        self
    }

    pub fn booted(mut self, booted: bool) -> Self {
        self.booted = booted;
        self
    }

    pub fn system_ready(mut self, ready: bool) -> Self {
        self.system_ready = ready;
        self
    }

    pub fn device_key_handler_fails(mut self, fails: bool) -> Self {
        self.device_key_handler_fails = fails;
        self
    }

    pub fn build(self) -> Harness {
        let scheduler = Arc::new(ManualScheduler::new());
        let mut seeded = vec![(keys::SCREEN_OFF_TIMEOUT.to_string(), "30000".to_string())];
        seeded.extend(self.settings);
        let settings = Arc::new(MemorySettings::with_values(
            USER_OWNER,
            seeded.iter().map(|(k, v)| (k.as_str(), v.clone())),
        ));

        let keyguard = Arc::new(RecordingKeyguard::default());
        let status_bar = Arc::new(RecordingStatusBar::default());
        let telephony = Arc::new(FakeTelephony::default());
        let audio = Arc::new(RecordingAudio::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let power = Arc::new(RecordingPower::default());
        let wake_lock = Arc::new(CountingWakeLock::default());
        let haptics = Arc::new(RecordingHaptics::default());
        let window_manager = Arc::new(RecordingWindowManager::default());
        let orientation = Arc::new(FakeOrientation::default());
        let key_map = Arc::new(FakeKeyMap::default());

        let status_bar_service: Arc<dyn StatusBarService> = status_bar.clone();
        let telephony_service: Arc<dyn TelephonyService> = telephony.clone();
        let audio_service: Arc<dyn AudioService> = audio.clone();
        let device_key_handler = if self.device_key_handler_fails {
            Some(Arc::new(FailingDeviceKeys) as Arc<dyn DeviceKeyHandler>)
        } else {
            None
        };
        let services = Collaborators {
            window_manager: window_manager.clone(),
            keyguard: Some(keyguard.clone() as Arc<dyn KeyguardMediator>),
            status_bar: CachedService::fixed("status_bar", status_bar_service),
            telephony: CachedService::fixed("telephony", telephony_service),
            audio: CachedService::fixed("audio", audio_service),
            launcher: launcher.clone(),
            power: power.clone(),
            wake_lock: wake_lock.clone(),
            haptics: haptics.clone(),
            device_key_handler,
            orientation: orientation.clone(),
            key_map: key_map.clone(),
        };

        let policy = PhonePolicy::new(self.config, services, scheduler.clone(), scheduler.clone(), settings.clone());
        policy.set_initial_display_size(720, 1280, 320);
        if self.system_ready {
            policy.system_ready();
        }
        if self.booted {
            policy.system_booted();
        }
        scheduler.run_pending(&*policy);

        Harness {
            policy,
            scheduler,
            settings: TestSettings(settings),
            keyguard,
            status_bar,
            telephony,
            audio,
            launcher,
            power,
            wake_lock,
            haptics,
            window_manager,
            orientation,
            key_map,
            next_window_id: AtomicU64::new(1000),
        }
    }
}

/// A booted, ready policy on a 720x1280 phone with the screen off
pub struct Harness {
    pub policy: Arc<PhonePolicy>,
    pub scheduler: Arc<ManualScheduler>,
    pub settings: TestSettings,
    pub keyguard: Arc<RecordingKeyguard>,
    pub status_bar: Arc<RecordingStatusBar>,
    pub telephony: Arc<FakeTelephony>,
    pub audio: Arc<RecordingAudio>,
    pub launcher: Arc<RecordingLauncher>,
    pub power: Arc<RecordingPower>,
    pub wake_lock: Arc<CountingWakeLock>,
    pub haptics: Arc<RecordingHaptics>,
    pub window_manager: Arc<RecordingWindowManager>,
    pub orientation: Arc<FakeOrientation>,
    pub key_map: Arc<FakeKeyMap>,
    next_window_id: AtomicU64,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: PolicyConfig::default(),
            settings: Vec::new(),
            booted: true,
            system_ready: true,
            device_key_handler_fails: false,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Owner settings seeded before the policy first reads them
    pub fn with_settings(values: &[(&str, &str)]) -> Self {
        values.iter().fold(Self::builder(), |b, (k, v)| b.setting(k, v)).build()
    }

    pub fn now(&self) -> u64 {
        self.scheduler.now_ms()
    }

    /// Move virtual time forward, running whatever comes due
    pub fn advance(&self, ms: u64) {
        self.scheduler.advance(ms, &*self.policy);
    }

    pub fn handle(&self, message: PolicyMessage) {
        self.policy.handle_message(message);
    }

    pub fn add_window(&self, window: &FakeWindow) {
        self.policy.prepare_add_window(&window.clone().into_ref(), HeldPermissions::all());
    }

    /// One full layout and post-layout pass; `windows` is ordered top first
    pub fn layout_pass(&self, windows: &[FakeWindow]) {
        let refs: Vec<WindowRef> = windows.iter().cloned().map(FakeWindow::into_ref).collect();
        self.layout_refs(&refs);
    }

    /// Same as [`Harness::layout_pass`] over arbitrary handles
    pub fn layout_refs(&self, refs: &[WindowRef]) {
        let rotation = self.policy.rotation().current_rotation;
        self.policy.begin_layout(720, 1280, rotation, true);
        for w in refs.iter().rev() {
            self.policy.layout_window(w, None);
        }
        self.policy.finish_layout();
        self.policy.begin_post_layout_policy();
        for w in refs {
            self.policy.apply_post_layout_policy(w);
        }
        self.policy.finish_post_layout_policy();
    }

    /// Focus a fresh window with `attrs` and lay it out alone
    pub fn layout_with_top_window(&self, attrs: WindowAttrs) -> FakeWindow {
        let id = self.next_window_id.fetch_add(1, Ordering::SeqCst);
        let window = FakeWindow::new(id, attrs);
        self.policy.focus_changed(Some(window.clone().into_ref()));
        self.layout_pass(&[window.clone()]);
        window
    }
}
