//! Scripted replay against a simulated phone
//!
//! A replay script is a TOML file with optional seed `[settings]`, an
//! optional `[display]` and a list of `[[steps]]`. Each step drives one
//! policy entry point the way the window server or input reader would.
//! Collaborators are played by [`SimDevice`], which logs every call and
//! keeps just enough state (keyguard, call state, music) for the policy's
//! queries to make sense.
//!
//! ```toml
//! [settings]
//! screen_off_timeout = "15000"
//!
//! [[steps]]
//! op = "layout"
//! focus = 10
//! windows = [{ id = 10, type = "application" }]
//!
//! [[steps]]
//! op = "key"
//! code = "home"
//! hold_ms = 600
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::error::{LaunchError, PolicyError, RemoteResult, Result};
use crate::geometry::{Rect, Rotation, ScreenOrientation};
use crate::handler::{Clock, HandlerThread, ManualScheduler, MessageHandler, PolicyScheduler};
use crate::input::keys::{Dispatch, KeyCode, KeyEvent, MetaState, PolicyFlags, QueueAction};
use crate::policy::PhonePolicy;
use crate::rotation::{DockMode, UiMode};
use crate::services::{
    ActivityLauncher, AudioService, CachedService, Collaborators, Completion, HapticEffect, HapticFeedback, Intent,
    KeyCharacterMap, KeyguardMediator, OffReason, OrientationListener, PowerManager, StatusBarService, Stream,
    TelephonyService, WakeLock, WindowManagerFuncs,
};
use crate::settings::{MemorySettings, SettingsStore, UserId, USER_OWNER};
use crate::window::{Gravity, HeldPermissions, PolicyWindow, SystemUiFlags, WindowAttrs, WindowFrames, WindowId, WindowRef};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Id the simulated keyguard reports for its own window
const KEYGUARD_WINDOW: WindowId = WindowId(u64::MAX);

/// Dispatch retries before a key is given up on
const MAX_DISPATCH_RETRIES: usize = 16;

// ============================================================================
// Simulated windows
// ============================================================================

#[derive(Debug)]
struct SimWindowState {
    attrs: WindowAttrs,
    alive: bool,
    shown: bool,
    drawn: bool,
    gone: bool,
    animating: bool,
    frames: WindowFrames,
    frame: Rect,
    gravity: Option<Gravity>,
    compute_count: usize,
}

/// A window as the window server would present it to the policy.
///
/// Clones share state, so a handle kept by the caller observes what the
/// policy does to the window.
#[derive(Debug, Clone)]
pub struct SimWindow {
    id: WindowId,
    state: Arc<Mutex<SimWindowState>>,
}

impl SimWindow {
    pub fn new(id: u64, attrs: WindowAttrs) -> Self {
        Self {
            id: WindowId(id),
            state: Arc::new(Mutex::new(SimWindowState {
                attrs,
                alive: true,
                shown: true,
                drawn: true,
                gone: false,
                animating: false,
                frames: WindowFrames::default(),
                frame: Rect::default(),
                gravity: None,
                compute_count: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimWindowState> {
        lock(&self.state)
    }

    pub fn into_ref(self) -> WindowRef {
        Arc::new(self)
    }

    pub fn set_gone(&self, gone: bool) {
        self.state().gone = gone;
    }

    pub fn set_drawn(&self, drawn: bool) {
        self.state().drawn = drawn;
    }

    pub fn set_shown(&self, shown: bool) {
        self.state().shown = shown;
    }

    pub fn set_alive(&self, alive: bool) {
        self.state().alive = alive;
    }

    pub fn set_animating(&self, animating: bool) {
        self.state().animating = animating;
    }

    pub fn is_shown(&self) -> bool {
        self.state().shown
    }

    /// Frames from the last layout
    pub fn frames(&self) -> WindowFrames {
        self.state().frames
    }

    pub fn compute_count(&self) -> usize {
        self.state().compute_count
    }

    pub fn gravity(&self) -> Option<Gravity> {
        self.state().gravity
    }

    /// Move the top edge of the window, as an input method does once it
    /// has measured itself
    pub fn set_frames_top(&self, top: i32) {
        let mut state = self.state();
        state.frame.top = top;
        state.frames.content.top = top;
        state.frames.visible.top = top;
    }
}

impl PolicyWindow for SimWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn attrs(&self) -> WindowAttrs {
        self.state().attrs.clone()
    }

    fn surface_layer(&self) -> i32 {
        self.state().attrs.window_type.rules().layer * 10_000
    }

    fn is_alive(&self) -> bool {
        self.state().alive
    }

    fn is_visible(&self) -> bool {
        let state = self.state();
        state.shown && !state.gone
    }

    fn is_visible_or_behind_keyguard(&self) -> bool {
        !self.state().gone
    }

    fn is_gone_for_layout(&self) -> bool {
        self.state().gone
    }

    fn is_animating(&self) -> bool {
        self.state().animating
    }

    fn has_drawn(&self) -> bool {
        self.state().drawn
    }

    fn frame(&self) -> Rect {
        self.state().frame
    }

    fn display_frame(&self) -> Rect {
        self.state().frames.display
    }

    fn content_frame(&self) -> Rect {
        self.state().frames.content
    }

    fn visible_frame(&self) -> Rect {
        self.state().frames.visible
    }

    fn compute_frame(&self, frames: &WindowFrames) {
        let mut state = self.state();
        state.frames = *frames;
        state.frame = frames.parent;
        state.compute_count += 1;
    }

    fn set_gravity(&self, gravity: Gravity) {
        self.state().gravity = Some(gravity);
    }

    fn show(&self, _animate: bool) -> bool {
        let mut state = self.state();
        let changed = !state.shown;
        state.shown = true;
        changed
    }

    fn hide(&self, _animate: bool) -> bool {
        let mut state = self.state();
        let changed = state.shown;
        state.shown = false;
        changed
    }
}

// ============================================================================
// Simulated collaborators
// ============================================================================

#[derive(Debug, Default)]
struct SimDeviceState {
    keyguard_showing: bool,
    keyguard_secure: bool,
    keyguard_hidden: bool,
    ringing: bool,
    offhook: bool,
    music_active: bool,
    orientation_enabled: bool,
    wake_locks: i64,
}

/// Every collaborator the policy needs, simulated in-process
#[derive(Debug, Default)]
pub struct SimDevice {
    state: Mutex<SimDeviceState>,
}

impl SimDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, SimDeviceState> {
        lock(&self.state)
    }

    pub fn set_keyguard(&self, showing: Option<bool>, secure: Option<bool>) {
        let mut state = self.state();
        if let Some(showing) = showing {
            state.keyguard_showing = showing;
        }
        if let Some(secure) = secure {
            state.keyguard_secure = secure;
        }
        info!(showing = state.keyguard_showing, secure = state.keyguard_secure, "sim: keyguard state");
    }

    pub fn set_call_state(&self, call: CallState) {
        let mut state = self.state();
        state.ringing = call == CallState::Ringing;
        state.offhook = call == CallState::Offhook;
        info!(?call, "sim: call state");
    }

    pub fn set_music_active(&self, active: bool) {
        self.state().music_active = active;
    }

    pub fn orientation_enabled(&self) -> bool {
        self.state().orientation_enabled
    }

    /// Outstanding wake lock acquisitions
    pub fn wake_locks_held(&self) -> i64 {
        self.state().wake_locks
    }

    /// Bundle this device as the policy's collaborators
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        let status_bar: Arc<dyn StatusBarService> = self.clone();
        let telephony: Arc<dyn TelephonyService> = self.clone();
        let audio: Arc<dyn AudioService> = self.clone();
        Collaborators {
            window_manager: self.clone(),
            keyguard: Some(self.clone() as Arc<dyn KeyguardMediator>),
            status_bar: CachedService::fixed("status_bar", status_bar),
            telephony: CachedService::fixed("telephony", telephony),
            audio: CachedService::fixed("audio", audio),
            launcher: self.clone(),
            power: self.clone(),
            wake_lock: self.clone(),
            haptics: self.clone(),
            device_key_handler: None,
            orientation: self.clone(),
            key_map: self.clone(),
        }
    }
}

impl WindowManagerFuncs for SimDevice {
    fn reevaluate_status_bar_visibility(&self) -> RemoteResult<()> {
        info!("sim: wm reevaluate status bar visibility");
        Ok(())
    }

    fn switch_keyboard_layout(&self, device_id: i32, direction: i32) -> RemoteResult<()> {
        info!(device_id, direction, "sim: wm switch keyboard layout");
        Ok(())
    }

    fn update_rotation(&self, always_send_configuration: bool) -> RemoteResult<()> {
        info!(always_send_configuration, "sim: wm update rotation");
        Ok(())
    }

    fn set_hidden_nav_consumer(&self, installed: bool) -> RemoteResult<()> {
        info!(installed, "sim: wm hidden nav consumer");
        Ok(())
    }

    fn shutdown(&self, confirm: bool) -> RemoteResult<()> {
        info!(confirm, "sim: wm shutdown");
        Ok(())
    }

    fn set_event_dispatching(&self, enabled: bool) -> RemoteResult<()> {
        info!(enabled, "sim: wm event dispatching");
        Ok(())
    }

    fn wait_for_window_drawn(&self, window: WindowId, _done: Completion) -> RemoteResult<bool> {
        // Every simulated window is already drawn
        debug!(%window, "sim: wm window already drawn");
        Ok(false)
    }
}

impl KeyguardMediator for SimDevice {
    fn on_screen_turned_off(&self, why: OffReason) -> RemoteResult<()> {
        let mut state = self.state();
        state.keyguard_showing = true;
        state.keyguard_hidden = false;
        info!(?why, "sim: keyguard screen off, showing");
        Ok(())
    }

    fn on_screen_turned_on(&self, shown: Option<Box<dyn FnOnce(Option<WindowId>) + Send>>) -> RemoteResult<()> {
        let window = self.state().keyguard_showing.then_some(KEYGUARD_WINDOW);
        info!(?window, "sim: keyguard screen on");
        if let Some(shown) = shown {
            shown(window);
        }
        Ok(())
    }

    fn is_showing(&self) -> bool {
        self.state().keyguard_showing
    }

    fn is_showing_and_not_hidden(&self) -> bool {
        let state = self.state();
        state.keyguard_showing && !state.keyguard_hidden
    }

    fn is_secure(&self) -> bool {
        self.state().keyguard_secure
    }

    fn is_input_restricted(&self) -> bool {
        self.state().keyguard_showing
    }

    fn is_dismissable(&self) -> bool {
        !self.state().keyguard_secure
    }

    fn set_hidden(&self, hidden: bool) -> RemoteResult<()> {
        self.state().keyguard_hidden = hidden;
        info!(hidden, "sim: keyguard hidden");
        Ok(())
    }

    fn keyguard_done(&self, authenticated: bool, wake_up: bool) -> RemoteResult<()> {
        self.state().keyguard_showing = false;
        info!(authenticated, wake_up, "sim: keyguard done");
        Ok(())
    }

    fn dismiss(&self) -> RemoteResult<()> {
        let mut state = self.state();
        if !state.keyguard_secure {
            state.keyguard_showing = false;
        }
        info!(showing = state.keyguard_showing, "sim: keyguard dismiss");
        Ok(())
    }

    fn verify_unlock(&self, result: Box<dyn FnOnce(bool) + Send>) -> RemoteResult<()> {
        let unlocked = !self.state().keyguard_secure;
        info!(unlocked, "sim: keyguard verify unlock");
        result(unlocked);
        Ok(())
    }

    fn on_wake_key_when_keyguard_showing(&self, code: KeyCode) -> RemoteResult<()> {
        info!(?code, "sim: keyguard wake key");
        Ok(())
    }

    fn on_wake_motion_when_keyguard_showing(&self) -> RemoteResult<()> {
        info!("sim: keyguard wake motion");
        Ok(())
    }

    fn do_keyguard_timeout(&self, options: Option<&str>) -> RemoteResult<()> {
        self.state().keyguard_showing = true;
        info!(?options, "sim: keyguard timeout, locking");
        Ok(())
    }

    fn user_activity(&self) -> RemoteResult<()> {
        debug!("sim: keyguard user activity");
        Ok(())
    }

    fn set_current_user(&self, user: UserId) -> RemoteResult<()> {
        info!(user, "sim: keyguard user");
        Ok(())
    }

    fn on_system_ready(&self) -> RemoteResult<()> {
        info!("sim: keyguard system ready");
        Ok(())
    }

    fn on_booted(&self) -> RemoteResult<()> {
        info!("sim: keyguard booted");
        Ok(())
    }

    fn show_assistant(&self) -> RemoteResult<()> {
        info!("sim: keyguard assistant");
        Ok(())
    }
}

impl StatusBarService for SimDevice {
    fn set_system_ui_visibility(&self, visibility: SystemUiFlags, mask: u32) -> RemoteResult<()> {
        info!(?visibility, mask = format_args!("{:#x}", mask), "sim: status bar visibility");
        Ok(())
    }

    fn top_app_window_changed(&self, needs_menu: bool) -> RemoteResult<()> {
        info!(needs_menu, "sim: status bar top app changed");
        Ok(())
    }

    fn collapse_panels(&self) -> RemoteResult<()> {
        info!("sim: status bar collapse panels");
        Ok(())
    }

    fn toggle_recent_apps(&self) -> RemoteResult<()> {
        info!("sim: status bar toggle recents");
        Ok(())
    }

    fn preload_recent_apps(&self) -> RemoteResult<()> {
        info!("sim: status bar preload recents");
        Ok(())
    }

    fn cancel_preload_recent_apps(&self) -> RemoteResult<()> {
        info!("sim: status bar cancel preload recents");
        Ok(())
    }

    fn toggle_notification_shade(&self) -> RemoteResult<()> {
        info!("sim: status bar toggle shade");
        Ok(())
    }

    fn toggle_widgets(&self) -> RemoteResult<()> {
        info!("sim: status bar toggle widgets");
        Ok(())
    }

    fn set_current_user(&self, user: UserId) -> RemoteResult<()> {
        info!(user, "sim: status bar user");
        Ok(())
    }
}

impl TelephonyService for SimDevice {
    fn is_ringing(&self) -> RemoteResult<bool> {
        Ok(self.state().ringing)
    }

    fn is_offhook(&self) -> RemoteResult<bool> {
        Ok(self.state().offhook)
    }

    fn is_idle(&self) -> RemoteResult<bool> {
        let state = self.state();
        Ok(!state.ringing && !state.offhook)
    }

    fn silence_ringer(&self) -> RemoteResult<()> {
        info!("sim: telephony silence ringer");
        Ok(())
    }

    fn end_call(&self) -> RemoteResult<bool> {
        let mut state = self.state();
        let ended = state.ringing || state.offhook;
        state.ringing = false;
        state.offhook = false;
        info!(ended, "sim: telephony end call");
        Ok(ended)
    }

    fn answer_ringing_call(&self) -> RemoteResult<()> {
        let mut state = self.state();
        if state.ringing {
            state.ringing = false;
            state.offhook = true;
        }
        info!("sim: telephony answer");
        Ok(())
    }
}

impl AudioService for SimDevice {
    fn is_music_active(&self) -> RemoteResult<bool> {
        Ok(self.state().music_active)
    }

    fn adjust_stream_volume(&self, stream: Stream, direction: i32) -> RemoteResult<()> {
        info!(?stream, direction, "sim: audio adjust volume");
        Ok(())
    }

    fn dispatch_media_key(&self, event: &KeyEvent) -> RemoteResult<()> {
        info!(key = ?event.code, down = event.down, repeat = event.repeat_count, "sim: audio media key");
        Ok(())
    }
}

impl ActivityLauncher for SimDevice {
    fn start_activity(&self, intent: &Intent) -> std::result::Result<(), LaunchError> {
        info!(%intent, "sim: start activity");
        Ok(())
    }

    fn start_activity_if_needed(&self, intent: &Intent) -> std::result::Result<bool, LaunchError> {
        info!(%intent, "sim: start activity if needed");
        Ok(true)
    }

    fn send_close_system_windows(&self, reason: Option<&str>) -> RemoteResult<()> {
        info!(?reason, "sim: close system windows");
        Ok(())
    }

    fn stop_app_switches(&self) -> RemoteResult<()> {
        debug!("sim: stop app switches");
        Ok(())
    }

    fn kill_foreground_app(&self) -> RemoteResult<bool> {
        info!("sim: kill foreground app");
        Ok(true)
    }

    fn switch_to_last_app(&self) -> RemoteResult<()> {
        info!("sim: switch to last app");
        Ok(())
    }

    fn show_global_actions(&self, keyguard_showing: bool, device_provisioned: bool) -> RemoteResult<()> {
        info!(keyguard_showing, device_provisioned, "sim: global actions");
        Ok(())
    }

    fn recent_apps_dialog(&self, show: bool, switch: bool) -> RemoteResult<()> {
        info!(show, switch, "sim: recent apps dialog");
        Ok(())
    }

    fn take_screenshot(&self) -> RemoteResult<()> {
        info!("sim: screenshot");
        Ok(())
    }

    fn inject_virtual_key(&self, code: KeyCode) -> RemoteResult<()> {
        info!(?code, "sim: inject virtual key");
        Ok(())
    }
}

impl PowerManager for SimDevice {
    fn go_to_sleep(&self, time_ms: u64) {
        info!(time_ms, "sim: power go to sleep");
    }

    fn wake_up(&self, time_ms: u64) {
        info!(time_ms, "sim: power wake up");
    }

    fn user_activity(&self, time_ms: u64) {
        debug!(time_ms, "sim: power user activity");
    }
}

impl WakeLock for SimDevice {
    fn acquire(&self) {
        self.state().wake_locks += 1;
    }

    fn release(&self) {
        let mut state = self.state();
        state.wake_locks -= 1;
        if state.wake_locks < 0 {
            warn!("sim: wake lock released more often than acquired");
        }
    }
}

impl HapticFeedback for SimDevice {
    fn perform(&self, effect: HapticEffect) {
        info!(?effect, "sim: haptic");
    }
}

impl OrientationListener for SimDevice {
    fn enable(&self) {
        self.state().orientation_enabled = true;
        info!("sim: orientation listener enabled");
    }

    fn disable(&self) {
        self.state().orientation_enabled = false;
        info!("sim: orientation listener disabled");
    }

    fn can_detect_orientation(&self) -> bool {
        true
    }

    fn set_current_rotation(&self, rotation: Rotation) {
        debug!(?rotation, "sim: orientation listener rotation");
    }
}

impl KeyCharacterMap for SimDevice {
    fn fallback_action(&self, _code: KeyCode, _meta: MetaState) -> Option<(KeyCode, MetaState)> {
        None
    }

    fn shortcut_intent(&self, _code: KeyCode, _meta: MetaState) -> Option<Intent> {
        None
    }
}

// ============================================================================
// Script
// ============================================================================

/// Telephony call state a script can put the device in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    Offhook,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DisplaySpec {
    pub width: i32,
    pub height: i32,
    pub density: i32,
}

impl Default for DisplaySpec {
    fn default() -> Self {
        Self { width: 720, height: 1280, density: 320 }
    }
}

/// One window in a `layout` step, listed bottom to top
#[derive(Debug, Clone, Deserialize)]
pub struct WindowSpec {
    pub id: u64,
    #[serde(flatten)]
    pub attrs: WindowAttrs,
    #[serde(default)]
    pub gone: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Press and release a key; `hold_ms` elapses between the two
    Key {
        code: KeyCode,
        #[serde(default)]
        hold_ms: u64,
        #[serde(default)]
        meta: MetaState,
        /// The input reader marks this key as a wake key
        #[serde(default)]
        wake: bool,
    },
    /// Touch while the screen is off
    Motion,
    ScreenOff {
        #[serde(default)]
        reason: Option<OffReason>,
    },
    ScreenOn,
    Lid {
        open: bool,
    },
    Hdmi {
        plugged: bool,
    },
    WifiDisplay {
        connected: bool,
    },
    Dock {
        mode: DockMode,
    },
    UiMode {
        mode: UiMode,
    },
    /// Orientation sensor proposes a rotation
    Sensor {
        rotation: Rotation,
    },
    /// Orientation requested by the focused app
    Orientation {
        orientation: ScreenOrientation,
    },
    Layout {
        windows: Vec<WindowSpec>,
        #[serde(default)]
        focus: Option<u64>,
    },
    Advance {
        ms: u64,
    },
    Setting {
        key: String,
        value: String,
        #[serde(default)]
        user: UserId,
    },
    Keyguard {
        #[serde(default)]
        showing: Option<bool>,
        #[serde(default)]
        secure: Option<bool>,
    },
    Call {
        state: CallState,
    },
    Music {
        #[serde(default = "default_true")]
        active: bool,
    },
    HiddenNavTouch,
    UserActivity,
    LockNow,
    User {
        user: UserId,
    },
    Dump,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub display: DisplaySpec,
    /// Seed values for the owner's settings
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Script(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| PolicyError::Script(e.to_string()))
    }
}

// ============================================================================
// Runner
// ============================================================================

enum Clocking {
    Manual(Arc<ManualScheduler>),
    Realtime(Arc<HandlerThread>),
}

/// Replays a [`Script`] against a fresh policy
pub struct Replay {
    pub policy: Arc<PhonePolicy>,
    pub device: Arc<SimDevice>,
    settings: Arc<MemorySettings>,
    clocking: Clocking,
    display: DisplaySpec,
    windows: Vec<SimWindow>,
    focused: Option<WindowRef>,
    screen_on: AtomicBool,
    event_time: AtomicU64,
}

impl Replay {
    /// Build a booted, ready policy on virtual time, or on the handler
    /// thread when `realtime` is set
    pub fn new(config: PolicyConfig, script: &Script, realtime: bool) -> Result<Self> {
        let device = SimDevice::new();
        let settings = Arc::new(MemorySettings::with_values(
            USER_OWNER,
            script.settings.iter().map(|(k, v)| (k.as_str(), v.clone())),
        ));

        let (clocking, scheduler, clock): (Clocking, Arc<dyn PolicyScheduler>, Arc<dyn Clock>) = if realtime {
            let thread = Arc::new(HandlerThread::spawn()?);
            (Clocking::Realtime(thread.clone()), thread.clone() as Arc<dyn PolicyScheduler>, thread as Arc<dyn Clock>)
        } else {
            let manual = Arc::new(ManualScheduler::new());
            (Clocking::Manual(manual.clone()), manual.clone() as Arc<dyn PolicyScheduler>, manual as Arc<dyn Clock>)
        };

        let store: Arc<dyn SettingsStore> = settings.clone();
        let policy = PhonePolicy::new(config, device.collaborators(), scheduler, clock, store);
        if let Clocking::Realtime(thread) = &clocking {
            let handler: Weak<dyn MessageHandler> = Arc::downgrade(&policy) as Weak<dyn MessageHandler>;
            thread.attach(handler);
        }

        let display = script.display;
        policy.set_initial_display_size(display.width, display.height, display.density);
        policy.system_ready();
        policy.system_booted();

        let replay = Self {
            policy,
            device,
            settings,
            clocking,
            display,
            windows: Vec::new(),
            focused: None,
            screen_on: AtomicBool::new(false),
            event_time: AtomicU64::new(0),
        };
        replay.settle();
        replay.turn_screen_on();
        Ok(replay)
    }

    /// Run queued work without moving time forward
    fn settle(&self) {
        if let Clocking::Manual(manual) = &self.clocking {
            manual.run_pending(&*self.policy);
        }
    }

    fn advance(&self, ms: u64) {
        match &self.clocking {
            Clocking::Manual(manual) => manual.advance(ms, &*self.policy),
            Clocking::Realtime(_) => std::thread::sleep(Duration::from_millis(ms)),
        }
    }

    fn now(&self) -> u64 {
        match &self.clocking {
            Clocking::Manual(manual) => manual.now_ms(),
            Clocking::Realtime(thread) => thread.now_ms(),
        }
    }

    fn turn_screen_on(&self) {
        if !self.screen_on.swap(true, Ordering::SeqCst) {
            self.policy.screen_turning_on(None);
            self.settle();
        }
    }

    fn turn_screen_off(&self, why: OffReason) {
        if self.screen_on.swap(false, Ordering::SeqCst) {
            self.policy.screen_turned_off(why);
            self.settle();
        }
    }

    /// Run every step in order; a `dump` step writes to `out`
    pub fn run(&mut self, script: &Script, out: &mut dyn Write) -> Result<()> {
        for (index, step) in script.steps.iter().enumerate() {
            debug!(index, ?step, "Replay step");
            self.step(step, out)?;
            self.settle();
        }
        info!(wake_locks = self.device.wake_locks_held(), "Replay finished");
        Ok(())
    }

    fn step(&mut self, step: &Step, out: &mut dyn Write) -> Result<()> {
        match step {
            Step::Key { code, hold_ms, meta, wake } => {
                let time = self.now().max(self.event_time.load(Ordering::SeqCst));
                let down = KeyEvent::down(*code, time).with_meta(*meta);
                let flags = if *wake { PolicyFlags::WAKE | PolicyFlags::TRUSTED } else { PolicyFlags::TRUSTED };
                self.key(&down, flags);
                self.advance(*hold_ms);
                let up = KeyEvent::up_from(&down, time + hold_ms);
                self.key(&up, flags);
                self.event_time.store(time + hold_ms + 1, Ordering::SeqCst);
            }
            Step::Motion => {
                let action = self.policy.intercept_motion_before_queueing_when_screen_off(PolicyFlags::WAKE);
                info!(?action, "Motion queued");
                self.apply_queue_action(action);
            }
            Step::ScreenOff { reason } => self.turn_screen_off(reason.unwrap_or(OffReason::User)),
            Step::ScreenOn => self.turn_screen_on(),
            Step::Lid { open } => self.policy.notify_lid_switch_changed(*open),
            Step::Hdmi { plugged } => self.policy.set_hdmi_plugged(*plugged),
            Step::WifiDisplay { connected } => self.policy.set_wifi_display_connected(*connected),
            Step::Dock { mode } => self.policy.set_dock_mode(*mode),
            Step::UiMode { mode } => self.policy.set_ui_mode(*mode),
            Step::Sensor { rotation } => self.policy.on_proposed_rotation_changed(*rotation),
            Step::Orientation { orientation } => {
                self.policy.set_current_orientation(*orientation);
                let last = self.policy.rotation().current_rotation;
                let rotation = self.policy.rotation_for_orientation(*orientation, last);
                self.policy.set_rotation(rotation);
                info!(?orientation, ?rotation, "Rotation resolved");
            }
            Step::Layout { windows, focus } => self.layout(windows, *focus)?,
            Step::Advance { ms } => self.advance(*ms),
            Step::Setting { key, value, user } => self.settings.put_string(*user, key, value),
            Step::Keyguard { showing, secure } => self.device.set_keyguard(*showing, *secure),
            Step::Call { state } => self.device.set_call_state(*state),
            Step::Music { active } => self.device.set_music_active(*active),
            Step::HiddenNavTouch => self.policy.on_hidden_nav_touch(),
            Step::UserActivity => self.policy.user_activity(),
            Step::LockNow => self.policy.lock_now(None),
            Step::User { user } => self.policy.set_current_user(*user),
            Step::Dump => {
                writeln!(out, "{}", self.policy.dump())?;
            }
        }
        Ok(())
    }

    fn apply_queue_action(&self, action: QueueAction) {
        if action.contains(QueueAction::WAKE_UP) {
            self.turn_screen_on();
        }
        if action.contains(QueueAction::GO_TO_SLEEP) {
            self.turn_screen_off(OffReason::User);
        }
    }

    /// Feed one key through queueing and dispatch, as the input system would
    fn key(&self, event: &KeyEvent, flags: PolicyFlags) {
        let screen_on = self.screen_on.load(Ordering::SeqCst);
        let action = self.policy.intercept_key_before_queueing(event, flags, screen_on);
        info!(key = ?event.code, down = event.down, ?action, "Key queued");
        self.settle();
        self.apply_queue_action(action);
        if !action.contains(QueueAction::PASS_TO_USER) {
            return;
        }

        for _ in 0..MAX_DISPATCH_RETRIES {
            match self.policy.intercept_key_before_dispatching(self.focused.as_ref(), event, flags) {
                Dispatch::Pass => {
                    // The simulated app never handles keys itself
                    if let Some(fallback) = self.policy.dispatch_unhandled_key(self.focused.as_ref(), event, flags) {
                        info!(key = ?fallback.code, "Fallback key delivered");
                    } else {
                        info!(key = ?event.code, "Key delivered to focused window");
                    }
                    return;
                }
                Dispatch::Consume => {
                    info!(key = ?event.code, down = event.down, "Key consumed by policy");
                    return;
                }
                Dispatch::RetryAfter(ms) => {
                    debug!(key = ?event.code, ms, "Dispatch deferred");
                    self.advance(ms);
                }
            }
        }
        warn!(key = ?event.code, "Dispatch still deferred, dropping key");
    }

    fn layout(&mut self, specs: &[WindowSpec], focus: Option<u64>) -> Result<()> {
        let mut windows = Vec::with_capacity(specs.len());
        for spec in specs {
            let window = match self.windows.iter().find(|w| w.id == WindowId(spec.id)) {
                Some(existing) => existing.clone(),
                None => {
                    let window = SimWindow::new(spec.id, spec.attrs.clone());
                    let result = self.policy.prepare_add_window(&window.clone().into_ref(), HeldPermissions::all());
                    info!(id = spec.id, ?result, "Window added");
                    window
                }
            };
            window.set_gone(spec.gone);
            windows.push(window);
        }
        for old in &self.windows {
            if !windows.iter().any(|w| w.id == old.id) {
                self.policy.remove_window(&old.clone().into_ref());
            }
        }
        self.windows = windows;

        let focused = match focus {
            Some(id) => Some(
                self.windows
                    .iter()
                    .find(|w| w.id == WindowId(id))
                    .cloned()
                    .ok_or_else(|| PolicyError::Script(format!("focus on unknown window {}", id)))?
                    .into_ref(),
            ),
            None => None,
        };
        let changes = self.policy.focus_changed(focused.clone());
        self.focused = focused;

        let rotation = self.policy.rotation().current_rotation;
        let (width, height) = if matches!(rotation, Rotation::Rot90 | Rotation::Rot270) {
            (self.display.height, self.display.width)
        } else {
            (self.display.width, self.display.height)
        };
        let refs: Vec<WindowRef> = self.windows.iter().cloned().map(SimWindow::into_ref).collect();
        self.policy.begin_layout(width, height, rotation, true);
        for window in &refs {
            self.policy.layout_window(window, None);
        }
        self.policy.finish_layout();
        self.policy.begin_post_layout_policy();
        for window in refs.iter().rev() {
            self.policy.apply_post_layout_policy(window);
        }
        let changes = changes | self.policy.finish_post_layout_policy();
        info!(windows = refs.len(), ?changes, "Layout pass");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowType;

    const SCRIPT: &str = r#"
[settings]
screen_off_timeout = "10000"

[[steps]]
op = "layout"
focus = 10
windows = [{ id = 1, type = "status_bar" }, { id = 10, type = "application" }]

[[steps]]
op = "key"
code = "volume_down"

[[steps]]
op = "lid"
open = false

[[steps]]
op = "dump"
"#;

    #[test]
    fn test_parse_script() {
        let script = Script::parse(SCRIPT).unwrap();
        assert_eq!(script.steps.len(), 4);
        assert_eq!(script.display.width, 720);
        assert_eq!(script.settings.get("screen_off_timeout").map(String::as_str), Some("10000"));
        match &script.steps[0] {
            Step::Layout { windows, focus } => {
                assert_eq!(*focus, Some(10));
                assert_eq!(windows[0].attrs.window_type, WindowType::StatusBar);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(script.steps[2], Step::Lid { open: false }));
    }

    #[test]
    fn test_unknown_op_rejected() {
        let err = Script::parse("[[steps]]\nop = \"juggle\"\n").unwrap_err();
        assert!(matches!(err, PolicyError::Script(_)));
    }

    #[test]
    fn test_replay_runs_and_dumps() {
        let script = Script::parse(SCRIPT).unwrap();
        let mut replay = Replay::new(PolicyConfig::default(), &script, false).unwrap();
        let mut out = Vec::new();
        replay.run(&script, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("booted=true"));
        assert_eq!(replay.device.wake_locks_held(), 0);
    }

    #[test]
    fn test_unknown_focus_is_an_error() {
        let script = Script::parse("[[steps]]\nop = \"layout\"\nfocus = 3\nwindows = []\n").unwrap();
        let mut replay = Replay::new(PolicyConfig::default(), &script, false).unwrap();
        let mut out = Vec::new();
        assert!(matches!(replay.run(&script, &mut out), Err(PolicyError::Script(_))));
    }

    #[test]
    fn test_sim_window_show_hide_report_changes() {
        let window = SimWindow::new(1, WindowAttrs::new(WindowType::Application));
        assert!(!window.show(false));
        assert!(window.hide(false));
        assert!(!window.hide(false));
        assert!(!window.is_visible());
    }

    #[test]
    fn test_sim_keyguard_secure_dismiss_keeps_showing() {
        let device = SimDevice::new();
        device.set_keyguard(Some(true), Some(true));
        KeyguardMediator::dismiss(&*device).unwrap();
        assert!(device.is_showing());
        device.set_keyguard(None, Some(false));
        KeyguardMediator::dismiss(&*device).unwrap();
        assert!(!device.is_showing());
    }
}
