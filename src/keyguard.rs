//! Keyguard and screen lifecycle
//!
//! Sequences screen on/off with the keyguard mediator, keeps the keyguard
//! window in step with what the top fullscreen window asks for, runs the
//! lock timer, and owns what "home" means while the device is locked.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chrome::PostLayoutScan;
use crate::display::LayoutChanges;
use crate::handler::{PolicyMessage, TimerKey};
use crate::policy::PhonePolicy;
use crate::rotation::UiMode;
use crate::services::{close_reason, Completion, Intent, OffReason};
use crate::window::{WindowId, WindowRef};

/// Progress of a window dismissing the keyguard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DismissKeyguard {
    #[default]
    None,
    /// First pass with this window on top: ask the keyguard to dismiss
    Start,
    /// Same window still on top, the request is already out
    Continue,
}

/// Dismiss tracking across layout passes
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyguardLifecycle {
    pub dismiss: DismissKeyguard,
    pub dismissing_window: Option<WindowId>,
}

impl KeyguardLifecycle {
    /// Record this pass's dismissing window, if any
    pub fn evaluate(&mut self, candidate: Option<WindowId>) -> DismissKeyguard {
        self.dismiss = match candidate {
            None => DismissKeyguard::None,
            Some(id) if self.dismissing_window == Some(id) => DismissKeyguard::Continue,
            Some(id) => {
                self.dismissing_window = Some(id);
                DismissKeyguard::Start
            }
        };
        self.dismiss
    }

    pub fn clear(&mut self) {
        self.dismissing_window = None;
    }
}

/// What to do with the keyguard window after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyguardAction {
    /// Insecure keyguard dismissed by the top window: hide and finish it
    HideAndFinish,
    /// Top window shows over the lock screen
    HideForShowWhenLocked,
    /// Secure keyguard must show so the user can authenticate
    ShowAndDismiss,
    KeepDismissing,
    Show,
}

pub fn keyguard_action(dismiss: DismissKeyguard, hide_lock_screen: bool, secure: bool) -> KeyguardAction {
    match dismiss {
        DismissKeyguard::Start | DismissKeyguard::Continue if !secure => KeyguardAction::HideAndFinish,
        _ if hide_lock_screen => KeyguardAction::HideForShowWhenLocked,
        DismissKeyguard::Start => KeyguardAction::ShowAndDismiss,
        DismissKeyguard::Continue => KeyguardAction::KeepDismissing,
        DismissKeyguard::None => KeyguardAction::Show,
    }
}

/// Screen power and lock timer state
#[derive(Debug, Default, Serialize)]
pub struct ScreenState {
    /// Keyguard drawn (or absent) and input re-enabled
    pub screen_on_fully: bool,
    pub lock_timer_active: bool,
    /// Options handed to the keyguard when the timer fires
    pub lock_options: Option<String>,
    pub lifecycle: KeyguardLifecycle,
}

/// Listener slot shared by the paths that may finish screen-on
type ListenerSlot = Arc<Mutex<Option<Completion>>>;

fn take_listener(slot: &ListenerSlot) -> Option<Completion> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl PhonePolicy {
    pub fn screen_turned_off(&self, why: OffReason) {
        info!(?why, "Screen turned off");
        self.rotation().screen_on_early = false;
        self.screen().screen_on_fully = false;
        self.keyguard_call("on_screen_turned_off", |k| k.on_screen_turned_off(why));
        self.update_orientation_listener();
        self.update_lock_screen_timeout();
    }

    /// Screen is coming on; `listener` runs once the keyguard has drawn
    pub fn screen_turning_on(&self, listener: Option<Completion>) {
        info!("Screen turning on");
        self.rotation().screen_on_early = true;
        self.update_orientation_listener();
        self.update_lock_screen_timeout();
        self.wait_for_keyguard(listener);
    }

    fn wait_for_keyguard(&self, listener: Option<Completion>) {
        let keyguard = match &self.services.keyguard {
            Some(keyguard) if !self.config.device.headless => Arc::clone(keyguard),
            _ => return self.finish_screen_turning_on(listener),
        };
        let Some(listener) = listener else {
            if let Err(e) = keyguard.on_screen_turned_on(None) {
                warn!("Keyguard failed to handle screen on: {}", e);
            }
            return self.finish_screen_turning_on(None);
        };

        let slot: ListenerSlot = Arc::new(Mutex::new(Some(listener)));
        let weak = self.self_ref.clone();
        let waiting = Arc::clone(&slot);
        let shown: Box<dyn FnOnce(Option<WindowId>) + Send> = Box::new(move |window| {
            if let Some(policy) = weak.upgrade() {
                policy.wait_for_keyguard_window_drawn(window, waiting);
            }
        });
        if let Err(e) = keyguard.on_screen_turned_on(Some(shown)) {
            warn!("Keyguard failed to handle screen on: {}", e);
            self.finish_screen_turning_on(take_listener(&slot));
        }
    }

    fn wait_for_keyguard_window_drawn(&self, window: Option<WindowId>, slot: ListenerSlot) {
        if let Some(window) = window {
            let weak = self.self_ref.clone();
            let drawn = Arc::clone(&slot);
            let done: Completion = Box::new(move || {
                if let Some(policy) = weak.upgrade() {
                    policy.finish_screen_turning_on(take_listener(&drawn));
                }
            });
            match self.services.window_manager.wait_for_window_drawn(window, done) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("Failed to wait for keyguard window: {}", e),
            }
        }
        debug!("No lock screen to wait for");
        self.finish_screen_turning_on(take_listener(&slot));
    }

    fn finish_screen_turning_on(&self, listener: Option<Completion>) {
        self.screen().screen_on_fully = true;
        info!("Screen fully on");
        if let Err(e) = self.services.window_manager.set_event_dispatching(true) {
            warn!("Failed to re-enable event dispatching: {}", e);
        }
        if let Some(listener) = listener {
            listener();
        }
    }

    pub fn is_screen_on_early(&self) -> bool {
        self.rotation().screen_on_early
    }

    pub fn is_screen_on_fully(&self) -> bool {
        self.screen().screen_on_fully
    }

    /// Bring the keyguard window in line with the pass that just ended
    pub(crate) fn apply_keyguard_policy(&self, keyguard_window: &WindowRef, scan: &PostLayoutScan) -> LayoutChanges {
        let dismiss = self.screen().lifecycle.evaluate(scan.dismissing_window);
        let secure = self.keyguard_secure();
        let relayout = LayoutChanges::LAYOUT | LayoutChanges::CONFIG | LayoutChanges::WALLPAPER;
        let mut changes = LayoutChanges::empty();

        let action = keyguard_action(dismiss, scan.hide_lock_screen, secure);
        debug!(?dismiss, ?action, "Keyguard window policy");
        match action {
            KeyguardAction::HideAndFinish => {
                if keyguard_window.hide(true) {
                    changes |= relayout;
                }
                if self.keyguard_showing() {
                    self.scheduler.post(PolicyMessage::KeyguardDone);
                }
            }
            KeyguardAction::HideForShowWhenLocked => {
                if keyguard_window.hide(true) {
                    changes |= relayout;
                }
                self.keyguard_call("set_hidden", |k| k.set_hidden(true));
            }
            KeyguardAction::ShowAndDismiss => {
                if keyguard_window.show(true) {
                    changes |= relayout;
                }
                self.keyguard_call("set_hidden", |k| k.set_hidden(false));
                self.scheduler.post(PolicyMessage::KeyguardDismiss);
            }
            KeyguardAction::KeepDismissing => {}
            KeyguardAction::Show => {
                self.screen().lifecycle.clear();
                if keyguard_window.show(true) {
                    changes |= relayout;
                }
                self.keyguard_call("set_hidden", |k| k.set_hidden(false));
            }
        }
        changes
    }

    pub(crate) fn keyguard_secure(&self) -> bool {
        self.services.keyguard.as_ref().is_some_and(|k| k.is_secure())
    }

    /// Arm or disarm the lock timer to match the current state
    pub(crate) fn update_lock_screen_timeout(&self) {
        let allow = self.chrome().scan.allow_lockscreen_when_on;
        let enable = allow && self.is_screen_on_early() && self.keyguard_secure();
        let changed = {
            let mut screen = self.screen();
            std::mem::replace(&mut screen.lock_timer_active, enable) != enable
        };
        if !changed {
            return;
        }
        if enable {
            debug!("Arming lock timer");
            self.post_lock_timeout();
        } else {
            debug!("Disarming lock timer");
            self.scheduler.cancel(TimerKey::ScreenLock);
        }
    }

    fn post_lock_timeout(&self) {
        let timeout = self.settings().lock_screen_timeout_ms;
        self.scheduler.post_delayed(PolicyMessage::ScreenLockTimeout, Duration::from_millis(timeout));
    }

    /// User did something; restart the lock timer if it runs
    pub fn user_activity(&self) {
        if self.screen().lock_timer_active {
            self.post_lock_timeout();
        }
    }

    /// Lock right away instead of waiting for the timer
    pub fn lock_now(&self, options: Option<String>) {
        info!("Locking now");
        self.scheduler.cancel(TimerKey::ScreenLock);
        self.screen().lock_options = options;
        self.scheduler.post(PolicyMessage::ScreenLockTimeout);
    }

    pub(crate) fn screen_lock_timeout(&self) {
        let options = {
            let mut screen = self.screen();
            screen.lock_timer_active = false;
            screen.lock_options.take()
        };
        info!("Lock timeout");
        self.keyguard_call("do_keyguard_timeout", |k| k.do_keyguard_timeout(options.as_deref()));
    }

    /// Home from a key or key action. Behind a restricted keyguard the user
    /// must unlock first.
    pub(crate) fn launch_home_from_hotkey(&self) {
        if self.keyguard_showing_and_not_hidden() {
            // The keyguard handles home itself
            return;
        }
        let hide_lock_screen = self.chrome().scan.hide_lock_screen;
        let restricted = self.services.keyguard.as_ref().is_some_and(|k| k.is_input_restricted());
        if !hide_lock_screen && restricted {
            let weak = self.self_ref.clone();
            self.keyguard_call("verify_unlock", move |k| {
                k.verify_unlock(Box::new(move |unlocked| {
                    if !unlocked {
                        return;
                    }
                    if let Some(policy) = weak.upgrade() {
                        policy.go_home_after_close();
                    }
                }))
            });
            return;
        }
        self.go_home_after_close();
    }

    fn go_home_after_close(&self) {
        if let Err(e) = self.services.launcher.stop_app_switches() {
            warn!("Failed to stop app switches: {}", e);
        }
        self.close_system_windows(Some(close_reason::HOME_KEY));
        self.start_dock_or_home();
    }

    fn dock_home_intent(&self) -> Option<Intent> {
        let device = &self.config.device;
        match self.rotation().ui_mode {
            UiMode::Car if device.enable_car_dock_home => Some(Intent::CarDockHome),
            UiMode::Desk if device.enable_desk_dock_home => Some(Intent::DeskDockHome),
            _ => None,
        }
    }

    /// Launch the dock's home screen when docked, the regular one otherwise
    pub fn start_dock_or_home(&self) {
        if let Some(dock) = self.dock_home_intent() {
            match self.services.launcher.start_activity(&dock) {
                Ok(()) => return,
                Err(e) => warn!(intent = %dock, "Dock home failed, falling back: {}", e),
            }
        }
        if let Err(e) = self.services.launcher.start_activity(&Intent::Home) {
            warn!("Failed to start home: {}", e);
        }
    }

    /// Home for END_CALL. False if home was already in front.
    pub fn go_home(&self) -> bool {
        if let Err(e) = self.services.launcher.stop_app_switches() {
            warn!("Failed to stop app switches: {}", e);
        }
        self.close_system_windows(None);
        for intent in self.dock_home_intent().into_iter().chain([Intent::Home]) {
            match self.services.launcher.start_activity_if_needed(&intent) {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(%intent, "Already in front");
                    return false;
                }
                Err(e) => warn!(%intent, "Failed to go home: {}", e),
            }
        }
        true
    }

    pub fn show_assistant(&self) {
        self.keyguard_call("show_assistant", |k| k.show_assistant());
    }

    /// An app holding the screen on stopped doing so
    pub fn keep_screen_on_stopped(&self) {
        if !self.keyguard_showing_and_not_hidden() {
            self.services.power.user_activity(self.now_ms());
        }
    }

    pub fn is_keyguard_locked(&self) -> bool {
        self.keyguard_on()
    }

    pub fn is_keyguard_secure(&self) -> bool {
        self.keyguard_secure()
    }

    pub fn in_keyguard_restricted_key_input_mode(&self) -> bool {
        self.services.keyguard.as_ref().is_some_and(|k| k.is_input_restricted())
    }

    pub fn dismiss_keyguard(&self) {
        if self.keyguard_showing() {
            self.scheduler.post(PolicyMessage::KeyguardDismiss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::UiMode;
    use crate::testing::{FakeWindow, Harness};
    use crate::window::{WindowAttrs, WindowFlags, WindowType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dismiss_lifecycle() {
        let mut lifecycle = KeyguardLifecycle::default();
        assert_eq!(lifecycle.evaluate(Some(WindowId(3))), DismissKeyguard::Start);
        assert_eq!(lifecycle.evaluate(Some(WindowId(3))), DismissKeyguard::Continue);
        assert_eq!(lifecycle.evaluate(Some(WindowId(4))), DismissKeyguard::Start);
        assert_eq!(lifecycle.evaluate(None), DismissKeyguard::None);
        // Still remembered until the keyguard shows again
        assert_eq!(lifecycle.evaluate(Some(WindowId(4))), DismissKeyguard::Continue);
        lifecycle.clear();
        assert_eq!(lifecycle.evaluate(Some(WindowId(4))), DismissKeyguard::Start);
    }

    #[test]
    fn test_keyguard_action_table() {
        use DismissKeyguard::*;
        assert_eq!(keyguard_action(Start, false, false), KeyguardAction::HideAndFinish);
        assert_eq!(keyguard_action(Continue, true, false), KeyguardAction::HideAndFinish);
        assert_eq!(keyguard_action(Start, true, true), KeyguardAction::HideForShowWhenLocked);
        assert_eq!(keyguard_action(Start, false, true), KeyguardAction::ShowAndDismiss);
        assert_eq!(keyguard_action(Continue, false, true), KeyguardAction::KeepDismissing);
        assert_eq!(keyguard_action(None, false, true), KeyguardAction::Show);
    }

    fn with_keyguard_window(h: &Harness) -> FakeWindow {
        let keyguard = FakeWindow::new(100, WindowAttrs::new(WindowType::Keyguard));
        h.add_window(&keyguard);
        keyguard
    }

    #[test]
    fn test_secure_dismiss_requested_once_per_window() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        h.keyguard.set_secure(true);
        let keyguard = with_keyguard_window(&h);
        keyguard.set_shown(false);
        let attrs = WindowAttrs::new(WindowType::Application).with_flags(WindowFlags::DISMISS_KEYGUARD);
        let app = h.layout_with_top_window(attrs);
        h.advance(0);
        assert_eq!(h.keyguard.dismisses(), 1);
        assert!(keyguard.is_shown());

        // Same window on top again: no second request
        h.layout_pass(&[app.clone()]);
        h.advance(0);
        assert_eq!(h.keyguard.dismisses(), 1);
    }

    #[test]
    fn test_insecure_dismiss_finishes_keyguard() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        let keyguard = with_keyguard_window(&h);
        let attrs = WindowAttrs::new(WindowType::Application).with_flags(WindowFlags::DISMISS_KEYGUARD);
        h.layout_with_top_window(attrs);
        h.advance(0);
        assert!(!keyguard.is_shown());
        assert_eq!(h.keyguard.done_calls(), vec![(false, false)]);
    }

    #[test]
    fn test_show_when_locked_hides_keyguard() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        h.keyguard.set_secure(true);
        let keyguard = with_keyguard_window(&h);
        let attrs = WindowAttrs::new(WindowType::Application).with_flags(WindowFlags::SHOW_WHEN_LOCKED);
        let app = h.layout_with_top_window(attrs);
        assert!(!keyguard.is_shown());
        assert_eq!(h.keyguard.hidden_calls(), vec![true]);

        // Window goes away: keyguard comes back
        app.set_gone(true);
        h.layout_pass(&[app]);
        assert!(keyguard.is_shown());
        assert_eq!(h.keyguard.hidden_calls(), vec![true, false]);
    }

    #[test]
    fn test_screen_on_waits_for_keyguard_draw() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        h.keyguard.set_shown_window(Some(WindowId(100)));
        h.window_manager.set_defer_draws(true);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        h.policy.screen_turning_on(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(h.policy.is_screen_on_early());
        assert!(!h.policy.is_screen_on_fully());
        assert_eq!(done.load(Ordering::SeqCst), 0);

        h.window_manager.complete_draws();
        assert!(h.policy.is_screen_on_fully());
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(h.window_manager.event_dispatching(), Some(true));
    }

    #[test]
    fn test_screen_on_without_lock_screen_finishes_immediately() {
        let h = Harness::new();
        h.keyguard.set_shown_window(None);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        h.policy.screen_turning_on(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(h.policy.is_screen_on_fully());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_screen_on_draw_wait_refused() {
        let h = Harness::new();
        h.keyguard.set_shown_window(Some(WindowId(55)));
        h.window_manager.set_defer_draws(false);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        h.policy.screen_turning_on(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_screen_off_clears_fully_on() {
        let h = Harness::new();
        h.policy.screen_turning_on(None);
        assert!(h.policy.is_screen_on_fully());
        h.policy.screen_turned_off(OffReason::Timeout);
        assert!(!h.policy.is_screen_on_fully());
        assert!(!h.policy.is_screen_on_early());
        assert_eq!(h.keyguard.screen_offs(), vec![OffReason::Timeout]);
    }

    fn arm_lock_timer(h: &Harness) {
        h.keyguard.set_secure(true);
        h.policy.screen_turning_on(None);
        let attrs = WindowAttrs::new(WindowType::Application).with_flags(WindowFlags::ALLOW_LOCK_WHILE_SCREEN_ON);
        h.layout_with_top_window(attrs);
    }

    #[test]
    fn test_lock_timer_fires_once() {
        let h = Harness::new();
        arm_lock_timer(&h);
        assert!(h.scheduler.is_pending(TimerKey::ScreenLock));
        let timeout = h.policy.settings().lock_screen_timeout_ms;
        h.advance(timeout - 1);
        assert_eq!(h.keyguard.timeouts(), 0);
        h.advance(1);
        assert_eq!(h.keyguard.timeouts(), 1);
        h.advance(timeout * 2);
        assert_eq!(h.keyguard.timeouts(), 1);
    }

    #[test]
    fn test_user_activity_restarts_lock_timer() {
        let h = Harness::new();
        arm_lock_timer(&h);
        let timeout = h.policy.settings().lock_screen_timeout_ms;
        h.advance(timeout - 10);
        h.policy.user_activity();
        h.advance(timeout - 10);
        assert_eq!(h.keyguard.timeouts(), 0);
        h.advance(10);
        assert_eq!(h.keyguard.timeouts(), 1);
    }

    #[test]
    fn test_screen_off_disarms_lock_timer() {
        let h = Harness::new();
        arm_lock_timer(&h);
        h.policy.screen_turned_off(OffReason::User);
        assert!(!h.scheduler.is_pending(TimerKey::ScreenLock));
    }

    #[test]
    fn test_lock_now_passes_options() {
        let h = Harness::new();
        h.policy.lock_now(Some("fingerprint".to_string()));
        h.advance(0);
        assert_eq!(h.keyguard.timeouts(), 1);
        assert_eq!(h.keyguard.timeout_options(), vec![Some("fingerprint".to_string())]);
    }

    #[test]
    fn test_home_behind_restricted_keyguard_needs_unlock() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        h.keyguard.set_hidden_state(true);
        h.keyguard.set_unlock_result(false);
        h.policy.launch_home_from_hotkey();
        assert!(h.launcher.started().is_empty());
        h.keyguard.set_unlock_result(true);
        h.policy.launch_home_from_hotkey();
        assert_eq!(h.launcher.started(), vec![Intent::Home]);
    }

    #[test]
    fn test_home_ignored_while_keyguard_visible() {
        let h = Harness::new();
        h.keyguard.set_showing(true);
        h.policy.launch_home_from_hotkey();
        assert!(h.launcher.started().is_empty());
    }

    #[test]
    fn test_car_mode_starts_dock_home() {
        let h = Harness::new();
        h.policy.set_ui_mode(UiMode::Car);
        h.policy.start_dock_or_home();
        assert_eq!(h.launcher.started(), vec![Intent::CarDockHome]);
        // Desk home is off by default
        h.policy.set_ui_mode(UiMode::Desk);
        h.policy.start_dock_or_home();
        assert_eq!(h.launcher.started(), vec![Intent::CarDockHome, Intent::Home]);
    }

    #[test]
    fn test_go_home_reports_already_home() {
        let h = Harness::new();
        assert!(h.policy.go_home());
        h.launcher.set_in_front(Some(Intent::Home));
        assert!(!h.policy.go_home());
    }

    #[test]
    fn test_keep_screen_on_stopped_pokes_activity() {
        let h = Harness::new();
        h.policy.keep_screen_on_stopped();
        assert_eq!(h.power.activity(), 1);
        h.keyguard.set_showing(true);
        h.policy.keep_screen_on_stopped();
        assert_eq!(h.power.activity(), 1);
    }
}
