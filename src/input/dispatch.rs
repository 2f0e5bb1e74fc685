//! Dispatch stage: intercept a key once its target window is known

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::handler::{PolicyMessage, TimerKey};
use crate::input::actions::{FamilyBehavior, KeyAction, KeyFamily};
use crate::input::chord_key::{Fire, KeyContext, KeyVerdict};
use crate::input::keys::{Dispatch, KeyCode, KeyEvent, KeyEventFlags, MetaState, PolicyFlags, QueueAction, VIRTUAL_KEYBOARD};
use crate::policy::PhonePolicy;
use crate::services::{HapticEffect, Intent};
use crate::window::{WindowRef, WindowType};

/// Activity launched by a dedicated application key
fn application_launch_intent(code: KeyCode) -> Option<Intent> {
    Some(match code {
        KeyCode::Explorer => Intent::Browser,
        KeyCode::Envelope => Intent::Email,
        KeyCode::Contacts => Intent::Contacts,
        KeyCode::Calendar => Intent::Calendar,
        KeyCode::Music => Intent::Music,
        KeyCode::Calculator => Intent::Calculator,
        _ => return None,
    })
}

impl PhonePolicy {
    /// Decide whether the policy takes a key before `focused` sees it
    pub fn intercept_key_before_dispatching(
        &self,
        focused: Option<&WindowRef>,
        event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Dispatch {
        let keyguard_on = self.keyguard_on();
        let code = event.code;
        trace!(key = ?code, down = event.down, repeat = event.repeat_count, keyguard_on, "Dispatching key");

        // A volume-down may be the first half of the screenshot chord: hold
        // every key until power had its chance
        if !event.is_fallback() {
            let keyguard_showing = self.keyguard_showing();
            let now = self.now_ms();
            let (retry, eaten) = {
                let mut keys = self.keys();
                let retry = keys.chord.retry_delay(now, keyguard_showing);
                let eaten = retry.is_none() && code == KeyCode::VolumeDown && keys.chord.eat_volume_down(event.down);
                (retry, eaten)
            };
            if let Some(delay) = retry {
                return Dispatch::RetryAfter(delay);
            }
            if eaten {
                return Dispatch::Consume;
            }
        }

        if let Some(family) = KeyFamily::from_code(code) {
            if family == KeyFamily::Menu && self.is_bug_report_chord(event) {
                return Dispatch::Consume;
            }
            if family == KeyFamily::Home {
                let releasing = !event.down && self.keys().key(KeyFamily::Home).is_pressed();
                if !releasing {
                    if let Some(verdict) = self.home_focus_guard(focused) {
                        return verdict;
                    }
                }
            }
            match self.dispatch_family_key(family, event, keyguard_on) {
                KeyVerdict::Consume => return Dispatch::Consume,
                KeyVerdict::Pass => return Dispatch::Pass,
                KeyVerdict::Continue => {}
            }
        } else if code == KeyCode::Search {
            let mut keys = self.keys();
            if event.down {
                if event.repeat_count == 0 {
                    keys.search_key_shortcut_pending = true;
                    keys.consume_search_key_up = false;
                }
            } else {
                keys.search_key_shortcut_pending = false;
                if std::mem::take(&mut keys.consume_search_key_up) {
                    return Dispatch::Consume;
                }
            }
            return Dispatch::Pass;
        }

        self.dispatch_shortcuts(event, keyguard_on)
    }

    /// Shift+Menu starts a bug report when enabled
    fn is_bug_report_chord(&self, event: &KeyEvent) -> bool {
        if !event.is_initial_down() || !self.config.input.enable_shift_menu_bug_reports || event.meta != MetaState::SHIFT {
            return false;
        }
        info!("Shift+Menu, starting bug report");
        if let Err(e) = self.services.launcher.start_activity(&Intent::BugReport) {
            warn!("Could not start bug report: {}", e);
        }
        true
    }

    /// HOME does not reach the home action while certain windows have focus
    fn home_focus_guard(&self, focused: Option<&WindowRef>) -> Option<Dispatch> {
        let window_type = focused?.attrs().window_type;
        if matches!(window_type, WindowType::Keyguard | WindowType::KeyguardDialog) {
            // The keyguard handles HOME itself
            return Some(Dispatch::Pass);
        }
        if window_type.rules().blocks_home {
            return Some(Dispatch::Consume);
        }
        None
    }

    fn dispatch_family_key(&self, family: KeyFamily, event: &KeyEvent, keyguard_on: bool) -> KeyVerdict {
        let settings = self.settings();
        let behavior = settings.key_behaviors.get(family);
        let ctx = KeyContext { behavior, keyguard_on };

        if event.down {
            if event.repeat_count == 0 && behavior.wants_recents() {
                self.preload_recent_apps();
            }
            let outcome = {
                let mut keys = self.keys();
                let press_id = if event.repeat_count == 0 { keys.allocate_press_id() } else { 0 };
                keys.key_mut(family).on_down(event, ctx, press_id)
            };
            if let Some(press_id) = outcome.arm_long_press {
                self.scheduler.post_delayed(
                    PolicyMessage::KeyLongPress { family, press_id },
                    Duration::from_millis(self.config.input.long_press_timeout_ms),
                );
            }
            if let Some(fire) = outcome.fire {
                self.fire_key_action(family, fire, behavior, event);
            }
            return outcome.verdict;
        }

        let outcome = self.keys().key_mut(family).on_up(event, ctx);
        if outcome.disarm {
            self.scheduler.cancel(TimerKey::KeyLongPress(family));
        }
        if let Some(fire) = outcome.fire {
            self.fire_key_action(family, fire, behavior, event);
        }
        // Whatever the release did, a preload nobody used must not linger
        self.cancel_preload_recent_apps();
        outcome.verdict
    }

    /// Runs on the handler when a family key's long-press timer expires
    pub(crate) fn key_long_press(&self, family: KeyFamily, press_id: u64) {
        let settings = self.settings();
        let behavior = settings.key_behaviors.get(family);
        let ctx = KeyContext { behavior, keyguard_on: self.keyguard_on() };
        let fire = self.keys().key_mut(family).on_long_press_timeout(press_id, ctx);
        if let Some(fire) = fire {
            let now = self.now_ms();
            let synthetic = KeyEvent::down(KeyCode::Unknown, now);
            self.fire_key_action(family, fire, behavior, &synthetic);
        }
    }

    fn fire_key_action(&self, family: KeyFamily, fire: Fire, behavior: &FamilyBehavior, event: &KeyEvent) {
        match fire {
            Fire::LongPress => {
                debug!(?family, action = %behavior.long_press, "Key long press");
                if behavior.long_press != KeyAction::VoiceSearch {
                    // Voice search gives its own feedback
                    self.haptic(HapticEffect::LongPress);
                }
                self.perform_key_action(&behavior.long_press);
            }
            Fire::Press if family == KeyFamily::Home => self.home_pressed(behavior, event),
            Fire::Press => self.perform_key_action(&behavior.press),
        }
    }

    fn home_pressed(&self, behavior: &FamilyBehavior, event: &KeyEvent) {
        let ringing = self.services.telephony.call("is_ringing", |t| t.is_ringing()).unwrap_or(false);
        if ringing {
            if self.settings().ring_home_answers {
                info!("HOME while ringing, answering call");
                self.services.telephony.call("answer_ringing_call", |t| t.answer_ringing_call());
            } else {
                info!("Ignoring HOME, there is a ringing incoming call");
            }
            return;
        }
        if event.device_id == VIRTUAL_KEYBOARD {
            // The navigation bar home button always goes home
            self.launch_home_from_hotkey();
        } else {
            self.perform_key_action(&behavior.press);
        }
    }

    pub(crate) fn preload_recent_apps(&self) {
        let already = std::mem::replace(&mut self.keys().recent_apps_preloaded, true);
        if already {
            return;
        }
        if self.services.status_bar.call("preload_recent_apps", |s| s.preload_recent_apps()).is_none() {
            tracing::error!("Could not preload recent apps");
            self.keys().recent_apps_preloaded = false;
        }
    }

    pub(crate) fn cancel_preload_recent_apps(&self) {
        let preloaded = std::mem::take(&mut self.keys().recent_apps_preloaded);
        if preloaded
            && self
                .services
                .status_bar
                .call("cancel_preload_recent_apps", |s| s.cancel_preload_recent_apps())
                .is_none()
        {
            tracing::error!("Could not cancel recent apps preload");
        }
    }

    /// Search/meta shortcuts, launch keys, Alt-Tab, language switch and the
    /// device key handler, in that order
    fn dispatch_shortcuts(&self, event: &KeyEvent, keyguard_on: bool) -> Dispatch {
        let code = event.code;
        let initial_down = event.is_initial_down();

        let search_chord = {
            let mut keys = self.keys();
            if keys.search_key_shortcut_pending && code.is_printing() {
                keys.consume_search_key_up = true;
                keys.search_key_shortcut_pending = false;
                true
            } else {
                false
            }
        };
        if search_chord {
            if initial_down && !keyguard_on {
                match self.services.key_map.shortcut_intent(code, event.meta) {
                    Some(intent) => self.launch_shortcut(&intent),
                    None => info!(key = ?code, meta = ?event.meta, "Dropping unregistered shortcut key combination"),
                }
            }
            return Dispatch::Consume;
        }

        if initial_down && !keyguard_on && event.meta.contains(MetaState::META) && code.is_printing() {
            if let Some(intent) = self.services.key_map.shortcut_intent(code, event.meta - MetaState::META) {
                self.launch_shortcut(&intent);
                return Dispatch::Consume;
            }
        }

        if initial_down && !keyguard_on {
            if let Some(intent) = application_launch_intent(code) {
                if let Err(e) = self.services.launcher.start_activity(&intent) {
                    warn!(key = ?code, "Dropping application launch key: {}", e);
                }
                return Dispatch::Consume;
            }
        }

        if initial_down && code == KeyCode::Tab {
            let shiftless = event.meta - MetaState::SHIFT;
            let show = {
                let mut keys = self.keys();
                let show = keys.recent_apps_dialog_held_modifiers.is_empty()
                    && !keyguard_on
                    && (shiftless == MetaState::ALT || shiftless == MetaState::META);
                if show {
                    keys.recent_apps_dialog_held_modifiers = shiftless;
                }
                show
            };
            if show {
                self.recent_apps_dialog(true, false);
                return Dispatch::Consume;
            }
        } else if !event.down {
            let released = {
                let mut keys = self.keys();
                let held = keys.recent_apps_dialog_held_modifiers;
                if !held.is_empty() && !event.meta.intersects(held) {
                    keys.recent_apps_dialog_held_modifiers = MetaState::empty();
                    true
                } else {
                    false
                }
            };
            if released {
                self.recent_apps_dialog(false, !keyguard_on);
            }
        }

        let language_switch =
            code == KeyCode::LanguageSwitch || (code == KeyCode::Space && event.meta.contains(MetaState::CTRL));
        if initial_down && language_switch {
            let direction = if event.meta.contains(MetaState::SHIFT) { -1 } else { 1 };
            self.keys().language_switch_pressed = true;
            if let Err(e) = self.services.window_manager.switch_keyboard_layout(event.device_id, direction) {
                warn!("Could not switch keyboard layout: {}", e);
            }
            return Dispatch::Consume;
        }
        if !event.down && matches!(code, KeyCode::LanguageSwitch | KeyCode::Space) {
            let was_pressed = std::mem::take(&mut self.keys().language_switch_pressed);
            if was_pressed {
                return Dispatch::Consume;
            }
        }

        if let Some(handler) = &self.services.device_key_handler {
            match handler.handle_key_event(event) {
                Ok(true) => return Dispatch::Consume,
                Ok(false) => {}
                Err(e) => warn!(key = ?code, "Device key handler failed: {}", e),
            }
        }

        Dispatch::Pass
    }

    fn launch_shortcut(&self, intent: &Intent) {
        if let Err(e) = self.services.launcher.start_activity(intent) {
            warn!(intent = %intent, "Dropping shortcut key combination: {}", e);
        }
    }

    fn recent_apps_dialog(&self, show: bool, switch: bool) {
        if let Err(e) = self.services.launcher.recent_apps_dialog(show, switch) {
            warn!("Could not update recent apps dialog: {}", e);
        }
    }

    /// Offer a substitute for a key the application did not handle.
    ///
    /// The substitute is tagged as a fallback, run through both stages, and
    /// returned only if they would deliver it.
    pub fn dispatch_unhandled_key(
        &self,
        focused: Option<&WindowRef>,
        event: &KeyEvent,
        policy_flags: PolicyFlags,
    ) -> Option<KeyEvent> {
        if event.is_fallback() {
            return None;
        }
        let initial_down = event.is_initial_down();
        let action = if initial_down {
            self.services.key_map.fallback_action(event.code, event.meta)
        } else {
            self.keys().fallback_actions.get(&event.code).copied()
        };
        let (code, meta) = action?;

        let fallback = KeyEvent { code, meta, flags: event.flags | KeyEventFlags::FALLBACK, ..*event };
        let accepted = self.intercept_fallback(focused, &fallback, policy_flags);

        {
            let mut keys = self.keys();
            if initial_down {
                keys.fallback_actions.insert(event.code, (code, meta));
            } else if !event.down {
                keys.fallback_actions.remove(&event.code);
            }
        }
        debug!(key = ?event.code, fallback = ?code, accepted, "Fallback key");
        accepted.then_some(fallback)
    }

    fn intercept_fallback(&self, focused: Option<&WindowRef>, fallback: &KeyEvent, policy_flags: PolicyFlags) -> bool {
        let actions = self.intercept_key_before_queueing(fallback, policy_flags, true);
        actions.contains(QueueAction::PASS_TO_USER)
            && self.intercept_key_before_dispatching(focused, fallback, policy_flags) == Dispatch::Pass
    }
}
