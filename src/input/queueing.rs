//! Queueing stage: wake, sleep, or pass before the event is queued

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::config::LongPressOnPower;
use crate::handler::{PolicyMessage, TimerKey};
use crate::input::keys::{KeyCode, KeyEvent, PolicyFlags, QueueAction};
use crate::input::screenshot::capture_delay_ms;
use crate::input::VolumeMusicState;
use crate::policy::PhonePolicy;
use crate::services::{close_reason, HapticEffect, Stream};
use crate::settings::{PolicySettings, END_BUTTON_BEHAVIOR_HOME, END_BUTTON_BEHAVIOR_SLEEP};
use crate::window::WindowFlags;

/// Screen and keyguard conditions an event is judged against
struct QueueContext {
    screen_is_on: bool,
    keyguard_active: bool,
    /// The keyguard was already told about this wake key
    keyguard_notified: bool,
}

impl PhonePolicy {
    /// Decide what happens to a key before it is queued for dispatch
    pub fn intercept_key_before_queueing(
        &self,
        event: &KeyEvent,
        policy_flags: PolicyFlags,
        screen_is_on: bool,
    ) -> QueueAction {
        if !self.is_booted() {
            // Nothing is ready to handle keys yet
            return QueueAction::empty();
        }

        let code = event.code;
        let settings = self.settings();
        let keyguard_active = match &self.services.keyguard {
            Some(keyguard) if screen_is_on => keyguard.is_showing_and_not_hidden(),
            Some(keyguard) => keyguard.is_showing(),
            None => false,
        };

        let mut policy_flags = policy_flags;
        if code == KeyCode::Power {
            policy_flags |= PolicyFlags::WAKE;
        }
        let is_wake_key = policy_flags.intersects(PolicyFlags::WAKE | PolicyFlags::WAKE_DROPPED)
            || (matches!(code, KeyCode::VolumeUp | KeyCode::VolumeDown)
                && settings.volume_wake_screen
                && !screen_is_on);
        let injected = policy_flags.contains(PolicyFlags::INJECTED);
        trace!(key = ?code, down = event.down, screen_is_on, keyguard_active, ?policy_flags, is_wake_key, "Queueing key");

        if event.down && policy_flags.contains(PolicyFlags::VIRTUAL) && event.repeat_count == 0 {
            self.haptic(HapticEffect::VirtualKey);
        }

        let mut ctx = QueueContext { screen_is_on, keyguard_active, keyguard_notified: false };
        let mut result;
        if (screen_is_on && !self.config.device.headless) || (injected && !is_wake_key) {
            result = QueueAction::PASS_TO_USER;
        } else {
            // Screen off: maybe wake, never pass
            result = QueueAction::empty();
            if event.down && is_wake_key && self.is_wake_key_when_screen_off(code) {
                if keyguard_active {
                    self.keyguard_wake_key(code);
                    ctx.keyguard_notified = true;
                    if code == KeyCode::Power {
                        result |= QueueAction::WAKE_UP;
                    }
                } else if !matches!(code, KeyCode::VolumeUp | KeyCode::VolumeDown) {
                    result |= QueueAction::WAKE_UP;
                }
            }
        }

        match code {
            KeyCode::EndCall => self.queue_end_call(event, &ctx, &settings, &mut result),
            KeyCode::VolumeDown | KeyCode::VolumeUp | KeyCode::VolumeMute => {
                self.queue_volume(event, &ctx, &settings, &mut result)
            }
            KeyCode::Power => self.queue_power(event, &ctx, &settings, &mut result),
            KeyCode::MediaPlay | KeyCode::MediaPause | KeyCode::MediaPlayPause
                if event.down && !self.phone_is_idle() =>
            {
                // No play/pause toggling while ringing or in a call
                debug!(key = ?code, "Suppressing play/pause, phone not idle");
            }
            code if code.is_media() => {
                if !result.contains(QueueAction::PASS_TO_USER) {
                    // Released by the handler once the audio service has it
                    self.services.wake_lock.acquire();
                    self.scheduler.post(PolicyMessage::DispatchMediaKey(*event));
                }
            }
            KeyCode::Call => {
                if event.down && self.phone_is_ringing() {
                    info!("CALL key-down while ringing, answering");
                    self.services.telephony.call("answer_ringing_call", |t| t.answer_ringing_call());
                    result.remove(QueueAction::PASS_TO_USER);
                }
            }
            _ => {}
        }
        result
    }

    /// Decide what a motion event does while the screen is off
    pub fn intercept_motion_before_queueing_when_screen_off(&self, policy_flags: PolicyFlags) -> QueueAction {
        if !policy_flags.intersects(PolicyFlags::WAKE | PolicyFlags::WAKE_DROPPED) {
            return QueueAction::empty();
        }
        match &self.services.keyguard {
            Some(keyguard) if keyguard.is_showing() => {
                self.keyguard_call("on_wake_motion", |k| k.on_wake_motion_when_keyguard_showing());
                QueueAction::empty()
            }
            _ => QueueAction::WAKE_UP,
        }
    }

    fn is_wake_key_when_screen_off(&self, code: KeyCode) -> bool {
        match code {
            // Volume keys only wake a docked device
            KeyCode::VolumeUp | KeyCode::VolumeDown | KeyCode::VolumeMute => self.is_docked(),
            KeyCode::Camera => false,
            code if code.is_media() => false,
            _ => true,
        }
    }

    fn keyguard_wake_key(&self, code: KeyCode) {
        self.keyguard_call("on_wake_key", |k| k.on_wake_key_when_keyguard_showing(code));
    }

    fn queue_end_call(&self, event: &KeyEvent, ctx: &QueueContext, settings: &PolicySettings, result: &mut QueueAction) {
        result.remove(QueueAction::PASS_TO_USER);
        if event.down {
            let hung_up = self.services.telephony.call("end_call", |t| t.end_call()).unwrap_or(false);
            self.intercept_power_key_down(!ctx.screen_is_on || hung_up);
            return;
        }
        if !self.intercept_power_key_up(event.is_canceled()) {
            return;
        }
        if settings.end_button_behavior & END_BUTTON_BEHAVIOR_HOME != 0 && self.go_home() {
            return;
        }
        if settings.end_button_behavior & END_BUTTON_BEHAVIOR_SLEEP != 0 {
            result.remove(QueueAction::WAKE_UP);
            result.insert(QueueAction::GO_TO_SLEEP);
        }
    }

    fn queue_volume(&self, event: &KeyEvent, ctx: &QueueContext, settings: &PolicySettings, result: &mut QueueAction) {
        let arm_chord = ctx.screen_is_on && !event.is_fallback();
        match (event.code, event.down) {
            (KeyCode::VolumeDown, true) if arm_chord => {
                let pressed = self.keys().chord.press_volume_down(event.down_time_ms);
                if pressed {
                    self.cancel_pending_power_key_action();
                    self.intercept_screenshot_chord();
                }
            }
            (KeyCode::VolumeDown, false) => {
                self.keys().chord.release_volume_down();
                self.cancel_pending_screenshot_chord();
            }
            (KeyCode::VolumeUp, true) if arm_chord => {
                let pressed = self.keys().chord.press_volume_up();
                if pressed {
                    self.cancel_pending_power_key_action();
                    self.cancel_pending_screenshot_chord();
                }
            }
            (KeyCode::VolumeUp, false) => {
                self.keys().chord.release_volume_up();
                self.cancel_pending_screenshot_chord();
            }
            _ => {}
        }

        if event.down {
            if self.phone_is_ringing() {
                info!("Volume key-down while ringing, silencing ringer");
                self.services.telephony.call("silence_ringer", |t| t.silence_ringer());
                result.remove(QueueAction::PASS_TO_USER);
                return;
            }
            if !result.contains(QueueAction::PASS_TO_USER) && self.phone_is_offhook() {
                // In call and the app is not getting the key
                self.adjust_volume(Stream::VoiceCall, event.code);
                return;
            }
        }

        if self.queue_volume_music(event, ctx, settings, result) {
            return;
        }

        if ctx.screen_is_on || !settings.volume_wake_screen {
            return;
        }
        if ctx.keyguard_active {
            if event.down && !ctx.keyguard_notified {
                self.keyguard_wake_key(KeyCode::Power);
            }
        } else {
            result.insert(QueueAction::WAKE_UP);
        }
    }

    /// Volume keys while music plays. Returns true when the key was fully
    /// handled here.
    fn queue_volume_music(
        &self,
        event: &KeyEvent,
        ctx: &QueueContext,
        settings: &PolicySettings,
        result: &mut QueueAction,
    ) -> bool {
        let music_active = self.services.audio.call("is_music_active", |a| a.is_music_active()).unwrap_or(false);
        if !music_active {
            return false;
        }

        if settings.volbtn_music_controls && event.code != KeyCode::VolumeMute {
            result.remove(QueueAction::PASS_TO_USER);
            if event.down {
                if event.repeat_count == 0 {
                    let press_id = {
                        let mut keys = self.keys();
                        let press_id = keys.allocate_press_id();
                        keys.volume_music =
                            VolumeMusicState { active: Some(event.code), press_id, long_fired: false };
                        press_id
                    };
                    self.scheduler.post_delayed(
                        PolicyMessage::VolumeMusicLongPress { code: event.code, press_id },
                        Duration::from_millis(self.config.input.long_press_timeout_ms),
                    );
                }
                return true;
            }

            self.scheduler.cancel(TimerKey::VolumeMusic);
            let (state, chord_consumed) = {
                let mut keys = self.keys();
                let consumed = event.code == KeyCode::VolumeDown && keys.chord.volume_down_consumed();
                (std::mem::take(&mut keys.volume_music), consumed)
            };
            if !state.long_fired && !chord_consumed {
                self.adjust_volume(Stream::Music, event.code);
            }
            return true;
        }

        if event.down
            && !result.contains(QueueAction::PASS_TO_USER)
            && !ctx.screen_is_on
            && !settings.volume_wake_screen
        {
            self.adjust_volume(Stream::Music, event.code);
        }
        false
    }

    fn queue_power(&self, event: &KeyEvent, ctx: &QueueContext, settings: &PolicySettings, result: &mut QueueAction) {
        if self.top_fullscreen_flags().contains(WindowFlags::PREVENT_POWER_KEY) {
            debug!("Top window is handling the power key itself");
            return;
        }
        result.remove(QueueAction::PASS_TO_USER);

        if event.down {
            if ctx.screen_is_on && !event.is_fallback() {
                let pressed = self.keys().chord.press_power(event.down_time_ms);
                if pressed {
                    self.intercept_screenshot_chord();
                }
            }

            let mut hung_up = false;
            if self.phone_is_ringing() {
                self.services.telephony.call("silence_ringer", |t| t.silence_ringer());
            } else if settings.incall_power_hangup && self.phone_is_offhook() {
                hung_up = self.services.telephony.call("end_call", |t| t.end_call()).unwrap_or(false);
            }

            let volume_held = {
                let keys = self.keys();
                keys.chord.volume_down_triggered() || keys.chord.volume_up_triggered()
            };
            self.intercept_power_key_down(!ctx.screen_is_on || hung_up || volume_held);
            return;
        }

        self.keys().chord.release_power();
        self.cancel_pending_screenshot_chord();
        let pending_up_canceled = std::mem::take(&mut self.keys().power.pending_up_canceled);
        if self.intercept_power_key_up(event.is_canceled() || pending_up_canceled) {
            result.remove(QueueAction::WAKE_UP);
            result.insert(QueueAction::GO_TO_SLEEP);
        }
    }

    fn intercept_power_key_down(&self, handled: bool) {
        self.keys().power.handled = handled;
        if !handled {
            self.scheduler.post_delayed(
                PolicyMessage::PowerLongPress,
                Duration::from_millis(self.config.input.global_action_key_timeout_ms),
            );
        }
    }

    /// True if the release should put the device to sleep
    fn intercept_power_key_up(&self, canceled: bool) -> bool {
        let handled = self.keys().power.handled;
        if handled {
            return false;
        }
        self.scheduler.cancel(TimerKey::PowerLongPress);
        !canceled
    }

    fn cancel_pending_power_key_action(&self) {
        let handled = {
            let mut keys = self.keys();
            if keys.chord.power_triggered() {
                keys.power.pending_up_canceled = true;
            }
            keys.power.handled
        };
        if !handled {
            self.scheduler.cancel(TimerKey::PowerLongPress);
        }
    }

    fn intercept_screenshot_chord(&self) {
        let keyguard_showing = self.keyguard_showing();
        let now = self.now_ms();
        let fired = self.keys().chord.try_complete(now, keyguard_showing);
        if !fired {
            return;
        }
        info!("Screenshot chord detected");
        self.cancel_pending_power_key_action();
        self.scheduler.cancel(TimerKey::VolumeMusic);
        let delay = capture_delay_ms(self.config.input.global_action_key_timeout_ms, keyguard_showing);
        self.scheduler.post_delayed(PolicyMessage::ScreenshotChord, Duration::from_millis(delay));
    }

    fn cancel_pending_screenshot_chord(&self) {
        self.scheduler.cancel(TimerKey::ScreenshotChord);
    }

    /// Runs on the handler when the chord capture delay expires
    pub(crate) fn take_screenshot(&self) {
        if let Err(e) = self.services.launcher.take_screenshot() {
            tracing::warn!("Could not take screenshot: {}", e);
        }
    }

    /// Runs on the handler when power has been held long enough
    pub(crate) fn power_long_press(&self) {
        let behavior = self.config.input.long_press_on_power;
        debug!(?behavior, "Power long press");
        let confirm = match behavior {
            LongPressOnPower::Nothing => return,
            LongPressOnPower::GlobalActions => None,
            LongPressOnPower::ShutOff => Some(true),
            LongPressOnPower::ShutOffNoConfirm => Some(false),
        };
        self.keys().power.handled = true;
        self.haptic(HapticEffect::LongPress);
        self.close_system_windows(Some(close_reason::GLOBAL_ACTIONS));
        match confirm {
            None => {
                let keyguard_showing = self.keyguard_showing_and_not_hidden();
                if let Err(e) = self.services.launcher.show_global_actions(keyguard_showing, true) {
                    tracing::warn!("Could not show global actions: {}", e);
                }
            }
            Some(confirm) => {
                if let Err(e) = self.services.window_manager.shutdown(confirm) {
                    tracing::warn!("Shutdown request failed: {}", e);
                }
            }
        }
    }

    /// Runs on the handler when a volume key was held past the long-press
    /// timeout while music plays: skip a track instead of changing volume
    pub(crate) fn volume_music_long_press(&self, code: KeyCode, press_id: u64) {
        {
            let mut keys = self.keys();
            let state = &mut keys.volume_music;
            if state.active != Some(code) || state.press_id != press_id || state.long_fired {
                return;
            }
            state.long_fired = true;
        }
        let track = if code == KeyCode::VolumeUp { KeyCode::MediaNext } else { KeyCode::MediaPrevious };
        debug!(key = ?track, "Volume key held, skipping track");
        let down = KeyEvent::down(track, self.now_ms());
        self.services.wake_lock.acquire();
        self.send_media_key_to_audio(&down);
        self.send_media_key_to_audio(&KeyEvent::up_from(&down, down.event_time_ms));
        self.services.wake_lock.release();
    }

    fn adjust_volume(&self, stream: Stream, code: KeyCode) {
        let direction = match code {
            KeyCode::VolumeUp => 1,
            KeyCode::VolumeDown => -1,
            _ => return,
        };
        self.services.wake_lock.acquire();
        self.services.audio.call("adjust_stream_volume", |a| a.adjust_stream_volume(stream, direction));
        self.services.wake_lock.release();
    }

    fn phone_is_ringing(&self) -> bool {
        self.services.telephony.call("is_ringing", |t| t.is_ringing()).unwrap_or(false)
    }

    fn phone_is_offhook(&self) -> bool {
        self.services.telephony.call("is_offhook", |t| t.is_offhook()).unwrap_or(false)
    }

    fn phone_is_idle(&self) -> bool {
        self.services.telephony.call("is_idle", |t| t.is_idle()).unwrap_or(true)
    }
}
