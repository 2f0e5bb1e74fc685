//! Media keys handed to the audio service off the input thread
//!
//! The queueing stage takes the wake lock and posts the event. Every
//! acquire is matched by exactly one release: either right after dispatch,
//! or, for an initial down, by the repeat that follows it or by whichever
//! event cancels that repeat.

use std::time::Duration;

use tracing::{debug, trace};

use crate::handler::{PolicyMessage, TimerKey};
use crate::input::keys::{KeyEvent, KeyEventFlags};
use crate::policy::PhonePolicy;

impl PhonePolicy {
    pub(crate) fn dispatch_media_key_with_wake_lock(&self, event: KeyEvent) {
        trace!(key = ?event.code, down = event.down, "Dispatching media key");
        let had_pending_repeat = self.keys().media_repeat_pending.take().is_some();
        if had_pending_repeat {
            debug!("Media key repeat canceled");
            self.scheduler.cancel(TimerKey::MediaKeyRepeat);
            // The pending repeat was holding the wake lock
            self.services.wake_lock.release();
        }

        self.send_media_key_to_audio(&event);

        if event.is_initial_down() {
            let seq = {
                let mut keys = self.keys();
                let seq = keys.allocate_media_seq();
                keys.media_repeat_pending = Some(seq);
                seq
            };
            self.scheduler.post_delayed(
                PolicyMessage::DispatchMediaKeyRepeat { event, seq },
                Duration::from_millis(self.config.input.key_repeat_timeout_ms),
            );
        } else {
            self.services.wake_lock.release();
        }
    }

    pub(crate) fn dispatch_media_key_repeat_with_wake_lock(&self, event: KeyEvent, seq: u64) {
        {
            let mut keys = self.keys();
            if keys.media_repeat_pending != Some(seq) {
                // Canceled after it was already on its way
                return;
            }
            keys.media_repeat_pending = None;
        }
        let repeat = event.repeat(1, self.now_ms()).with_flags(KeyEventFlags::LONG_PRESS);
        self.send_media_key_to_audio(&repeat);
        self.services.wake_lock.release();
    }

    pub(crate) fn send_media_key_to_audio(&self, event: &KeyEvent) {
        if !self.is_system_ready() {
            debug!(key = ?event.code, "System not ready, dropping media key");
            return;
        }
        self.services.audio.call("dispatch_media_key", |a| a.dispatch_media_key(event));
    }
}
