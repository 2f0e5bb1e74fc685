//! Key/motion interception pipeline
//!
//! Two decision points: [`PhonePolicy::intercept_key_before_queueing`] runs
//! on the input reader before an event is queued, and
//! [`PhonePolicy::intercept_key_before_dispatching`] runs once the target
//! window is known. Both only touch [`KeyState`] under its own lock and call
//! collaborators after releasing it.
//!
//! [`PhonePolicy::intercept_key_before_queueing`]: crate::policy::PhonePolicy::intercept_key_before_queueing
//! [`PhonePolicy::intercept_key_before_dispatching`]: crate::policy::PhonePolicy::intercept_key_before_dispatching

pub mod actions;
pub mod chord_key;
mod dispatch;
pub mod keys;
mod media;
mod queueing;
pub mod screenshot;

use std::collections::HashMap;

use serde::Serialize;

pub use actions::*;
pub use chord_key::*;
pub use keys::*;
pub use screenshot::*;

/// Power (and end-call) key bookkeeping
#[derive(Debug, Clone, Default, Serialize)]
pub struct PowerKeyState {
    /// The press already did something; its release must not sleep
    pub handled: bool,
    /// A screenshot chord took over this power press
    pub pending_up_canceled: bool,
}

/// Volume key held to skip tracks while music plays
#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeMusicState {
    pub active: Option<KeyCode>,
    pub press_id: u64,
    pub long_fired: bool,
}

/// Everything the pipeline remembers between events
#[derive(Debug)]
pub struct KeyState {
    keys: [ChordableKey; 5],
    pub chord: ScreenshotChord,
    pub power: PowerKeyState,
    pub search_key_shortcut_pending: bool,
    pub consume_search_key_up: bool,
    /// Modifiers holding the Alt/Meta+Tab recent apps dialog open
    pub recent_apps_dialog_held_modifiers: MetaState,
    pub language_switch_pressed: bool,
    /// Fallback substitutes by original key, kept from down until up
    pub fallback_actions: HashMap<KeyCode, (KeyCode, MetaState)>,
    pub volume_music: VolumeMusicState,
    /// Sequence of the media key repeat currently holding the wake lock
    pub media_repeat_pending: Option<u64>,
    media_seq: u64,
    next_press_id: u64,
    pub recent_apps_preloaded: bool,
}

impl KeyState {
    pub fn new(screenshot_chord_enabled: bool) -> Self {
        Self {
            keys: KeyFamily::ALL.map(ChordableKey::new),
            chord: ScreenshotChord::new(screenshot_chord_enabled),
            power: PowerKeyState::default(),
            search_key_shortcut_pending: false,
            consume_search_key_up: false,
            recent_apps_dialog_held_modifiers: MetaState::empty(),
            language_switch_pressed: false,
            fallback_actions: HashMap::new(),
            volume_music: VolumeMusicState::default(),
            media_repeat_pending: None,
            media_seq: 0,
            next_press_id: 0,
            recent_apps_preloaded: false,
        }
    }

    pub fn key(&self, family: KeyFamily) -> &ChordableKey {
        &self.keys[family.index()]
    }

    pub fn key_mut(&mut self, family: KeyFamily) -> &mut ChordableKey {
        &mut self.keys[family.index()]
    }

    pub fn keys(&self) -> &[ChordableKey; 5] {
        &self.keys
    }

    /// Identity for a new press, used to match timers to presses
    pub fn allocate_press_id(&mut self) -> u64 {
        self.next_press_id += 1;
        self.next_press_id
    }

    pub fn allocate_media_seq(&mut self) -> u64 {
        self.media_seq += 1;
        self.media_seq
    }
}
