//! Key event model and the verdict types of the two interception stages

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Device id used for events injected by the system itself (navigation
/// bar buttons, virtual key presses)
pub const VIRTUAL_KEYBOARD: i32 = -1;

/// Hardware key codes the policy cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCode {
    Unknown,
    Home,
    Back,
    Menu,
    AppSwitch,
    Assist,
    Search,
    Power,
    EndCall,
    Call,
    Camera,
    VolumeUp,
    VolumeDown,
    VolumeMute,
    Mute,
    HeadsetHook,
    MediaPlay,
    MediaPause,
    MediaPlayPause,
    MediaStop,
    MediaNext,
    MediaPrevious,
    MediaRewind,
    MediaFastForward,
    MediaRecord,
    Tab,
    Space,
    Enter,
    LanguageSwitch,
    Explorer,
    Envelope,
    Contacts,
    Calendar,
    Music,
    Calculator,
    ShiftLeft,
    ShiftRight,
    AltLeft,
    AltRight,
    CtrlLeft,
    CtrlRight,
    MetaLeft,
    MetaRight,
    /// Printing key producing this character (letters, digits, symbols)
    Char(char),
    /// Numeric keypad digit
    Numpad(u8),
}

impl KeyCode {
    /// Key produces a printable character
    pub fn is_printing(self) -> bool {
        matches!(self, KeyCode::Char(_) | KeyCode::Numpad(_) | KeyCode::Space)
    }

    pub fn is_volume(self) -> bool {
        matches!(self, KeyCode::VolumeUp | KeyCode::VolumeDown | KeyCode::VolumeMute)
    }

    /// Keys forwarded to the audio service when the app does not get them
    pub fn is_media(self) -> bool {
        matches!(
            self,
            KeyCode::MediaPlay
                | KeyCode::MediaPause
                | KeyCode::MediaPlayPause
                | KeyCode::HeadsetHook
                | KeyCode::Mute
                | KeyCode::MediaStop
                | KeyCode::MediaNext
                | KeyCode::MediaPrevious
                | KeyCode::MediaRewind
                | KeyCode::MediaRecord
                | KeyCode::MediaFastForward
        )
    }
}

bitflags! {
    /// Modifier state at the time of the event
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MetaState: u32 {
        const SHIFT = 0x01;
        const ALT = 0x02;
        const CTRL = 0x04;
        const META = 0x08;
    }
}

bitflags! {
    /// Flags carried by the key event itself
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct KeyEventFlags: u32 {
        const VIRTUAL_HARD_KEY = 0x0040;
        const LONG_PRESS = 0x0080;
        const CANCELED = 0x0020;
        const FROM_SYSTEM = 0x0008;
        /// Synthesized by `dispatch_unhandled_key`
        const FALLBACK = 0x0400;
    }
}

bitflags! {
    /// Flags the input reader attaches to an event
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PolicyFlags: u32 {
        const WAKE = 0x0000_0001;
        const WAKE_DROPPED = 0x0000_0002;
        const VIRTUAL = 0x0000_0004;
        const INJECTED = 0x0100_0000;
        const TRUSTED = 0x0200_0000;
    }
}

bitflags! {
    /// Verdict of the queueing stage
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct QueueAction: u32 {
        const PASS_TO_USER = 0x1;
        const WAKE_UP = 0x2;
        const GO_TO_SLEEP = 0x4;
    }
}

/// Verdict of the dispatch stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Deliver the key to the focused window
    Pass,
    /// The policy handled the key
    Consume,
    /// Ask again after this many milliseconds
    RetryAfter(u64),
}

/// One key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub down: bool,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default)]
    pub meta: MetaState,
    #[serde(default)]
    pub flags: KeyEventFlags,
    #[serde(default)]
    pub device_id: i32,
    /// Time of the initial down, ms since boot
    #[serde(default)]
    pub down_time_ms: u64,
    #[serde(default)]
    pub event_time_ms: u64,
}

impl KeyEvent {
    pub fn down(code: KeyCode, time_ms: u64) -> Self {
        Self {
            code,
            down: true,
            repeat_count: 0,
            meta: MetaState::empty(),
            flags: KeyEventFlags::empty(),
            device_id: 0,
            down_time_ms: time_ms,
            event_time_ms: time_ms,
        }
    }

    /// Release matching this down event
    pub fn up_from(down: &KeyEvent, time_ms: u64) -> Self {
        Self { down: false, repeat_count: 0, event_time_ms: time_ms, ..*down }
    }

    pub fn with_meta(mut self, meta: MetaState) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_flags(mut self, flags: KeyEventFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_device(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Repeat of a held key
    pub fn repeat(&self, count: u32, time_ms: u64) -> Self {
        Self { repeat_count: count, event_time_ms: time_ms, ..*self }
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.contains(KeyEventFlags::CANCELED)
    }

    pub fn is_long_press(&self) -> bool {
        self.flags.contains(KeyEventFlags::LONG_PRESS)
    }

    pub fn is_fallback(&self) -> bool {
        self.flags.contains(KeyEventFlags::FALLBACK)
    }

    /// First down of a press
    pub fn is_initial_down(&self) -> bool {
        self.down && self.repeat_count == 0
    }
}
