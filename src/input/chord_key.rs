//! Press / long-press state machine shared by the five configurable keys
//!
//! Each physical press ends in exactly one action: the long-press action if
//! the threshold was reached first, otherwise the short-press action on
//! release. The long-press can be reached two ways, a policy timer armed on
//! the initial down or a repeat carrying the long-press flag, and whichever
//! comes first wins.

use serde::Serialize;

use crate::input::actions::{FamilyBehavior, KeyAction, KeyFamily};
use crate::input::keys::{KeyEvent, VIRTUAL_KEYBOARD};

/// Action a key transition asks the policy to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fire {
    Press,
    LongPress,
}

/// What to tell the dispatcher about the key itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    Consume,
    Pass,
    /// Not decided here; later dispatch rules get a look
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOutcome {
    pub fire: Option<Fire>,
    pub verdict: KeyVerdict,
    /// Arm the long-press timer for this press id
    pub arm_long_press: Option<u64>,
    /// The press is over; any long-press timer should be cancelled
    pub disarm: bool,
}

impl KeyOutcome {
    fn verdict(verdict: KeyVerdict) -> Self {
        Self { fire: None, verdict, arm_long_press: None, disarm: false }
    }

    fn fire(fire: Fire, verdict: KeyVerdict) -> Self {
        Self { fire: Some(fire), ..Self::verdict(verdict) }
    }
}

/// Conditions that change how a transition is handled
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub behavior: &'a FamilyBehavior,
    pub keyguard_on: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChordableKey {
    family: KeyFamily,
    pressed: bool,
    long_pressed: bool,
    do_custom_action: bool,
    press_id: u64,
}

impl ChordableKey {
    pub fn new(family: KeyFamily) -> Self {
        Self { family, pressed: false, long_pressed: false, do_custom_action: false, press_id: 0 }
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    pub fn is_long_pressed(&self) -> bool {
        self.long_pressed
    }

    pub fn press_id(&self) -> u64 {
        self.press_id
    }

    fn base_verdict(&self) -> KeyVerdict {
        if self.family.always_consumed() {
            KeyVerdict::Consume
        } else {
            KeyVerdict::Continue
        }
    }

    /// Initial down or repeat
    pub fn on_down(&mut self, event: &KeyEvent, ctx: KeyContext<'_>, next_press_id: u64) -> KeyOutcome {
        if event.repeat_count == 0 {
            self.pressed = true;
            self.long_pressed = false;
            self.do_custom_action = false;
            self.press_id = next_press_id;

            let arm = (ctx.behavior.long_press != KeyAction::Nothing).then_some(next_press_id);
            let mut outcome = KeyOutcome::verdict(self.base_verdict());
            outcome.arm_long_press = arm;

            if self.family.uses_custom_action()
                && ctx.behavior.press != self.family.default_press()
                && event.device_id != VIRTUAL_KEYBOARD
            {
                self.do_custom_action = true;
                outcome.verdict = KeyVerdict::Consume;
            }
            return outcome;
        }

        if event.is_long_press() {
            if let Some(fire) = self.reach_long_press(ctx) {
                return KeyOutcome::fire(fire, KeyVerdict::Consume);
            }
        }
        if self.long_pressed || self.do_custom_action {
            KeyOutcome::verdict(KeyVerdict::Consume)
        } else {
            KeyOutcome::verdict(self.base_verdict())
        }
    }

    /// Long-press timer for `press_id` expired
    pub fn on_long_press_timeout(&mut self, press_id: u64, ctx: KeyContext<'_>) -> Option<Fire> {
        if press_id != self.press_id {
            return None;
        }
        self.reach_long_press(ctx)
    }

    fn reach_long_press(&mut self, ctx: KeyContext<'_>) -> Option<Fire> {
        if !self.pressed || self.long_pressed {
            return None;
        }
        if ctx.keyguard_on || ctx.behavior.long_press == KeyAction::Nothing {
            return None;
        }
        self.long_pressed = true;
        self.do_custom_action = false;
        Some(Fire::LongPress)
    }

    pub fn on_up(&mut self, event: &KeyEvent, ctx: KeyContext<'_>) -> KeyOutcome {
        let was_pressed = std::mem::replace(&mut self.pressed, false);
        let was_long_pressed = std::mem::replace(&mut self.long_pressed, false);
        let custom = std::mem::replace(&mut self.do_custom_action, false);

        let mut outcome = if was_long_pressed {
            // The long press already acted; eat the release
            KeyOutcome::verdict(KeyVerdict::Consume)
        } else if !was_pressed {
            KeyOutcome::verdict(self.base_verdict())
        } else if self.family.uses_custom_action() {
            if custom {
                if !event.is_canceled() && !ctx.keyguard_on {
                    KeyOutcome::fire(Fire::Press, KeyVerdict::Consume)
                } else {
                    KeyOutcome::verdict(KeyVerdict::Consume)
                }
            } else if event.is_canceled() {
                KeyOutcome::verdict(KeyVerdict::Consume)
            } else {
                KeyOutcome::verdict(KeyVerdict::Continue)
            }
        } else if event.is_canceled() || (ctx.keyguard_on && self.family != KeyFamily::Home) {
            KeyOutcome::verdict(self.base_verdict())
        } else {
            KeyOutcome::fire(Fire::Press, self.base_verdict())
        };
        outcome.disarm = true;
        outcome
    }
}
