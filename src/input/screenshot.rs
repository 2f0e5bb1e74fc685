//! Volume-down + power screenshot chord

use serde::Serialize;

/// Both halves of the chord must land within this window
pub const CHORD_DEBOUNCE_MS: u64 = 150;

/// Slack applied to the debounce window and the capture delay while the
/// keyguard is showing
pub const KEYGUARD_CHORD_MULTIPLIER: f64 = 2.5;

/// Trigger state of the chord participants
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScreenshotChord {
    enabled: bool,
    volume_down_triggered: bool,
    volume_down_time: u64,
    /// Volume-down belongs to a detected chord; its events are eaten
    volume_down_consumed: bool,
    volume_up_triggered: bool,
    power_triggered: bool,
    power_time: u64,
}

/// Debounce window for the current keyguard state
pub fn debounce_ms(keyguard_showing: bool) -> u64 {
    if keyguard_showing {
        (CHORD_DEBOUNCE_MS as f64 * KEYGUARD_CHORD_MULTIPLIER) as u64
    } else {
        CHORD_DEBOUNCE_MS
    }
}

/// Delay between detecting the chord and capturing the screen
pub fn capture_delay_ms(global_action_timeout_ms: u64, keyguard_showing: bool) -> u64 {
    if keyguard_showing {
        (global_action_timeout_ms as f64 * KEYGUARD_CHORD_MULTIPLIER) as u64
    } else {
        global_action_timeout_ms
    }
}

impl ScreenshotChord {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, ..Self::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn volume_down_triggered(&self) -> bool {
        self.volume_down_triggered
    }

    pub fn volume_up_triggered(&self) -> bool {
        self.volume_up_triggered
    }

    pub fn power_triggered(&self) -> bool {
        self.power_triggered
    }

    pub fn volume_down_consumed(&self) -> bool {
        self.volume_down_consumed
    }

    /// Record a volume-down press; false if it was already held
    pub fn press_volume_down(&mut self, down_time: u64) -> bool {
        if self.volume_down_triggered {
            return false;
        }
        self.volume_down_triggered = true;
        self.volume_down_time = down_time;
        self.volume_down_consumed = false;
        true
    }

    pub fn release_volume_down(&mut self) {
        self.volume_down_triggered = false;
    }

    pub fn press_volume_up(&mut self) -> bool {
        !std::mem::replace(&mut self.volume_up_triggered, true)
    }

    pub fn release_volume_up(&mut self) {
        self.volume_up_triggered = false;
    }

    pub fn press_power(&mut self, down_time: u64) -> bool {
        if self.power_triggered {
            return false;
        }
        self.power_triggered = true;
        self.power_time = down_time;
        true
    }

    pub fn release_power(&mut self) {
        self.power_triggered = false;
    }

    /// Check whether the chord just completed. On success volume-down is
    /// marked consumed and the caller arms the capture.
    pub fn try_complete(&mut self, now: u64, keyguard_showing: bool) -> bool {
        if !self.enabled || !self.volume_down_triggered || !self.power_triggered || self.volume_up_triggered {
            return false;
        }
        let window = debounce_ms(keyguard_showing);
        if now <= self.volume_down_time + window && now <= self.power_time + window {
            self.volume_down_consumed = true;
            return true;
        }
        false
    }

    /// Milliseconds the dispatcher should wait before delivering a key
    /// while only volume-down of a possible chord has been seen
    pub fn retry_delay(&self, now: u64, keyguard_showing: bool) -> Option<u64> {
        if !self.enabled || !self.volume_down_triggered || self.power_triggered {
            return None;
        }
        let timeout = self.volume_down_time + debounce_ms(keyguard_showing);
        (now < timeout).then(|| timeout - now)
    }

    /// Volume-down events of a completed chord are eaten; the release ends
    /// that
    pub fn eat_volume_down(&mut self, down: bool) -> bool {
        if !self.enabled || !self.volume_down_consumed {
            return false;
        }
        if !down {
            self.volume_down_consumed = false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chord_within_window() {
        let mut chord = ScreenshotChord::new(true);
        assert!(chord.press_volume_down(1000));
        assert!(chord.press_power(1100));
        assert!(chord.try_complete(1150, false));
        assert!(chord.volume_down_consumed());
    }

    #[test]
    fn test_chord_boundary_is_inclusive() {
        let mut chord = ScreenshotChord::new(true);
        chord.press_volume_down(1000);
        chord.press_power(1150);
        assert!(chord.try_complete(1150, false));

        let mut late = ScreenshotChord::new(true);
        late.press_volume_down(1000);
        late.press_power(1151);
        assert!(!late.try_complete(1151, false));
    }

    #[test]
    fn test_keyguard_widens_window() {
        let mut chord = ScreenshotChord::new(true);
        chord.press_volume_down(1000);
        chord.press_power(1375);
        assert!(chord.try_complete(1375, true));
        assert_eq!(capture_delay_ms(500, true), 1250);
    }

    #[test]
    fn test_volume_up_blocks_chord() {
        let mut chord = ScreenshotChord::new(true);
        chord.press_volume_up();
        chord.press_volume_down(0);
        chord.press_power(10);
        assert!(!chord.try_complete(20, false));
    }

    #[test]
    fn test_disabled_chord() {
        let mut chord = ScreenshotChord::new(false);
        chord.press_volume_down(0);
        chord.press_power(0);
        assert!(!chord.try_complete(0, false));
        assert_eq!(chord.retry_delay(0, false), None);
    }

    #[test]
    fn test_retry_while_half_seen() {
        let mut chord = ScreenshotChord::new(true);
        chord.press_volume_down(1000);
        assert_eq!(chord.retry_delay(1040, false), Some(110));
        assert_eq!(chord.retry_delay(1150, false), None);
        chord.press_power(1050);
        assert_eq!(chord.retry_delay(1060, false), None);
    }

    #[test]
    fn test_consumed_until_release() {
        let mut chord = ScreenshotChord::new(true);
        chord.press_volume_down(0);
        chord.press_power(0);
        chord.try_complete(0, false);
        assert!(chord.eat_volume_down(true));
        assert!(chord.eat_volume_down(false));
        assert!(!chord.eat_volume_down(false));
    }
}
