//! System chrome: status bar visibility and the system UI flags negotiated
//! between the focused window and the status bar service
//!
//! The post-layout scan walks windows top-down after every layout pass and
//! remembers the first fullscreen application window along with the
//! keyguard related requests it carries. [`PhonePolicy::finish_post_layout_policy`]
//! turns the scan into show/hide decisions.
//!
//! [`PhonePolicy::finish_post_layout_policy`]: crate::policy::PhonePolicy::finish_post_layout_policy

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use crate::handler::PolicyMessage;
use crate::policy::PhonePolicy;
use crate::settings::PolicySettings;
use crate::window::{AppToken, PrivateFlags, SystemUiFlags, WindowFlags, WindowId, WindowRef, WindowType};

/// What one post-layout pass learned about the window stack
#[derive(Debug, Clone, Default)]
pub struct PostLayoutScan {
    /// Topmost visible fullscreen application (or dream) window
    pub top_fullscreen: Option<WindowRef>,
    pub force_status_bar: bool,
    /// A keyguard window asked for the status bar
    pub force_status_bar_from_keyguard: bool,
    /// Layer of the window forcing the navigation bar visible
    pub forcing_show_nav_bar_layer: Option<i32>,
    /// Top window shows over the lock screen
    pub hide_lock_screen: bool,
    pub allow_lockscreen_when_on: bool,
    /// Top window asking to dismiss the keyguard
    pub dismissing_window: Option<WindowId>,
    pub showing_lockscreen: bool,
    pub showing_dream: bool,
}

/// Window state sampled before the scan takes its lock
#[derive(Debug, Clone)]
pub struct ScanWindow {
    pub id: WindowId,
    pub window_type: WindowType,
    pub flags: WindowFlags,
    pub private_flags: PrivateFlags,
    pub match_parent_at_origin: bool,
    pub surface_layer: i32,
    pub visible_or_behind_keyguard: bool,
    pub gone: bool,
    pub visible: bool,
    pub drawn: bool,
}

impl ScanWindow {
    pub fn sample(win: &WindowRef) -> Self {
        let attrs = win.attrs();
        Self {
            id: win.id(),
            window_type: attrs.window_type,
            flags: attrs.flags,
            private_flags: attrs.private_flags,
            match_parent_at_origin: attrs.is_match_parent_at_origin(),
            surface_layer: win.surface_layer(),
            visible_or_behind_keyguard: win.is_visible_or_behind_keyguard(),
            gone: win.is_gone_for_layout(),
            visible: win.is_visible(),
            drawn: win.has_drawn(),
        }
    }
}

impl PostLayoutScan {
    /// Fold one window into the scan, topmost first
    pub fn apply(&mut self, win: &WindowRef, w: &ScanWindow, dreaming_lockscreen: bool) {
        if self.top_fullscreen.is_none()
            && self.forcing_show_nav_bar_layer.is_none()
            && w.private_flags.contains(PrivateFlags::FORCE_SHOW_NAV_BAR)
        {
            self.forcing_show_nav_bar_layer = Some(w.surface_layer);
        }
        if self.top_fullscreen.is_some() || !w.visible_or_behind_keyguard || w.gone {
            return;
        }

        if w.flags.contains(WindowFlags::FORCE_NOT_FULLSCREEN) {
            if w.window_type == WindowType::Keyguard {
                self.force_status_bar_from_keyguard = true;
            } else {
                self.force_status_bar = true;
            }
        }
        if w.window_type == WindowType::Keyguard {
            self.showing_lockscreen = true;
        }

        let mut candidate = w.window_type.is_application();
        // A dream over the lock screen only counts once it has drawn
        if w.window_type == WindowType::Dream && (!dreaming_lockscreen || (w.visible && w.drawn)) {
            self.showing_dream = true;
            candidate = true;
        }
        if !candidate || !w.match_parent_at_origin {
            return;
        }

        trace!(window = %w.id, "Top fullscreen window");
        self.top_fullscreen = Some(win.clone());
        if w.flags.contains(WindowFlags::SHOW_WHEN_LOCKED) {
            self.hide_lock_screen = true;
            self.force_status_bar_from_keyguard = false;
        }
        if w.flags.contains(WindowFlags::DISMISS_KEYGUARD) && self.dismissing_window.is_none() {
            self.dismissing_window = Some(w.id);
            self.force_status_bar_from_keyguard = false;
        }
        if w.flags.contains(WindowFlags::ALLOW_LOCK_WHILE_SCREEN_ON) {
            self.allow_lockscreen_when_on = true;
        }
    }
}

/// Status bar change a finished scan calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBarVerdict {
    Show,
    Hide,
    /// Nothing fullscreen on top, leave it as it is
    Keep,
}

/// Decide the status bar from a finished scan. Also returns whether the top
/// window counts as fullscreen.
pub fn status_bar_verdict(
    scan: &PostLayoutScan,
    top_flags: Option<WindowFlags>,
    last_system_ui_flags: SystemUiFlags,
    settings: &PolicySettings,
) -> (StatusBarVerdict, bool) {
    if scan.force_status_bar || scan.force_status_bar_from_keyguard {
        return (StatusBarVerdict::Show, false);
    }
    let Some(flags) = top_flags else {
        return (StatusBarVerdict::Keep, false);
    };
    let top_is_fullscreen =
        flags.contains(WindowFlags::FULLSCREEN) || last_system_ui_flags.contains(SystemUiFlags::FULLSCREEN);
    let hide = (top_is_fullscreen || settings.expanded_hides_status_bar() || settings.hide_statusbar)
        && !settings.toggle_notification_shade;
    let verdict = if hide { StatusBarVerdict::Hide } else { StatusBarVerdict::Show };
    (verdict, top_is_fullscreen)
}

/// System UI bookkeeping kept between layout passes
#[derive(Debug, Default)]
pub struct ChromeState {
    /// Last visibility sent to the status bar service
    pub last_system_ui_flags: SystemUiFlags,
    pub last_focus_needs_menu: bool,
    pub focused_app: Option<AppToken>,
    pub focused: Option<WindowRef>,
    /// Bits cleared by a user touch, held until the app drops them itself
    pub resetting: SystemUiFlags,
    /// Bits force-cleared for a while after a touch on hidden navigation
    pub force_cleared: SystemUiFlags,
    pub scan: PostLayoutScan,
    pub top_is_fullscreen: bool,
    pub dreaming_lockscreen: bool,
    pub hidden_nav_consumer: bool,
}

/// Serializable view for state dumps
#[derive(Debug, Serialize)]
pub struct ChromeSummary {
    pub last_system_ui_flags: SystemUiFlags,
    pub resetting: SystemUiFlags,
    pub force_cleared: SystemUiFlags,
    pub last_focus_needs_menu: bool,
    pub focused: Option<WindowId>,
    pub top_fullscreen: Option<WindowId>,
    pub top_is_fullscreen: bool,
    pub force_status_bar: bool,
    pub hide_lock_screen: bool,
    pub showing_dream: bool,
    pub dreaming_lockscreen: bool,
    pub hidden_nav_consumer: bool,
}

impl ChromeState {
    /// Visibility an app gets to see: bits reset by the user stay off
    /// until the app itself clears them
    pub fn adjust_system_ui_visibility(&mut self, requested: SystemUiFlags) -> SystemUiFlags {
        self.resetting &= requested;
        requested - self.resetting - self.force_cleared
    }

    /// Touch on the hidden navigation consumer. Returns whether anything
    /// changed and whether the forced clear was newly started.
    pub fn touch_hidden_navigation(&mut self) -> (bool, bool) {
        let resetting = self.resetting | SystemUiFlags::CLEARABLE;
        let changed = resetting != self.resetting;
        self.resetting = resetting;
        let newly_forced = !self.force_cleared.contains(SystemUiFlags::HIDE_NAVIGATION);
        self.force_cleared |= SystemUiFlags::HIDE_NAVIGATION;
        (changed || newly_forced, newly_forced)
    }

    pub fn summary(&self) -> ChromeSummary {
        ChromeSummary {
            last_system_ui_flags: self.last_system_ui_flags,
            resetting: self.resetting,
            force_cleared: self.force_cleared,
            last_focus_needs_menu: self.last_focus_needs_menu,
            focused: self.focused.as_ref().map(|w| w.id()),
            top_fullscreen: self.scan.top_fullscreen.as_ref().map(|w| w.id()),
            top_is_fullscreen: self.top_is_fullscreen,
            force_status_bar: self.scan.force_status_bar,
            hide_lock_screen: self.scan.hide_lock_screen,
            showing_dream: self.scan.showing_dream,
            dreaming_lockscreen: self.dreaming_lockscreen,
            hidden_nav_consumer: self.hidden_nav_consumer,
        }
    }
}

impl PhonePolicy {
    pub fn adjust_system_ui_visibility(&self, requested: SystemUiFlags) -> SystemUiFlags {
        self.chrome().adjust_system_ui_visibility(requested)
    }

    /// Recompute the visibility reported for the focused window. Returns the
    /// bits that changed; the status bar is told asynchronously.
    pub(crate) fn update_system_ui_visibility(&self) -> SystemUiFlags {
        let Some(focused) = self.chrome().focused.clone() else {
            return SystemUiFlags::empty();
        };
        let window_type = focused.attrs().window_type;
        let requested = focused.system_ui_visibility();
        let layer = focused.surface_layer();
        let needs_menu = focused.needs_menu();
        let app = focused.app_token();

        let diff = {
            let mut chrome = self.chrome();
            if window_type == WindowType::Keyguard && chrome.scan.hide_lock_screen {
                // The keyguard is about to go away; keep what the app had
                return SystemUiFlags::empty();
            }
            let mut visibility = requested - chrome.resetting - chrome.force_cleared;
            if matches!(chrome.scan.forcing_show_nav_bar_layer, Some(min) if layer < min) {
                visibility -= SystemUiFlags::CLEARABLE;
            }
            let diff = visibility ^ chrome.last_system_ui_flags;
            if diff.is_empty() && needs_menu == chrome.last_focus_needs_menu && app == chrome.focused_app {
                return SystemUiFlags::empty();
            }
            chrome.last_system_ui_flags = visibility;
            chrome.last_focus_needs_menu = needs_menu;
            chrome.focused_app = app;
            diff
        };
        debug!(?diff, "System UI visibility changed");
        self.scheduler.post(PolicyMessage::UpdateSystemUiVisibility);
        diff
    }

    pub(crate) fn send_system_ui_visibility(&self) {
        let (visibility, needs_menu) = {
            let chrome = self.chrome();
            (chrome.last_system_ui_flags, chrome.last_focus_needs_menu)
        };
        self.services.status_bar.call("set_system_ui_visibility", |s| {
            s.set_system_ui_visibility(visibility, u32::MAX)?;
            s.top_app_window_changed(needs_menu)
        });
    }

    pub(crate) fn collapse_panels(&self) {
        self.services.status_bar.call("collapse_panels", |s| s.collapse_panels());
    }

    /// Touch-down on the consumer laid over hidden navigation: bring the
    /// navigation back and keep it for a while
    pub fn on_hidden_nav_touch(&self) {
        let (changed, newly_forced) = self.chrome().touch_hidden_navigation();
        if newly_forced {
            self.scheduler.post_delayed(
                PolicyMessage::ClearForcedNavigation,
                Duration::from_millis(self.config.chrome.force_clear_nav_duration_ms),
            );
        }
        if changed {
            debug!("Touch on hidden navigation, revealing bars");
            self.reevaluate_status_bar_visibility();
        }
    }

    pub(crate) fn clear_forced_navigation(&self) {
        self.chrome().force_cleared.remove(SystemUiFlags::HIDE_NAVIGATION);
        self.reevaluate_status_bar_visibility();
    }

    fn reevaluate_status_bar_visibility(&self) {
        if let Err(e) = self.services.window_manager.reevaluate_status_bar_visibility() {
            tracing::warn!("Failed to reevaluate status bar visibility: {}", e);
        }
    }

    /// Install the touch consumer while navigation is hidden, remove it
    /// once navigation is requested again
    pub(crate) fn sync_hidden_nav_consumer(&self, nav_requested_visible: bool) {
        let change = {
            let mut chrome = self.chrome();
            let want = !nav_requested_visible;
            (chrome.hidden_nav_consumer != want).then(|| {
                chrome.hidden_nav_consumer = want;
                want
            })
        };
        if let Some(installed) = change {
            debug!(installed, "Hidden navigation consumer");
            if let Err(e) = self.services.window_manager.set_hidden_nav_consumer(installed) {
                tracing::warn!("Failed to update hidden navigation consumer: {}", e);
            }
        }
    }

    pub(crate) fn last_system_ui_flags(&self) -> SystemUiFlags {
        self.chrome().last_system_ui_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TimerKey;
    use crate::testing::{FakeWindow, Harness};
    use crate::window::WindowAttrs;

    fn scan_of(windows: &[FakeWindow]) -> PostLayoutScan {
        let mut scan = PostLayoutScan::default();
        for w in windows {
            let r = w.clone().into_ref();
            scan.apply(&r, &ScanWindow::sample(&r), false);
        }
        scan
    }

    #[test]
    fn test_scan_picks_topmost_fullscreen_app() {
        let dialog = FakeWindow::new(1, WindowAttrs { x: 10, ..WindowAttrs::new(WindowType::Application) });
        let app = FakeWindow::new(2, WindowAttrs::new(WindowType::Application));
        let below = FakeWindow::new(3, WindowAttrs::new(WindowType::Application));
        let scan = scan_of(&[dialog, app, below]);
        assert_eq!(scan.top_fullscreen.map(|w| w.id()), Some(WindowId(2)));
    }

    #[test]
    fn test_scan_keyguard_flags() {
        let keyguard = FakeWindow::new(
            1,
            WindowAttrs::new(WindowType::Keyguard).with_flags(WindowFlags::FORCE_NOT_FULLSCREEN),
        );
        let app = FakeWindow::new(
            2,
            WindowAttrs::new(WindowType::Application)
                .with_flags(WindowFlags::SHOW_WHEN_LOCKED | WindowFlags::DISMISS_KEYGUARD),
        );
        let scan = scan_of(&[keyguard, app]);
        assert!(scan.showing_lockscreen);
        assert!(scan.hide_lock_screen);
        assert!(!scan.force_status_bar_from_keyguard);
        assert_eq!(scan.dismissing_window, Some(WindowId(2)));
    }

    #[test]
    fn test_scan_skips_gone_windows() {
        let gone = FakeWindow::new(1, WindowAttrs::new(WindowType::Application));
        gone.set_gone(true);
        let scan = scan_of(&[gone]);
        assert!(scan.top_fullscreen.is_none());
    }

    #[test]
    fn test_undrawn_dream_ignored_while_dreaming_lockscreen() {
        let dream = FakeWindow::new(1, WindowAttrs::new(WindowType::Dream));
        dream.set_drawn(false);
        let r = dream.clone().into_ref();
        let mut scan = PostLayoutScan::default();
        scan.apply(&r, &ScanWindow::sample(&r), true);
        assert!(!scan.showing_dream);
        let mut awake = PostLayoutScan::default();
        awake.apply(&r, &ScanWindow::sample(&r), false);
        assert!(awake.showing_dream);
        assert!(awake.top_fullscreen.is_some());
    }

    #[test]
    fn test_status_bar_verdict() {
        let settings = PolicySettings::default();
        let mut scan = PostLayoutScan::default();
        assert_eq!(
            status_bar_verdict(&scan, None, SystemUiFlags::empty(), &settings).0,
            StatusBarVerdict::Keep
        );
        let (verdict, fullscreen) =
            status_bar_verdict(&scan, Some(WindowFlags::FULLSCREEN), SystemUiFlags::empty(), &settings);
        assert_eq!((verdict, fullscreen), (StatusBarVerdict::Hide, true));
        assert_eq!(
            status_bar_verdict(&scan, Some(WindowFlags::empty()), SystemUiFlags::FULLSCREEN, &settings).0,
            StatusBarVerdict::Hide
        );
        assert_eq!(
            status_bar_verdict(&scan, Some(WindowFlags::empty()), SystemUiFlags::empty(), &settings).0,
            StatusBarVerdict::Show
        );
        scan.force_status_bar = true;
        assert_eq!(
            status_bar_verdict(&scan, Some(WindowFlags::FULLSCREEN), SystemUiFlags::empty(), &settings).0,
            StatusBarVerdict::Show
        );
    }

    #[test]
    fn test_notification_shade_toggle_keeps_status_bar() {
        let settings = PolicySettings { toggle_notification_shade: true, ..PolicySettings::default() };
        let scan = PostLayoutScan::default();
        let (verdict, _) = status_bar_verdict(&scan, Some(WindowFlags::FULLSCREEN), SystemUiFlags::empty(), &settings);
        assert_eq!(verdict, StatusBarVerdict::Show);
    }

    #[test]
    fn test_adjust_keeps_reset_bits_until_app_clears_them() {
        let mut chrome = ChromeState::default();
        chrome.touch_hidden_navigation();
        chrome.force_cleared = SystemUiFlags::empty();
        let requested = SystemUiFlags::HIDE_NAVIGATION | SystemUiFlags::LAYOUT_STABLE;
        assert_eq!(chrome.adjust_system_ui_visibility(requested), SystemUiFlags::LAYOUT_STABLE);
        // App dropped the bit; asking again works
        chrome.adjust_system_ui_visibility(SystemUiFlags::LAYOUT_STABLE);
        assert_eq!(chrome.adjust_system_ui_visibility(requested), requested);
    }

    #[test]
    fn test_focus_change_reports_visibility() {
        let h = Harness::new();
        let attrs = WindowAttrs { system_ui_visibility: SystemUiFlags::LOW_PROFILE, ..WindowAttrs::new(WindowType::Application) };
        let win = FakeWindow::new(4, attrs).into_ref();
        h.policy.focus_changed(Some(win.clone()));
        h.advance(0);
        assert_eq!(h.status_bar.system_ui_updates(), vec![SystemUiFlags::LOW_PROFILE]);
        // Same state again is not resent
        h.policy.focus_changed(Some(win));
        h.advance(0);
        assert_eq!(h.status_bar.system_ui_updates().len(), 1);
    }

    #[test]
    fn test_hidden_nav_touch_forces_navigation_for_a_while() {
        let h = Harness::new();
        let attrs = WindowAttrs {
            system_ui_visibility: SystemUiFlags::HIDE_NAVIGATION,
            ..WindowAttrs::new(WindowType::Application)
        };
        h.layout_with_top_window(attrs.clone());
        assert_eq!(h.policy.last_system_ui_flags(), SystemUiFlags::HIDE_NAVIGATION);
        // Next pass sees navigation hidden and installs the consumer
        h.layout_with_top_window(attrs);
        assert!(h.window_manager.hidden_nav_consumer());

        h.policy.on_hidden_nav_touch();
        assert_eq!(h.window_manager.reevaluations(), 1);
        assert!(h.scheduler.is_pending(TimerKey::ClearForcedNavigation));
        h.advance(999);
        assert_eq!(h.window_manager.reevaluations(), 1);
        h.advance(1);
        assert_eq!(h.window_manager.reevaluations(), 2);
        assert!(h.policy.chrome().force_cleared.is_empty());
    }

    #[test]
    fn test_forced_nav_window_keeps_clearable_bits_off_below_it() {
        let h = Harness::new();
        let mut scan = PostLayoutScan::default();
        scan.forcing_show_nav_bar_layer = Some(50_000);
        h.policy.chrome().scan = scan;
        let attrs = WindowAttrs {
            system_ui_visibility: SystemUiFlags::FULLSCREEN | SystemUiFlags::LAYOUT_STABLE,
            ..WindowAttrs::new(WindowType::Application)
        };
        let win = FakeWindow::new(5, attrs).into_ref();
        h.policy.chrome().focused = Some(win);
        h.policy.update_system_ui_visibility();
        assert_eq!(h.policy.last_system_ui_flags(), SystemUiFlags::LAYOUT_STABLE);
    }
}
