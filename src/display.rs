//! Display bootstrap and the layout pass as seen from the window server
//!
//! A pass is `begin_layout`, `layout_window` for every window bottom-up,
//! `finish_layout`, then `begin_post_layout_policy`,
//! `apply_post_layout_policy` for every window top-down and
//! `finish_post_layout_policy`. Window handles are sampled before any
//! policy lock is taken; frames go back to the window server after the
//! lock is released.

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, info};

use crate::chrome::{status_bar_verdict, PostLayoutScan, ScanWindow, StatusBarVerdict};
use crate::geometry::{Rect, Rotation};
use crate::handler::PolicyMessage;
use crate::layout::{
    navigation_visible, AttachedFrames, BarInput, DecorMetrics, LayoutEngine, LayoutInputs, LayoutRequest,
};
use crate::policy::PhonePolicy;
use crate::rotation::OrientationMapping;
use crate::window::{SystemUiFlags, WindowAttrs, WindowId, WindowRef, WindowType};

bitflags! {
    /// What the window server must redo after a policy pass
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
    pub struct LayoutChanges: u32 {
        const LAYOUT = 0x1;
        const CONFIG = 0x2;
        const WALLPAPER = 0x4;
    }
}

/// Natural size of the default display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplaySize {
    pub width: i32,
    pub height: i32,
    pub density_dpi: i32,
}

/// Layout engine plus the input method bookkeeping it needs
#[derive(Debug, Default)]
pub struct LayoutState {
    pub engine: LayoutEngine,
    pub display: Option<DisplaySize>,
    /// Input method window whose frames offset its target
    pub last_input_method: Option<WindowRef>,
    pub last_input_method_target: Option<WindowId>,
}

fn bar_input(win: &WindowRef) -> BarInput {
    BarInput { surface_layer: win.surface_layer(), visible: win.is_visible(), animating: win.is_animating() }
}

fn attached_frames(win: &WindowRef) -> AttachedFrames {
    AttachedFrames {
        surface_layer: win.surface_layer(),
        frame: win.frame(),
        display_frame: win.display_frame(),
        content_frame: win.content_frame(),
        visible_frame: win.visible_frame(),
    }
}

impl PhonePolicy {
    /// Derive rotation mapping and decor sizes from the natural display
    pub fn set_initial_display_size(&self, width: i32, height: i32, density_dpi: i32) {
        let device = &self.config.device;
        let mapping = OrientationMapping::from_display(width, height, device.reverse_default_rotation);
        let metrics = DecorMetrics::compute(width, height, density_dpi, &mapping, device, &self.settings());
        {
            let mut rotation = self.rotation();
            rotation.mapping = mapping;
            rotation.hdmi_rotation = device.hdmi_rotation.unwrap_or(mapping.landscape);
        }
        let mut layout = self.layout();
        layout.engine.set_metrics(metrics);
        layout.display = Some(DisplaySize { width, height, density_dpi });
        info!(width, height, density_dpi, ?mapping, "Initial display size");
    }

    /// Recompute decor sizes after a settings change. True if they moved.
    pub(crate) fn refresh_decor_metrics(&self) -> bool {
        let Some(display) = self.layout().display else {
            return false;
        };
        let mapping = self.rotation().mapping;
        let metrics = DecorMetrics::compute(
            display.width,
            display.height,
            display.density_dpi,
            &mapping,
            &self.config.device,
            &self.settings(),
        );
        let mut layout = self.layout();
        if *layout.engine.metrics() == metrics {
            return false;
        }
        layout.engine.set_metrics(metrics);
        true
    }

    pub fn has_navigation_bar(&self) -> bool {
        self.layout().engine.metrics().has_navigation_bar
    }

    pub fn can_hide_navigation_bar(&self) -> bool {
        self.layout().engine.metrics().can_hide
    }

    pub fn non_decor_display_width(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        self.layout().engine.metrics().non_decor_display_width(full_width, full_height, rotation)
    }

    pub fn non_decor_display_height(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        self.layout().engine.metrics().non_decor_display_height(full_width, full_height, rotation)
    }

    pub fn config_display_width(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        self.layout().engine.metrics().config_display_width(full_width, full_height, rotation)
    }

    pub fn config_display_height(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        self.layout().engine.metrics().config_display_height(full_width, full_height, rotation)
    }

    pub fn content_inset_hint(&self, attrs: &WindowAttrs) -> Rect {
        self.layout().engine.content_inset_hint(attrs)
    }

    pub fn system_decor_rect(&self) -> (Rect, i32) {
        self.layout().engine.system_decor_rect()
    }

    /// Input method currently shown and the window it serves
    pub fn set_last_input_method_window(&self, ime: Option<WindowRef>, target: Option<&WindowRef>) {
        let target = target.map(|w| w.id());
        let mut layout = self.layout();
        layout.last_input_method = ime;
        layout.last_input_method_target = target;
    }

    /// Start a pass: reset regions and place the status and navigation bars
    pub fn begin_layout(&self, display_width: i32, display_height: i32, rotation: Rotation, is_default_display: bool) {
        let nav_requested = !self.last_system_ui_flags().contains(SystemUiFlags::HIDE_NAVIGATION);
        self.sync_hidden_nav_consumer(nav_requested);

        let (status_bar, navigation_bar) = {
            let windows = self.windows();
            (windows.status_bar(), windows.navigation_bar())
        };
        let expanded_hides = self.settings().expanded_hides_navigation();
        let inputs = LayoutInputs {
            display_width,
            display_height,
            rotation,
            is_default_display,
            nav_visible: navigation_visible(nav_requested, self.can_hide_navigation_bar(), expanded_hides),
            navigation_bar: navigation_bar.as_ref().map(bar_input),
            status_bar: status_bar.as_ref().map(bar_input),
        };
        let plan = self.layout().engine.begin_layout(&inputs);
        debug!(?rotation, display_width, display_height, ?plan, "Layout pass started");

        if let Some(nav) = &navigation_bar {
            if let Some(frames) = &plan.navigation {
                nav.compute_frame(frames);
            }
            match plan.show_navigation {
                Some(true) => {
                    nav.show(true);
                }
                Some(false) => {
                    nav.hide(true);
                }
                None => {}
            }
        }
        if let (Some(bar), Some(frames)) = (&status_bar, &plan.status_bar) {
            bar.compute_frame(frames);
        }
    }

    /// Compute and hand back the frames of one window
    pub fn layout_window(&self, win: &WindowRef, attached: Option<&WindowRef>) {
        let id = win.id();
        let (is_bar, navigation_bar) = {
            let windows = self.windows();
            (windows.ids().is_bar(id), windows.navigation_bar())
        };
        if is_bar {
            // Placed by begin_layout
            return;
        }

        let attrs = win.attrs();
        let window_type = attrs.window_type;
        let request = LayoutRequest {
            surface_layer: win.surface_layer(),
            system_ui_visibility: win.system_ui_visibility(),
            is_default_display: win.is_default_display(),
            attached: attached.map(attached_frames),
            has_nav_bar: navigation_bar.is_some_and(|n| n.is_visible()),
            attrs,
        };

        let ime = {
            let layout = self.layout();
            match &layout.last_input_method {
                Some(ime) if layout.last_input_method_target == Some(id) => Some(ime.clone()),
                _ => None,
            }
        };
        let ime_offset = ime.map(|ime| {
            (
                ime.content_frame().top + ime.given_content_insets().top,
                ime.visible_frame().top + ime.given_visible_insets().top,
            )
        });

        let result = {
            let mut layout = self.layout();
            if let Some((content_top, visible_top)) = ime_offset {
                layout.engine.offset_input_method(content_top, visible_top);
            }
            layout.engine.layout_window(&request)
        };
        win.compute_frame(&result.frames);
        if let Some(gravity) = result.gravity {
            win.set_gravity(gravity);
        }

        if window_type == WindowType::InputMethod && win.is_visible_or_behind_keyguard() && !win.given_insets_pending() {
            let content_top = win.content_frame().top + win.given_content_insets().top;
            let visible_top = win.visible_frame().top + win.given_visible_insets().top;
            let mut layout = self.layout();
            layout.last_input_method = None;
            layout.engine.offset_input_method(content_top, visible_top);
        }
    }

    pub fn finish_layout(&self) {
        self.layout().engine.finish_layout();
    }

    pub fn begin_post_layout_policy(&self) {
        self.chrome().scan = PostLayoutScan::default();
    }

    /// Fold one window, topmost first, into this pass's scan
    pub fn apply_post_layout_policy(&self, win: &WindowRef) {
        let sample = ScanWindow::sample(win);
        let mut chrome = self.chrome();
        let dreaming_lockscreen = chrome.dreaming_lockscreen;
        chrome.scan.apply(win, &sample, dreaming_lockscreen);
    }

    /// Decide bar and keyguard visibility for the pass that just ended
    pub fn finish_post_layout_policy(&self) -> LayoutChanges {
        let mut changes = LayoutChanges::empty();
        let (scan, last_flags) = {
            let mut chrome = self.chrome();
            if !chrome.scan.showing_dream {
                chrome.dreaming_lockscreen = chrome.scan.showing_lockscreen;
            }
            (chrome.scan.clone(), chrome.last_system_ui_flags)
        };
        let (status_bar, keyguard) = {
            let windows = self.windows();
            (windows.status_bar(), windows.keyguard())
        };

        let mut top_is_fullscreen = false;
        if let Some(bar) = status_bar {
            let top_flags = scan.top_fullscreen.as_ref().map(|w| w.attrs().flags);
            let (verdict, fullscreen) = status_bar_verdict(&scan, top_flags, last_flags, &self.settings());
            top_is_fullscreen = fullscreen;
            debug!(?verdict, top_is_fullscreen, "Status bar policy");
            match verdict {
                StatusBarVerdict::Show => {
                    if bar.show(true) {
                        changes |= LayoutChanges::LAYOUT;
                    }
                }
                StatusBarVerdict::Hide => {
                    if bar.hide(true) {
                        changes |= LayoutChanges::LAYOUT;
                        self.scheduler.post(PolicyMessage::CollapsePanels);
                    }
                }
                StatusBarVerdict::Keep => {}
            }
        }
        self.chrome().top_is_fullscreen = top_is_fullscreen;

        if let Some(keyguard) = keyguard {
            changes |= self.apply_keyguard_policy(&keyguard, &scan);
        }
        if self.update_system_ui_visibility().intersects(SystemUiFlags::CHANGING_LAYOUT) {
            // Bars moved, lay out again
            changes |= LayoutChanges::LAYOUT;
        }
        self.update_lock_screen_timeout();
        changes
    }

    /// Focus moved to `focused`
    pub fn focus_changed(&self, focused: Option<WindowRef>) -> LayoutChanges {
        self.chrome().focused = focused;
        if self.update_system_ui_visibility().intersects(SystemUiFlags::CHANGING_LAYOUT) {
            LayoutChanges::LAYOUT
        } else {
            LayoutChanges::empty()
        }
    }

    pub(crate) fn top_fullscreen_window(&self) -> Option<WindowRef> {
        self.chrome().scan.top_fullscreen.clone()
    }
}
