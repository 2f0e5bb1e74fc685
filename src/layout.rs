//! Geometry/layout engine
//!
//! Computes the screen regions at the start of every layout pass and the
//! four frames of each window from them. The engine is pure: it never
//! touches a window, it only takes snapshots and hands back frames. The
//! caller applies the frames and bar visibility outside its lock.
//!
//! Regions nest as `unrestricted ⊇ restricted ⊇ stable ⊇ dock ⊇ content ⊇ cur`
//! while the decor is visible. Hiding the navigation bar leaves `stable` at
//! the bar edge but lets `dock` and `restricted` grow to the display edge.

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::{DeviceConfig, UiLayout};
use crate::geometry::{Rect, Rotation};
use crate::rotation::OrientationMapping;
use crate::settings::PolicySettings;
use crate::window::{Gravity, SoftInputAdjust, SystemUiFlags, WindowAttrs, WindowFlags, WindowFrames, WindowType};

/// Dock layer before any input method window has been laid out
pub const INITIAL_DOCK_LAYER: i32 = 0x1000_0000;

/// Density that maps one pixel to one dp
const DENSITY_DEFAULT: i32 = 160;

/// Screen regions of the current layout pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Regions {
    pub unrestricted: Rect,
    pub restricted: Rect,
    pub stable: Rect,
    pub stable_fullscreen: Rect,
    pub system: Rect,
    pub content: Rect,
    pub cur: Rect,
    pub dock: Rect,
    pub dock_layer: i32,
}

impl Regions {
    fn full(display: Rect) -> Self {
        Self {
            unrestricted: display,
            restricted: display,
            stable: display,
            stable_fullscreen: display,
            system: display,
            content: display,
            cur: display,
            dock: display,
            dock_layer: INITIAL_DOCK_LAYER,
        }
    }
}

impl Default for Regions {
    fn default() -> Self {
        Self::full(Rect::default())
    }
}

/// Bar sizes and navigation bar capabilities for one display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecorMetrics {
    pub status_bar_height: i32,
    /// Navigation bar height per rotation index
    pub nav_height: [i32; 4],
    /// Navigation bar width per rotation index
    pub nav_width: [i32; 4],
    /// Combined status/navigation bar at the bottom (tablet layout)
    pub has_system_nav_bar: bool,
    pub has_navigation_bar: bool,
    /// Navigation bar moves to the right edge in landscape
    pub can_move: bool,
    pub can_hide: bool,
}

impl Default for DecorMetrics {
    fn default() -> Self {
        Self {
            status_bar_height: 0,
            nav_height: [0; 4],
            nav_width: [0; 4],
            has_system_nav_bar: false,
            has_navigation_bar: false,
            can_move: true,
            can_hide: false,
        }
    }
}

impl DecorMetrics {
    /// Derive metrics from the natural display size
    pub fn compute(
        width: i32,
        height: i32,
        density_dpi: i32,
        mapping: &OrientationMapping,
        device: &DeviceConfig,
        settings: &PolicySettings,
    ) -> Self {
        let (short_size, long_size) = if width > height { (height, width) } else { (width, height) };
        let density = density_dpi.max(1);
        let short_dp = short_size * DENSITY_DEFAULT / density;

        let layout = match settings.ui_layout {
            UiLayout::Auto if short_dp < 600 => UiLayout::Phone,
            UiLayout::Auto => UiLayout::Phablet,
            other => other,
        };
        let (has_system_nav_bar, can_move) = match layout {
            UiLayout::Tablet => (true, false),
            UiLayout::Phablet => (false, false),
            _ => (false, short_dp >= 600 || settings.navigation_bar_can_move),
        };

        let mut nav_height = [0; 4];
        let mut nav_width = [0; 4];
        for rotation in [mapping.portrait, mapping.upside_down] {
            nav_height[rotation.index()] = settings.navigation_bar_height;
        }
        for rotation in [mapping.landscape, mapping.seascape] {
            nav_height[rotation.index()] = settings.navigation_bar_height_landscape;
        }
        for rotation in Rotation::ALL {
            nav_width[rotation.index()] = settings.navigation_bar_width;
        }

        let can_hide = if has_system_nav_bar {
            // Hiding only pays off when the bar spoils a 16:9 picture
            let long_dp = (long_size * DENSITY_DEFAULT / density).max(1);
            let bar_dp = nav_height[mapping.landscape.index()] * DENSITY_DEFAULT / density;
            ((short_dp - bar_dp) * 16) / long_dp < 9
        } else {
            settings.has_navigation_bar
        };

        let metrics = Self {
            status_bar_height: device.status_bar_height,
            nav_height,
            nav_width,
            has_system_nav_bar,
            has_navigation_bar: settings.has_navigation_bar,
            can_move,
            can_hide,
        };
        debug!(?layout, short_dp, ?metrics, "Computed decor metrics");
        metrics
    }

    /// Width left to apps once the navigation bar is taken out
    pub fn non_decor_display_width(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        if self.has_navigation_bar && self.can_move && full_width > full_height {
            return full_width - self.nav_width[rotation.index()];
        }
        full_width
    }

    pub fn non_decor_display_height(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        if self.has_system_nav_bar {
            return full_height - self.nav_height[rotation.index()];
        }
        if self.has_navigation_bar && (!self.can_move || full_width < full_height) {
            return full_height - self.nav_height[rotation.index()];
        }
        full_height
    }

    pub fn config_display_width(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        self.non_decor_display_width(full_width, full_height, rotation)
    }

    /// Configuration height also excludes the status bar on phones
    pub fn config_display_height(&self, full_width: i32, full_height: i32, rotation: Rotation) -> i32 {
        let height = self.non_decor_display_height(full_width, full_height, rotation);
        if self.has_system_nav_bar {
            height
        } else {
            height - self.status_bar_height
        }
    }
}

/// Whether the navigation bar should be shown this pass
pub fn navigation_visible(requested: bool, can_hide: bool, expanded_hides: bool) -> bool {
    (requested || !can_hide) && !expanded_hides
}

/// Snapshot of a bar window taken before the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInput {
    pub surface_layer: i32,
    pub visible: bool,
    pub animating: bool,
}

/// Everything `begin_layout` needs
#[derive(Debug, Clone, Copy)]
pub struct LayoutInputs {
    pub display_width: i32,
    pub display_height: i32,
    pub rotation: Rotation,
    pub is_default_display: bool,
    /// Navigation bar should be visible (see [`navigation_visible`])
    pub nav_visible: bool,
    pub navigation_bar: Option<BarInput>,
    pub status_bar: Option<BarInput>,
}

/// Decor frames and navigation bar visibility to apply after `begin_layout`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecorPlan {
    pub navigation: Option<WindowFrames>,
    /// Show (true) or hide (false) the navigation bar
    pub show_navigation: Option<bool>,
    pub status_bar: Option<WindowFrames>,
}

/// Frames of the window a sub-window is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedFrames {
    pub surface_layer: i32,
    pub frame: Rect,
    pub display_frame: Rect,
    pub content_frame: Rect,
    pub visible_frame: Rect,
}

/// Snapshot of one window to lay out
#[derive(Debug, Clone)]
pub struct LayoutRequest {
    pub attrs: WindowAttrs,
    pub surface_layer: i32,
    pub system_ui_visibility: SystemUiFlags,
    pub is_default_display: bool,
    pub attached: Option<AttachedFrames>,
    /// A navigation bar exists and is visible
    pub has_nav_bar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutResult {
    pub frames: WindowFrames,
    pub gravity: Option<Gravity>,
}

/// Region state for one display
#[derive(Debug, Default)]
pub struct LayoutEngine {
    metrics: DecorMetrics,
    regions: Regions,
    nav_bar_on_bottom: bool,
    navigation_frame: Rect,
    status_bar_layer: Option<i32>,
    navigation_layer: Option<i32>,
    in_pass: bool,
}

impl LayoutEngine {
    pub fn new(metrics: DecorMetrics) -> Self {
        Self { metrics, nav_bar_on_bottom: true, ..Self::default() }
    }

    pub fn metrics(&self) -> &DecorMetrics {
        &self.metrics
    }

    pub fn set_metrics(&mut self, metrics: DecorMetrics) {
        self.metrics = metrics;
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub fn nav_bar_on_bottom(&self) -> bool {
        self.nav_bar_on_bottom
    }

    pub fn navigation_frame(&self) -> Rect {
        self.navigation_frame
    }

    pub fn in_pass(&self) -> bool {
        self.in_pass
    }

    /// Reset every region to the display and place the bars
    pub fn begin_layout(&mut self, input: &LayoutInputs) -> DecorPlan {
        assert!(!self.in_pass, "layout pass started while another is running");
        self.in_pass = true;

        let (w, h) = (input.display_width, input.display_height);
        self.regions = Regions::full(Rect::from_size(w, h));
        self.status_bar_layer = input.status_bar.map(|b| b.surface_layer);
        self.navigation_layer = input.navigation_bar.map(|b| b.surface_layer);

        let mut plan = DecorPlan::default();
        if !input.is_default_display {
            return plan;
        }

        let nav_visible = input.nav_visible;
        let r = &mut self.regions;

        if let Some(nav) = input.navigation_bar {
            let rot = input.rotation.index();
            self.nav_bar_on_bottom = !self.metrics.can_move || w < h;
            if self.nav_bar_on_bottom {
                let top = h - self.metrics.nav_height[rot];
                self.navigation_frame = Rect::new(0, top, w, h);
                r.stable.bottom = top;
                r.stable_fullscreen.bottom = top;
                if nav_visible {
                    r.dock.bottom = top;
                    r.restricted.bottom = top;
                    if !nav.animating {
                        r.system.bottom = top;
                    }
                }
            } else {
                let left = w - self.metrics.nav_width[rot];
                self.navigation_frame = Rect::new(left, 0, w, h);
                r.stable.right = left;
                r.stable_fullscreen.right = left;
                if nav_visible {
                    r.dock.right = left;
                    r.restricted.right = left;
                    if !nav.animating {
                        r.system.right = left;
                    }
                }
            }
            r.content = r.dock;
            r.cur = r.dock;

            let frame = self.navigation_frame;
            plan.navigation = Some(WindowFrames { parent: frame, display: frame, content: frame, visible: frame });
            plan.show_navigation = Some(nav_visible);
            debug!(frame = %frame, on_bottom = self.nav_bar_on_bottom, nav_visible, "Placed navigation bar");
        }

        if let Some(status) = input.status_bar {
            let mut pf = r.unrestricted;
            let mut vf = r.stable;
            if nav_visible && input.navigation_bar.is_some() && !self.nav_bar_on_bottom {
                pf.right = self.navigation_frame.left;
                vf.right = self.navigation_frame.left;
            }
            plan.status_bar = Some(WindowFrames { parent: pf, display: pf, content: vf, visible: vf });

            let status_bottom = r.unrestricted.top + self.metrics.status_bar_height;
            r.stable.top = status_bottom;
            if status.visible {
                r.dock.top = status_bottom;
                r.content = r.dock;
                r.cur = r.dock;
                if !status.animating {
                    r.system.top = status_bottom;
                }
            }
        }

        debug!(dock = %self.regions.dock, restricted = %self.regions.restricted, "Began layout pass");
        plan
    }

    fn apply_stable_constraints(&self, sysui: SystemUiFlags, flags: WindowFlags, r: &mut Rect) {
        if !sysui.contains(SystemUiFlags::LAYOUT_STABLE) {
            return;
        }
        if flags.contains(WindowFlags::FULLSCREEN) {
            r.clamp_to(&self.regions.stable_fullscreen);
        } else {
            r.clamp_to(&self.regions.stable);
        }
    }

    /// Rect for status bar panels, which may cover the status bar but not
    /// the navigation bar
    fn status_panel_rect(&self, has_nav_bar: bool) -> Rect {
        let r = &self.regions;
        if has_nav_bar {
            Rect::new(r.dock.left, r.unrestricted.top, r.restricted.right, r.restricted.bottom)
        } else {
            r.unrestricted
        }
    }

    fn attached_frames(&self, req: &LayoutRequest, attached: &AttachedFrames, inset_decors: bool) -> WindowFrames {
        let r = &self.regions;
        let (display, content, visible) =
            if req.surface_layer > r.dock_layer && attached.surface_layer < r.dock_layer {
                // Panel floats above the IME while its parent sits below it
                (r.dock, r.dock, r.dock)
            } else {
                let content = if req.attrs.soft_input_adjust != SoftInputAdjust::Resize {
                    attached.display_frame
                } else {
                    let mut cf = attached.content_frame;
                    if attached.surface_layer < r.dock_layer {
                        cf.clamp_to(&r.content);
                    }
                    cf
                };
                let display = if inset_decors { attached.display_frame } else { content };
                (display, content, attached.visible_frame)
            };
        let parent = if req.attrs.flags.contains(WindowFlags::LAYOUT_IN_SCREEN) {
            display
        } else {
            attached.frame
        };
        WindowFrames { parent, display, content, visible }
    }

    /// Compute the frames of one window from the current regions
    pub fn layout_window(&mut self, req: &LayoutRequest) -> LayoutResult {
        let attrs = &req.attrs;
        let fl = attrs.flags;
        let sysui = req.system_ui_visibility;
        let adjust = attrs.soft_input_adjust;
        let window_type = attrs.window_type;
        let r = self.regions;
        let mut gravity = None;

        let hide_nav_layout = self.metrics.can_hide
            && sysui.contains(SystemUiFlags::LAYOUT_HIDE_NAVIGATION)
            && window_type.is_app_or_sub_window();
        let visible_or = |cf: Rect| if adjust != SoftInputAdjust::Nothing { r.cur } else { cf };

        let mut frames = if !req.is_default_display {
            match &req.attached {
                Some(attached) => self.attached_frames(req, attached, true),
                None => uniform(r.unrestricted),
            }
        } else if window_type == WindowType::InputMethod {
            gravity = Some(Gravity::Bottom);
            self.regions.dock_layer = req.surface_layer;
            uniform(r.dock)
        } else if window_type == WindowType::Wallpaper {
            uniform(r.unrestricted)
        } else if fl & (WindowFlags::LAYOUT_IN_SCREEN | WindowFlags::FULLSCREEN | WindowFlags::LAYOUT_INSET_DECOR)
            == (WindowFlags::LAYOUT_IN_SCREEN | WindowFlags::LAYOUT_INSET_DECOR)
            && !sysui.contains(SystemUiFlags::FULLSCREEN)
        {
            // Normal activity window covering the screen and insetting itself
            match &req.attached {
                Some(attached) => self.attached_frames(req, attached, true),
                None => {
                    let parent = if window_type.is_status_bar_panel() {
                        self.status_panel_rect(req.has_nav_bar)
                    } else if hide_nav_layout {
                        r.unrestricted
                    } else {
                        r.restricted
                    };
                    let mut content = if adjust != SoftInputAdjust::Resize { r.dock } else { r.content };
                    self.apply_stable_constraints(sysui, fl, &mut content);
                    WindowFrames { parent, display: parent, content, visible: visible_or(content) }
                }
            }
        } else if fl.contains(WindowFlags::LAYOUT_IN_SCREEN)
            || sysui.intersects(SystemUiFlags::LAYOUT_FULLSCREEN | SystemUiFlags::LAYOUT_HIDE_NAVIGATION)
        {
            let area = match window_type {
                t if t.is_status_bar_panel() => self.status_panel_rect(req.has_nav_bar),
                WindowType::NavigationBar
                | WindowType::NavigationBarPanel
                | WindowType::BootProgress
                | WindowType::UniverseBackground => r.unrestricted,
                WindowType::SecureSystemOverlay if fl.contains(WindowFlags::FULLSCREEN) => r.unrestricted,
                _ if hide_nav_layout => r.unrestricted,
                _ => r.restricted,
            };
            let mut content = area;
            self.apply_stable_constraints(sysui, fl, &mut content);
            WindowFrames { parent: area, display: area, content, visible: visible_or(content) }
        } else if let Some(attached) = &req.attached {
            self.attached_frames(req, attached, false)
        } else if window_type == WindowType::StatusBarPanel {
            uniform(r.restricted)
        } else {
            // Inside all screen decorations
            let display = if adjust != SoftInputAdjust::Resize { r.dock } else { r.restricted };
            let visible = if adjust != SoftInputAdjust::Nothing { r.restricted } else { display };
            WindowFrames { parent: r.content, display, content: display, visible }
        };

        if fl.contains(WindowFlags::LAYOUT_NO_LIMITS) {
            let unbounded = Rect::unbounded();
            frames.display = unbounded;
            frames.content = unbounded;
            frames.visible = unbounded;
        } else {
            frames.content.clamp_to(&frames.display);
            frames.visible.clamp_to(&frames.content);
        }

        trace!(
            window_type = ?window_type,
            pf = %frames.parent,
            df = %frames.display,
            cf = %frames.content,
            vf = %frames.visible,
            "Computed window frames"
        );
        LayoutResult { frames, gravity }
    }

    /// Carve the visible input method out of `content` and `cur`.
    ///
    /// Takes the IME's content and visible tops, given insets included.
    pub fn offset_input_method(&mut self, content_top: i32, visible_top: i32) {
        let r = &mut self.regions;
        r.content.bottom = r.content.bottom.min(content_top);
        r.cur.bottom = r.cur.bottom.min(visible_top);
        debug!(dock_bottom = r.dock.bottom, content_bottom = r.content.bottom, cur_bottom = r.cur.bottom, "Input method offset");
    }

    /// Insets a window with these attributes should expect, as a rect of
    /// left/top/right/bottom inset amounts
    pub fn content_inset_hint(&self, attrs: &WindowAttrs) -> Rect {
        let fl = attrs.flags;
        let sysui = attrs.system_ui_visibility;
        let r = &self.regions;
        if !fl.contains(WindowFlags::LAYOUT_IN_SCREEN | WindowFlags::LAYOUT_INSET_DECOR) {
            return Rect::default();
        }
        let avail = if self.metrics.can_hide && sysui.contains(SystemUiFlags::LAYOUT_HIDE_NAVIGATION) {
            r.unrestricted
        } else {
            r.restricted
        };
        let insets = |inner: &Rect| {
            Rect::new(inner.left, inner.top, avail.right - inner.right, avail.bottom - inner.bottom)
        };
        if sysui.contains(SystemUiFlags::LAYOUT_STABLE) {
            if fl.contains(WindowFlags::FULLSCREEN) {
                insets(&r.stable_fullscreen)
            } else {
                insets(&r.stable)
            }
        } else if fl.contains(WindowFlags::FULLSCREEN) {
            Rect::default()
        } else {
            insets(&r.cur)
        }
    }

    /// Area covered by visible system decor, with the decor's surface layer
    pub fn system_decor_rect(&self) -> (Rect, i32) {
        let layer = self.status_bar_layer.or(self.navigation_layer).unwrap_or(0);
        (self.regions.system, layer)
    }

    pub fn finish_layout(&mut self) {
        self.in_pass = false;
    }
}

fn uniform(rect: Rect) -> WindowFrames {
    WindowFrames { parent: rect, display: rect, content: rect, visible: rect }
}
