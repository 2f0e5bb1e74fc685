//! Window kinds, attributes and the handle the policy sees for each window
//!
//! The window server owns every window; the policy only ever sees a
//! [`PolicyWindow`] handle. Everything that used to be a per-type switch
//! (z-order, add permission, singleton, cross-user visibility, force hiding)
//! is answered by a single rule table on [`WindowType`].

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

/// Opaque identity of a window owned by the window server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "win#{}", self.0)
    }
}

/// Identity of the activity a window belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppToken(pub u64);

/// Shared handle to a window
pub type WindowRef = Arc<dyn PolicyWindow>;

bitflags! {
    /// Layout flags carried in window attributes
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WindowFlags: u32 {
        const ALLOW_LOCK_WHILE_SCREEN_ON = 0x0000_0001;
        const NOT_FOCUSABLE = 0x0000_0008;
        const NOT_TOUCHABLE = 0x0000_0010;
        const LAYOUT_IN_SCREEN = 0x0000_0100;
        const LAYOUT_NO_LIMITS = 0x0000_0200;
        const FULLSCREEN = 0x0000_0400;
        const FORCE_NOT_FULLSCREEN = 0x0000_0800;
        const LAYOUT_INSET_DECOR = 0x0001_0000;
        const WATCH_OUTSIDE_TOUCH = 0x0004_0000;
        const SHOW_WHEN_LOCKED = 0x0008_0000;
        const DISMISS_KEYGUARD = 0x0040_0000;
        /// Top fullscreen window wants raw power key events
        const PREVENT_POWER_KEY = 0x2000_0000;
    }
}

bitflags! {
    /// Flags only system windows may set
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PrivateFlags: u32 {
        const SHOW_FOR_ALL_USERS = 0x0000_0010;
        const FORCE_SHOW_NAV_BAR = 0x0000_0020;
    }
}

bitflags! {
    /// System UI visibility bits negotiated between apps and the chrome
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SystemUiFlags: u32 {
        const LOW_PROFILE = 0x0000_0001;
        const HIDE_NAVIGATION = 0x0000_0002;
        const FULLSCREEN = 0x0000_0004;
        const LAYOUT_STABLE = 0x0000_0100;
        const LAYOUT_HIDE_NAVIGATION = 0x0000_0200;
        const LAYOUT_FULLSCREEN = 0x0000_0400;

        /// Bits a user touch clears
        const CLEARABLE = Self::LOW_PROFILE.bits() | Self::HIDE_NAVIGATION.bits() | Self::FULLSCREEN.bits();
        /// Bits whose change moves the decor and needs another layout pass
        const CHANGING_LAYOUT = Self::HIDE_NAVIGATION.bits() | Self::FULLSCREEN.bits();
    }
}

/// Soft input adjustment requested by a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftInputAdjust {
    #[default]
    Unspecified,
    Resize,
    Pan,
    Nothing,
}

/// Gravity the policy may force on a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gravity {
    #[default]
    Default,
    Bottom,
}

/// Requested window dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    #[default]
    MatchParent,
    WrapContent,
    Pixels(i32),
}

/// Broad family a window type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowClass {
    Application,
    SubWindow,
    System,
}

/// Permission a caller must hold to add a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    SystemAlertWindow,
    InternalSystemWindow,
    StatusBarService,
}

bitflags! {
    /// Permissions held by the process adding a window
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HeldPermissions: u32 {
        const SYSTEM_ALERT_WINDOW = 0x1;
        const INTERNAL_SYSTEM_WINDOW = 0x2;
        const STATUS_BAR_SERVICE = 0x4;
    }
}

impl HeldPermissions {
    pub fn holds(&self, permission: Permission) -> bool {
        match permission {
            Permission::SystemAlertWindow => self.contains(HeldPermissions::SYSTEM_ALERT_WINDOW),
            Permission::InternalSystemWindow => self.contains(HeldPermissions::INTERNAL_SYSTEM_WINDOW),
            Permission::StatusBarService => self.contains(HeldPermissions::STATUS_BAR_SERVICE),
        }
    }
}

/// Per-type policy rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTypeRules {
    /// Base z-order layer (higher is closer to the user)
    pub layer: i32,
    pub class: WindowClass,
    /// Permission needed to add the window at all
    pub add_permission: Option<Permission>,
    /// Extra permission enforced when the window is actually added
    pub prepare_permission: Option<Permission>,
    /// Only one live instance may exist
    pub singleton: bool,
    /// Shown to every user by default
    pub all_users: bool,
    pub can_be_force_hidden: bool,
    pub can_magnify: bool,
    /// Overlay types are forced to be non-interactive
    pub input_transparent: bool,
    /// HOME does nothing while such a window has focus
    pub blocks_home: bool,
}

const fn rules(layer: i32, class: WindowClass) -> WindowTypeRules {
    WindowTypeRules {
        layer,
        class,
        add_permission: match class {
            WindowClass::System => Some(Permission::InternalSystemWindow),
            _ => None,
        },
        prepare_permission: None,
        singleton: false,
        all_users: false,
        can_be_force_hidden: true,
        can_magnify: true,
        input_transparent: false,
        blocks_home: false,
    }
}

/// Every window kind the policy knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    BaseApplication,
    Application,
    ApplicationStarting,
    ApplicationPanel,
    ApplicationMedia,
    ApplicationSubPanel,
    ApplicationAttachedDialog,
    ApplicationMediaOverlay,
    UniverseBackground,
    Wallpaper,
    Phone,
    SearchBar,
    RecentsOverlay,
    SystemDialog,
    Toast,
    PriorityPhone,
    Dream,
    SystemAlert,
    InputMethod,
    InputMethodDialog,
    Keyguard,
    KeyguardDialog,
    StatusBarSubPanel,
    StatusBar,
    StatusBarPanel,
    VolumeOverlay,
    SystemOverlay,
    NavigationBar,
    NavigationBarPanel,
    SystemError,
    MagnificationOverlay,
    DisplayOverlay,
    Drag,
    SecureSystemOverlay,
    BootProgress,
    Pointer,
    HiddenNavConsumer,
}

impl WindowType {
    /// Rule table lookup
    pub fn rules(self) -> WindowTypeRules {
        use WindowClass::*;
        use WindowType::*;

        let mut r = match self {
            BaseApplication | WindowType::Application | ApplicationStarting => rules(2, WindowClass::Application),
            ApplicationPanel | ApplicationMedia | ApplicationSubPanel
            | ApplicationAttachedDialog | ApplicationMediaOverlay => rules(2, SubWindow),
            UniverseBackground => rules(1, System),
            Wallpaper => rules(2, System),
            Phone => rules(3, System),
            SearchBar => rules(4, System),
            RecentsOverlay | SystemDialog => rules(5, System),
            Toast => rules(6, System),
            PriorityPhone => rules(7, System),
            Dream => rules(8, System),
            SystemAlert => rules(9, System),
            InputMethod => rules(10, System),
            InputMethodDialog => rules(11, System),
            Keyguard => rules(12, System),
            KeyguardDialog => rules(13, System),
            StatusBarSubPanel => rules(14, System),
            StatusBar => rules(15, System),
            StatusBarPanel => rules(16, System),
            VolumeOverlay => rules(17, System),
            SystemOverlay => rules(18, System),
            NavigationBar => rules(19, System),
            NavigationBarPanel => rules(20, System),
            SystemError => rules(21, System),
            MagnificationOverlay => rules(22, System),
            DisplayOverlay => rules(23, System),
            Drag => rules(24, System),
            SecureSystemOverlay => rules(25, System),
            BootProgress => rules(26, System),
            Pointer => rules(27, System),
            HiddenNavConsumer => rules(28, System),
        };

        match self {
            Toast | Dream | InputMethod | Wallpaper => r.add_permission = None,
            Phone | PriorityPhone | SystemAlert | SystemError | SystemOverlay => {
                r.add_permission = Some(Permission::SystemAlertWindow)
            }
            _ => {}
        }

        if matches!(self, StatusBar | NavigationBar | StatusBarPanel | StatusBarSubPanel | NavigationBarPanel) {
            r.prepare_permission = Some(Permission::StatusBarService);
        }

        r.singleton = matches!(self, StatusBar | NavigationBar | Keyguard);

        r.all_users = matches!(
            self,
            ApplicationStarting
                | BootProgress
                | DisplayOverlay
                | HiddenNavConsumer
                | Keyguard
                | KeyguardDialog
                | MagnificationOverlay
                | NavigationBar
                | NavigationBarPanel
                | Phone
                | Pointer
                | PriorityPhone
                | RecentsOverlay
                | SearchBar
                | StatusBar
                | StatusBarPanel
                | StatusBarSubPanel
                | SystemDialog
                | UniverseBackground
                | VolumeOverlay
        );

        r.can_be_force_hidden = !matches!(
            self,
            StatusBar | NavigationBar | Wallpaper | Dream | UniverseBackground | Keyguard
        );
        r.can_magnify = !matches!(self, InputMethod | InputMethodDialog | NavigationBar | MagnificationOverlay);
        r.input_transparent = matches!(self, SystemOverlay | SecureSystemOverlay | Toast);
        r.blocks_home = matches!(self, SystemAlert | SystemError);
        r
    }

    pub fn is_application(self) -> bool {
        self.rules().class == WindowClass::Application
    }

    pub fn is_system(self) -> bool {
        self.rules().class == WindowClass::System
    }

    /// Application and sub-window range, the only windows allowed to lay
    /// out behind a hidden navigation bar
    pub fn is_app_or_sub_window(self) -> bool {
        self.rules().class != WindowClass::System
    }

    pub fn is_status_bar_panel(self) -> bool {
        matches!(self, WindowType::StatusBarPanel | WindowType::StatusBarSubPanel)
    }
}

/// Attributes the window server supplies with each window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAttrs {
    #[serde(rename = "type")]
    pub window_type: WindowType,
    #[serde(default)]
    pub flags: WindowFlags,
    #[serde(default)]
    pub private_flags: PrivateFlags,
    #[serde(default)]
    pub soft_input_adjust: SoftInputAdjust,
    #[serde(default)]
    pub gravity: Gravity,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: Dimension,
    #[serde(default)]
    pub height: Dimension,
    /// Requested system UI visibility, window plus subtree
    #[serde(default)]
    pub system_ui_visibility: SystemUiFlags,
    #[serde(default)]
    pub title: String,
}

impl WindowAttrs {
    pub fn new(window_type: WindowType) -> Self {
        Self {
            window_type,
            flags: WindowFlags::empty(),
            private_flags: PrivateFlags::empty(),
            soft_input_adjust: SoftInputAdjust::Unspecified,
            gravity: Gravity::Default,
            x: 0,
            y: 0,
            width: Dimension::MatchParent,
            height: Dimension::MatchParent,
            system_ui_visibility: SystemUiFlags::empty(),
            title: String::new(),
        }
    }

    pub fn with_flags(mut self, flags: WindowFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Positioned at the origin and matching the parent in both dimensions
    pub fn is_match_parent_at_origin(&self) -> bool {
        self.x == 0
            && self.y == 0
            && self.width == Dimension::MatchParent
            && self.height == Dimension::MatchParent
    }
}

/// The four frames computed for every laid-out window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowFrames {
    pub parent: Rect,
    pub display: Rect,
    pub content: Rect,
    pub visible: Rect,
}

/// What the policy may ask of a window owned by the window server.
///
/// Queries must be cheap. The policy holds none of its locks while it
/// calls them.
pub trait PolicyWindow: Send + Sync {
    fn id(&self) -> WindowId;
    fn attrs(&self) -> WindowAttrs;
    fn app_token(&self) -> Option<AppToken> {
        None
    }
    fn surface_layer(&self) -> i32;
    /// Current system UI visibility requested by the window's views
    fn system_ui_visibility(&self) -> SystemUiFlags {
        self.attrs().system_ui_visibility
    }
    fn is_default_display(&self) -> bool {
        true
    }
    /// Window still exists in the window server
    fn is_alive(&self) -> bool;
    fn is_visible(&self) -> bool;
    fn is_visible_or_behind_keyguard(&self) -> bool;
    fn is_gone_for_layout(&self) -> bool;
    fn is_animating(&self) -> bool;
    fn has_drawn(&self) -> bool;
    fn needs_menu(&self) -> bool {
        false
    }

    fn frame(&self) -> Rect;
    fn display_frame(&self) -> Rect;
    fn content_frame(&self) -> Rect;
    fn visible_frame(&self) -> Rect;
    fn given_content_insets(&self) -> Rect {
        Rect::default()
    }
    fn given_visible_insets(&self) -> Rect {
        Rect::default()
    }
    fn given_insets_pending(&self) -> bool {
        false
    }

    /// Hand the computed frames back to the window server
    fn compute_frame(&self, frames: &WindowFrames);
    /// Gravity forced by layout (input method windows sit at the bottom)
    fn set_gravity(&self, _gravity: Gravity) {}
    /// Returns true if the visibility actually changed
    fn show(&self, animate: bool) -> bool;
    fn hide(&self, animate: bool) -> bool;
}

impl fmt::Debug for dyn PolicyWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.id(), self.attrs().window_type)
    }
}
