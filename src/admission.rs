//! Window admission and the singleton registry
//!
//! Decides who may add which window type, which windows are shown across
//! users, and keeps the one-per-type handles for the status bar, the
//! navigation bar and the keyguard.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::window::{
    HeldPermissions, Permission, PrivateFlags, WindowAttrs, WindowFlags, WindowId, WindowRef,
    WindowType,
};

/// Outcome of the add-permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPermission {
    Allowed,
    Denied,
}

/// Outcome of registering a new window with the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddWindowResult {
    Ok,
    MultipleSingleton,
    PermissionDenied,
}

/// Sub-layer of a sub-window relative to its parent
pub const APPLICATION_MEDIA_SUBLAYER: i32 = -2;
pub const APPLICATION_MEDIA_OVERLAY_SUBLAYER: i32 = -1;
pub const APPLICATION_PANEL_SUBLAYER: i32 = 1;
pub const APPLICATION_SUB_PANEL_SUBLAYER: i32 = 2;

/// Whether a caller holding `held` may add a window of this type
pub fn check_add_permission(window_type: WindowType, held: HeldPermissions) -> AddPermission {
    match window_type.rules().add_permission {
        Some(permission) if !held.holds(permission) => AddPermission::Denied,
        _ => AddPermission::Allowed,
    }
}

/// True when the window must only be shown to the user that created it
pub fn check_show_to_owner_only(attrs: &WindowAttrs, held: HeldPermissions) -> bool {
    let wants_all_users = attrs.window_type.rules().all_users
        || attrs.private_flags.contains(PrivateFlags::SHOW_FOR_ALL_USERS);
    if !wants_all_users {
        return true;
    }
    // Third-party code cannot spoof a cross-user system window
    !held.holds(Permission::InternalSystemWindow)
}

/// Sanitize attributes before the window is added
pub fn adjust_window_params(attrs: &mut WindowAttrs) {
    if attrs.window_type.rules().input_transparent {
        attrs.flags |= WindowFlags::NOT_FOCUSABLE | WindowFlags::NOT_TOUCHABLE;
        attrs.flags.remove(WindowFlags::WATCH_OUTSIDE_TOUCH);
    }
}

pub fn window_type_to_layer(window_type: WindowType) -> i32 {
    window_type.rules().layer
}

pub fn sub_window_type_to_layer(window_type: WindowType) -> i32 {
    match window_type {
        WindowType::ApplicationPanel | WindowType::ApplicationAttachedDialog => APPLICATION_PANEL_SUBLAYER,
        WindowType::ApplicationMedia => APPLICATION_MEDIA_SUBLAYER,
        WindowType::ApplicationMediaOverlay => APPLICATION_MEDIA_OVERLAY_SUBLAYER,
        WindowType::ApplicationSubPanel => APPLICATION_SUB_PANEL_SUBLAYER,
        other => {
            warn!(window_type = ?other, "Unknown sub-window type");
            0
        }
    }
}

/// Wallpapers never go above the status bar
pub fn max_wallpaper_layer() -> i32 {
    window_type_to_layer(WindowType::StatusBar)
}

pub fn above_universe_layer() -> i32 {
    window_type_to_layer(WindowType::SystemError)
}

/// Only the keyguard hides the windows behind it
pub fn does_force_hide(attrs: &WindowAttrs) -> bool {
    attrs.window_type == WindowType::Keyguard
}

pub fn can_be_force_hidden(attrs: &WindowAttrs) -> bool {
    attrs.window_type.rules().can_be_force_hidden
}

pub fn can_magnify_window(attrs: &WindowAttrs) -> bool {
    attrs.window_type.rules().can_magnify
}

/// Facts about a window being added, read from the handles before the
/// registry is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRequest {
    pub id: WindowId,
    pub window_type: WindowType,
    /// Id and liveness of the window registered for the same type
    pub existing: Option<(WindowId, bool)>,
}

impl AddRequest {
    /// Read the request from the handles. Must run with no policy lock held.
    pub fn snapshot(win: &WindowRef, existing: Option<&WindowRef>) -> Self {
        Self {
            id: win.id(),
            window_type: win.attrs().window_type,
            existing: existing.map(|w| (w.id(), w.is_alive())),
        }
    }
}

#[derive(Clone)]
struct Registered {
    id: WindowId,
    window: WindowRef,
}

/// The one live instance of each singleton window type
///
/// Ids are stored next to the handles so that nothing here has to call
/// into a window.
#[derive(Default)]
pub struct SingletonRegistry {
    status_bar: Option<Registered>,
    navigation_bar: Option<Registered>,
    keyguard: Option<Registered>,
}

/// Ids of the registered singletons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SingletonIds {
    pub status_bar: Option<WindowId>,
    pub navigation_bar: Option<WindowId>,
    pub keyguard: Option<WindowId>,
}

impl SingletonIds {
    pub fn is_bar(&self, id: WindowId) -> bool {
        self.status_bar == Some(id) || self.navigation_bar == Some(id)
    }
}

impl SingletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, window_type: WindowType) -> Option<&mut Option<Registered>> {
        match window_type {
            WindowType::StatusBar => Some(&mut self.status_bar),
            WindowType::NavigationBar => Some(&mut self.navigation_bar),
            WindowType::Keyguard => Some(&mut self.keyguard),
            _ => None,
        }
    }

    /// Handle currently registered for `window_type`
    pub fn registered(&self, window_type: WindowType) -> Option<WindowRef> {
        let slot = match window_type {
            WindowType::StatusBar => &self.status_bar,
            WindowType::NavigationBar => &self.navigation_bar,
            WindowType::Keyguard => &self.keyguard,
            _ => return None,
        };
        slot.as_ref().map(|r| Arc::clone(&r.window))
    }

    /// Register `win`, enforcing the status-bar permission and one live
    /// instance per singleton type.
    ///
    /// A registered window whose liveness `request` does not carry is
    /// treated as alive.
    pub fn prepare_add_window(&mut self, win: &WindowRef, request: AddRequest, held: HeldPermissions) -> AddWindowResult {
        let AddRequest { id, window_type, existing } = request;
        let rules = window_type.rules();

        if let Some(permission) = rules.prepare_permission {
            if !held.holds(permission) {
                warn!(window = %id, window_type = ?window_type, "Missing status bar permission");
                return AddWindowResult::PermissionDenied;
            }
        }

        if !rules.singleton {
            return AddWindowResult::Ok;
        }

        let Some(slot) = self.slot(window_type) else {
            return AddWindowResult::Ok;
        };
        if let Some(current) = slot {
            let alive = match existing {
                Some((existing_id, alive)) if existing_id == current.id => alive,
                _ => true,
            };
            if alive && current.id != id {
                warn!(
                    window = %id,
                    existing = %current.id,
                    window_type = ?window_type,
                    "Rejecting second singleton window"
                );
                return AddWindowResult::MultipleSingleton;
            }
        }
        info!(window = %id, window_type = ?window_type, "Registered singleton window");
        *slot = Some(Registered { id, window: Arc::clone(win) });
        AddWindowResult::Ok
    }

    /// Clear whichever singleton slot holds `id`
    pub fn remove_window(&mut self, id: WindowId) {
        for slot in [&mut self.status_bar, &mut self.navigation_bar, &mut self.keyguard] {
            if matches!(slot, Some(r) if r.id == id) {
                *slot = None;
                return;
            }
        }
    }

    pub fn status_bar(&self) -> Option<WindowRef> {
        self.status_bar.as_ref().map(|r| Arc::clone(&r.window))
    }

    pub fn navigation_bar(&self) -> Option<WindowRef> {
        self.navigation_bar.as_ref().map(|r| Arc::clone(&r.window))
    }

    pub fn keyguard(&self) -> Option<WindowRef> {
        self.keyguard.as_ref().map(|r| Arc::clone(&r.window))
    }

    pub fn ids(&self) -> SingletonIds {
        SingletonIds {
            status_bar: self.status_bar.as_ref().map(|r| r.id),
            navigation_bar: self.navigation_bar.as_ref().map(|r| r.id),
            keyguard: self.keyguard.as_ref().map(|r| r.id),
        }
    }

    /// Is `id` one of the registered singletons
    pub fn is_singleton(&self, id: WindowId) -> bool {
        let ids = self.ids();
        [ids.status_bar, ids.navigation_bar, ids.keyguard].contains(&Some(id))
    }
}
