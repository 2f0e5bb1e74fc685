//! Geometry primitives shared by the layout engine and rotation resolver
//!
//! Rectangles are edge based (left, top, right, bottom) in physical pixels,
//! matching how the window server hands frames around.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Edge-based rectangle in display pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Rectangle anchored at the origin
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Frame handed out for windows that asked for no layout limits
    pub const fn unbounded() -> Self {
        Self::new(-10000, -10000, 10000, 10000)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Check if a point is inside this rectangle
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// True when `other` lies entirely inside this rectangle
    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Shrink this rectangle so it does not extend past `bounds`
    pub fn clamp_to(&mut self, bounds: &Rect) {
        if self.left < bounds.left {
            self.left = bounds.left;
        }
        if self.top < bounds.top {
            self.top = bounds.top;
        }
        if self.right > bounds.right {
            self.right = bounds.right;
        }
        if self.bottom > bounds.bottom {
            self.bottom = bounds.bottom;
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// One of the four physical display rotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    Rot0,
    #[serde(rename = "90")]
    Rot90,
    #[serde(rename = "180")]
    Rot180,
    #[serde(rename = "270")]
    Rot270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [Rotation::Rot0, Rotation::Rot90, Rotation::Rot180, Rotation::Rot270];

    /// Surface rotation index (0..=3)
    pub fn index(self) -> usize {
        match self {
            Rotation::Rot0 => 0,
            Rotation::Rot90 => 1,
            Rotation::Rot180 => 2,
            Rotation::Rot270 => 3,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Rotation::Rot0),
            1 => Some(Rotation::Rot90),
            2 => Some(Rotation::Rot180),
            3 => Some(Rotation::Rot270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        self.index() as u32 * 90
    }

    /// Bit of this rotation in the user's "allowed rotation angles" mask
    /// (1 = 0°, 2 = 90°, 4 = 180°, 8 = 270°)
    pub fn angle_bit(self) -> u32 {
        1 << self.index()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Orientation requested by the focused application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenOrientation {
    #[default]
    Unspecified,
    Landscape,
    Portrait,
    User,
    Behind,
    Sensor,
    NoSensor,
    SensorLandscape,
    SensorPortrait,
    ReverseLandscape,
    ReversePortrait,
    FullSensor,
}

impl ScreenOrientation {
    /// Orientations that explicitly follow the accelerometer
    pub fn follows_sensor(self) -> bool {
        matches!(
            self,
            ScreenOrientation::Sensor
                | ScreenOrientation::FullSensor
                | ScreenOrientation::SensorLandscape
                | ScreenOrientation::SensorPortrait
        )
    }
}
