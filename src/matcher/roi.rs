use serde::{Deserialize, Serialize};

/// Rectangle in frame-pixel coordinates. May extend past the frame; it is
/// clipped before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A region known to lie inside the frame with positive area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClippedRoi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Intersect with a `frame_width` x `frame_height` frame. Returns `None`
    /// when the intersection has no area.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<ClippedRoi> {
        if self.width <= 0 || self.height <= 0 {
            return None;
        }

        let left = (self.x as i64).max(0);
        let top = (self.y as i64).max(0);
        let right = (self.x as i64 + self.width as i64).min(frame_width as i64);
        let bottom = (self.y as i64 + self.height as i64).min(frame_height as i64);

        if right <= left || bottom <= top {
            return None;
        }

        Some(ClippedRoi {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}
