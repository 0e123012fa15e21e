//! Placement of a capture buffer on a display plane

use crate::display::{AtomicCommitRequest, PlaneProperty};
use crate::error::GeometryClampedWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A source rectangle in 16.16 fixed point, as the commit protocol expects.
/// Wide enough that no `u32` pixel size loses its high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRect {
    pub x: u64,
    pub y: u64,
    pub width: u64,
    pub height: u64,
}

impl FixedRect {
    pub fn from_pixels(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: u64::from(width) << 16,
            height: u64::from(height) << 16,
        }
    }
}

/// Source and destination rectangles for one display/buffer size pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub display_width: u32,
    pub display_height: u32,
    pub src: FixedRect,
    pub dest: Rect,
    pub clamped: Option<GeometryClampedWarning>,
}

impl PlaneGeometry {
    /// Centers the buffer on the display without scaling. Origins left of or
    /// above the display edge are clamped to 0 and reported.
    pub fn centered(
        display_width: u32,
        display_height: u32,
        buffer_width: u32,
        buffer_height: u32,
    ) -> Self {
        let dest_x = i64::from(display_width / 2) - i64::from(buffer_width / 2);
        let dest_y = i64::from(display_height / 2) - i64::from(buffer_height / 2);
        let clamped =
            (dest_x < 0 || dest_y < 0).then_some(GeometryClampedWarning { dest_x, dest_y });

        Self {
            display_width,
            display_height,
            src: FixedRect::from_pixels(buffer_width, buffer_height),
            dest: Rect {
                x: dest_x.max(0) as u32,
                y: dest_y.max(0) as u32,
                width: buffer_width,
                height: buffer_height,
            },
            clamped,
        }
    }

    pub fn buffer_size(&self) -> (u32, u32) {
        (self.dest.width, self.dest.height)
    }

    pub fn matches(
        &self,
        display_width: u32,
        display_height: u32,
        buffer_width: u32,
        buffer_height: u32,
    ) -> bool {
        (self.display_width, self.display_height) == (display_width, display_height)
            && self.buffer_size() == (buffer_width, buffer_height)
    }

    pub fn apply(&self, request: &mut AtomicCommitRequest) {
        request
            .add(PlaneProperty::CrtcX, u64::from(self.dest.x))
            .add(PlaneProperty::CrtcY, u64::from(self.dest.y))
            .add(PlaneProperty::CrtcW, u64::from(self.dest.width))
            .add(PlaneProperty::CrtcH, u64::from(self.dest.height))
            .add(PlaneProperty::SrcX, self.src.x)
            .add(PlaneProperty::SrcY, self.src.y)
            .add(PlaneProperty::SrcW, self.src.width)
            .add(PlaneProperty::SrcH, self.src.height);
    }
}
