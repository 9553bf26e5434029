//! Overlay images and where they sit on the canvas.
//!
//! Placement rectangles use a bottom-left origin: `y` grows upwards from the
//! bottom edge of the canvas. Compositors flip them into raster rows.

use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::geometry::{Rect, Size};

/// Rule positioning an overlay of known size on a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "anchor", rename_all = "kebab-case")]
pub enum Placement {
    TopLeft { top: f64, left: f64 },
    TopRight { top: f64, right: f64 },
    BottomLeft { bottom: f64, left: f64 },
    BottomRight { bottom: f64, right: f64 },
    Absolute(Rect),
}

impl Placement {
    /// Anchor an overlay at a named corner with horizontal/vertical margins.
    ///
    /// Accepts `top-left`, `top-right`, `bottom-left`, and `bottom-right`.
    pub fn from_corner(name: &str, margin_x: f64, margin_y: f64) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "top-left" => Some(Placement::TopLeft {
                top: margin_y,
                left: margin_x,
            }),
            "top-right" => Some(Placement::TopRight {
                top: margin_y,
                right: margin_x,
            }),
            "bottom-left" => Some(Placement::BottomLeft {
                bottom: margin_y,
                left: margin_x,
            }),
            "bottom-right" => Some(Placement::BottomRight {
                bottom: margin_y,
                right: margin_x,
            }),
            _ => None,
        }
    }

    /// Rectangle occupied by an overlay of `overlay` size on a `canvas`.
    pub fn resolve(&self, overlay: Size, canvas: Size) -> Rect {
        let (w, h) = (overlay.width, overlay.height);
        let (cw, ch) = (canvas.width, canvas.height);
        match *self {
            Placement::TopLeft { top, left } => Rect::new(left, ch - top - h, w, h),
            Placement::TopRight { top, right } => Rect::new(cw - w - right, ch - top - h, w, h),
            Placement::BottomLeft { bottom, left } => Rect::new(left, bottom, w, h),
            Placement::BottomRight { bottom, right } => Rect::new(cw - w - right, bottom, w, h),
            Placement::Absolute(rect) => rect,
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::BottomRight {
            bottom: 15.0,
            right: 15.0,
        }
    }
}

/// An overlay image plus its placement rule, before the canvas is known.
#[derive(Clone)]
pub struct OverlayDescription {
    pub image: Arc<RgbaImage>,
    pub placement: Placement,
}

impl OverlayDescription {
    pub fn new(image: RgbaImage, placement: Placement) -> Self {
        Self {
            image: Arc::new(image),
            placement,
        }
    }

    /// Pixel size of the image.
    pub fn size(&self) -> Size {
        Size::new(self.image.width() as f64, self.image.height() as f64)
    }

    /// Fix the overlay onto a canvas of `canvas` size.
    pub fn resolve(&self, canvas: Size) -> OverlayLayer {
        OverlayLayer {
            image: Arc::clone(&self.image),
            frame: self.placement.resolve(self.size(), canvas),
        }
    }
}

impl fmt::Debug for OverlayDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayDescription")
            .field("image", &(self.image.width(), self.image.height()))
            .field("placement", &self.placement)
            .finish()
    }
}

/// An overlay fixed at a rectangle (bottom-left origin) of the canvas.
#[derive(Clone)]
pub struct OverlayLayer {
    pub image: Arc<RgbaImage>,
    pub frame: Rect,
}

impl fmt::Debug for OverlayLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayLayer")
            .field("image", &(self.image.width(), self.image.height()))
            .field("frame", &self.frame)
            .finish()
    }
}
