//! Framestamp Media Model
//!
//! Defines the data contracts shared by the export pipeline and the player:
//! - **Time:** Rational media time and time ranges
//! - **Geometry:** Sizes, rectangles, and affine transforms
//! - **Assets:** Opened media handles with typed tracks
//! - **Settings:** Encoder parameters per track kind
//! - **Composition:** Re-compositions and per-frame layer instructions
//! - **Overlay:** Overlay images and their placement on the canvas
//!
//! Layer transforms operate in raster space (origin top-left, y down).
//! Overlay rectangles use the compositing convention (origin bottom-left,
//! y up) and are flipped by the compositor when blitting.

pub mod asset;
pub mod composition;
pub mod geometry;
pub mod overlay;
pub mod settings;
pub mod time;

pub use asset::*;
pub use composition::*;
pub use geometry::*;
pub use overlay::*;
pub use settings::*;
pub use time::*;

/// Errors raised while building or validating model values.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid time range: {message}")]
    InvalidTimeRange { message: String },

    #[error("Track {track} not found")]
    TrackNotFound { track: u32 },

    #[error("Track kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch { expected: MediaKind, found: MediaKind },

    #[error("Invalid composition: {message}")]
    InvalidComposition { message: String },
}
