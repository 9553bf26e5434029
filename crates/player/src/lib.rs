//! Framestamp Player
//!
//! Looping playback on top of an abstract decoder/display surface.
//!
//! - [`PlaybackStateMachine`] owns every state transition and the buffering
//!   policy.
//! - [`Player`] drives a [`PlaybackBackend`], rewinds and pauses at the end
//!   of each pass, and reports to a weakly held [`PlayerObserver`].
//! - [`AudioFocusController`] is acquired before playback and released at
//!   the end of each pass.

pub mod backend;
pub mod player;
pub mod state;

pub use backend::{AudioFocusController, NoopAudioFocus, PlaybackBackend, PlayerObserver};
pub use player::{Player, LOOP_REWIND_SECS};
pub use state::{PlaybackEvent, PlaybackState, PlaybackStateMachine, DEFAULT_RESUME_THRESHOLD_SECS};
