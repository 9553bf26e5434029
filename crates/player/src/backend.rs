//! Seams between the player and its surroundings.

use framestamp_common::error::FramestampResult;

use crate::state::PlaybackState;

/// Decoder and display surface the player drives.
///
/// Notifications travel the other way: whoever owns the backend forwards
/// them to [`crate::Player::handle_event`].
pub trait PlaybackBackend {
    /// Make `source` the current item.
    fn load(&mut self, source: &str) -> FramestampResult<()>;

    /// Drop the current item.
    fn unload(&mut self);

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, seconds: f64);

    /// Playhead position in seconds.
    fn current_time(&self) -> f64;

    /// Item duration in seconds, 0 while unknown.
    fn duration(&self) -> f64;
}

/// Receives player notifications. Every method defaults to a no-op.
///
/// The player holds observers weakly; dropping the last strong reference
/// silently detaches it.
pub trait PlayerObserver: Send + Sync {
    fn on_ready_to_play(&self, _source: &str) {}

    fn on_progress(&self, _current: f64, _total: f64) {}

    fn on_state_change(&self, _state: PlaybackState) {}

    fn on_reached_end(&self) {}
}

/// Exclusive audio output claimed while a pass plays.
pub trait AudioFocusController: Send {
    fn acquire(&mut self) -> FramestampResult<()>;

    fn release(&mut self);
}

/// Focus controller for environments without shared audio output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudioFocus;

impl AudioFocusController for NoopAudioFocus {
    fn acquire(&mut self) -> FramestampResult<()> {
        Ok(())
    }

    fn release(&mut self) {}
}
