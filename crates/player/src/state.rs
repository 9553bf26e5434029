//! Playback states and the transition rules between them.

use serde::{Deserialize, Serialize};

/// Buffered-ahead time, in seconds, needed to leave buffering.
pub const DEFAULT_RESUME_THRESHOLD_SECS: f64 = 3.0;

/// State of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Unknown,
    Playing,
    Paused,
    Stopped,
    Buffering,
    Failed,
}

/// Inputs to the state machine: user requests and backend notifications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackEvent {
    /// Playback was requested. `replay` is set once the item has played to
    /// the end at least once.
    PlayRequested { replay: bool },
    Paused,
    /// Source cleared or replaced.
    Stopped,
    /// The current item can start playing.
    ItemReady,
    ItemFailed,
    /// The backend ran out of buffered media.
    BufferEmpty,
    /// The backend predicts playback will keep up from here.
    LikelyToKeepUp,
    /// The buffered range grew. Times are seconds on the item timeline.
    LoadedRange { buffered_end: f64, current: f64 },
    PlayedToEnd,
}

/// Owns the current [`PlaybackState`] and notifies a single callback when it
/// changes. Repeated transitions into the current state are swallowed.
pub struct PlaybackStateMachine {
    state: PlaybackState,
    resume_threshold: f64,
    on_state_change: Option<Box<dyn FnMut(PlaybackState) + Send>>,
}

impl PlaybackStateMachine {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Unknown,
            resume_threshold: DEFAULT_RESUME_THRESHOLD_SECS,
            on_state_change: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn resume_threshold(&self) -> f64 {
        self.resume_threshold
    }

    pub fn set_resume_threshold(&mut self, seconds: f64) {
        self.resume_threshold = seconds.max(0.0);
    }

    pub fn on_state_change<F>(&mut self, callback: F)
    where
        F: FnMut(PlaybackState) + Send + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
    }

    /// Apply `event`. Returns `true` when buffering ended and the backend
    /// should be told to play again.
    pub fn handle(&mut self, event: PlaybackEvent) -> bool {
        match event {
            PlaybackEvent::PlayRequested { replay } => {
                if self.state == PlaybackState::Paused || replay {
                    self.transition(PlaybackState::Playing);
                } else {
                    self.transition(PlaybackState::Buffering);
                }
                false
            }
            PlaybackEvent::Paused | PlaybackEvent::PlayedToEnd => {
                self.transition(PlaybackState::Paused);
                false
            }
            PlaybackEvent::Stopped => {
                self.transition(PlaybackState::Stopped);
                false
            }
            PlaybackEvent::ItemReady => {
                self.transition(PlaybackState::Playing);
                false
            }
            PlaybackEvent::ItemFailed => {
                self.transition(PlaybackState::Failed);
                false
            }
            PlaybackEvent::BufferEmpty => {
                self.transition(PlaybackState::Buffering);
                false
            }
            PlaybackEvent::LikelyToKeepUp => self.resume_if_buffering(),
            PlaybackEvent::LoadedRange {
                buffered_end,
                current,
            } => {
                if buffered_end <= current && current > 0.0 && buffered_end > 0.0 {
                    self.transition(PlaybackState::Buffering);
                    false
                } else if buffered_end - current > self.resume_threshold {
                    self.resume_if_buffering()
                } else {
                    false
                }
            }
        }
    }

    fn resume_if_buffering(&mut self) -> bool {
        if self.state != PlaybackState::Buffering {
            return false;
        }
        self.transition(PlaybackState::Playing);
        true
    }

    fn transition(&mut self, next: PlaybackState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "Playback state changed");
        self.state = next;
        if let Some(callback) = self.on_state_change.as_mut() {
            callback(next);
        }
    }
}

impl Default for PlaybackStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlaybackStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackStateMachine")
            .field("state", &self.state)
            .field("resume_threshold", &self.resume_threshold)
            .finish()
    }
}
