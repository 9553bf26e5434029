//! Looping player over a [`PlaybackBackend`].

use std::sync::{Arc, Mutex, Weak};

use framestamp_common::error::{FramestampError, FramestampResult};

use crate::backend::{AudioFocusController, NoopAudioFocus, PlaybackBackend, PlayerObserver};
use crate::state::{PlaybackEvent, PlaybackState, PlaybackStateMachine};

/// Where the playhead is parked after each pass, in seconds.
pub const LOOP_REWIND_SECS: f64 = 0.2;

type ObserverSlot = Arc<Mutex<Option<Weak<dyn PlayerObserver>>>>;

/// Plays one source at a time and parks at the start after every pass.
pub struct Player<B: PlaybackBackend> {
    backend: B,
    machine: PlaybackStateMachine,
    focus: Box<dyn AudioFocusController>,
    observer: ObserverSlot,
    source: Option<String>,
    loaded: bool,
    pending_seek: Option<f64>,
    repeat_count: u32,
    current_time: f64,
    total_time: f64,
}

impl<B: PlaybackBackend> Player<B> {
    pub fn new(backend: B) -> Self {
        Self::with_audio_focus(backend, Box::new(NoopAudioFocus))
    }

    pub fn with_audio_focus(backend: B, focus: Box<dyn AudioFocusController>) -> Self {
        let observer: ObserverSlot = Arc::new(Mutex::new(None));
        let mut machine = PlaybackStateMachine::new();
        let slot = Arc::clone(&observer);
        machine.on_state_change(move |state| {
            if let Some(observer) = upgrade(&slot) {
                observer.on_state_change(state);
            }
        });
        Self {
            backend,
            machine,
            focus,
            observer,
            source: None,
            loaded: false,
            pending_seek: None,
            repeat_count: 0,
            current_time: 0.0,
            total_time: 0.0,
        }
    }

    /// Observe this player without keeping `observer` alive.
    pub fn set_observer(&self, observer: &Arc<dyn PlayerObserver>) {
        *lock_slot(&self.observer) = Some(Arc::downgrade(observer));
    }

    pub fn clear_observer(&self) {
        *lock_slot(&self.observer) = None;
    }

    pub fn state(&self) -> PlaybackState {
        self.machine.state()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Completed passes since the source was last replaced.
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Seconds left in the current pass, as of the last tick.
    pub fn remaining_time(&self) -> f64 {
        (self.total_time - self.current_time).max(0.0)
    }

    pub fn set_resume_threshold(&mut self, seconds: f64) {
        self.machine.set_resume_threshold(seconds);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Remember `source`; it is loaded on the next [`Player::play`].
    pub fn set_source(&mut self, source: impl Into<String>) {
        if self.loaded {
            self.backend.unload();
            self.loaded = false;
        }
        self.source = Some(source.into());
    }

    pub fn play(&mut self) -> FramestampResult<()> {
        let Some(source) = self.source.clone() else {
            return Err(FramestampError::playback("no source set"));
        };
        self.machine.handle(PlaybackEvent::PlayRequested {
            replay: self.repeat_count > 0,
        });
        if !self.loaded {
            if let Err(e) = self.backend.load(&source) {
                tracing::warn!(source = %source, error = %e, "Failed to load playback source");
                self.machine.handle(PlaybackEvent::ItemFailed);
                return Err(e);
            }
            self.loaded = true;
        }
        tracing::debug!(source = %source, "Starting playback");
        self.start_backend();
        Ok(())
    }

    pub fn pause(&mut self) {
        self.backend.pause();
        self.machine.handle(PlaybackEvent::Paused);
    }

    /// Seek to `fraction` of the item, truncated to whole seconds.
    pub fn seek(&mut self, fraction: f64) {
        if !self.loaded {
            return;
        }
        let total = self.backend.duration();
        let seconds = (fraction.clamp(0.0, 1.0) * total).trunc();
        self.backend.seek(seconds);
    }

    /// Swap in a new source, optionally starting at `seek_time` seconds once
    /// it is ready. `None` clears the player.
    pub fn replace_source(
        &mut self,
        source: Option<&str>,
        seek_time: Option<f64>,
    ) -> FramestampResult<()> {
        self.pause();
        self.repeat_count = 0;
        self.current_time = 0.0;
        self.total_time = 0.0;
        self.machine.handle(PlaybackEvent::Stopped);
        if self.loaded {
            self.backend.unload();
            self.loaded = false;
        }

        let Some(source) = source else {
            self.source = None;
            self.pending_seek = None;
            return Ok(());
        };

        self.source = Some(source.to_string());
        self.pending_seek = seek_time;
        self.backend.load(source)?;
        self.loaded = true;
        Ok(())
    }

    /// Stop playback and drop the loaded item. The source is kept.
    pub fn reset(&mut self) {
        self.pause();
        if self.loaded {
            self.backend.unload();
            self.loaded = false;
        }
        self.machine.handle(PlaybackEvent::Stopped);
    }

    /// Periodic progress report. Call about once a second while playing.
    pub fn tick(&mut self) {
        if !self.loaded {
            return;
        }
        let total = self.backend.duration();
        if total <= 0.0 {
            return;
        }
        self.total_time = total;
        self.current_time = self.backend.current_time();
        if let Some(observer) = upgrade(&self.observer) {
            observer.on_progress(self.current_time, self.total_time);
        }
    }

    /// Feed a backend notification into the player.
    pub fn handle_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::ItemReady => {
                if let Some(seconds) = self.pending_seek.take() {
                    self.backend.seek(seconds);
                }
                self.machine.handle(event);
                if let (Some(observer), Some(source)) = (upgrade(&self.observer), &self.source) {
                    observer.on_ready_to_play(source);
                }
            }
            PlaybackEvent::ItemFailed => {
                tracing::warn!(source = ?self.source, "Playback item failed");
                self.reset();
                self.machine.handle(event);
            }
            PlaybackEvent::PlayedToEnd => self.reached_end(),
            _ => {
                if self.machine.handle(event) {
                    self.start_backend();
                }
            }
        }
    }

    fn reached_end(&mut self) {
        self.repeat_count += 1;
        self.focus.release();
        self.backend.seek(LOOP_REWIND_SECS);
        self.pause();
        tracing::debug!(repeat_count = self.repeat_count, "Playback reached the end");
        if let Some(observer) = upgrade(&self.observer) {
            observer.on_reached_end();
        }
    }

    fn start_backend(&mut self) {
        if let Err(e) = self.focus.acquire() {
            tracing::warn!(error = %e, "Audio focus unavailable; playing anyway");
        }
        self.backend.play();
    }
}

impl<B: PlaybackBackend> Drop for Player<B> {
    fn drop(&mut self) {
        if self.loaded {
            self.backend.pause();
            self.backend.unload();
        }
    }
}

fn lock_slot(
    slot: &ObserverSlot,
) -> std::sync::MutexGuard<'_, Option<Weak<dyn PlayerObserver>>> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn upgrade(slot: &ObserverSlot) -> Option<Arc<dyn PlayerObserver>> {
    lock_slot(slot).as_ref().and_then(Weak::upgrade)
}
