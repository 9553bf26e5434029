//! Framestamp Export Engine
//!
//! Re-encodes a media asset into a new container while compositing every
//! video frame, and builds the watermark pipeline on top of it.
//!
//! # Pipeline Architecture
//!
//! ```text
//! source.mp4 ──► SourceReader ──┬── video lane ──► FrameCompositor ──► render hook ──┐
//!                               │                        ▲                          │
//!                               │         overlay.png ───┘                          ├──► SinkWriter ──► output.mp4
//!                               └── audio lane ─────────────────────────────────────┘
//! ```
//!
//! The two lanes are pumped independently on a per-export thread; whichever
//! drains last finalizes the writer. [`MediaEngine`] abstracts the demuxing
//! and encoding backend: [`FfmpegEngine`] drives `ffmpeg`/`ffprobe`
//! subprocesses and [`MemoryEngine`] serves synthetic media for tests.

pub mod compositor;
pub mod engine;
pub mod ffmpeg;
pub mod memory;
pub mod session;
pub mod watermark;

pub use compositor::{build_default_composition, FrameCompositor};
pub use engine::*;
pub use ffmpeg::FfmpegEngine;
pub use memory::{MemoryEngine, ReadyGate, SyntheticSource};
pub use session::*;
pub use watermark::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
