//! Engine seams: asset loading, sample readers, and encoding writers.
//!
//! An export never talks to a codec directly. It asks a [`MediaEngine`] for
//! a [`SourceReader`] over an asset and a [`SinkWriter`] bound to the
//! destination, then shuttles [`SampleBuffer`]s between them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use framestamp_common::error::{FramestampError, FramestampResult};
use framestamp_media_model::{
    ContainerFormat, MediaAsset, MediaKind, MediaTime, Size, TimeRange, TrackId, TrackSettings,
};

/// Bytes per BGRA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A decoded video frame in packed BGRA, top row first.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Opaque black frame.
    pub fn new(width: u32, height: u32) -> Self {
        let mut buffer = Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        };
        buffer.fill([0, 0, 0, 255]);
        buffer
    }

    /// Wrap existing BGRA bytes. The length must match the dimensions.
    pub fn from_bgra(width: u32, height: u32, data: Vec<u8>) -> FramestampResult<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(FramestampError::engine(format!(
                "pixel data is {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width as f64, self.height as f64)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    /// BGRA value at `(x, y)`. Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let o = self.offset(x, y);
        [
            self.data[o],
            self.data[o + 1],
            self.data[o + 2],
            self.data[o + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, bgra: [u8; 4]) {
        let o = self.offset(x, y);
        self.data[o..o + BYTES_PER_PIXEL].copy_from_slice(&bgra);
    }

    pub fn fill(&mut self, bgra: [u8; 4]) {
        for px in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&bgra);
        }
    }

    pub fn same_geometry(&self, other: &PixelBuffer) -> bool {
        self.width == other.width && self.height == other.height && self.data.len() == other.data.len()
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> MediaTime {
        MediaTime::new(self.frames() as i64, self.sample_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplePayload {
    Video(PixelBuffer),
    Audio(AudioBuffer),
}

/// One timed unit of media pulled from a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    /// Position on the asset timeline.
    pub presentation_time: MediaTime,
    pub duration: MediaTime,
    pub payload: SamplePayload,
}

impl SampleBuffer {
    pub fn kind(&self) -> MediaKind {
        match self.payload {
            SamplePayload::Video(_) => MediaKind::Video,
            SamplePayload::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn video_frame(&self) -> Option<&PixelBuffer> {
        match &self.payload {
            SamplePayload::Video(frame) => Some(frame),
            SamplePayload::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioBuffer> {
        match &self.payload {
            SamplePayload::Audio(audio) => Some(audio),
            SamplePayload::Video(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderStatus {
    Unknown,
    Reading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterStatus {
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// Callback a writer fires once an input can accept more data.
///
/// Notifiers may be fired from any thread, at most once per registration.
#[derive(Clone)]
pub struct ReadyNotifier(Arc<dyn Fn() + Send + Sync>);

impl ReadyNotifier {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn notify(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ReadyNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadyNotifier")
    }
}

/// Container-level writer options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterOptions {
    /// Move the index to the front of the file for progressive download.
    pub optimize_for_network_use: bool,

    /// Container metadata entries.
    pub metadata: BTreeMap<String, String>,
}

/// A demux/encode backend.
pub trait MediaEngine: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Whether the backend can run on this system.
    fn is_available(&self) -> bool;

    /// Open the container at `path` and describe its tracks.
    fn load_asset(&self, path: &Path) -> FramestampResult<MediaAsset>;

    /// Create a reader over `asset`, restricted to `range` on its timeline.
    fn create_reader(
        &self,
        asset: &MediaAsset,
        range: TimeRange,
    ) -> FramestampResult<Box<dyn SourceReader>>;

    /// Create a writer producing `destination` in `format`.
    fn create_writer(
        &self,
        destination: &Path,
        format: ContainerFormat,
        options: &WriterOptions,
    ) -> FramestampResult<Box<dyn SinkWriter>>;
}

/// Pull side of an export: hands out decoded samples per track kind.
pub trait SourceReader: Send {
    /// Decode `track` into frames spaced `frame_duration` apart.
    fn add_video_output(&mut self, track: TrackId, frame_duration: MediaTime)
        -> FramestampResult<()>;

    /// Decode `track` into PCM chunks.
    fn add_audio_output(&mut self, track: TrackId) -> FramestampResult<()>;

    fn start_reading(&mut self) -> FramestampResult<()>;

    /// Next sample of `kind`, or `None` once that output is exhausted.
    fn copy_next_sample(&mut self, kind: MediaKind) -> FramestampResult<Option<SampleBuffer>>;

    fn cancel_reading(&mut self);

    fn status(&self) -> ReaderStatus;
}

/// Push side of an export: encodes samples and muxes the container.
pub trait SinkWriter: Send {
    /// Declare an input. Must be called before [`SinkWriter::start_writing`].
    fn add_input(&mut self, settings: &TrackSettings) -> FramestampResult<()>;

    fn start_writing(&mut self) -> FramestampResult<()>;

    /// Timeline position of the first sample to be written.
    fn start_session(&mut self, at: MediaTime);

    fn is_ready_for_more_media_data(&self, kind: MediaKind) -> bool;

    /// Fire `notifier` once the `kind` input is ready again. Fires
    /// immediately when the input is already ready.
    fn request_media_data_when_ready(&mut self, kind: MediaKind, notifier: ReadyNotifier);

    fn append(&mut self, kind: MediaKind, sample: &SampleBuffer) -> FramestampResult<()>;

    /// Append a rendered frame to the video input.
    fn append_pixel_buffer(
        &mut self,
        buffer: &PixelBuffer,
        presentation_time: MediaTime,
    ) -> FramestampResult<()>;

    /// No more samples will be appended to the `kind` input.
    fn mark_as_finished(&mut self, kind: MediaKind);

    /// Flush encoders and finalize the container.
    fn finish_writing(&mut self) -> FramestampResult<()>;

    fn cancel_writing(&mut self);

    fn status(&self) -> WriterStatus;
}

/// Fixed-size set of reusable render buffers.
#[derive(Debug)]
pub struct PixelBufferPool {
    width: u32,
    height: u32,
    capacity: usize,
    free: Vec<PixelBuffer>,
    outstanding: usize,
}

impl PixelBufferPool {
    pub fn new(width: u32, height: u32, capacity: usize) -> Self {
        Self {
            width,
            height,
            capacity: capacity.max(1),
            free: Vec::new(),
            outstanding: 0,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Take a buffer, allocating lazily up to capacity.
    pub fn take(&mut self) -> FramestampResult<PixelBuffer> {
        if self.outstanding >= self.capacity {
            return Err(FramestampError::pump_failure(format!(
                "pixel buffer pool exhausted ({} buffers in use)",
                self.capacity
            )));
        }
        self.outstanding += 1;
        Ok(self
            .free
            .pop()
            .unwrap_or_else(|| PixelBuffer::new(self.width, self.height)))
    }

    /// Return a buffer. Buffers of foreign geometry are dropped.
    pub fn recycle(&mut self, buffer: PixelBuffer) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if buffer.width == self.width && buffer.height == self.height {
            self.free.push(buffer);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
