//! In-process engine over synthetic media.
//!
//! Sources are registered under a path and generate deterministic frames
//! and PCM on demand. The writer records what it was given and writes a
//! JSON manifest to the destination on finish. Readiness can be gated and
//! failures injected, which is how the session's error and backpressure
//! paths are exercised without codecs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use framestamp_common::error::{FramestampError, FramestampResult};
use framestamp_media_model::{
    AffineTransform, AssetTrack, ContainerFormat, MediaAsset, MediaKind, MediaTime, Size,
    TimeRange, TrackId, TrackSettings,
};

use crate::engine::{
    AudioBuffer, MediaEngine, PixelBuffer, ReadyNotifier, ReaderStatus, SampleBuffer,
    SamplePayload, SinkWriter, SourceReader, WriterOptions, WriterStatus,
};
use crate::lock;

/// PCM frames per synthetic audio chunk.
pub const AUDIO_CHUNK_FRAMES: i64 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticVideo {
    pub natural_size: Size,
    pub frame_rate: f64,
    pub preferred_transform: AffineTransform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A fake container.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSource {
    pub duration: MediaTime,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
}

impl SyntheticSource {
    pub fn new(duration: MediaTime) -> Self {
        Self {
            duration,
            video: None,
            audio: None,
        }
    }

    pub fn with_video(mut self, width: u32, height: u32, frame_rate: f64) -> Self {
        self.video = Some(SyntheticVideo {
            natural_size: Size::new(width as f64, height as f64),
            frame_rate,
            preferred_transform: AffineTransform::IDENTITY,
        });
        self
    }

    /// Tag the video track with an orientation transform.
    pub fn with_transform(mut self, transform: AffineTransform) -> Self {
        if let Some(video) = self.video.as_mut() {
            video.preferred_transform = transform;
        }
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio = Some(SyntheticAudio {
            sample_rate,
            channels,
        });
        self
    }

    fn to_asset(&self, path: &Path) -> MediaAsset {
        let mut tracks = Vec::new();
        let mut stream = 0;
        if let Some(video) = &self.video {
            tracks.push(
                AssetTrack::video(
                    TrackId(stream + 1),
                    path,
                    stream,
                    self.duration,
                    video.natural_size,
                    video.frame_rate,
                )
                .with_preferred_transform(video.preferred_transform),
            );
            stream += 1;
        }
        if let Some(audio) = &self.audio {
            tracks.push(AssetTrack::audio(
                TrackId(stream + 1),
                path,
                stream,
                self.duration,
                audio.sample_rate,
                audio.channels,
            ));
        }
        MediaAsset::new(Some(path.to_path_buf()), self.duration, tracks)
    }
}

/// Frame `index` of a synthetic video: blue carries the index, green and
/// red the column and row.
pub fn synthetic_frame(width: u32, height: u32, index: u64) -> PixelBuffer {
    let mut frame = PixelBuffer::new(width, height);
    for y in 0..height {
        for x in 0..width {
            frame.set_pixel(x, y, [(index % 256) as u8, (x % 256) as u8, (y % 256) as u8, 255]);
        }
    }
    frame
}

/// Failures to inject into readers and writers created after the plan is set.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_reader_open: bool,
    pub fail_writer_open: bool,
    /// Reader fails after handing out this many samples.
    pub reader_fail_after: Option<usize>,
    /// Writer fails after accepting this many samples.
    pub writer_fail_after: Option<usize>,
    pub fail_finish: bool,
    /// Sleep before every sample pull.
    pub sample_delay: Option<Duration>,
}

/// What writers have received.
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub writers_created: usize,
    pub video_frames: usize,
    pub audio_chunks: usize,
    pub video_times: Vec<MediaTime>,
    pub frame_size: Option<(u32, u32)>,
    pub last_video_frame: Option<PixelBuffer>,
    pub finish_calls: usize,
    pub session_start: Option<MediaTime>,
    pub inputs: Vec<TrackSettings>,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    pending: Vec<ReadyNotifier>,
}

/// Shared readiness switch for memory writers.
///
/// While closed, writers report not ready and park readiness requests;
/// opening fires every parked notifier.
#[derive(Clone, Default)]
pub struct ReadyGate {
    state: Arc<Mutex<GateState>>,
}

impl ReadyGate {
    pub fn close(&self) {
        lock(&self.state).closed = true;
    }

    pub fn open(&self) {
        let pending = {
            let mut state = lock(&self.state);
            state.closed = false;
            std::mem::take(&mut state.pending)
        };
        for notifier in pending {
            notifier.notify();
        }
    }

    pub fn is_open(&self) -> bool {
        !lock(&self.state).closed
    }

    /// Number of notifiers parked on the gate.
    pub fn waiting(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn notify_when_open(&self, notifier: ReadyNotifier) {
        let mut state = lock(&self.state);
        if state.closed {
            state.pending.push(notifier);
        } else {
            drop(state);
            notifier.notify();
        }
    }
}

#[derive(Default)]
struct Inner {
    sources: Mutex<HashMap<PathBuf, SyntheticSource>>,
    faults: Mutex<FaultPlan>,
    stats: Mutex<WriterStats>,
    gate: ReadyGate,
}

/// Engine over registered [`SyntheticSource`]s.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `source` loadable at `path` and return its asset.
    pub fn register(&self, path: impl Into<PathBuf>, source: SyntheticSource) -> MediaAsset {
        let path = path.into();
        let asset = source.to_asset(&path);
        lock(&self.inner.sources).insert(path, source);
        asset
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *lock(&self.inner.faults) = plan;
    }

    pub fn stats(&self) -> WriterStats {
        lock(&self.inner.stats).clone()
    }

    pub fn ready_gate(&self) -> ReadyGate {
        self.inner.gate.clone()
    }

    fn faults(&self) -> FaultPlan {
        lock(&self.inner.faults).clone()
    }
}

impl MediaEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn load_asset(&self, path: &Path) -> FramestampResult<MediaAsset> {
        lock(&self.inner.sources)
            .get(path)
            .map(|source| source.to_asset(path))
            .ok_or_else(|| FramestampError::FileNotFound {
                path: path.to_path_buf(),
            })
    }

    fn create_reader(
        &self,
        asset: &MediaAsset,
        range: TimeRange,
    ) -> FramestampResult<Box<dyn SourceReader>> {
        let faults = self.faults();
        if faults.fail_reader_open {
            return Err(FramestampError::open_failure("injected reader open failure"));
        }
        let sources = lock(&self.inner.sources);
        let mut needed = HashMap::new();
        for segment in asset.tracks.iter().flat_map(|t| t.segments.iter()) {
            let source = sources.get(&segment.source).ok_or_else(|| {
                FramestampError::open_failure(format!(
                    "no synthetic source registered at {}",
                    segment.source.display()
                ))
            })?;
            needed.insert(segment.source.clone(), source.clone());
        }

        Ok(Box::new(MemoryReader {
            asset: asset.clone(),
            sources: needed,
            range: range.bounded_by(asset.duration),
            video: None,
            audio: None,
            status: ReaderStatus::Unknown,
            emitted: 0,
            faults,
        }))
    }

    fn create_writer(
        &self,
        destination: &Path,
        format: ContainerFormat,
        options: &WriterOptions,
    ) -> FramestampResult<Box<dyn SinkWriter>> {
        let faults = self.faults();
        if faults.fail_writer_open {
            return Err(FramestampError::open_failure("injected writer open failure"));
        }
        {
            let mut stats = lock(&self.inner.stats);
            *stats = WriterStats {
                writers_created: stats.writers_created + 1,
                ..WriterStats::default()
            };
        }
        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            destination: destination.to_path_buf(),
            format,
            options: options.clone(),
            inputs: Vec::new(),
            finished: HashSet::new(),
            status: WriterStatus::Unknown,
            accepted: 0,
            faults,
        }))
    }
}

struct VideoCursor {
    track: AssetTrack,
    frame_duration: MediaTime,
    next: MediaTime,
    done: bool,
}

struct AudioCursor {
    track: AssetTrack,
    next: MediaTime,
    done: bool,
}

struct MemoryReader {
    asset: MediaAsset,
    sources: HashMap<PathBuf, SyntheticSource>,
    range: TimeRange,
    video: Option<VideoCursor>,
    audio: Option<AudioCursor>,
    status: ReaderStatus,
    emitted: usize,
    faults: FaultPlan,
}

impl MemoryReader {
    fn track(&self, id: TrackId, kind: MediaKind) -> FramestampResult<AssetTrack> {
        let track = self.asset.track(id).ok_or_else(|| {
            FramestampError::open_failure(format!("track {} not in asset", id.0))
        })?;
        if track.kind != kind {
            return Err(FramestampError::open_failure(format!(
                "track {} is {}, not {kind}",
                id.0, track.kind
            )));
        }
        Ok(track.clone())
    }

    fn range_end(&self) -> MediaTime {
        self.range.end().unwrap_or(self.asset.duration)
    }

    fn next_video(&mut self) -> Option<SampleBuffer> {
        let end = self.range_end();
        let cursor = self.video.as_mut()?;
        if cursor.done || cursor.next >= end {
            cursor.done = true;
            return None;
        }
        let t = cursor.next;
        cursor.next = t + cursor.frame_duration;

        let (width, height) = cursor.track.natural_size.to_pixels();
        let frame = cursor
            .track
            .segments
            .iter()
            .find(|s| s.target_range().contains(t))
            .and_then(|segment| {
                let source = self.sources.get(&segment.source)?;
                let video = source.video.as_ref()?;
                let source_time = segment.source_range.start() + (t - segment.target_start);
                let index = (source_time.as_secs_f64() * video.frame_rate).floor().max(0.0) as u64;
                let (w, h) = video.natural_size.to_pixels();
                Some(synthetic_frame(w, h, index))
            })
            .unwrap_or_else(|| PixelBuffer::new(width, height));

        Some(SampleBuffer {
            presentation_time: t,
            duration: cursor.frame_duration,
            payload: SamplePayload::Video(frame),
        })
    }

    fn next_audio(&mut self) -> Option<SampleBuffer> {
        let end = self.range_end();
        let cursor = self.audio.as_mut()?;
        if cursor.done || cursor.next >= end {
            cursor.done = true;
            return None;
        }
        let rate = cursor.track.sample_rate.max(1);
        let channels = cursor.track.channels.max(1);
        let start = cursor.next.rescale(rate);
        let remaining = (end - start).rescale(rate).value;
        let frames = remaining.clamp(0, AUDIO_CHUNK_FRAMES);
        if frames == 0 {
            cursor.done = true;
            return None;
        }
        cursor.next = start + MediaTime::new(frames, rate);

        let samples = (0..frames * channels as i64)
            .map(|i| ((start.value + i / channels as i64) % 100) as i16)
            .collect();
        Some(SampleBuffer {
            presentation_time: start,
            duration: MediaTime::new(frames, rate),
            payload: SamplePayload::Audio(AudioBuffer {
                sample_rate: rate,
                channels,
                samples,
            }),
        })
    }

    fn all_done(&self) -> bool {
        self.video.as_ref().map_or(true, |c| c.done) && self.audio.as_ref().map_or(true, |c| c.done)
    }
}

impl SourceReader for MemoryReader {
    fn add_video_output(
        &mut self,
        track: TrackId,
        frame_duration: MediaTime,
    ) -> FramestampResult<()> {
        let track = self.track(track, MediaKind::Video)?;
        self.video = Some(VideoCursor {
            track,
            frame_duration,
            next: self.range.start(),
            done: false,
        });
        Ok(())
    }

    fn add_audio_output(&mut self, track: TrackId) -> FramestampResult<()> {
        let track = self.track(track, MediaKind::Audio)?;
        self.audio = Some(AudioCursor {
            track,
            next: self.range.start(),
            done: false,
        });
        Ok(())
    }

    fn start_reading(&mut self) -> FramestampResult<()> {
        if self.status != ReaderStatus::Unknown {
            return Err(FramestampError::engine("reader already started"));
        }
        self.status = ReaderStatus::Reading;
        Ok(())
    }

    fn copy_next_sample(&mut self, kind: MediaKind) -> FramestampResult<Option<SampleBuffer>> {
        match self.status {
            ReaderStatus::Reading | ReaderStatus::Completed => {}
            other => {
                return Err(FramestampError::pump_failure(format!(
                    "reader is not reading ({other:?})"
                )))
            }
        }
        if let Some(delay) = self.faults.sample_delay {
            std::thread::sleep(delay);
        }
        if let Some(limit) = self.faults.reader_fail_after {
            if self.emitted >= limit {
                self.status = ReaderStatus::Failed;
                return Err(FramestampError::pump_failure("injected reader failure"));
            }
        }

        let sample = match kind {
            MediaKind::Video => self.next_video(),
            MediaKind::Audio => self.next_audio(),
        };
        if sample.is_some() {
            self.emitted += 1;
        } else if self.all_done() {
            self.status = ReaderStatus::Completed;
        }
        Ok(sample)
    }

    fn cancel_reading(&mut self) {
        if matches!(self.status, ReaderStatus::Unknown | ReaderStatus::Reading) {
            self.status = ReaderStatus::Cancelled;
        }
    }

    fn status(&self) -> ReaderStatus {
        self.status
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    engine: &'a str,
    format: ContainerFormat,
    optimized_for_network: bool,
    metadata: &'a BTreeMap<String, String>,
    inputs: &'a [TrackSettings],
    video_frames: usize,
    audio_chunks: usize,
    frame_size: Option<(u32, u32)>,
}

struct MemoryWriter {
    inner: Arc<Inner>,
    destination: PathBuf,
    format: ContainerFormat,
    options: WriterOptions,
    inputs: Vec<TrackSettings>,
    finished: HashSet<MediaKind>,
    status: WriterStatus,
    accepted: usize,
    faults: FaultPlan,
}

impl MemoryWriter {
    fn accept(&mut self, kind: MediaKind) -> FramestampResult<()> {
        if self.status != WriterStatus::Writing {
            return Err(FramestampError::pump_failure(format!(
                "writer is not writing ({:?})",
                self.status
            )));
        }
        if !self.inputs.iter().any(|s| s.kind() == kind) {
            return Err(FramestampError::pump_failure(format!("no {kind} input")));
        }
        if self.finished.contains(&kind) {
            return Err(FramestampError::pump_failure(format!(
                "{kind} input already finished"
            )));
        }
        if let Some(limit) = self.faults.writer_fail_after {
            if self.accepted >= limit {
                self.status = WriterStatus::Failed;
                return Err(FramestampError::pump_failure("injected writer failure"));
            }
        }
        self.accepted += 1;
        Ok(())
    }
}

impl SinkWriter for MemoryWriter {
    fn add_input(&mut self, settings: &TrackSettings) -> FramestampResult<()> {
        if self.status != WriterStatus::Unknown {
            return Err(FramestampError::engine("inputs must be added before writing starts"));
        }
        if settings.kind() == MediaKind::Video && !self.format.supports_video() {
            return Err(FramestampError::engine(format!(
                "{} cannot carry video",
                self.format.extension()
            )));
        }
        self.inputs.push(settings.clone());
        lock(&self.inner.stats).inputs.push(settings.clone());
        Ok(())
    }

    fn start_writing(&mut self) -> FramestampResult<()> {
        if self.inputs.is_empty() {
            return Err(FramestampError::engine("writer has no inputs"));
        }
        std::fs::write(&self.destination, b"")?;
        self.status = WriterStatus::Writing;
        Ok(())
    }

    fn start_session(&mut self, at: MediaTime) {
        lock(&self.inner.stats).session_start = Some(at);
    }

    fn is_ready_for_more_media_data(&self, _kind: MediaKind) -> bool {
        self.inner.gate.is_open()
    }

    fn request_media_data_when_ready(&mut self, _kind: MediaKind, notifier: ReadyNotifier) {
        self.inner.gate.notify_when_open(notifier);
    }

    fn append(&mut self, kind: MediaKind, sample: &SampleBuffer) -> FramestampResult<()> {
        match (&sample.payload, kind) {
            (SamplePayload::Video(frame), MediaKind::Video) => {
                self.append_pixel_buffer(frame, sample.presentation_time)
            }
            (SamplePayload::Audio(_), MediaKind::Audio) => {
                self.accept(kind)?;
                lock(&self.inner.stats).audio_chunks += 1;
                Ok(())
            }
            _ => Err(FramestampError::pump_failure(format!(
                "{} sample appended to {kind} input",
                sample.kind()
            ))),
        }
    }

    fn append_pixel_buffer(
        &mut self,
        buffer: &PixelBuffer,
        presentation_time: MediaTime,
    ) -> FramestampResult<()> {
        self.accept(MediaKind::Video)?;
        let mut stats = lock(&self.inner.stats);
        stats.video_frames += 1;
        stats.video_times.push(presentation_time);
        stats.frame_size = Some((buffer.width(), buffer.height()));
        stats.last_video_frame = Some(buffer.clone());
        Ok(())
    }

    fn mark_as_finished(&mut self, kind: MediaKind) {
        self.finished.insert(kind);
    }

    fn finish_writing(&mut self) -> FramestampResult<()> {
        lock(&self.inner.stats).finish_calls += 1;
        if self.status != WriterStatus::Writing {
            return Err(FramestampError::engine(format!(
                "cannot finish writer in state {:?}",
                self.status
            )));
        }
        if self.faults.fail_finish {
            self.status = WriterStatus::Failed;
            return Err(FramestampError::engine("injected finalization failure"));
        }

        let stats = lock(&self.inner.stats).clone();
        let manifest = Manifest {
            engine: "memory",
            format: self.format,
            optimized_for_network: self.options.optimize_for_network_use,
            metadata: &self.options.metadata,
            inputs: &self.inputs,
            video_frames: stats.video_frames,
            audio_chunks: stats.audio_chunks,
            frame_size: stats.frame_size,
        };
        std::fs::write(&self.destination, serde_json::to_vec_pretty(&manifest)?)?;
        self.status = WriterStatus::Completed;
        Ok(())
    }

    fn cancel_writing(&mut self) {
        if matches!(self.status, WriterStatus::Unknown | WriterStatus::Writing) {
            self.status = WriterStatus::Cancelled;
        }
    }

    fn status(&self) -> WriterStatus {
        self.status
    }
}
