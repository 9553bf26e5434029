//! Export sessions: re-encode an asset through a reader/writer pair.
//!
//! Each export runs on its own named thread, which acts as the serial
//! context for everything that touches the reader and writer. Work arrives
//! on an mpsc queue as [`Job`]s: one pump lane per track kind, plus cancel.
//! A lane pulls samples while the writer input is ready, yields after a
//! bounded batch, and parks on a readiness notifier when the writer pushes
//! back. Whichever lane drains last finalizes the output.
//!
//! ```text
//! export() ──► [thread] prepare ──► Pump(video) ──┐
//!                                   Pump(audio) ──┼──► finish ──► teardown ──► on_complete
//! cancel() ─────────────────────────► Cancel ─────┘
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use framestamp_common::error::{ErrorCategory, FramestampError, FramestampResult};
use framestamp_media_model::{
    AudioSettings, ContainerFormat, MediaAsset, MediaKind, MediaTime, TimeRange, TrackId,
    TrackSettings, VideoComposition, VideoSettings,
};

use crate::compositor::{build_default_composition, corrected_natural_size, FrameCompositor};
use crate::engine::{
    MediaEngine, PixelBuffer, PixelBufferPool, ReadyNotifier, ReaderStatus, SampleBuffer,
    SamplePayload, SinkWriter, SourceReader, WriterOptions, WriterStatus,
};
use crate::lock;

/// Samples a lane processes before yielding the export thread.
pub const MAX_SAMPLES_PER_STEP: usize = 8;

/// Render buffers available to the render hook.
const RENDER_POOL_CAPACITY: usize = 3;

const EXPORT_THREAD_NAME: &str = "framestamp-export";

/// Lifecycle of an [`ExportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportStatus {
    Idle,
    Exporting,
    Completed,
    Failed,
    Cancelled,
}

impl ExportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Cancelled
        )
    }
}

/// Outcome handed to the completion callback.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub status: ExportStatus,
    /// Set for failures only. Cancellation carries no error.
    pub error: Option<Arc<FramestampError>>,
    /// Written file, set only when the export completed.
    pub output_path: Option<PathBuf>,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.status == ExportStatus::Completed
    }
}

/// Called with export progress in `[0, 1]`, once per video sample.
pub type ProgressCallback = Box<dyn Fn(f32) + Send>;

/// Called exactly once per export, on the export thread.
pub type CompletionCallback = Box<dyn FnOnce(ExportReport) + Send>;

/// Per-frame post-processing: receives the composited frame and its time
/// relative to the export range, and fills the render buffer that gets
/// encoded instead. Runs on the export thread; it must not register or
/// clear hooks on the same session.
pub type RenderHook = Box<dyn FnMut(&PixelBuffer, MediaTime, &mut PixelBuffer) + Send>;

/// What to export and how.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub output: Option<PathBuf>,
    pub format: ContainerFormat,
    /// Portion of the asset to export; unbounded means to the end.
    pub time_range: TimeRange,
    /// Explicit video encoding; defaults follow the source.
    pub video_settings: Option<VideoSettings>,
    /// Explicit audio encoding; defaults follow the source.
    pub audio_settings: Option<AudioSettings>,
    /// Replaces the default letterbox composition.
    pub composition: Option<VideoComposition>,
    pub optimize_for_network_use: bool,
    pub metadata: BTreeMap<String, String>,
}

impl ExportRequest {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: ContainerFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = range;
        self
    }

    pub fn with_video_settings(mut self, settings: VideoSettings) -> Self {
        self.video_settings = Some(settings);
        self
    }

    pub fn with_audio_settings(mut self, settings: AudioSettings) -> Self {
        self.audio_settings = Some(settings);
        self
    }

    pub fn with_composition(mut self, composition: VideoComposition) -> Self {
        self.composition = Some(composition);
        self
    }

    pub fn optimized_for_network(mut self, optimize: bool) -> Self {
        self.optimize_for_network_use = optimize;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Pump(MediaKind),
    Cancel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LaneState {
    #[default]
    Absent,
    Pumping,
    Drained,
}

/// Drained flags for both lanes plus the finish-once latch.
#[derive(Debug, Default)]
struct LaneCompletion {
    video: LaneState,
    audio: LaneState,
    finished: bool,
}

impl LaneCompletion {
    fn new(video: bool, audio: bool) -> Self {
        let state = |present: bool| {
            if present {
                LaneState::Pumping
            } else {
                LaneState::Absent
            }
        };
        Self {
            video: state(video),
            audio: state(audio),
            finished: false,
        }
    }

    fn lane_mut(&mut self, kind: MediaKind) -> &mut LaneState {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    fn is_pumping(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video == LaneState::Pumping,
            MediaKind::Audio => self.audio == LaneState::Pumping,
        }
    }

    /// Mark `kind` drained. True for exactly one caller: the one that
    /// observes every present lane drained first.
    fn mark_drained(&mut self, kind: MediaKind) -> bool {
        let lane = self.lane_mut(kind);
        if *lane == LaneState::Pumping {
            *lane = LaneState::Drained;
        }
        if self.finished || self.video == LaneState::Pumping || self.audio == LaneState::Pumping {
            return false;
        }
        self.finished = true;
        true
    }

    /// Take the latch without draining (cancellation).
    fn claim(&mut self) -> bool {
        !std::mem::replace(&mut self.finished, true)
    }
}

struct SessionState {
    status: ExportStatus,
    error: Option<Arc<FramestampError>>,
    output: Option<PathBuf>,
    /// Job queue of the running export. Set and cleared together with
    /// `status`, so a finished worker never touches its successor's queue.
    jobs: Option<Sender<Job>>,
}

struct Shared {
    state: Mutex<SessionState>,
    /// `f32` bits of the last progress value.
    progress: AtomicU32,
    lanes: Mutex<LaneCompletion>,
    render_hook: Mutex<Option<RenderHook>>,
}

impl Shared {
    fn set_progress(&self, value: f32) {
        self.progress.store(value.to_bits(), Ordering::Relaxed);
    }

    fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }
}

/// Exports one asset, one export at a time.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ExportSession {
    engine: Arc<dyn MediaEngine>,
    asset: Arc<MediaAsset>,
    shared: Arc<Shared>,
}

impl ExportSession {
    pub fn new(engine: Arc<dyn MediaEngine>, asset: MediaAsset) -> Self {
        Self {
            engine,
            asset: Arc::new(asset),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    status: ExportStatus::Idle,
                    error: None,
                    output: None,
                    jobs: None,
                }),
                progress: AtomicU32::new(0f32.to_bits()),
                lanes: Mutex::new(LaneCompletion::default()),
                render_hook: Mutex::new(None),
            }),
        }
    }

    /// Load the asset at `path` through `engine`.
    pub fn open(engine: Arc<dyn MediaEngine>, path: &Path) -> FramestampResult<Self> {
        let asset = engine.load_asset(path)?;
        Ok(Self::new(engine, asset))
    }

    pub fn asset(&self) -> &MediaAsset {
        &self.asset
    }

    pub fn status(&self) -> ExportStatus {
        lock(&self.shared.state).status
    }

    /// Error of the last failed export.
    pub fn error(&self) -> Option<Arc<FramestampError>> {
        lock(&self.shared.state).error.clone()
    }

    /// Destination of the current or last export.
    pub fn output_path(&self) -> Option<PathBuf> {
        lock(&self.shared.state).output.clone()
    }

    /// Last progress reported by the video lane; 0 without video.
    pub fn progress(&self) -> f32 {
        self.shared.progress()
    }

    /// Install a render hook. It stays installed across exports.
    pub fn set_render_hook<F>(&self, hook: F)
    where
        F: FnMut(&PixelBuffer, MediaTime, &mut PixelBuffer) + Send + 'static,
    {
        *lock(&self.shared.render_hook) = Some(Box::new(hook));
    }

    pub fn clear_render_hook(&self) {
        *lock(&self.shared.render_hook) = None;
    }

    /// Start exporting on a background thread.
    ///
    /// Fails synchronously, without touching any state, when the session is
    /// not idle. Every other outcome, including invalid requests, is
    /// delivered through `on_complete`. If the export thread cannot be
    /// spawned the session returns to idle and `on_complete` is dropped.
    pub fn export(
        &self,
        request: ExportRequest,
        on_progress: Option<ProgressCallback>,
        on_complete: CompletionCallback,
    ) -> FramestampResult<()> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = lock(&self.shared.state);
            if state.status != ExportStatus::Idle {
                return Err(FramestampError::configuration(format!(
                    "session is {:?}; only an idle session can export",
                    state.status
                )));
            }
            state.status = ExportStatus::Exporting;
            state.error = None;
            state.output = request.output.clone();
            state.jobs = Some(tx.clone());
        }
        self.shared.set_progress(0.0);

        let worker = ExportWorker {
            shared: Arc::clone(&self.shared),
            engine: Arc::clone(&self.engine),
            asset: Arc::clone(&self.asset),
            request,
            jobs: tx,
            on_progress,
            on_complete: Some(on_complete),
            pipeline: None,
            writer_opened: false,
            lane_error: None,
            done: false,
        };

        let spawned = thread::Builder::new()
            .name(EXPORT_THREAD_NAME.to_string())
            .spawn(move || worker.run(rx));
        if let Err(e) = spawned {
            let mut state = lock(&self.shared.state);
            state.jobs = None;
            state.status = ExportStatus::Idle;
            return Err(FramestampError::Io(e));
        }
        Ok(())
    }

    /// [`ExportSession::export`] as a future resolving to the report.
    pub async fn export_async(
        &self,
        request: ExportRequest,
        on_progress: Option<ProgressCallback>,
    ) -> FramestampResult<ExportReport> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.export(
            request,
            on_progress,
            Box::new(move |report| {
                let _ = tx.send(report);
            }),
        )?;
        rx.await
            .map_err(|_| FramestampError::engine("export thread ended without a report"))
    }

    /// Cancel the running export. No-op when not exporting.
    pub fn cancel(&self) {
        let state = lock(&self.shared.state);
        if let Some(jobs) = state.jobs.as_ref() {
            tracing::info!("Cancelling export");
            let _ = jobs.send(Job::Cancel);
        }
    }

    /// Return a finished session to idle so it can export again.
    pub fn reset(&self) -> FramestampResult<()> {
        let mut state = lock(&self.shared.state);
        if state.status == ExportStatus::Exporting {
            return Err(FramestampError::configuration(
                "cannot reset a session while it is exporting",
            ));
        }
        state.status = ExportStatus::Idle;
        state.error = None;
        state.output = None;
        self.shared.set_progress(0.0);
        Ok(())
    }
}

struct VideoLane {
    track: TrackId,
    compositor: FrameCompositor,
    canvas: PixelBuffer,
    pool: PixelBufferPool,
}

/// Resources held for the duration of one export.
struct Pipeline {
    reader: Box<dyn SourceReader>,
    writer: Box<dyn SinkWriter>,
    range: TimeRange,
    duration: MediaTime,
    video: Option<VideoLane>,
}

impl Pipeline {
    fn inactive_reason(&self) -> Option<String> {
        match (self.reader.status(), self.writer.status()) {
            (ReaderStatus::Failed | ReaderStatus::Cancelled, _) => {
                Some(format!("reader stopped ({:?})", self.reader.status()))
            }
            (_, WriterStatus::Failed | WriterStatus::Cancelled) => {
                Some(format!("writer stopped ({:?})", self.writer.status()))
            }
            _ => None,
        }
    }
}

/// Validated plan for the video lane.
struct VideoPlan {
    track: TrackId,
    settings: VideoSettings,
    compositor: FrameCompositor,
}

struct AudioPlan {
    track: TrackId,
    settings: AudioSettings,
}

/// State owned by the export thread.
struct ExportWorker {
    shared: Arc<Shared>,
    engine: Arc<dyn MediaEngine>,
    asset: Arc<MediaAsset>,
    request: ExportRequest,
    jobs: Sender<Job>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompletionCallback>,
    pipeline: Option<Pipeline>,
    writer_opened: bool,
    lane_error: Option<FramestampError>,
    done: bool,
}

impl ExportWorker {
    fn run(mut self, jobs: Receiver<Job>) {
        let lanes = match self.prepare() {
            Ok(lanes) => lanes,
            Err(e) => {
                self.teardown(ExportStatus::Failed, Some(e));
                return;
            }
        };
        for kind in lanes {
            let _ = self.jobs.send(Job::Pump(kind));
        }

        while !self.done {
            let Ok(job) = jobs.recv() else {
                break;
            };
            match job {
                Job::Pump(kind) => self.pump(kind),
                Job::Cancel => self.cancel(),
            }
        }
    }

    /// Validate the request, open the engines, and start them. Returns the
    /// lanes to pump.
    fn prepare(&mut self) -> FramestampResult<Vec<MediaKind>> {
        let destination = self
            .request
            .output
            .clone()
            .ok_or_else(|| FramestampError::configuration("no output destination set"))?;
        if self
            .asset
            .source_files()
            .iter()
            .any(|source| same_path(source, &destination))
        {
            return Err(FramestampError::configuration(format!(
                "output {} is one of the asset's source files",
                destination.display()
            )));
        }

        let video = self.plan_video()?;
        let audio = self.plan_audio()?;
        if video.is_none() && audio.is_none() {
            return Err(FramestampError::configuration(
                "asset has no track the output container can carry",
            ));
        }

        let range = self.request.time_range.bounded_by(self.asset.duration);
        let duration = range.duration().unwrap_or(MediaTime::ZERO);

        tracing::info!(
            engine = self.engine.name(),
            output = %destination.display(),
            format = ?self.request.format,
            start_secs = range.start().as_secs_f64(),
            duration_secs = duration.as_secs_f64(),
            video = video.is_some(),
            audio = audio.is_some(),
            "Starting export"
        );

        let reader = self
            .engine
            .create_reader(&self.asset, range)
            .map_err(as_open_failure)?;

        let existed = destination.exists();
        let options = WriterOptions {
            optimize_for_network_use: self.request.optimize_for_network_use,
            metadata: self.request.metadata.clone(),
        };
        let writer = match self
            .engine
            .create_writer(&destination, self.request.format, &options)
        {
            Ok(writer) => writer,
            Err(e) => {
                if !existed {
                    remove_partial_output(&destination);
                }
                return Err(as_open_failure(e));
            }
        };
        self.writer_opened = true;

        let pipeline = self.pipeline.insert(Pipeline {
            reader,
            writer,
            range,
            duration,
            video: None,
        });

        let mut lanes = Vec::new();
        if let Some(plan) = video {
            let frame_duration = plan.compositor.composition().frame_duration;
            pipeline
                .reader
                .add_video_output(plan.track, frame_duration)
                .map_err(as_open_failure)?;
            pipeline
                .writer
                .add_input(&TrackSettings::Video(plan.settings))
                .map_err(as_open_failure)?;
            let (width, height) = plan.compositor.dimensions();
            pipeline.video = Some(VideoLane {
                track: plan.track,
                canvas: plan.compositor.make_canvas(),
                compositor: plan.compositor,
                pool: PixelBufferPool::new(width, height, RENDER_POOL_CAPACITY),
            });
            lanes.push(MediaKind::Video);
        }
        if let Some(plan) = audio {
            pipeline
                .reader
                .add_audio_output(plan.track)
                .map_err(as_open_failure)?;
            pipeline
                .writer
                .add_input(&TrackSettings::Audio(plan.settings))
                .map_err(as_open_failure)?;
            lanes.push(MediaKind::Audio);
        }

        pipeline.writer.start_writing().map_err(as_open_failure)?;
        pipeline.reader.start_reading().map_err(as_open_failure)?;
        pipeline.writer.start_session(range.start());

        *lock(&self.shared.lanes) = LaneCompletion::new(
            lanes.contains(&MediaKind::Video),
            lanes.contains(&MediaKind::Audio),
        );
        Ok(lanes)
    }

    fn plan_video(&self) -> FramestampResult<Option<VideoPlan>> {
        let track = if self.request.format.supports_video() {
            self.asset.first_track(MediaKind::Video)
        } else {
            None
        };
        let Some(track) = track else {
            if self.request.video_settings.is_some() {
                return Err(FramestampError::configuration(
                    "video settings given but there is no video track to encode",
                ));
            }
            return Ok(None);
        };

        let mut settings = self.request.video_settings.clone().unwrap_or_default();
        let composition = match &self.request.composition {
            Some(composition) => composition.clone(),
            None => {
                let target = settings.output_size().unwrap_or_else(|| {
                    corrected_natural_size(track.natural_size, &track.preferred_transform)
                });
                build_default_composition(
                    track,
                    Some(target),
                    settings.frame_rate,
                    self.asset.duration,
                )?
            }
        };
        settings.fill_size_from(composition.render_size);
        if settings.frame_rate.is_none() {
            settings.frame_rate = Some(composition.frame_rate());
        }

        Ok(Some(VideoPlan {
            track: track.id,
            settings,
            compositor: FrameCompositor::new(composition)?,
        }))
    }

    fn plan_audio(&self) -> FramestampResult<Option<AudioPlan>> {
        let Some(track) = self.asset.first_track(MediaKind::Audio) else {
            if self.request.audio_settings.is_some() {
                return Err(FramestampError::configuration(
                    "audio settings given but the asset has no audio track",
                ));
            }
            return Ok(None);
        };
        let settings = self.request.audio_settings.clone().unwrap_or_else(|| {
            let defaults = AudioSettings::default();
            AudioSettings {
                channels: if track.channels > 0 {
                    track.channels
                } else {
                    defaults.channels
                },
                sample_rate: if track.sample_rate > 0 {
                    track.sample_rate
                } else {
                    defaults.sample_rate
                },
                ..defaults
            }
        });
        Ok(Some(AudioPlan {
            track: track.id,
            settings,
        }))
    }

    fn pump(&mut self, kind: MediaKind) {
        if self.done || !lock(&self.shared.lanes).is_pumping(kind) {
            return;
        }

        let mut budget = MAX_SAMPLES_PER_STEP;
        loop {
            if self.lane_error.is_some() {
                // The other lane already failed; stop pulling.
                self.lane_drained(kind);
                return;
            }
            let Some(pipeline) = self.pipeline.as_mut() else {
                return;
            };
            if let Some(reason) = pipeline.inactive_reason() {
                self.lane_failed(kind, FramestampError::pump_failure(reason));
                return;
            }
            if !pipeline.writer.is_ready_for_more_media_data(kind) {
                let jobs = self.jobs.clone();
                pipeline.writer.request_media_data_when_ready(
                    kind,
                    ReadyNotifier::new(move || {
                        let _ = jobs.send(Job::Pump(kind));
                    }),
                );
                return;
            }
            if budget == 0 {
                let _ = self.jobs.send(Job::Pump(kind));
                return;
            }
            budget -= 1;

            match pipeline.reader.copy_next_sample(kind) {
                Ok(None) => {
                    pipeline.writer.mark_as_finished(kind);
                    self.lane_drained(kind);
                    return;
                }
                Ok(Some(sample)) => {
                    let pushed = match kind {
                        MediaKind::Video => self.push_video(sample),
                        MediaKind::Audio => self.push_audio(sample),
                    };
                    if let Err(e) = pushed {
                        self.lane_failed(kind, e);
                        return;
                    }
                }
                Err(e) => {
                    self.lane_failed(kind, e);
                    return;
                }
            }
        }
    }

    fn push_video(&mut self, sample: SampleBuffer) -> FramestampResult<()> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| FramestampError::pump_failure("export pipeline already released"))?;
        let lane = pipeline
            .video
            .as_mut()
            .ok_or_else(|| FramestampError::pump_failure("no video lane configured"))?;
        let SamplePayload::Video(frame) = &sample.payload else {
            return Err(FramestampError::pump_failure(
                "reader returned audio on the video output",
            ));
        };

        let pts = sample.presentation_time;
        let relative = pts - pipeline.range.start();
        let progress = progress_fraction(relative, pipeline.duration);
        self.shared.set_progress(progress);
        if let Some(on_progress) = &self.on_progress {
            on_progress(progress);
        }

        lane.compositor
            .compose(pts, &[(lane.track, frame)], &mut lane.canvas)?;

        let mut hook = lock(&self.shared.render_hook);
        match hook.as_mut() {
            Some(hook) => {
                let mut target = lane.pool.take()?;
                hook(&lane.canvas, relative, &mut target);
                if !target.same_geometry(&lane.canvas) {
                    let (w, h) = (target.width(), target.height());
                    lane.pool.recycle(target);
                    return Err(FramestampError::pump_failure(format!(
                        "render hook produced a {w}x{h} buffer, expected {}x{}",
                        lane.canvas.width(),
                        lane.canvas.height()
                    )));
                }
                let appended = pipeline.writer.append_pixel_buffer(&target, pts);
                lane.pool.recycle(target);
                appended
            }
            None => pipeline.writer.append_pixel_buffer(&lane.canvas, pts),
        }
    }

    fn push_audio(&mut self, sample: SampleBuffer) -> FramestampResult<()> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| FramestampError::pump_failure("export pipeline already released"))?;
        pipeline.writer.append(MediaKind::Audio, &sample)
    }

    fn lane_failed(&mut self, kind: MediaKind, error: FramestampError) {
        tracing::warn!(lane = %kind, error = %error, "Export lane aborted");
        if self.lane_error.is_none() {
            self.lane_error = Some(as_pump_failure(error));
        }
        self.lane_drained(kind);
    }

    fn lane_drained(&mut self, kind: MediaKind) {
        let won = lock(&self.shared.lanes).mark_drained(kind);
        tracing::debug!(lane = %kind, finishing = won, "Export lane drained");
        if won {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        let reader_status = pipeline.reader.status();
        let writer_status = pipeline.writer.status();

        if reader_status == ReaderStatus::Cancelled || writer_status == WriterStatus::Cancelled {
            self.teardown(ExportStatus::Cancelled, None);
            return;
        }
        if writer_status == WriterStatus::Failed {
            let error = self
                .lane_error
                .take()
                .unwrap_or_else(|| FramestampError::pump_failure("writer failed"));
            self.teardown(ExportStatus::Failed, Some(error));
            return;
        }
        if reader_status == ReaderStatus::Failed {
            pipeline.writer.cancel_writing();
            let error = self
                .lane_error
                .take()
                .unwrap_or_else(|| FramestampError::pump_failure("reader failed"));
            self.teardown(ExportStatus::Failed, Some(error));
            return;
        }
        if let Some(error) = self.lane_error.take() {
            pipeline.writer.cancel_writing();
            self.teardown(ExportStatus::Failed, Some(error));
            return;
        }

        match pipeline.writer.finish_writing() {
            Ok(()) => self.teardown(ExportStatus::Completed, None),
            Err(e) => self.teardown(
                ExportStatus::Failed,
                Some(FramestampError::pump_failure(format!(
                    "finalizing output failed: {e}"
                ))),
            ),
        }
    }

    fn cancel(&mut self) {
        if self.done || !lock(&self.shared.lanes).claim() {
            return;
        }
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.writer.cancel_writing();
            pipeline.reader.cancel_reading();
        }
        self.teardown(ExportStatus::Cancelled, None);
    }

    fn teardown(&mut self, status: ExportStatus, error: Option<FramestampError>) {
        if self.done {
            return;
        }
        self.done = true;

        if let Some(mut pipeline) = self.pipeline.take() {
            if status != ExportStatus::Completed {
                if matches!(
                    pipeline.writer.status(),
                    WriterStatus::Unknown | WriterStatus::Writing
                ) {
                    pipeline.writer.cancel_writing();
                }
                if matches!(
                    pipeline.reader.status(),
                    ReaderStatus::Unknown | ReaderStatus::Reading
                ) {
                    pipeline.reader.cancel_reading();
                }
            }
        }

        let destination = self.request.output.clone();
        if status != ExportStatus::Completed && self.writer_opened {
            if let Some(destination) = &destination {
                remove_partial_output(destination);
            }
        }

        match (&status, &error) {
            (ExportStatus::Completed, _) => tracing::info!(
                output = ?destination.as_ref().map(|p| p.display().to_string()),
                "Export completed"
            ),
            (ExportStatus::Cancelled, _) => tracing::info!("Export cancelled"),
            (_, Some(e)) => tracing::error!(error = %e, category = ?e.category(), "Export failed"),
            (_, None) => tracing::error!(status = ?status, "Export ended without an error"),
        }

        let error = error.map(Arc::new);
        {
            let mut state = lock(&self.shared.state);
            state.status = status;
            state.error = error.clone();
            state.jobs = None;
        }

        let report = ExportReport {
            status,
            error,
            output_path: destination.filter(|_| status == ExportStatus::Completed),
        };
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(report);
        }
    }
}

fn progress_fraction(relative: MediaTime, duration: MediaTime) -> f32 {
    if duration.value <= 0 {
        return 1.0;
    }
    (relative.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0) as f32
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_partial_output(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial output"),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove partial output"
        ),
    }
}

fn as_open_failure(error: FramestampError) -> FramestampError {
    match error.category() {
        ErrorCategory::Open | ErrorCategory::Configuration => error,
        _ => FramestampError::open_failure(error.to_string()),
    }
}

fn as_pump_failure(error: FramestampError) -> FramestampError {
    match error.category() {
        ErrorCategory::Pump => error,
        _ => FramestampError::pump_failure(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_completion_single_winner() {
        let mut both = LaneCompletion::new(true, true);
        assert!(!both.mark_drained(MediaKind::Video));
        assert!(!both.mark_drained(MediaKind::Video));
        assert!(both.mark_drained(MediaKind::Audio));
        assert!(!both.mark_drained(MediaKind::Audio));
        assert!(!both.claim());

        let mut audio_only = LaneCompletion::new(false, true);
        assert!(audio_only.mark_drained(MediaKind::Audio));
    }

    #[test]
    fn test_claim_blocks_finish() {
        let mut lanes = LaneCompletion::new(true, true);
        assert!(lanes.claim());
        assert!(!lanes.mark_drained(MediaKind::Video));
        assert!(!lanes.mark_drained(MediaKind::Audio));
    }

    #[test]
    fn test_concurrent_drains_finish_once() {
        for _ in 0..500 {
            let lanes = Arc::new(Mutex::new(LaneCompletion::new(true, true)));
            let handles: Vec<_> = [MediaKind::Video, MediaKind::Audio]
                .into_iter()
                .map(|kind| {
                    let lanes = Arc::clone(&lanes);
                    thread::spawn(move || lock(&lanes).mark_drained(kind))
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(MediaTime::new(1, 1), MediaTime::ZERO), 1.0);
        assert_eq!(
            progress_fraction(MediaTime::new(1, 1), MediaTime::new(4, 1)),
            0.25
        );
        assert_eq!(
            progress_fraction(MediaTime::new(-1, 1), MediaTime::new(4, 1)),
            0.0
        );
        assert_eq!(
            progress_fraction(MediaTime::new(9, 1), MediaTime::new(4, 1)),
            1.0
        );
    }

    #[test]
    fn test_error_mapping_keeps_configuration() {
        let e = as_open_failure(FramestampError::configuration("bad"));
        assert_eq!(e.category(), ErrorCategory::Configuration);
        let e = as_open_failure(FramestampError::engine("boom"));
        assert_eq!(e.category(), ErrorCategory::Open);
        let e = as_pump_failure(FramestampError::engine("boom"));
        assert_eq!(e.category(), ErrorCategory::Pump);
    }
}
