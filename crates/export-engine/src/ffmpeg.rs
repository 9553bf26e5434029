//! `ffmpeg`/`ffprobe` subprocess engine.
//!
//! Assets are described with `ffprobe -print_format json`. Readers run one
//! `ffmpeg` decoder per track segment and read raw BGRA frames or s16le PCM
//! from its stdout. Writers pipe raw media into one encoder per track and
//! mux the encoded streams into the destination when finished.
//!
//! Decoders resample video to the requested frame duration, so output is
//! constant frame rate. Pipe writes block while an encoder is busy; that is
//! the backpressure, and inputs always report ready.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use anyhow::Context;
use serde::Deserialize;

use framestamp_common::config::EngineConfig;
use framestamp_common::error::{FramestampError, FramestampResult};
use framestamp_media_model::{
    AffineTransform, AssetTrack, AudioCodec, AudioSettings, ContainerFormat, MediaAsset,
    MediaKind, MediaTime, Size, TimeRange, TrackId, TrackSettings, VideoCodec, VideoSettings,
};

use crate::engine::{
    AudioBuffer, MediaEngine, PixelBuffer, ReadyNotifier, ReaderStatus, SampleBuffer,
    SamplePayload, SinkWriter, SourceReader, WriterOptions, WriterStatus, BYTES_PER_PIXEL,
};

/// PCM frames per audio sample buffer.
const AUDIO_CHUNK_FRAMES: usize = 1024;

/// Engine backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegEngine {
    /// Use `ffmpeg`/`ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
        }
    }

    /// Whether each binary can be found.
    pub fn availability(&self) -> Vec<(String, bool)> {
        vec![
            (self.ffmpeg.clone(), command_exists(&self.ffmpeg)),
            (self.ffprobe.clone(), command_exists(&self.ffprobe)),
        ]
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn is_available(&self) -> bool {
        command_exists(&self.ffmpeg) && command_exists(&self.ffprobe)
    }

    fn load_asset(&self, path: &Path) -> FramestampResult<MediaAsset> {
        if !path.exists() {
            return Err(FramestampError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FramestampError::engine(format!("Failed to start ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(FramestampError::engine(format!(
                "ffprobe failed on {} (status {}): {}",
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        let asset = parse_probe_output(&json, path)?;
        tracing::debug!(
            path = %path.display(),
            tracks = asset.tracks.len(),
            duration_secs = asset.duration.as_secs_f64(),
            "Probed asset"
        );
        Ok(asset)
    }

    fn create_reader(
        &self,
        asset: &MediaAsset,
        range: TimeRange,
    ) -> FramestampResult<Box<dyn SourceReader>> {
        for source in asset.source_files() {
            if !source.exists() {
                return Err(FramestampError::FileNotFound {
                    path: source.to_path_buf(),
                });
            }
        }
        Ok(Box::new(FfmpegReader {
            ffmpeg: self.ffmpeg.clone(),
            asset: asset.clone(),
            range: range.bounded_by(asset.duration),
            video: None,
            audio: None,
            status: ReaderStatus::Unknown,
        }))
    }

    fn create_writer(
        &self,
        destination: &Path,
        format: ContainerFormat,
        options: &WriterOptions,
    ) -> FramestampResult<Box<dyn SinkWriter>> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }
        let scratch = tempfile::Builder::new()
            .prefix("framestamp-")
            .tempdir()
            .context("creating encoder scratch directory")?;
        Ok(Box::new(FfmpegWriter {
            ffmpeg: self.ffmpeg.clone(),
            destination: destination.to_path_buf(),
            format,
            options: options.clone(),
            scratch,
            video_settings: None,
            audio_settings: None,
            video: EncoderSlot::default(),
            audio: EncoderSlot::default(),
            status: WriterStatus::Unknown,
        }))
    }
}

// ---------------------------------------------------------------------------
// ffprobe
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    fn frame_rate(&self) -> f64 {
        [&self.avg_frame_rate, &self.r_frame_rate]
            .into_iter()
            .flatten()
            .map(|r| parse_rational(r))
            .find(|fps| *fps > 0.0)
            .unwrap_or(0.0)
    }

    /// Clockwise display rotation, a multiple of 90.
    fn clockwise_rotation(&self) -> i32 {
        // Display-matrix side data stores counter-clockwise degrees; the
        // legacy `rotate` tag stores clockwise degrees.
        let degrees = self
            .side_data_list
            .iter()
            .find_map(|s| s.rotation)
            .map(|r| -r)
            .or_else(|| self.tags.get("rotate").and_then(|r| r.parse::<f64>().ok()))
            .unwrap_or(0.0);
        ((degrees / 90.0).round() as i32 * 90).rem_euclid(360)
    }
}

/// Parse `"30000/1001"` or `"25"`. Invalid or zero-denominator input yields 0.
pub fn parse_rational(value: &str) -> f64 {
    match value.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().unwrap_or(0.0);
            let den = den.trim().parse::<f64>().unwrap_or(0.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => value.trim().parse::<f64>().unwrap_or(0.0),
    }
}

fn parse_secs(value: &Option<String>) -> Option<MediaTime> {
    value
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(MediaTime::from_secs_f64)
}

/// Turn `ffprobe -show_streams -show_format` JSON into an asset at `path`.
pub fn parse_probe_output(json: &str, path: &Path) -> FramestampResult<MediaAsset> {
    let probe: ProbeOutput = serde_json::from_str(json)?;

    let stream_durations = probe.streams.iter().filter_map(|s| parse_secs(&s.duration));
    let duration = probe
        .format
        .as_ref()
        .and_then(|f| parse_secs(&f.duration))
        .unwrap_or_else(|| stream_durations.fold(MediaTime::ZERO, MediaTime::max));

    let mut tracks = Vec::new();
    for stream in &probe.streams {
        let track_duration = parse_secs(&stream.duration).unwrap_or(duration);
        let id = TrackId(stream.index + 1);
        match stream.codec_type.as_deref() {
            Some("video") => {
                let natural = Size::new(
                    stream.width.unwrap_or(0) as f64,
                    stream.height.unwrap_or(0) as f64,
                );
                let transform =
                    AffineTransform::for_clockwise_rotation(stream.clockwise_rotation(), natural);
                tracks.push(
                    AssetTrack::video(
                        id,
                        path,
                        stream.index,
                        track_duration,
                        natural,
                        stream.frame_rate(),
                    )
                    .with_preferred_transform(transform),
                );
            }
            Some("audio") => {
                let sample_rate = stream
                    .sample_rate
                    .as_deref()
                    .and_then(|r| r.parse::<u32>().ok())
                    .unwrap_or(0);
                tracks.push(AssetTrack::audio(
                    id,
                    path,
                    stream.index,
                    track_duration,
                    sample_rate,
                    stream.channels.unwrap_or(0),
                ));
            }
            _ => {}
        }
    }

    Ok(MediaAsset::new(Some(path.to_path_buf()), duration, tracks))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// A contiguous stretch of one source stream to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentWindow {
    pub source: PathBuf,
    pub stream: u32,
    pub source_start: MediaTime,
    pub duration: MediaTime,
    /// Where the first decoded sample lands on the asset timeline.
    pub target_start: MediaTime,
}

/// Windows of `track` that fall inside `range`, in timeline order.
pub fn plan_segments(track: &AssetTrack, range: &TimeRange) -> Vec<SegmentWindow> {
    let mut windows: Vec<SegmentWindow> = track
        .segments
        .iter()
        .filter_map(|segment| {
            let overlap = segment.target_range().intersection(range)?;
            let duration = overlap.duration()?;
            Some(SegmentWindow {
                source: segment.source.clone(),
                stream: segment.source_stream,
                source_start: segment.source_range.start() + (overlap.start() - segment.target_start),
                duration,
                target_start: overlap.start(),
            })
        })
        .collect();
    windows.sort_by(|a, b| a.target_start.cmp(&b.target_start));
    windows
}

fn secs_arg(t: MediaTime) -> String {
    format!("{:.6}", t.as_secs_f64())
}

/// Arguments decoding `window` to raw BGRA at one frame per `frame_duration`.
pub fn video_decoder_args(window: &SegmentWindow, frame_duration: MediaTime) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
        "-noautorotate".to_string(),
        "-ss".to_string(),
        secs_arg(window.source_start),
        "-t".to_string(),
        secs_arg(window.duration),
        "-i".to_string(),
        window.source.display().to_string(),
        "-map".to_string(),
        format!("0:{}", window.stream),
        "-vf".to_string(),
        format!(
            "fps={}/{}",
            frame_duration.timescale,
            frame_duration.value.max(1)
        ),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgra".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Arguments decoding `window` to interleaved s16le PCM.
pub fn audio_decoder_args(window: &SegmentWindow, sample_rate: u32, channels: u16) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
        "-ss".to_string(),
        secs_arg(window.source_start),
        "-t".to_string(),
        secs_arg(window.duration),
        "-i".to_string(),
        window.source.display().to_string(),
        "-map".to_string(),
        format!("0:{}", window.stream),
        "-f".to_string(),
        "s16le".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        "pipe:1".to_string(),
    ]
}

/// A running ffmpeg child with its stderr drained on a helper thread.
struct FfmpegProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    fn spawn(ffmpeg: &str, args: &[String], stdin: Stdio) -> FramestampResult<Self> {
        tracing::debug!(args = ?args, "Spawning ffmpeg");
        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FramestampError::engine(format!("Failed to start ffmpeg: {e}")))?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| FramestampError::engine("Failed to capture ffmpeg stderr"))?;

        // Drain stderr concurrently so ffmpeg never blocks on a full pipe.
        let stderr = std::thread::spawn(move || -> String {
            let mut output = String::new();
            match stderr.read_to_string(&mut output) {
                Ok(_) => output,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        Ok(Self {
            child,
            stderr: Some(stderr),
        })
    }

    fn take_stdout(&mut self) -> FramestampResult<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| FramestampError::engine("Failed to capture ffmpeg stdout"))
    }

    fn take_stdin(&mut self) -> FramestampResult<ChildStdin> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| FramestampError::engine("Failed to capture ffmpeg stdin"))
    }

    /// Wait for exit; a non-zero status becomes an error carrying stderr.
    fn wait(mut self, what: &str) -> FramestampResult<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| FramestampError::engine(format!("Failed to wait on ffmpeg: {e}")))?;
        let stderr = self
            .stderr
            .take()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| "<failed to join stderr reader>".to_string())
            })
            .unwrap_or_default();
        if !status.success() {
            return Err(FramestampError::engine(format!(
                "ffmpeg {what} failed (status {status}): {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

enum LaneFormat {
    Video {
        width: u32,
        height: u32,
        frame_duration: MediaTime,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

struct ActiveDecoder {
    process: FfmpegProcess,
    stdout: ChildStdout,
    window: SegmentWindow,
    /// Frames (video) or PCM frames (audio) emitted from this window.
    emitted: i64,
}

struct DecodeLane {
    format: LaneFormat,
    pending: VecDeque<SegmentWindow>,
    active: Option<ActiveDecoder>,
    done: bool,
}

impl DecodeLane {
    fn new(format: LaneFormat, windows: Vec<SegmentWindow>) -> Self {
        Self {
            format,
            pending: windows.into(),
            active: None,
            done: false,
        }
    }

    fn chunk_bytes(&self) -> usize {
        match self.format {
            LaneFormat::Video { width, height, .. } => {
                width as usize * height as usize * BYTES_PER_PIXEL
            }
            LaneFormat::Audio { channels, .. } => AUDIO_CHUNK_FRAMES * channels.max(1) as usize * 2,
        }
    }

    fn next(&mut self, ffmpeg: &str) -> FramestampResult<Option<SampleBuffer>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.active.is_none() {
                let Some(window) = self.pending.pop_front() else {
                    self.done = true;
                    return Ok(None);
                };
                let args = match self.format {
                    LaneFormat::Video { frame_duration, .. } => {
                        video_decoder_args(&window, frame_duration)
                    }
                    LaneFormat::Audio {
                        sample_rate,
                        channels,
                    } => audio_decoder_args(&window, sample_rate, channels),
                };
                let mut process = FfmpegProcess::spawn(ffmpeg, &args, Stdio::null())?;
                let stdout = process.take_stdout()?;
                self.active = Some(ActiveDecoder {
                    process,
                    stdout,
                    window,
                    emitted: 0,
                });
            }

            let chunk = self.chunk_bytes();
            let Some(active) = self.active.as_mut() else {
                continue;
            };
            let mut buf = vec![0u8; chunk];
            let filled = read_up_to(&mut active.stdout, &mut buf)?;

            let sample = match self.format {
                LaneFormat::Video {
                    width,
                    height,
                    frame_duration,
                } if filled == chunk => {
                    let pts = active.window.target_start
                        + MediaTime::new(frame_duration.value * active.emitted, frame_duration.timescale);
                    active.emitted += 1;
                    Some(SampleBuffer {
                        presentation_time: pts,
                        duration: frame_duration,
                        payload: SamplePayload::Video(PixelBuffer::from_bgra(width, height, buf)?),
                    })
                }
                LaneFormat::Audio {
                    sample_rate,
                    channels,
                } if filled >= channels.max(1) as usize * 2 => {
                    let frame_bytes = channels.max(1) as usize * 2;
                    let frames = (filled / frame_bytes) as i64;
                    let samples = buf[..frames as usize * frame_bytes]
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]))
                        .collect();
                    let pts = active.window.target_start + MediaTime::new(active.emitted, sample_rate);
                    active.emitted += frames;
                    Some(SampleBuffer {
                        presentation_time: pts,
                        duration: MediaTime::new(frames, sample_rate),
                        payload: SamplePayload::Audio(AudioBuffer {
                            sample_rate,
                            channels,
                            samples,
                        }),
                    })
                }
                _ => None,
            };

            if sample.is_some() {
                return Ok(sample);
            }
            // Short read: this window is exhausted.
            if let Some(active) = self.active.take() {
                drop(active.stdout);
                active.process.wait("decoder")?;
            }
        }
    }

    fn kill(&mut self) {
        if let Some(active) = self.active.take() {
            active.process.kill();
        }
        self.done = true;
    }
}

/// Fill `buf` until it is full or the stream ends. Returns bytes read.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> FramestampResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(FramestampError::pump_failure(format!(
                    "reading decoder output failed: {e}"
                )))
            }
        }
    }
    Ok(filled)
}

struct FfmpegReader {
    ffmpeg: String,
    asset: MediaAsset,
    range: TimeRange,
    video: Option<DecodeLane>,
    audio: Option<DecodeLane>,
    status: ReaderStatus,
}

impl FfmpegReader {
    fn track(&self, id: TrackId, kind: MediaKind) -> FramestampResult<&AssetTrack> {
        self.asset
            .track(id)
            .filter(|t| t.kind == kind)
            .ok_or_else(|| FramestampError::open_failure(format!("no {kind} track {}", id.0)))
    }
}

impl SourceReader for FfmpegReader {
    fn add_video_output(
        &mut self,
        track: TrackId,
        frame_duration: MediaTime,
    ) -> FramestampResult<()> {
        let track = self.track(track, MediaKind::Video)?;
        let (width, height) = track.natural_size.to_pixels();
        let windows = plan_segments(track, &self.range);
        self.video = Some(DecodeLane::new(
            LaneFormat::Video {
                width,
                height,
                frame_duration,
            },
            windows,
        ));
        Ok(())
    }

    fn add_audio_output(&mut self, track: TrackId) -> FramestampResult<()> {
        let track = self.track(track, MediaKind::Audio)?;
        let defaults = AudioSettings::default();
        let format = LaneFormat::Audio {
            sample_rate: if track.sample_rate > 0 {
                track.sample_rate
            } else {
                defaults.sample_rate
            },
            channels: if track.channels > 0 {
                track.channels
            } else {
                defaults.channels
            },
        };
        let windows = plan_segments(track, &self.range);
        self.audio = Some(DecodeLane::new(format, windows));
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
        if !matches!(self.status, ReaderStatus::Reading | ReaderStatus::Completed) {
            return Err(FramestampError::pump_failure(format!(
                "reader is not reading ({:?})",
                self.status
            )));
        }
        let lane = match kind {
            MediaKind::Video => self.video.as_mut(),
            MediaKind::Audio => self.audio.as_mut(),
        };
        let Some(lane) = lane else {
            return Err(FramestampError::pump_failure(format!("no {kind} output added")));
        };

        match lane.next(&self.ffmpeg) {
            Ok(Some(sample)) => Ok(Some(sample)),
            Ok(None) => {
                let all_done = self.video.as_ref().map_or(true, |l| l.done)
                    && self.audio.as_ref().map_or(true, |l| l.done);
                if all_done {
                    self.status = ReaderStatus::Completed;
                }
                Ok(None)
            }
            Err(e) => {
                self.status = ReaderStatus::Failed;
                Err(e)
            }
        }
    }

    fn cancel_reading(&mut self) {
        for lane in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            lane.kill();
        }
        if matches!(self.status, ReaderStatus::Unknown | ReaderStatus::Reading) {
            self.status = ReaderStatus::Cancelled;
        }
    }

    fn status(&self) -> ReaderStatus {
        self.status
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        for lane in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            lane.kill();
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

fn video_codec_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::Hevc => "libx265",
    }
}

fn audio_codec_name(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aac",
    }
}

fn muxer_name(format: ContainerFormat) -> &'static str {
    match format {
        ContainerFormat::Mp4 => "mp4",
        ContainerFormat::Mov => "mov",
        ContainerFormat::M4a => "ipod",
    }
}

fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{fps:.3}")
    }
}

/// Arguments encoding raw BGRA frames of `input` size from stdin.
pub fn video_encoder_args(
    settings: &VideoSettings,
    input: (u32, u32),
    output: &Path,
) -> Vec<String> {
    let fps = settings.frame_rate.filter(|f| *f > 0.0).unwrap_or(30.0);
    let (out_w, out_h) = settings
        .output_size()
        .map(|s| s.to_pixels())
        .unwrap_or(input);
    // yuv420p needs even dimensions.
    let (even_w, even_h) = ((out_w & !1).max(2), (out_h & !1).max(2));

    let mut args = vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgra".to_string(),
        "-s".to_string(),
        format!("{}x{}", input.0, input.1),
        "-r".to_string(),
        format_rate(fps),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c:v".to_string(),
        video_codec_name(settings.codec).to_string(),
        "-preset".to_string(),
        "medium".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-b:v".to_string(),
        settings.average_bit_rate.to_string(),
        "-g".to_string(),
        settings.max_keyframe_interval.max(1).to_string(),
    ];
    if (even_w, even_h) != input {
        args.push("-vf".to_string());
        args.push(format!("scale={even_w}:{even_h}"));
    }
    args.push(output.display().to_string());
    args
}

/// Arguments encoding s16le PCM of the given input format from stdin.
pub fn audio_encoder_args(
    settings: &AudioSettings,
    input_rate: u32,
    input_channels: u16,
    output: &Path,
) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        input_rate.to_string(),
        "-ac".to_string(),
        input_channels.to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c:a".to_string(),
        audio_codec_name(settings.codec).to_string(),
        "-b:a".to_string(),
        settings.total_bit_rate().to_string(),
        "-ar".to_string(),
        settings.sample_rate.to_string(),
        "-ac".to_string(),
        settings.channels.to_string(),
        output.display().to_string(),
    ]
}

/// Arguments muxing encoded streams into the destination container.
pub fn mux_args(
    video: Option<&Path>,
    audio: Option<&Path>,
    format: ContainerFormat,
    options: &WriterOptions,
    creation_time: &str,
    destination: &Path,
) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];
    let mut maps = Vec::new();
    for (index, (path, selector)) in [(video, "v:0"), (audio, "a:0")]
        .into_iter()
        .filter_map(|(path, selector)| path.map(|p| (p, selector)))
        .enumerate()
    {
        args.push("-i".to_string());
        args.push(path.display().to_string());
        maps.push("-map".to_string());
        maps.push(format!("{index}:{selector}"));
    }
    args.extend(maps);
    args.push("-c".to_string());
    args.push("copy".to_string());
    if options.optimize_for_network_use {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }
    for (key, value) in &options.metadata {
        args.push("-metadata".to_string());
        args.push(format!("{key}={value}"));
    }
    if !options.metadata.contains_key("creation_time") {
        args.push("-metadata".to_string());
        args.push(format!("creation_time={creation_time}"));
    }
    args.push("-f".to_string());
    args.push(muxer_name(format).to_string());
    args.push(destination.display().to_string());
    args
}

struct EncoderProcess {
    process: FfmpegProcess,
    stdin: Option<ChildStdin>,
}

#[derive(Default)]
struct EncoderSlot {
    encoder: Option<EncoderProcess>,
    written: u64,
    finished: bool,
    output: Option<PathBuf>,
}

impl EncoderSlot {
    fn write(&mut self, bytes: &[u8]) -> FramestampResult<()> {
        let stdin = self
            .encoder
            .as_mut()
            .and_then(|e| e.stdin.as_mut())
            .ok_or_else(|| FramestampError::pump_failure("encoder input is closed"))?;
        stdin
            .write_all(bytes)
            .map_err(|e| FramestampError::pump_failure(format!("writing to encoder failed: {e}")))?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> FramestampResult<()> {
        self.finished = true;
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };
        drop(encoder.stdin.take());
        encoder.process.wait("encoder")
    }

    fn kill(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            drop(encoder.stdin.take());
            encoder.process.kill();
        }
    }
}

struct FfmpegWriter {
    ffmpeg: String,
    destination: PathBuf,
    format: ContainerFormat,
    options: WriterOptions,
    scratch: tempfile::TempDir,
    video_settings: Option<VideoSettings>,
    audio_settings: Option<AudioSettings>,
    video: EncoderSlot,
    audio: EncoderSlot,
    status: WriterStatus,
}

impl FfmpegWriter {
    fn ensure_writing(&self) -> FramestampResult<()> {
        if self.status != WriterStatus::Writing {
            return Err(FramestampError::pump_failure(format!(
                "writer is not writing ({:?})",
                self.status
            )));
        }
        Ok(())
    }

    fn spawn_encoder(&self, args: &[String]) -> FramestampResult<EncoderProcess> {
        let mut process = FfmpegProcess::spawn(&self.ffmpeg, args, Stdio::piped())?;
        let stdin = process.take_stdin()?;
        // Encoders write to a file; nothing on stdout.
        drop(process.take_stdout()?);
        Ok(EncoderProcess {
            process,
            stdin: Some(stdin),
        })
    }

    fn fail(&mut self, error: FramestampError) -> FramestampError {
        tracing::warn!(error = %error, "ffmpeg writer failed");
        self.video.kill();
        self.audio.kill();
        self.status = WriterStatus::Failed;
        error
    }

    fn write_video(&mut self, buffer: &PixelBuffer) -> FramestampResult<()> {
        self.ensure_writing()?;
        if self.video.finished {
            return Err(FramestampError::pump_failure("video input already finished"));
        }
        let settings = self
            .video_settings
            .clone()
            .ok_or_else(|| FramestampError::pump_failure("no video input"))?;
        if self.video.encoder.is_none() {
            let output = self.scratch.path().join("video.mp4");
            let args = video_encoder_args(&settings, (buffer.width(), buffer.height()), &output);
            let encoder = self.spawn_encoder(&args).map_err(|e| self.fail(e))?;
            self.video.encoder = Some(encoder);
            self.video.output = Some(output);
        }
        self.video.write(buffer.data()).map_err(|e| self.fail(e))
    }

    fn write_audio(&mut self, audio: &AudioBuffer) -> FramestampResult<()> {
        self.ensure_writing()?;
        if self.audio.finished {
            return Err(FramestampError::pump_failure("audio input already finished"));
        }
        let settings = self
            .audio_settings
            .clone()
            .ok_or_else(|| FramestampError::pump_failure("no audio input"))?;
        if self.audio.encoder.is_none() {
            let output = self.scratch.path().join("audio.m4a");
            let args = audio_encoder_args(&settings, audio.sample_rate, audio.channels, &output);
            let encoder = self.spawn_encoder(&args).map_err(|e| self.fail(e))?;
            self.audio.encoder = Some(encoder);
            self.audio.output = Some(output);
        }
        let bytes: Vec<u8> = audio.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.audio.write(&bytes).map_err(|e| self.fail(e))
    }
}

impl SinkWriter for FfmpegWriter {
    fn add_input(&mut self, settings: &TrackSettings) -> FramestampResult<()> {
        if self.status != WriterStatus::Unknown {
            return Err(FramestampError::engine(
                "inputs must be added before writing starts",
            ));
        }
        match settings {
            TrackSettings::Video(video) => {
                if !self.format.supports_video() {
                    return Err(FramestampError::engine(format!(
                        "{} cannot carry video",
                        self.format.extension()
                    )));
                }
                self.video_settings = Some(video.clone());
            }
            TrackSettings::Audio(audio) => self.audio_settings = Some(audio.clone()),
        }
        Ok(())
    }

    fn start_writing(&mut self) -> FramestampResult<()> {
        if self.video_settings.is_none() && self.audio_settings.is_none() {
            return Err(FramestampError::engine("writer has no inputs"));
        }
        self.status = WriterStatus::Writing;
        Ok(())
    }

    fn start_session(&mut self, at: MediaTime) {
        tracing::debug!(start_secs = at.as_secs_f64(), "Writer session started");
    }

    fn is_ready_for_more_media_data(&self, _kind: MediaKind) -> bool {
        true
    }

    fn request_media_data_when_ready(&mut self, _kind: MediaKind, notifier: ReadyNotifier) {
        notifier.notify();
    }

    fn append(&mut self, kind: MediaKind, sample: &SampleBuffer) -> FramestampResult<()> {
        match (&sample.payload, kind) {
            (SamplePayload::Video(frame), MediaKind::Video) => self.write_video(frame),
            (SamplePayload::Audio(audio), MediaKind::Audio) => self.write_audio(audio),
            _ => Err(FramestampError::pump_failure(format!(
                "{} sample appended to {kind} input",
                sample.kind()
            ))),
        }
    }

    fn append_pixel_buffer(
        &mut self,
        buffer: &PixelBuffer,
        _presentation_time: MediaTime,
    ) -> FramestampResult<()> {
        self.write_video(buffer)
    }

    fn mark_as_finished(&mut self, kind: MediaKind) {
        let closed = match kind {
            MediaKind::Video => self.video.close(),
            MediaKind::Audio => self.audio.close(),
        };
        if let Err(e) = closed {
            self.fail(e);
        }
    }

    fn finish_writing(&mut self) -> FramestampResult<()> {
        self.ensure_writing()
            .map_err(|e| FramestampError::engine(e.to_string()))?;
        for kind in [MediaKind::Video, MediaKind::Audio] {
            self.mark_as_finished(kind);
        }
        if self.status == WriterStatus::Failed {
            return Err(FramestampError::engine("an encoder failed before finalization"));
        }

        let video = self.video.output.as_deref().filter(|_| self.video.written > 0);
        let audio = self.audio.output.as_deref().filter(|_| self.audio.written > 0);
        if video.is_none() && audio.is_none() {
            self.status = WriterStatus::Failed;
            return Err(FramestampError::engine("no media was written"));
        }

        let creation_time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let args = mux_args(
            video,
            audio,
            self.format,
            &self.options,
            &creation_time,
            &self.destination,
        );
        tracing::debug!(args = ?args, "Muxing output");
        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FramestampError::engine(format!("Failed to start ffmpeg: {e}")))?;
        if !output.status.success() {
            self.status = WriterStatus::Failed;
            return Err(FramestampError::engine(format!(
                "ffmpeg mux failed (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(
            output = %self.destination.display(),
            video_frames = self.video.written,
            audio_chunks = self.audio.written,
            "Output finalized"
        );
        self.status = WriterStatus::Completed;
        Ok(())
    }

    fn cancel_writing(&mut self) {
        self.video.kill();
        self.audio.kill();
        if matches!(self.status, WriterStatus::Unknown | WriterStatus::Writing) {
            self.status = WriterStatus::Cancelled;
        }
    }

    fn status(&self) -> WriterStatus {
        self.status
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.video.kill();
        self.audio.kill();
    }
}

/// Whether `binary` resolves through the shell.
pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
