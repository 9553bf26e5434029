//! Compositions: how source tracks map onto an output timeline and canvas.
//!
//! Two related types live here:
//! - [`Composition`] stitches time ranges of source tracks into new tracks
//!   and yields a [`MediaAsset`] that readers can open like any container.
//! - [`VideoComposition`] describes, per time range, how video layers are
//!   transformed and faded onto a canvas of a fixed render size.

use serde::{Deserialize, Serialize};

use crate::asset::{AssetTrack, MediaAsset, MediaKind, TrackId, TrackSegment};
use crate::geometry::{AffineTransform, Size};
use crate::overlay::OverlayLayer;
use crate::time::{MediaTime, TimeRange};
use crate::ModelError;

/// A mutable set of tracks assembled from pieces of other assets.
#[derive(Debug, Clone, Default)]
pub struct Composition {
    tracks: Vec<AssetTrack>,
    next_id: u32,
}

impl Composition {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Add an empty track and return its id.
    pub fn add_track(&mut self, kind: MediaKind) -> TrackId {
        let id = TrackId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.tracks.push(AssetTrack {
            id,
            kind,
            duration: MediaTime::ZERO,
            natural_size: Size::ZERO,
            preferred_transform: AffineTransform::IDENTITY,
            nominal_frame_rate: 0.0,
            sample_rate: 0,
            channels: 0,
            segments: Vec::new(),
        });
        id
    }

    pub fn tracks(&self) -> &[AssetTrack] {
        &self.tracks
    }

    /// Insert `range` of `source` into track `track` starting at `at`.
    ///
    /// The first insertion into an empty track adopts the source track's
    /// natural properties (size, orientation, frame rate, audio format).
    pub fn insert_time_range(
        &mut self,
        track: TrackId,
        range: TimeRange,
        source: &AssetTrack,
        at: MediaTime,
    ) -> Result<(), ModelError> {
        let range = range.bounded_by(source.duration);
        let range_duration = range.duration().unwrap_or(MediaTime::ZERO);
        if at.is_negative() {
            return Err(ModelError::InvalidComposition {
                message: format!("insertion time {:.3}s is negative", at.as_secs_f64()),
            });
        }

        let target = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track)
            .ok_or(ModelError::TrackNotFound { track: track.0 })?;
        if target.kind != source.kind {
            return Err(ModelError::KindMismatch {
                expected: target.kind,
                found: source.kind,
            });
        }

        if target.segments.is_empty() {
            target.natural_size = source.natural_size;
            target.preferred_transform = source.preferred_transform;
            target.nominal_frame_rate = source.nominal_frame_rate;
            target.sample_rate = source.sample_rate;
            target.channels = source.channels;
        }

        for segment in &source.segments {
            let Some(overlap) = segment.target_range().intersection(&range) else {
                continue;
            };
            let overlap_duration = overlap.duration().unwrap_or(MediaTime::ZERO);
            let offset_in_segment = overlap.start() - segment.target_start;
            let source_range = TimeRange::new(
                segment.source_range.start() + offset_in_segment,
                overlap_duration,
            )?;
            target.segments.push(TrackSegment {
                source: segment.source.clone(),
                source_stream: segment.source_stream,
                source_range,
                target_start: at + (overlap.start() - range.start()),
            });
        }
        target
            .segments
            .sort_by(|a, b| a.target_start.cmp(&b.target_start));

        let inserted_end = at + range_duration;
        target.duration = target.duration.max(inserted_end);
        Ok(())
    }

    /// Longest track duration.
    pub fn duration(&self) -> MediaTime {
        self.tracks
            .iter()
            .map(|t| t.duration)
            .fold(MediaTime::ZERO, MediaTime::max)
    }

    /// Freeze into an asset. Tracks that never received media are dropped.
    pub fn to_asset(&self) -> MediaAsset {
        let tracks: Vec<AssetTrack> = self
            .tracks
            .iter()
            .filter(|t| !t.segments.is_empty())
            .cloned()
            .collect();
        MediaAsset::new(None, self.duration(), tracks)
    }
}

/// Linear opacity change across an instruction's time range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpacityRamp {
    pub start: f32,
    pub end: f32,
}

impl OpacityRamp {
    pub const OPAQUE: OpacityRamp = OpacityRamp {
        start: 1.0,
        end: 1.0,
    };

    pub fn constant(opacity: f32) -> Self {
        let opacity = opacity.clamp(0.0, 1.0);
        Self {
            start: opacity,
            end: opacity,
        }
    }

    pub fn linear(start: f32, end: f32) -> Self {
        Self {
            start: start.clamp(0.0, 1.0),
            end: end.clamp(0.0, 1.0),
        }
    }

    /// Opacity at `fraction` (0..=1) of the way through the range.
    pub fn at(&self, fraction: f64) -> f32 {
        let t = fraction.clamp(0.0, 1.0) as f32;
        self.start + (self.end - self.start) * t
    }

    pub fn is_opaque(&self) -> bool {
        self.start >= 1.0 && self.end >= 1.0
    }
}

impl Default for OpacityRamp {
    fn default() -> Self {
        Self::OPAQUE
    }
}

/// How one source track is drawn during an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInstruction {
    pub track_id: TrackId,
    /// Raster-space transform from source pixels to canvas pixels.
    pub transform: AffineTransform,
    pub opacity: OpacityRamp,
}

impl LayerInstruction {
    pub fn pass_through(track_id: TrackId) -> Self {
        Self {
            track_id,
            transform: AffineTransform::IDENTITY,
            opacity: OpacityRamp::OPAQUE,
        }
    }
}

/// Layers to draw over one time range. Earlier layers are drawn on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionInstruction {
    pub time_range: TimeRange,
    pub layers: Vec<LayerInstruction>,
}

impl CompositionInstruction {
    /// Fraction of the way `t` lies through this instruction's range.
    pub fn progress_at(&self, t: MediaTime) -> f64 {
        match self.time_range.duration() {
            Some(d) if !d.is_zero() => {
                ((t - self.time_range.start()).as_secs_f64() / d.as_secs_f64()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }
}

/// Canvas-level description of a video composition.
#[derive(Debug, Clone)]
pub struct VideoComposition {
    /// Size of every rendered frame.
    pub render_size: Size,

    /// Interval between rendered frames.
    pub frame_duration: MediaTime,

    /// Non-overlapping instructions ordered by start time.
    pub instructions: Vec<CompositionInstruction>,

    /// Image drawn over the video layers on every frame.
    pub overlay: Option<OverlayLayer>,
}

impl VideoComposition {
    /// Instruction covering `t`, if any.
    pub fn instruction_at(&self, t: MediaTime) -> Option<&CompositionInstruction> {
        self.instructions.iter().find(|i| i.time_range.contains(t))
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_duration.as_frame_rate()
    }

    /// Check canvas-level invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.render_size.is_empty() {
            return Err(ModelError::InvalidComposition {
                message: "render size is empty".to_string(),
            });
        }
        if self.frame_duration.value <= 0 {
            return Err(ModelError::InvalidComposition {
                message: "frame duration must be positive".to_string(),
            });
        }
        let mut previous_end: Option<MediaTime> = None;
        for instruction in &self.instructions {
            let Some(end) = instruction.time_range.end() else {
                return Err(ModelError::InvalidComposition {
                    message: "instruction time ranges must be finite".to_string(),
                });
            };
            if let Some(prev) = previous_end {
                if instruction.time_range.start() < prev {
                    return Err(ModelError::InvalidComposition {
                        message: format!(
                            "instruction at {:.3}s overlaps its predecessor",
                            instruction.time_range.start().as_secs_f64()
                        ),
                    });
                }
            }
            previous_end = Some(end);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_asset() -> MediaAsset {
        let duration = MediaTime::new(10, 1);
        MediaAsset::new(
            Some("/media/in.mp4".into()),
            duration,
            vec![
                AssetTrack::video(
                    TrackId(1),
                    "/media/in.mp4",
                    0,
                    duration,
                    Size::new(1280.0, 720.0),
                    25.0,
                ),
                AssetTrack::audio(TrackId(2), "/media/in.mp4", 1, duration, 48_000, 2),
            ],
        )
    }

    #[test]
    fn test_full_insertion_at_zero() {
        let source = source_asset();
        let mut comp = Composition::new();
        let video = comp.add_track(MediaKind::Video);
        let audio = comp.add_track(MediaKind::Audio);

        let video_src = source.first_track(MediaKind::Video).unwrap();
        let audio_src = source.first_track(MediaKind::Audio).unwrap();
        let full = TimeRange::new(MediaTime::ZERO, source.duration).unwrap();
        comp.insert_time_range(video, full, video_src, MediaTime::ZERO)
            .unwrap();
        comp.insert_time_range(audio, full, audio_src, MediaTime::ZERO)
            .unwrap();

        let asset = comp.to_asset();
        assert_eq!(asset.duration, MediaTime::new(10, 1));
        assert_eq!(asset.tracks.len(), 2);
        let v = asset.first_track(MediaKind::Video).unwrap();
        assert_eq!(v.natural_size, Size::new(1280.0, 720.0));
        assert_eq!(v.nominal_frame_rate, 25.0);
        assert_eq!(v.segments.len(), 1);
        assert_eq!(v.segments[0].source_stream, 0);
        assert_eq!(asset.source_files(), vec![std::path::Path::new("/media/in.mp4")]);
    }

    #[test]
    fn test_partial_insertion_maps_source_offsets() {
        let source = source_asset();
        let mut comp = Composition::new();
        let video = comp.add_track(MediaKind::Video);
        let video_src = source.first_track(MediaKind::Video).unwrap();

        comp.insert_time_range(
            video,
            TimeRange::from_secs(2.0, 3.0).unwrap(),
            video_src,
            MediaTime::new(1, 1),
        )
        .unwrap();

        let track = &comp.tracks()[0];
        assert_eq!(track.segments.len(), 1);
        let seg = &track.segments[0];
        assert_eq!(seg.source_range.start(), MediaTime::new(2, 1));
        assert_eq!(seg.source_range.duration(), Some(MediaTime::new(3, 1)));
        assert_eq!(seg.target_start, MediaTime::new(1, 1));
        assert_eq!(track.duration, MediaTime::new(4, 1));
    }

    #[test]
    fn test_insertion_rejects_kind_mismatch_and_unknown_track() {
        let source = source_asset();
        let mut comp = Composition::new();
        let video = comp.add_track(MediaKind::Video);
        let audio_src = source.first_track(MediaKind::Audio).unwrap();

        assert!(matches!(
            comp.insert_time_range(video, TimeRange::ALL, audio_src, MediaTime::ZERO),
            Err(ModelError::KindMismatch { .. })
        ));
        assert!(matches!(
            comp.insert_time_range(TrackId(42), TimeRange::ALL, audio_src, MediaTime::ZERO),
            Err(ModelError::TrackNotFound { track: 42 })
        ));
    }

    #[test]
    fn test_empty_tracks_are_dropped_from_asset() {
        let source = source_asset();
        let mut comp = Composition::new();
        let video = comp.add_track(MediaKind::Video);
        let _audio = comp.add_track(MediaKind::Audio);
        comp.insert_time_range(
            video,
            TimeRange::ALL,
            source.first_track(MediaKind::Video).unwrap(),
            MediaTime::ZERO,
        )
        .unwrap();

        let asset = comp.to_asset();
        assert!(asset.has(MediaKind::Video));
        assert!(!asset.has(MediaKind::Audio));
    }

    #[test]
    fn test_opacity_ramp() {
        let ramp = OpacityRamp::linear(1.0, 0.0);
        assert_eq!(ramp.at(0.0), 1.0);
        assert!((ramp.at(0.25) - 0.75).abs() < 1e-6);
        assert_eq!(ramp.at(2.0), 0.0);
        assert!(OpacityRamp::constant(1.0).is_opaque());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let layer = LayerInstruction::pass_through(TrackId(1));
        let composition = VideoComposition {
            render_size: Size::new(640.0, 360.0),
            frame_duration: MediaTime::new(1, 30),
            instructions: vec![
                CompositionInstruction {
                    time_range: TimeRange::from_secs(0.0, 5.0).unwrap(),
                    layers: vec![layer.clone()],
                },
                CompositionInstruction {
                    time_range: TimeRange::from_secs(4.0, 5.0).unwrap(),
                    layers: vec![layer],
                },
            ],
            overlay: None,
        };
        assert!(composition.validate().is_err());
        assert!(composition
            .instruction_at(MediaTime::from_secs_f64(4.5))
            .is_some());
    }
}
