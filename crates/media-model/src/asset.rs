//! Opened media assets and their tracks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::geometry::{AffineTransform, Size};
use crate::time::{MediaTime, TimeRange};

/// Kind of samples a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a track within one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

/// Where a stretch of a track's media comes from.
///
/// A track opened straight from a container has a single segment that maps
/// the container stream onto itself. Re-compositions stitch segments of
/// other assets together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSegment {
    /// Container file holding the samples.
    pub source: PathBuf,

    /// Stream index inside `source`.
    pub source_stream: u32,

    /// Range of the source stream used (always finite).
    pub source_range: TimeRange,

    /// Where the segment starts on this track's timeline.
    pub target_start: MediaTime,
}

impl TrackSegment {
    /// Range this segment occupies on the owning track's timeline.
    pub fn target_range(&self) -> TimeRange {
        let duration = self.source_range.duration().unwrap_or(MediaTime::ZERO);
        TimeRange::new(self.target_start, duration).unwrap_or(TimeRange::ALL)
    }
}

/// One track of a media asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTrack {
    pub id: TrackId,
    pub kind: MediaKind,

    /// Length of the track's timeline.
    pub duration: MediaTime,

    /// Stored frame size (video only).
    #[serde(default)]
    pub natural_size: Size,

    /// Display orientation of stored frames (video only).
    #[serde(default)]
    pub preferred_transform: AffineTransform,

    /// Nominal frames per second; 0 when unknown.
    #[serde(default)]
    pub nominal_frame_rate: f64,

    /// Sample rate in Hz (audio only).
    #[serde(default)]
    pub sample_rate: u32,

    /// Channel count (audio only).
    #[serde(default)]
    pub channels: u16,

    /// Media backing this track, in timeline order.
    pub segments: Vec<TrackSegment>,
}

impl AssetTrack {
    /// A video track read directly from `source` stream `stream`.
    pub fn video(
        id: TrackId,
        source: impl Into<PathBuf>,
        stream: u32,
        duration: MediaTime,
        natural_size: Size,
        nominal_frame_rate: f64,
    ) -> Self {
        Self {
            id,
            kind: MediaKind::Video,
            duration,
            natural_size,
            preferred_transform: AffineTransform::IDENTITY,
            nominal_frame_rate,
            sample_rate: 0,
            channels: 0,
            segments: vec![direct_segment(source.into(), stream, duration)],
        }
    }

    /// An audio track read directly from `source` stream `stream`.
    pub fn audio(
        id: TrackId,
        source: impl Into<PathBuf>,
        stream: u32,
        duration: MediaTime,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            id,
            kind: MediaKind::Audio,
            duration,
            natural_size: Size::ZERO,
            preferred_transform: AffineTransform::IDENTITY,
            nominal_frame_rate: 0.0,
            sample_rate,
            channels,
            segments: vec![direct_segment(source.into(), stream, duration)],
        }
    }

    pub fn with_preferred_transform(mut self, transform: AffineTransform) -> Self {
        self.preferred_transform = transform;
        self
    }
}

fn direct_segment(source: PathBuf, stream: u32, duration: MediaTime) -> TrackSegment {
    TrackSegment {
        source,
        source_stream: stream,
        source_range: TimeRange::new(MediaTime::ZERO, duration).unwrap_or(TimeRange::ALL),
        target_start: MediaTime::ZERO,
    }
}

/// An opened media container (or a re-composition of several).
///
/// Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Where the asset was opened from, if it is a single container.
    pub location: Option<PathBuf>,

    /// Overall duration.
    pub duration: MediaTime,

    /// Tracks in container order.
    pub tracks: Vec<AssetTrack>,
}

impl MediaAsset {
    pub fn new(location: Option<PathBuf>, duration: MediaTime, tracks: Vec<AssetTrack>) -> Self {
        Self {
            location,
            duration,
            tracks,
        }
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &AssetTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn first_track(&self, kind: MediaKind) -> Option<&AssetTrack> {
        self.tracks_of(kind).next()
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.first_track(kind).is_some()
    }

    pub fn track(&self, id: TrackId) -> Option<&AssetTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Stored frame size of the first video track, or zero without video.
    pub fn natural_size(&self) -> Size {
        self.first_track(MediaKind::Video)
            .map(|t| t.natural_size)
            .unwrap_or(Size::ZERO)
    }

    /// Every container file this asset reads from.
    pub fn source_files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = Vec::new();
        if let Some(location) = &self.location {
            files.push(location.as_path());
        }
        for segment in self.tracks.iter().flat_map(|t| t.segments.iter()) {
            if !files.contains(&segment.source.as_path()) {
                files.push(segment.source.as_path());
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_asset() -> MediaAsset {
        let duration = MediaTime::new(10, 1);
        MediaAsset::new(
            Some(PathBuf::from("/media/clip.mp4")),
            duration,
            vec![
                AssetTrack::video(
                    TrackId(1),
                    "/media/clip.mp4",
                    0,
                    duration,
                    Size::new(1920.0, 1080.0),
                    30.0,
                ),
                AssetTrack::audio(TrackId(2), "/media/clip.mp4", 1, duration, 48_000, 2),
            ],
        )
    }

    #[test]
    fn test_track_lookup() {
        let asset = sample_asset();
        assert!(asset.has(MediaKind::Video));
        assert!(asset.has(MediaKind::Audio));
        assert_eq!(asset.natural_size(), Size::new(1920.0, 1080.0));
        assert_eq!(asset.track(TrackId(2)).unwrap().sample_rate, 48_000);
        assert!(asset.track(TrackId(9)).is_none());
    }

    #[test]
    fn test_source_files_are_deduplicated() {
        let asset = sample_asset();
        assert_eq!(asset.source_files(), vec![Path::new("/media/clip.mp4")]);
    }

    #[test]
    fn test_audio_only_has_zero_natural_size() {
        let duration = MediaTime::new(3, 1);
        let asset = MediaAsset::new(
            None,
            duration,
            vec![AssetTrack::audio(TrackId(1), "/a.m4a", 0, duration, 44_100, 2)],
        );
        assert!(asset.natural_size().is_empty());
    }
}
