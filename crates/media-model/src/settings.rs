//! Encoder settings for output tracks and containers.

use serde::{Deserialize, Serialize};

use crate::asset::MediaKind;
use crate::geometry::Size;

/// Output video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
}

/// Output audio codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
}

/// Video encoder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Codec to encode with.
    pub codec: VideoCodec,

    /// Target average bitrate in bits per second.
    pub average_bit_rate: u32,

    /// Output frame rate. `None` follows the composition's frame duration.
    #[serde(default)]
    pub frame_rate: Option<f64>,

    /// Maximum distance between keyframes, in frames.
    pub max_keyframe_interval: u32,

    /// Output width; filled from the source when absent.
    #[serde(default)]
    pub width: Option<u32>,

    /// Output height; filled from the source when absent.
    #[serde(default)]
    pub height: Option<u32>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            average_bit_rate: 3_000_000,
            frame_rate: None,
            max_keyframe_interval: 30,
            width: None,
            height: None,
        }
    }
}

impl VideoSettings {
    /// Explicit output size, if both dimensions are set.
    pub fn output_size(&self) -> Option<Size> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Size::new(w as f64, h as f64)),
            _ => None,
        }
    }

    /// Fill absent width/height from `size`, leaving explicit values alone.
    pub fn fill_size_from(&mut self, size: Size) {
        if self.output_size().is_none() {
            let (w, h) = size.to_pixels();
            self.width = Some(w);
            self.height = Some(h);
        }
    }
}

/// Audio encoder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub codec: AudioCodec,
    pub channels: u16,
    pub sample_rate: u32,
    /// Bitrate per channel in bits per second.
    pub bit_rate_per_channel: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            channels: 2,
            sample_rate: 44_100,
            bit_rate_per_channel: 32_000,
        }
    }
}

impl AudioSettings {
    pub fn total_bit_rate(&self) -> u32 {
        self.bit_rate_per_channel * self.channels as u32
    }
}

/// Settings for one writer input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrackSettings {
    Video(VideoSettings),
    Audio(AudioSettings),
}

impl TrackSettings {
    pub fn kind(&self) -> MediaKind {
        match self {
            TrackSettings::Video(_) => MediaKind::Video,
            TrackSettings::Audio(_) => MediaKind::Audio,
        }
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    M4a,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::M4a => "m4a",
        }
    }

    /// Whether the container can carry a video track.
    pub fn supports_video(self) -> bool {
        !matches!(self, ContainerFormat::M4a)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mp4" => Some(ContainerFormat::Mp4),
            "mov" | "quicktime" => Some(ContainerFormat::Mov),
            "m4a" => Some(ContainerFormat::M4a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let video = VideoSettings::default();
        assert_eq!(video.codec, VideoCodec::H264);
        assert_eq!(video.average_bit_rate, 3_000_000);
        assert_eq!(video.max_keyframe_interval, 30);
        assert!(video.output_size().is_none());

        let audio = AudioSettings::default();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 44_100);
        assert_eq!(audio.total_bit_rate(), 64_000);
    }

    #[test]
    fn test_fill_size_only_when_absent() {
        let mut settings = VideoSettings::default();
        settings.fill_size_from(Size::new(1080.0, 1920.0));
        assert_eq!(settings.output_size(), Some(Size::new(1080.0, 1920.0)));

        let mut explicit = VideoSettings {
            width: Some(640),
            height: Some(360),
            ..VideoSettings::default()
        };
        explicit.fill_size_from(Size::new(1920.0, 1080.0));
        assert_eq!(explicit.output_size(), Some(Size::new(640.0, 360.0)));
    }

    #[test]
    fn test_settings_deserialize_with_missing_optionals() {
        let json = r#"{"kind":"video","codec":"hevc","average_bit_rate":8000000,"max_keyframe_interval":60}"#;
        let parsed: TrackSettings = serde_json::from_str(json).unwrap();
        match parsed {
            TrackSettings::Video(v) => {
                assert_eq!(v.codec, VideoCodec::Hevc);
                assert!(v.width.is_none());
                assert!(v.frame_rate.is_none());
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn test_container_parse() {
        assert_eq!(ContainerFormat::parse("MP4"), Some(ContainerFormat::Mp4));
        assert_eq!(ContainerFormat::parse("quicktime"), Some(ContainerFormat::Mov));
        assert_eq!(ContainerFormat::parse("avi"), None);
        assert!(!ContainerFormat::M4a.supports_video());
    }
}
