//! Rational media time and time ranges.
//!
//! Timestamps are kept as `value / timescale` so that frame-accurate
//! arithmetic never drifts through floating point.

use std::cmp::Ordering;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// A point (or length) on a media timeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaTime {
    /// Numerator, in units of `1 / timescale` seconds.
    pub value: i64,
    /// Units per second. Always > 0.
    pub timescale: u32,
}

impl MediaTime {
    /// Zero seconds.
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1,
    };

    /// Timescale used when converting from floating-point seconds.
    pub const DEFAULT_TIMESCALE: u32 = 90_000;

    /// Create a time of `value / timescale` seconds. A zero timescale is
    /// treated as 1.
    pub fn new(value: i64, timescale: u32) -> Self {
        Self {
            value,
            timescale: timescale.max(1),
        }
    }

    /// Convert floating-point seconds using [`Self::DEFAULT_TIMESCALE`].
    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from_secs_f64_with_timescale(secs, Self::DEFAULT_TIMESCALE)
    }

    pub fn from_secs_f64_with_timescale(secs: f64, timescale: u32) -> Self {
        let timescale = timescale.max(1);
        Self {
            value: (secs * timescale as f64).round() as i64,
            timescale,
        }
    }

    pub fn from_millis(ms: i64) -> Self {
        Self::new(ms, 1000)
    }

    /// Duration of one frame at `fps`. Integral rates are exact; NTSC-style
    /// fractional rates (29.97, 59.94) land on a 90 kHz clock.
    pub fn frame_duration(fps: f64) -> Self {
        if fps <= 0.0 || !fps.is_finite() {
            return Self::new(1, 30);
        }
        if fps.fract() == 0.0 && fps <= u32::MAX as f64 {
            Self::new(1, fps as u32)
        } else {
            Self::from_secs_f64(1.0 / fps)
        }
    }

    pub fn as_secs_f64(self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    pub fn is_zero(self) -> bool {
        self.value == 0
    }

    pub fn is_negative(self) -> bool {
        self.value < 0
    }

    /// Express this time in another timescale, rounding to nearest.
    pub fn rescale(self, timescale: u32) -> Self {
        let timescale = timescale.max(1);
        if timescale == self.timescale {
            return self;
        }
        let num = self.value as i128 * timescale as i128;
        let den = self.timescale as i128;
        let rounded = if num >= 0 {
            (num + den / 2) / den
        } else {
            (num - den / 2) / den
        };
        Self {
            value: rounded as i64,
            timescale,
        }
    }

    /// Frames per second implied by treating this value as a frame duration.
    pub fn as_frame_rate(self) -> f64 {
        if self.value <= 0 {
            return 0.0;
        }
        self.timescale as f64 / self.value as f64
    }

    pub fn min(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }

    pub fn max(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }

    fn common_timescale(a: u32, b: u32) -> u32 {
        if a == b {
            return a;
        }
        let lcm = a as u64 / gcd(a as u64, b as u64) * b as u64;
        if lcm <= u32::MAX as u64 {
            lcm as u32
        } else {
            a.max(b)
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: Self) -> Self::Output {
        let ts = Self::common_timescale(self.timescale, rhs.timescale);
        let a = self.rescale(ts);
        let b = rhs.rescale(ts);
        MediaTime::new(a.value.saturating_add(b.value), ts)
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: Self) -> Self::Output {
        let ts = Self::common_timescale(self.timescale, rhs.timescale);
        let a = self.rescale(ts);
        let b = rhs.rescale(ts);
        MediaTime::new(a.value.saturating_sub(b.value), ts)
    }
}

/// A half-open range `[start, start + duration)`.
///
/// `duration == None` is the unbounded sentinel: the range extends to the
/// end of whatever media it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: MediaTime,
    duration: Option<MediaTime>,
}

impl TimeRange {
    /// Everything, from zero to the end of the media.
    pub const ALL: TimeRange = TimeRange {
        start: MediaTime::ZERO,
        duration: None,
    };

    /// A finite range. Negative durations are rejected.
    pub fn new(start: MediaTime, duration: MediaTime) -> Result<Self, ModelError> {
        if duration.is_negative() {
            return Err(ModelError::InvalidTimeRange {
                message: format!("duration {:.3}s is negative", duration.as_secs_f64()),
            });
        }
        Ok(Self {
            start,
            duration: Some(duration),
        })
    }

    /// An unbounded range beginning at `start`.
    pub fn starting_at(start: MediaTime) -> Self {
        Self {
            start,
            duration: None,
        }
    }

    pub fn from_secs(start_secs: f64, duration_secs: f64) -> Result<Self, ModelError> {
        Self::new(
            MediaTime::from_secs_f64(start_secs),
            MediaTime::from_secs_f64(duration_secs),
        )
    }

    pub fn start(&self) -> MediaTime {
        self.start
    }

    /// Finite duration, or `None` for the unbounded sentinel.
    pub fn duration(&self) -> Option<MediaTime> {
        self.duration
    }

    pub fn is_unbounded(&self) -> bool {
        self.duration.is_none()
    }

    pub fn end(&self) -> Option<MediaTime> {
        self.duration.map(|d| self.start + d)
    }

    pub fn contains(&self, t: MediaTime) -> bool {
        t >= self.start && self.end().map_or(true, |end| t < end)
    }

    /// Resolve the unbounded sentinel against a media duration.
    pub fn bounded_by(&self, media_duration: MediaTime) -> TimeRange {
        match self.duration {
            Some(_) => *self,
            None => {
                let duration = if media_duration > self.start {
                    media_duration - self.start
                } else {
                    MediaTime::ZERO
                };
                TimeRange {
                    start: self.start,
                    duration: Some(duration),
                }
            }
        }
    }

    /// Overlap of two finite ranges, if any.
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = match (self.end(), other.end()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match end {
            Some(end) if end <= start => None,
            Some(end) => Some(TimeRange {
                start,
                duration: Some(end - start),
            }),
            None => Some(TimeRange::starting_at(start)),
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_timescale_equality() {
        assert_eq!(MediaTime::new(1, 2), MediaTime::new(300, 600));
        assert!(MediaTime::new(1, 30) < MediaTime::new(1, 25));
    }

    #[test]
    fn test_subtraction_is_exact() {
        let a = MediaTime::new(7, 30);
        let b = MediaTime::new(1, 25);
        let diff = a - b;
        // 7/30 - 1/25 = 35/150 - 6/150 = 29/150
        assert_eq!(diff, MediaTime::new(29, 150));
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let t = MediaTime::new(1, 3).rescale(1000);
        assert_eq!(t.value, 333);
        let t = MediaTime::new(-1, 3).rescale(1000);
        assert_eq!(t.value, -333);
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(MediaTime::frame_duration(30.0), MediaTime::new(1, 30));
        let ntsc = MediaTime::frame_duration(29.97);
        assert!((ntsc.as_frame_rate() - 29.97).abs() < 0.01);
        assert_eq!(MediaTime::frame_duration(0.0), MediaTime::new(1, 30));
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(TimeRange::new(MediaTime::ZERO, MediaTime::new(-1, 30)).is_err());
        assert!(TimeRange::new(MediaTime::ZERO, MediaTime::ZERO).is_ok());
    }

    #[test]
    fn test_unbounded_range() {
        let range = TimeRange::starting_at(MediaTime::new(2, 1));
        assert!(range.is_unbounded());
        assert!(range.contains(MediaTime::new(1000, 1)));
        assert!(!range.contains(MediaTime::new(1, 1)));

        let bounded = range.bounded_by(MediaTime::new(10, 1));
        assert_eq!(bounded.duration(), Some(MediaTime::new(8, 1)));
    }

    #[test]
    fn test_intersection() {
        let a = TimeRange::from_secs(0.0, 10.0).unwrap();
        let b = TimeRange::from_secs(4.0, 10.0).unwrap();
        let overlap = a.intersection(&b).unwrap();
        assert_eq!(overlap.start(), MediaTime::new(4, 1));
        assert_eq!(overlap.duration(), Some(MediaTime::new(6, 1)));

        let c = TimeRange::from_secs(10.0, 1.0).unwrap();
        assert!(a.intersection(&c).is_none());

        let open = TimeRange::starting_at(MediaTime::new(3, 1));
        let clipped = a.intersection(&open).unwrap();
        assert_eq!(clipped.end(), Some(MediaTime::new(10, 1)));
    }
}
