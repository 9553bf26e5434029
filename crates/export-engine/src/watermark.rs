//! Burn an overlay image into every frame of a video.
//!
//! The pipeline re-composes the source onto fresh tracks, fits the video to
//! its orientation-corrected canvas, places the overlay on top, and exports
//! the result as network-optimized MP4 through an [`ExportSession`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::RgbaImage;

use framestamp_common::error::{FramestampError, FramestampResult};
use framestamp_media_model::{
    Composition, ContainerFormat, MediaAsset, MediaKind, MediaTime, OverlayDescription,
    Placement, TimeRange,
};

use crate::compositor::build_default_composition;
use crate::engine::MediaEngine;
use crate::lock;
use crate::session::{
    ExportReport, ExportRequest, ExportSession, ExportStatus, ProgressCallback,
};

/// Called once with `(success, output path)`.
pub type WatermarkCompletion = Box<dyn FnOnce(bool, Option<PathBuf>) + Send>;

/// An overlay image and where it goes.
#[derive(Debug, Clone)]
pub struct Watermark {
    pub image: RgbaImage,
    pub placement: Placement,
}

impl Watermark {
    pub fn new(image: RgbaImage, placement: Placement) -> Self {
        Self { image, placement }
    }

    /// Load an image file (PNG) as the overlay.
    pub fn open(path: &Path, placement: Placement) -> FramestampResult<Self> {
        if !path.exists() {
            return Err(FramestampError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let image = image::open(path)
            .map_err(|e| {
                FramestampError::configuration(format!(
                    "cannot decode overlay {}: {e}",
                    path.display()
                ))
            })?
            .to_rgba8();
        Ok(Self::new(image, placement))
    }
}

/// Builds watermark compositions and runs them through export sessions.
#[derive(Clone)]
pub struct WatermarkPipeline {
    engine: Arc<dyn MediaEngine>,
}

impl WatermarkPipeline {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Start watermarking `source` into `destination`.
    ///
    /// `on_complete` receives `(true, Some(destination))` only when the
    /// export completed and the file exists. Failures detected before the
    /// export starts are reported through `on_complete(false, None)` and also
    /// returned. The returned session can be used to cancel or poll progress.
    pub fn add_watermark<P>(
        &self,
        source: &Path,
        destination: &Path,
        overlay_provider: P,
        on_progress: Option<ProgressCallback>,
        on_complete: WatermarkCompletion,
    ) -> FramestampResult<ExportSession>
    where
        P: FnOnce() -> Watermark,
    {
        let slot = Arc::new(Mutex::new(Some(on_complete)));
        let report_slot = Arc::clone(&slot);
        let expected = destination.to_path_buf();

        let started = self.start(
            source,
            destination,
            overlay_provider,
            on_progress,
            Box::new(move |report: ExportReport| {
                let outcome = watermark_outcome(&report, &expected);
                let callback = lock(&report_slot).take();
                if let Some(callback) = callback {
                    match outcome {
                        Ok(path) => callback(true, Some(path)),
                        Err(_) => callback(false, None),
                    }
                }
            }),
        );

        if let Err(e) = &started {
            tracing::warn!(
                source = %source.display(),
                error = %e,
                "Watermark could not start"
            );
            let callback = lock(&slot).take();
            if let Some(callback) = callback {
                callback(false, None);
            }
        }
        started
    }

    /// Watermark `source` into `destination`, resolving to the output path.
    pub async fn add_watermark_async(
        &self,
        source: &Path,
        destination: &Path,
        watermark: Watermark,
        on_progress: Option<ProgressCallback>,
    ) -> FramestampResult<PathBuf> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let expected = destination.to_path_buf();
        self.start(
            source,
            destination,
            move || watermark,
            on_progress,
            Box::new(move |report: ExportReport| {
                let _ = tx.send(watermark_outcome(&report, &expected));
            }),
        )?;
        rx.await
            .map_err(|_| FramestampError::engine("export thread ended without a report"))?
    }

    fn start<P>(
        &self,
        source: &Path,
        destination: &Path,
        overlay_provider: P,
        on_progress: Option<ProgressCallback>,
        on_report: Box<dyn FnOnce(ExportReport) + Send>,
    ) -> FramestampResult<ExportSession>
    where
        P: FnOnce() -> Watermark,
    {
        let asset = self.engine.load_asset(source).map_err(|e| {
            FramestampError::configuration(format!("cannot load {}: {e}", source.display()))
        })?;
        let video = asset
            .first_track(MediaKind::Video)
            .ok_or_else(|| {
                FramestampError::configuration(format!(
                    "{} has no video track",
                    source.display()
                ))
            })?;
        if video.natural_size.is_empty() {
            return Err(FramestampError::configuration(format!(
                "{} has an empty video frame",
                source.display()
            )));
        }

        let watermark = overlay_provider();
        let composed = recompose(&asset)?;
        let composed_video = composed
            .first_track(MediaKind::Video)
            .ok_or_else(|| FramestampError::configuration("re-composition lost the video track"))?;

        let mut composition =
            build_default_composition(composed_video, None, None, composed.duration)?;
        let overlay = OverlayDescription::new(watermark.image, watermark.placement)
            .resolve(composition.render_size);
        tracing::debug!(
            x = overlay.frame.x,
            y = overlay.frame.y,
            width = overlay.frame.width,
            height = overlay.frame.height,
            "Resolved watermark placement"
        );
        composition.overlay = Some(overlay);

        if same_file(source, destination) {
            return Err(FramestampError::configuration(format!(
                "destination {} is the source",
                destination.display()
            )));
        }
        if destination.exists() {
            std::fs::remove_file(destination)?;
        }

        tracing::info!(
            source = %source.display(),
            output = %destination.display(),
            "Starting watermark export"
        );

        let session = ExportSession::new(Arc::clone(&self.engine), composed);
        let request = ExportRequest::new(destination)
            .with_format(ContainerFormat::Mp4)
            .with_composition(composition)
            .optimized_for_network(true);
        session.export(request, on_progress, on_report)?;
        Ok(session)
    }
}

/// Copy the full video (and audio, if any) of `asset` onto fresh tracks.
fn recompose(asset: &MediaAsset) -> FramestampResult<MediaAsset> {
    let mut composition = Composition::new();
    for kind in [MediaKind::Video, MediaKind::Audio] {
        let Some(track) = asset.first_track(kind) else {
            continue;
        };
        let range = TimeRange::new(MediaTime::ZERO, track.duration)
            .map_err(|e| FramestampError::configuration(e.to_string()))?;
        let id = composition.add_track(kind);
        composition
            .insert_time_range(id, range, track, MediaTime::ZERO)
            .map_err(|e| FramestampError::configuration(e.to_string()))?;
    }
    Ok(composition.to_asset())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn watermark_outcome(report: &ExportReport, destination: &Path) -> FramestampResult<PathBuf> {
    match (report.status, &report.error) {
        (ExportStatus::Completed, _) if destination.exists() => Ok(destination.to_path_buf()),
        (ExportStatus::Completed, _) => Err(FramestampError::engine(format!(
            "export completed but {} is missing",
            destination.display()
        ))),
        (ExportStatus::Cancelled, _) => Err(FramestampError::Cancelled),
        (_, Some(error)) => Err(detach(error)),
        (status, None) => Err(FramestampError::engine(format!(
            "export ended as {status:?}"
        ))),
    }
}

/// Owned copy of a shared error, keeping its category.
fn detach(error: &FramestampError) -> FramestampError {
    match error {
        FramestampError::Configuration { message } => FramestampError::configuration(message.clone()),
        FramestampError::OpenFailure { message } => FramestampError::open_failure(message.clone()),
        FramestampError::PumpFailure { message } => FramestampError::pump_failure(message.clone()),
        FramestampError::Cancelled => FramestampError::Cancelled,
        FramestampError::FileNotFound { path } => FramestampError::FileNotFound { path: path.clone() },
        other => FramestampError::engine(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framestamp_common::error::ErrorCategory;
    use framestamp_media_model::{AffineTransform, Size, TrackId};

    use crate::memory::{MemoryEngine, SyntheticSource};

    #[test]
    fn test_recompose_keeps_video_and_audio() {
        let engine = MemoryEngine::new();
        let asset = engine.register(
            "/virtual/clip.mp4",
            SyntheticSource::new(MediaTime::new(2, 1))
                .with_video(64, 32, 10.0)
                .with_audio(8_000, 1),
        );
        let composed = recompose(&asset).unwrap();
        assert_eq!(composed.tracks.len(), 2);
        assert_eq!(composed.duration, MediaTime::new(2, 1));
        let video = composed.first_track(MediaKind::Video).unwrap();
        assert_eq!(video.id, TrackId(1));
        assert_eq!(video.natural_size, Size::new(64.0, 32.0));
        assert_eq!(video.segments.len(), 1);
        assert!(composed.has(MediaKind::Audio));
    }

    #[test]
    fn test_recompose_preserves_orientation() {
        let engine = MemoryEngine::new();
        let natural = Size::new(64.0, 32.0);
        let asset = engine.register(
            "/virtual/portrait.mp4",
            SyntheticSource::new(MediaTime::new(1, 1))
                .with_video(64, 32, 10.0)
                .with_transform(AffineTransform::for_clockwise_rotation(90, natural)),
        );
        let composed = recompose(&asset).unwrap();
        let video = composed.first_track(MediaKind::Video).unwrap();
        assert!(video.preferred_transform.is_quarter_turn());
        assert!(!composed.has(MediaKind::Audio));
    }

    #[test]
    fn test_outcome_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let report = ExportReport {
            status: ExportStatus::Completed,
            error: None,
            output_path: Some(dest.clone()),
        };
        assert!(watermark_outcome(&report, &dest).is_err());

        std::fs::write(&dest, b"mp4").unwrap();
        assert_eq!(watermark_outcome(&report, &dest).unwrap(), dest);
    }

    #[test]
    fn test_outcome_keeps_error_category() {
        let report = ExportReport {
            status: ExportStatus::Failed,
            error: Some(Arc::new(FramestampError::pump_failure("append rejected"))),
            output_path: None,
        };
        let err = watermark_outcome(&report, Path::new("/nowhere.mp4")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Pump);

        let cancelled = ExportReport {
            status: ExportStatus::Cancelled,
            error: None,
            output_path: None,
        };
        let err = watermark_outcome(&cancelled, Path::new("/nowhere.mp4")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }
}
