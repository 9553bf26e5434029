//! Watermark pipeline against the in-memory engine.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};

use framestamp_common::error::ErrorCategory;
use framestamp_export_engine::{
    ExportStatus, MemoryEngine, SyntheticSource, Watermark, WatermarkPipeline,
};
use framestamp_media_model::{AffineTransform, MediaTime, Placement, Rect, Size};

const SOURCE: &str = "/virtual/beach.mp4";
const TIMEOUT: Duration = Duration::from_secs(10);
const RED_BGRA: [u8; 4] = [0, 0, 255, 255];

fn red_badge(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255]))
}

fn setup(source: SyntheticSource) -> (MemoryEngine, WatermarkPipeline) {
    let engine = MemoryEngine::new();
    engine.register(SOURCE, source);
    let pipeline = WatermarkPipeline::new(Arc::new(engine.clone()));
    (engine, pipeline)
}

fn clip() -> SyntheticSource {
    SyntheticSource::new(MediaTime::new(1, 1))
        .with_video(64, 32, 10.0)
        .with_audio(8_000, 2)
}

/// Run `add_watermark` to completion and return what the callback saw.
fn watermark(
    pipeline: &WatermarkPipeline,
    source: &Path,
    dest: &Path,
    mark: Watermark,
) -> (bool, Option<PathBuf>) {
    let (tx, rx) = mpsc::channel();
    let _ = pipeline.add_watermark(
        source,
        dest,
        move || mark,
        None,
        Box::new(move |ok, path| tx.send((ok, path)).unwrap()),
    );
    rx.recv_timeout(TIMEOUT).unwrap()
}

#[test]
fn test_overlay_lands_in_bottom_right_corner() {
    let (engine, pipeline) = setup(clip());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("marked.mp4");

    let mark = Watermark::new(
        red_badge(8, 4),
        Placement::BottomRight {
            bottom: 2.0,
            right: 2.0,
        },
    );
    let (ok, path) = watermark(&pipeline, Path::new(SOURCE), &dest, mark);
    assert!(ok);
    assert_eq!(path.as_deref(), Some(dest.as_path()));

    let stats = engine.stats();
    assert_eq!(stats.video_frames, 10);
    assert!(stats.audio_chunks > 0);
    assert_eq!(stats.frame_size, Some((64, 32)));

    // Rect (54, 2, 8, 4) from the bottom covers raster rows 26..30.
    let frame = stats.last_video_frame.unwrap();
    assert_eq!(frame.pixel(54, 26), RED_BGRA);
    assert_eq!(frame.pixel(61, 29), RED_BGRA);
    assert_ne!(frame.pixel(53, 26), RED_BGRA);
    assert_ne!(frame.pixel(54, 25), RED_BGRA);
    assert_ne!(frame.pixel(54, 30), RED_BGRA);

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&dest).unwrap()).unwrap();
    assert_eq!(manifest["optimized_for_network"], true);
    assert_eq!(manifest["format"], "mp4");
}

#[test]
fn test_absolute_placement_in_top_left() {
    let (engine, pipeline) = setup(clip());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("marked.mp4");

    let mark = Watermark::new(
        red_badge(4, 4),
        Placement::Absolute(Rect::new(0.0, 28.0, 4.0, 4.0)),
    );
    let (ok, _) = watermark(&pipeline, Path::new(SOURCE), &dest, mark);
    assert!(ok);

    let frame = engine.stats().last_video_frame.unwrap();
    assert_eq!(frame.pixel(0, 0), RED_BGRA);
    assert_eq!(frame.pixel(3, 3), RED_BGRA);
    assert_ne!(frame.pixel(4, 4), RED_BGRA);
}

#[test]
fn test_rotated_source_uses_corrected_canvas() {
    let natural = Size::new(64.0, 32.0);
    let (engine, pipeline) = setup(
        clip().with_transform(AffineTransform::for_clockwise_rotation(90, natural)),
    );
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("portrait.mp4");

    let mark = Watermark::new(
        red_badge(4, 4),
        Placement::TopLeft {
            top: 0.0,
            left: 0.0,
        },
    );
    let (ok, _) = watermark(&pipeline, Path::new(SOURCE), &dest, mark);
    assert!(ok);

    let stats = engine.stats();
    assert_eq!(stats.frame_size, Some((32, 64)));
    let frame = stats.last_video_frame.unwrap();
    assert_eq!(frame.pixel(0, 0), RED_BGRA);
}

#[test]
fn test_existing_destination_is_replaced() {
    let (_engine, pipeline) = setup(clip());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("marked.mp4");
    std::fs::write(&dest, b"stale").unwrap();

    let mark = Watermark::new(red_badge(2, 2), Placement::default());
    let (ok, _) = watermark(&pipeline, Path::new(SOURCE), &dest, mark);
    assert!(ok);
    let contents = std::fs::read(&dest).unwrap();
    assert_ne!(contents, b"stale");
}

#[test]
fn test_audio_only_source_fails_before_export() {
    let (engine, pipeline) = setup(SyntheticSource::new(MediaTime::new(1, 1)).with_audio(8_000, 1));
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("marked.mp4");

    let (tx, rx) = mpsc::channel();
    let mut provided = false;
    let result = pipeline.add_watermark(
        Path::new(SOURCE),
        &dest,
        || {
            provided = true;
            Watermark::new(red_badge(2, 2), Placement::default())
        },
        None,
        Box::new(move |ok, path| tx.send((ok, path)).unwrap()),
    );
    let err = result.err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (false, None));
    assert!(!provided);
    assert_eq!(engine.stats().writers_created, 0);
    assert!(!dest.exists());
}

#[test]
fn test_unknown_source_fails() {
    let (_engine, pipeline) = setup(clip());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("marked.mp4");

    let mark = Watermark::new(red_badge(2, 2), Placement::default());
    let (ok, path) = watermark(&pipeline, Path::new("/virtual/missing.mp4"), &dest, mark);
    assert!(!ok);
    assert!(path.is_none());
}

#[test]
fn test_destination_equal_to_source_is_rejected() {
    let (_engine, pipeline) = setup(clip());

    let mark = Watermark::new(red_badge(2, 2), Placement::default());
    let (ok, path) = watermark(&pipeline, Path::new(SOURCE), Path::new(SOURCE), mark);
    assert!(!ok);
    assert!(path.is_none());
}

#[test]
fn test_returned_session_can_cancel() {
    let (engine, pipeline) = setup(
        SyntheticSource::new(MediaTime::new(5, 1)).with_video(32, 32, 30.0),
    );
    engine.ready_gate().close();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("cancelled.mp4");

    let (tx, rx) = mpsc::channel();
    let session = pipeline
        .add_watermark(
            Path::new(SOURCE),
            &dest,
            || Watermark::new(red_badge(2, 2), Placement::default()),
            None,
            Box::new(move |ok, path| tx.send((ok, path)).unwrap()),
        )
        .unwrap();
    session.cancel();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (false, None));
    assert_eq!(session.status(), ExportStatus::Cancelled);
    assert!(!dest.exists());
    engine.ready_gate().open();
}

#[tokio::test]
async fn test_async_resolves_to_destination() {
    let (_engine, pipeline) = setup(clip());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("async.mp4");

    let mark = Watermark::new(red_badge(4, 4), Placement::default());
    let path = pipeline
        .add_watermark_async(Path::new(SOURCE), &dest, mark, None)
        .await
        .unwrap();
    assert_eq!(path, dest);
    assert!(dest.exists());
}

#[tokio::test]
async fn test_async_failure_keeps_category() {
    let (engine, pipeline) = setup(clip());
    engine.set_faults(framestamp_export_engine::memory::FaultPlan {
        writer_fail_after: Some(1),
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("broken.mp4");

    let mark = Watermark::new(red_badge(4, 4), Placement::default());
    let err = pipeline
        .add_watermark_async(Path::new(SOURCE), &dest, mark, None)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Pump);
    assert!(!dest.exists());
}
