//! Stamp an overlay image onto a video.

use std::path::PathBuf;

use framestamp_common::AppConfig;
use framestamp_export_engine::{ExportStatus, Watermark, WatermarkPipeline};
use framestamp_media_model::{Placement, Rect};

use super::{default_output, engine, progress_printer, wait_or_cancel};

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    overlay: PathBuf,
    placement: Placement,
) -> anyhow::Result<()> {
    println!("Watermarking: {}", input.display());

    let output = output.unwrap_or_else(|| default_output(config, &input, "-watermarked", "mp4"));
    let watermark = Watermark::open(&overlay, placement)
        .map_err(|e| anyhow::anyhow!("Failed to load overlay: {e}"))?;

    println!("  Overlay: {}", overlay.display());
    println!("  Placement: {placement:?}");
    println!("  Output: {}", output.display());

    let pipeline = WatermarkPipeline::new(engine(config)?);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let session = pipeline
        .add_watermark(
            &input,
            &output,
            move || watermark,
            Some(progress_printer()),
            Box::new(move |ok, path| {
                let _ = tx.send((ok, path));
            }),
        )
        .map_err(|e| anyhow::anyhow!("Failed to start watermark: {e}"))?;

    match wait_or_cancel(&session, rx).await? {
        (true, Some(path)) => {
            println!("\nWatermark complete: {}", path.display());
            Ok(())
        }
        _ if session.status() == ExportStatus::Cancelled => {
            println!("\nWatermark cancelled");
            Ok(())
        }
        _ => match session.error() {
            Some(e) => Err(anyhow::anyhow!("Watermark failed: {e}")),
            None => Err(anyhow::anyhow!("Watermark failed")),
        },
    }
}

/// Resolve the overlay placement from flags, falling back to the config.
pub fn placement(
    config: &AppConfig,
    position: Option<String>,
    margin_x: Option<f64>,
    margin_y: Option<f64>,
    rect: Option<String>,
) -> anyhow::Result<Placement> {
    if let Some(rect) = rect {
        return Ok(Placement::Absolute(parse_rect(&rect)?));
    }

    let defaults = &config.watermark;
    let position = position.unwrap_or_else(|| defaults.position.clone());
    let margin_x = margin_x.unwrap_or(defaults.margin_x);
    let margin_y = margin_y.unwrap_or(defaults.margin_y);
    if margin_x < 0.0 || margin_y < 0.0 {
        return Err(anyhow::anyhow!("Margins must not be negative"));
    }

    Placement::from_corner(&position, margin_x, margin_y).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown position: {position}. Use: top-left, top-right, bottom-left, bottom-right"
        )
    })
}

/// Parse `x,y,w,h` into a rectangle with a bottom-left origin.
fn parse_rect(value: &str) -> anyhow::Result<Rect> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Invalid rect '{value}': {e}"))?;

    let [x, y, w, h] = parts[..] else {
        return Err(anyhow::anyhow!(
            "Invalid rect '{value}': expected x,y,w,h"
        ));
    };
    if w <= 0.0 || h <= 0.0 {
        return Err(anyhow::anyhow!(
            "Invalid rect '{value}': width and height must be positive"
        ));
    }
    Ok(Rect::new(x, y, w, h))
}
