//! Re-encode a media file.

use std::path::PathBuf;

use framestamp_common::AppConfig;
use framestamp_export_engine::{ExportRequest, ExportSession, ExportStatus};
use framestamp_media_model::{ContainerFormat, MediaTime, TimeRange, VideoSettings};

use super::{default_output, engine, progress_printer, wait_or_cancel};

/// Encoding flags of the `transcode` command.
#[derive(Debug, Clone, Default)]
pub struct TranscodeOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub start: Option<f64>,
    pub duration: Option<f64>,
    pub bitrate_kbps: Option<u32>,
    pub format: String,
}

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    options: TranscodeOptions,
) -> anyhow::Result<()> {
    println!("Transcoding: {}", input.display());

    let format = ContainerFormat::parse(&options.format).ok_or_else(|| {
        anyhow::anyhow!("Unknown format: {}. Use: mp4, mov, m4a", options.format)
    })?;
    let output = output.unwrap_or_else(|| default_output(config, &input, "", format.extension()));
    let request = build_request(output.clone(), format, &options)?;

    let session = ExportSession::open(engine(config)?, &input)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", input.display()))?;

    println!("  Output: {}", output.display());
    println!("  Format: {format:?}");
    if let Some(size) = request.video_settings.as_ref().and_then(|s| s.output_size()) {
        println!("  Resolution: {}x{}", size.width, size.height);
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    session
        .export(
            request,
            Some(progress_printer()),
            Box::new(move |report| {
                let _ = tx.send(report);
            }),
        )
        .map_err(|e| anyhow::anyhow!("Failed to start export: {e}"))?;

    let report = wait_or_cancel(&session, rx).await?;
    match report.status {
        ExportStatus::Completed => {
            println!("\nExport complete: {}", output.display());
            Ok(())
        }
        ExportStatus::Cancelled => {
            println!("\nExport cancelled");
            Ok(())
        }
        _ => match report.error {
            Some(e) => Err(anyhow::anyhow!("Export failed: {e}")),
            None => Err(anyhow::anyhow!("Export failed")),
        },
    }
}

fn build_request(
    output: PathBuf,
    format: ContainerFormat,
    options: &TranscodeOptions,
) -> anyhow::Result<ExportRequest> {
    let mut request = ExportRequest::new(output)
        .with_format(format)
        .with_time_range(time_range(options.start, options.duration)?);

    if options.width.is_some() || options.bitrate_kbps.is_some() {
        if !format.supports_video() {
            return Err(anyhow::anyhow!(
                "--width/--height/--bitrate need a video container, not {}",
                format.extension()
            ));
        }
        let mut settings = VideoSettings {
            width: options.width,
            height: options.height,
            ..VideoSettings::default()
        };
        if let Some(kbps) = options.bitrate_kbps {
            settings.average_bit_rate = kbps.saturating_mul(1000);
        }
        request = request.with_video_settings(settings);
    }
    Ok(request)
}

fn time_range(start: Option<f64>, duration: Option<f64>) -> anyhow::Result<TimeRange> {
    if start.is_some_and(|s| s < 0.0) {
        return Err(anyhow::anyhow!("--start must not be negative"));
    }
    let range = match (start, duration) {
        (None, None) => TimeRange::ALL,
        (start, Some(duration)) => TimeRange::from_secs(start.unwrap_or(0.0), duration)?,
        (Some(start), None) => TimeRange::starting_at(MediaTime::from_secs_f64(start)),
    };
    Ok(range)
}
