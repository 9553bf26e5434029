pub mod check;
pub mod info;
pub mod transcode;
pub mod watermark;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use framestamp_common::AppConfig;
use framestamp_export_engine::{ExportSession, FfmpegEngine, MediaEngine, ProgressCallback};
use tokio::sync::oneshot;

/// ffmpeg engine configured from `config`, or an error pointing at `check`.
pub(crate) fn engine(config: &AppConfig) -> anyhow::Result<Arc<dyn MediaEngine>> {
    let engine = FfmpegEngine::from_config(&config.engine);
    if let Some((binary, _)) = engine.availability().into_iter().find(|(_, ok)| !ok) {
        return Err(anyhow::anyhow!(
            "{binary} not found. Run `framestamp check` for details"
        ));
    }
    tracing::debug!(
        ffmpeg = %config.engine.ffmpeg,
        ffprobe = %config.engine.ffprobe,
        "Using ffmpeg engine"
    );
    Ok(Arc::new(engine))
}

/// `<output_dir>/<input stem><suffix>.<extension>`.
pub(crate) fn default_output(
    config: &AppConfig,
    input: &Path,
    suffix: &str,
    extension: &str,
) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    config
        .output_dir
        .join(format!("{stem}{suffix}.{extension}"))
}

pub(crate) fn progress_printer() -> ProgressCallback {
    Box::new(|progress| {
        print!("\r  Progress: {:.1}%  ", progress * 100.0);
    })
}

/// Wait for an export to report, cancelling it on Ctrl-C.
pub(crate) async fn wait_or_cancel<T>(
    session: &ExportSession,
    mut done: oneshot::Receiver<T>,
) -> anyhow::Result<T> {
    tokio::select! {
        outcome = &mut done => {
            outcome.map_err(|_| anyhow::anyhow!("Export ended without reporting"))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; cancelling export");
            println!("\n  Cancelling...");
            session.cancel();
            done.await
                .map_err(|_| anyhow::anyhow!("Export ended without reporting"))
        }
    }
}
