//! Check that the media tools are installed.

use framestamp_common::{config_file_path, AppConfig};
use framestamp_export_engine::FfmpegEngine;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Framestamp System Check");
    println!("{}", "=".repeat(50));

    let config_path = config_file_path();
    if config_path.exists() {
        println!("[OK] Config: {}", config_path.display());
    } else {
        println!("[OK] Config: defaults ({} not found)", config_path.display());
    }
    println!("     Output directory: {}", config.output_dir.display());

    let availability = FfmpegEngine::from_config(&config.engine).availability();
    for (binary, available) in &availability {
        if *available {
            println!("[OK] {binary} found");
        } else {
            println!("[WARN] {binary} not found on PATH");
        }
    }

    println!();
    if availability.iter().all(|(_, ok)| *ok) {
        println!("All media tools are available. Framestamp is ready.");
    } else {
        println!("Install ffmpeg (which ships ffprobe) or set engine paths in the config file.");
    }

    Ok(())
}
