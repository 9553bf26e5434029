//! Framestamp CLI: watermark, transcode, and inspect video files.
//!
//! Usage:
//!   framestamp watermark <INPUT> --overlay <PNG>   Stamp an image onto every frame
//!   framestamp transcode <INPUT>                   Re-encode into MP4, MOV, or M4A
//!   framestamp info <INPUT>                        Show tracks of a media file
//!   framestamp check                               Check for ffmpeg/ffprobe

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "framestamp",
    about = "Watermark and re-encode video files",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stamp an overlay image onto every frame of a video
    Watermark {
        /// Source video
        input: PathBuf,

        /// Output file (defaults to the configured output directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overlay image (PNG with alpha)
        #[arg(long)]
        overlay: PathBuf,

        /// Corner to anchor the overlay: top-left, top-right, bottom-left, bottom-right
        #[arg(long)]
        position: Option<String>,

        /// Horizontal margin from the anchored edge, in pixels
        #[arg(long)]
        margin_x: Option<f64>,

        /// Vertical margin from the anchored edge, in pixels
        #[arg(long)]
        margin_y: Option<f64>,

        /// Explicit overlay rectangle `x,y,w,h`, origin at the bottom-left
        #[arg(long, conflicts_with = "position")]
        rect: Option<String>,
    },

    /// Re-encode a video with the default letterbox composition
    Transcode {
        /// Source media
        input: PathBuf,

        /// Output file (defaults to the configured output directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output width in pixels
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Output height in pixels
        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// Start of the exported range (seconds)
        #[arg(long)]
        start: Option<f64>,

        /// Length of the exported range (seconds)
        #[arg(long)]
        duration: Option<f64>,

        /// Video bitrate (kbps)
        #[arg(long)]
        bitrate: Option<u32>,

        /// Container: mp4, mov, m4a
        #[arg(long, default_value = "mp4")]
        format: String,
    },

    /// Show tracks of a media file
    Info {
        /// Path to the media file
        input: PathBuf,

        /// Print the probed asset as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the media tools are installed
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = framestamp_common::AppConfig::load();

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    framestamp_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Watermark {
            input,
            output,
            overlay,
            position,
            margin_x,
            margin_y,
            rect,
        } => {
            let placement =
                commands::watermark::placement(&config, position, margin_x, margin_y, rect)?;
            commands::watermark::run(&config, input, output, overlay, placement).await
        }
        Commands::Transcode {
            input,
            output,
            width,
            height,
            start,
            duration,
            bitrate,
            format,
        } => {
            let options = commands::transcode::TranscodeOptions {
                width,
                height,
                start,
                duration,
                bitrate_kbps: bitrate,
                format,
            };
            commands::transcode::run(&config, input, output, options).await
        }
        Commands::Info { input, json } => commands::info::run(&config, input, json),
        Commands::Check => commands::check::run(&config),
    }
}
