//! Show media file information.

use std::path::PathBuf;

use framestamp_common::AppConfig;
use framestamp_media_model::{MediaAsset, MediaKind};

use super::engine;

pub fn run(config: &AppConfig, input: PathBuf, json: bool) -> anyhow::Result<()> {
    let asset = engine(config)?
        .load_asset(&input)
        .map_err(|e| anyhow::anyhow!("Failed to probe {}: {e}", input.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&asset)?);
        return Ok(());
    }

    println!("Media: {}", input.display());
    println!("  Duration: {:.3}s", asset.duration.as_secs_f64());
    println!();
    print_tracks(&asset);
    Ok(())
}

fn print_tracks(asset: &MediaAsset) {
    println!("Tracks:");
    if asset.tracks.is_empty() {
        println!("  (none)");
    }
    for track in &asset.tracks {
        match track.kind {
            MediaKind::Video => {
                let (w, h) = track.natural_size.to_pixels();
                let rotation = track.preferred_transform.rotation_degrees().round();
                println!(
                    "  #{} video: {w}x{h} @ {:.2}fps ({:.1}s){}",
                    track.id.0,
                    track.nominal_frame_rate,
                    track.duration.as_secs_f64(),
                    if rotation != 0.0 {
                        format!(", rotated {rotation}°")
                    } else {
                        String::new()
                    }
                );
            }
            MediaKind::Audio => {
                println!(
                    "  #{} audio: {} Hz, {} ch ({:.1}s)",
                    track.id.0,
                    track.sample_rate,
                    track.channels,
                    track.duration.as_secs_f64()
                );
            }
        }
    }
}
