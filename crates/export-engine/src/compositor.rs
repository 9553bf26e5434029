//! Frame compositor: draws layer instructions and the overlay onto a canvas.
//!
//! Also builds the default letterbox composition used when an export does
//! not bring its own.

use framestamp_common::error::{FramestampError, FramestampResult};
use framestamp_media_model::{
    AffineTransform, AssetTrack, CompositionInstruction, LayerInstruction, MediaTime,
    OpacityRamp, OverlayLayer, Point, Size, TimeRange, TrackId, VideoComposition,
};

use crate::engine::{PixelBuffer, BYTES_PER_PIXEL};

/// Translation value some camera exports write into the orientation
/// matrix. It is never a real offset.
pub const BOGUS_TRANSLATION: f64 = -560.0;

/// Frame rate used when neither the track nor the settings carry one.
pub const FALLBACK_FRAME_RATE: f64 = 30.0;

/// Zero any translation component equal to [`BOGUS_TRANSLATION`].
pub fn sanitize_transform(transform: AffineTransform) -> AffineTransform {
    let mut fixed = transform;
    if fixed.tx == BOGUS_TRANSLATION {
        fixed.tx = 0.0;
    }
    if fixed.ty == BOGUS_TRANSLATION {
        fixed.ty = 0.0;
    }
    fixed
}

/// Display size of a raster once its orientation transform is applied.
pub fn corrected_natural_size(natural: Size, transform: &AffineTransform) -> Size {
    if transform.is_quarter_turn() {
        natural.transposed()
    } else {
        natural
    }
}

/// Layer transform fitting an oriented raster into `target`, centered.
///
/// Returns the transform and the uniform scale applied.
pub fn fit_transform(
    natural: Size,
    orientation: &AffineTransform,
    target: Size,
) -> (AffineTransform, f64) {
    let orientation = sanitize_transform(*orientation);
    let corrected = corrected_natural_size(natural, &orientation);
    if corrected.is_empty() || target.is_empty() {
        return (orientation, 1.0);
    }

    let scale = (target.width / corrected.width).min(target.height / corrected.height);
    let tx = (target.width - corrected.width * scale) / 2.0;
    let ty = (target.height - corrected.height * scale) / 2.0;
    let transform = orientation
        .concatenating(&AffineTransform::scale(scale, scale))
        .concatenating(&AffineTransform::translation(tx, ty));
    (transform, scale)
}

/// Frame duration for a track: its nominal rate, else `settings_fps`,
/// else [`FALLBACK_FRAME_RATE`].
pub fn frame_duration_for(track: &AssetTrack, settings_fps: Option<f64>) -> MediaTime {
    let fps = if track.nominal_frame_rate > 0.0 {
        track.nominal_frame_rate
    } else {
        settings_fps
            .filter(|fps| *fps > 0.0)
            .unwrap_or(FALLBACK_FRAME_RATE)
    };
    MediaTime::frame_duration(fps)
}

/// Letterbox-fit composition of `track` into `target` (or its corrected
/// natural size), one layer spanning `duration`.
pub fn build_default_composition(
    track: &AssetTrack,
    target: Option<Size>,
    settings_fps: Option<f64>,
    duration: MediaTime,
) -> FramestampResult<VideoComposition> {
    if track.natural_size.is_empty() {
        return Err(FramestampError::configuration(format!(
            "video track {} has no natural size",
            track.id.0
        )));
    }

    let orientation = sanitize_transform(track.preferred_transform);
    let corrected = corrected_natural_size(track.natural_size, &orientation);
    let render_size = target.filter(|t| !t.is_empty()).unwrap_or(corrected);
    let (transform, scale) = fit_transform(track.natural_size, &orientation, render_size);

    tracing::debug!(
        track = track.id.0,
        natural_w = track.natural_size.width,
        natural_h = track.natural_size.height,
        render_w = render_size.width,
        render_h = render_size.height,
        scale,
        rotation = orientation.rotation_degrees(),
        "Built default composition"
    );

    let time_range = TimeRange::new(MediaTime::ZERO, duration)
        .map_err(|e| FramestampError::configuration(e.to_string()))?;

    Ok(VideoComposition {
        render_size,
        frame_duration: frame_duration_for(track, settings_fps),
        instructions: vec![CompositionInstruction {
            time_range,
            layers: vec![LayerInstruction {
                track_id: track.id,
                transform,
                opacity: OpacityRamp::OPAQUE,
            }],
        }],
        overlay: None,
    })
}

/// Renders composition frames into BGRA canvases of the render size.
#[derive(Debug)]
pub struct FrameCompositor {
    composition: VideoComposition,
    width: u32,
    height: u32,
    /// Canvas-to-source transforms, per instruction, per layer.
    inverses: Vec<Vec<Option<AffineTransform>>>,
}

impl FrameCompositor {
    pub fn new(composition: VideoComposition) -> FramestampResult<Self> {
        composition
            .validate()
            .map_err(|e| FramestampError::configuration(e.to_string()))?;
        let (width, height) = composition.render_size.to_pixels();
        let inverses = composition
            .instructions
            .iter()
            .map(|i| i.layers.iter().map(|l| l.transform.inverted()).collect())
            .collect();
        Ok(Self {
            composition,
            width,
            height,
            inverses,
        })
    }

    pub fn composition(&self) -> &VideoComposition {
        &self.composition
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// A black canvas of the render size.
    pub fn make_canvas(&self) -> PixelBuffer {
        PixelBuffer::new(self.width, self.height)
    }

    /// Render the frame at `time` from `sources` into `canvas`.
    pub fn compose(
        &self,
        time: MediaTime,
        sources: &[(TrackId, &PixelBuffer)],
        canvas: &mut PixelBuffer,
    ) -> FramestampResult<()> {
        if canvas.width() != self.width || canvas.height() != self.height {
            return Err(FramestampError::pump_failure(format!(
                "canvas is {}x{}, composition renders {}x{}",
                canvas.width(),
                canvas.height(),
                self.width,
                self.height
            )));
        }
        canvas.fill([0, 0, 0, 255]);

        let Some(index) = self
            .composition
            .instructions
            .iter()
            .position(|i| i.time_range.contains(time))
        else {
            return Ok(());
        };
        let instruction = &self.composition.instructions[index];
        let progress = instruction.progress_at(time);

        // Earlier layers sit on top, so paint back to front.
        let mut painted_any = false;
        for (layer, inverse) in instruction
            .layers
            .iter()
            .zip(&self.inverses[index])
            .rev()
        {
            let Some(inverse) = inverse else {
                continue;
            };
            let Some((_, source)) = sources.iter().find(|(id, _)| *id == layer.track_id) else {
                continue;
            };
            let opacity = layer.opacity.at(progress);
            if opacity <= 0.0 {
                continue;
            }

            let direct = !painted_any
                && opacity >= 1.0
                && layer.transform.is_identity()
                && source.same_geometry(canvas);
            if direct {
                canvas.data_mut().copy_from_slice(source.data());
            } else {
                draw_layer(canvas, source, inverse, opacity);
            }
            painted_any = true;
        }

        if let Some(overlay) = &self.composition.overlay {
            draw_overlay(canvas, overlay);
        }
        Ok(())
    }
}

fn draw_layer(canvas: &mut PixelBuffer, source: &PixelBuffer, inverse: &AffineTransform, opacity: f32) {
    let (sw, sh) = (source.width() as f64, source.height() as f64);
    let width = canvas.width();
    for y in 0..canvas.height() {
        for x in 0..width {
            let p = inverse.apply(Point::new(x as f64 + 0.5, y as f64 + 0.5));
            if p.x < 0.0 || p.y < 0.0 || p.x >= sw || p.y >= sh {
                continue;
            }
            let src = source.pixel(p.x as u32, p.y as u32);
            let alpha = src[3] as f32 / 255.0 * opacity;
            blend_into(canvas, x, y, [src[0], src[1], src[2]], alpha);
        }
    }
}

/// Blend the overlay into its frame. The frame is bottom-left origin; the
/// image itself is stored top row first.
fn draw_overlay(canvas: &mut PixelBuffer, overlay: &OverlayLayer) {
    let frame = overlay.frame;
    let (iw, ih) = (overlay.image.width(), overlay.image.height());
    if frame.width <= 0.0 || frame.height <= 0.0 || iw == 0 || ih == 0 {
        return;
    }

    let canvas_h = canvas.height() as f64;
    let top = canvas_h - frame.y - frame.height;
    let x0 = frame.x.max(0.0).floor() as u32;
    let y0 = top.max(0.0).floor() as u32;
    let x1 = frame.max_x().min(canvas.width() as f64).ceil().max(0.0) as u32;
    let y1 = (top + frame.height).min(canvas_h).ceil().max(0.0) as u32;

    for y in y0..y1 {
        let v = (y as f64 + 0.5 - top) / frame.height;
        if !(0.0..1.0).contains(&v) {
            continue;
        }
        let iy = ((v * ih as f64) as u32).min(ih - 1);
        for x in x0..x1 {
            let u = (x as f64 + 0.5 - frame.x) / frame.width;
            if !(0.0..1.0).contains(&u) {
                continue;
            }
            let ix = ((u * iw as f64) as u32).min(iw - 1);
            let [r, g, b, a] = overlay.image.get_pixel(ix, iy).0;
            blend_into(canvas, x, y, [b, g, r], a as f32 / 255.0);
        }
    }
}

fn blend_into(canvas: &mut PixelBuffer, x: u32, y: u32, bgr: [u8; 3], alpha: f32) {
    if alpha <= 0.0 {
        return;
    }
    let alpha = alpha.min(1.0);
    let width = canvas.width() as usize;
    let o = (y as usize * width + x as usize) * BYTES_PER_PIXEL;
    let dst = &mut canvas.data_mut()[o..o + BYTES_PER_PIXEL];
    for c in 0..3 {
        dst[c] = (bgr[c] as f32 * alpha + dst[c] as f32 * (1.0 - alpha)).round() as u8;
    }
    dst[3] = (255.0 * alpha + dst[3] as f32 * (1.0 - alpha)).round() as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use framestamp_media_model::{Placement, Rect};
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn video_track(natural: Size, transform: AffineTransform, fps: f64) -> AssetTrack {
        AssetTrack::video(TrackId(1), "/media/in.mp4", 0, MediaTime::new(5, 1), natural, fps)
            .with_preferred_transform(transform)
    }

    #[test]
    fn test_sanitize_zeroes_bogus_translation() {
        let t = AffineTransform::new(0.0, 1.0, -1.0, 0.0, BOGUS_TRANSLATION, 0.0);
        let fixed = sanitize_transform(t);
        assert_eq!(fixed.tx, 0.0);
        assert_eq!(fixed.b, 1.0);

        let untouched = AffineTransform::translation(-559.0, BOGUS_TRANSLATION);
        let fixed = sanitize_transform(untouched);
        assert_eq!(fixed.tx, -559.0);
        assert_eq!(fixed.ty, 0.0);
    }

    #[test]
    fn test_quarter_turn_fits_portrait_target() {
        let natural = Size::new(1920.0, 1080.0);
        let rotate = AffineTransform::for_clockwise_rotation(90, natural);
        assert_eq!(
            corrected_natural_size(natural, &rotate),
            Size::new(1080.0, 1920.0)
        );

        let (transform, scale) = fit_transform(natural, &rotate, Size::new(270.0, 480.0));
        assert!((scale - 0.25).abs() < 1e-12);
        let bounds = transform.apply_to_rect(Rect::from_size(natural));
        assert!((bounds.x).abs() < 1e-9);
        assert!((bounds.width - 270.0).abs() < 1e-9);
        assert!((bounds.height - 480.0).abs() < 1e-9);
    }

    #[test]
    fn test_landscape_letterboxed_into_square() {
        let natural = Size::new(1920.0, 1080.0);
        let (transform, scale) =
            fit_transform(natural, &AffineTransform::IDENTITY, Size::new(1000.0, 1000.0));
        assert!((scale - 1000.0 / 1920.0).abs() < 1e-12);
        let bounds = transform.apply_to_rect(Rect::from_size(natural));
        assert!((bounds.y - (1000.0 - 1080.0 * scale) / 2.0).abs() < 1e-9);
        assert!((bounds.x).abs() < 1e-9);
    }

    #[test]
    fn test_frame_duration_fallbacks() {
        let t = video_track(Size::new(10.0, 10.0), AffineTransform::IDENTITY, 24.0);
        assert_eq!(frame_duration_for(&t, Some(60.0)), MediaTime::new(1, 24));

        let t = video_track(Size::new(10.0, 10.0), AffineTransform::IDENTITY, 0.0);
        assert_eq!(frame_duration_for(&t, Some(60.0)), MediaTime::new(1, 60));
        assert_eq!(frame_duration_for(&t, None), MediaTime::new(1, 30));
    }

    #[test]
    fn test_default_composition_renders_at_target() {
        let t = video_track(Size::new(640.0, 480.0), AffineTransform::IDENTITY, 25.0);
        let comp =
            build_default_composition(&t, Some(Size::new(320.0, 320.0)), None, MediaTime::new(5, 1))
                .unwrap();
        assert_eq!(comp.render_size, Size::new(320.0, 320.0));
        assert_eq!(comp.instructions.len(), 1);
        assert_eq!(comp.instructions[0].layers[0].track_id, TrackId(1));

        let natural = build_default_composition(&t, None, None, MediaTime::new(5, 1)).unwrap();
        assert_eq!(natural.render_size, Size::new(640.0, 480.0));
        assert!(natural.instructions[0].layers[0].transform.is_identity());
    }

    #[test]
    fn test_empty_natural_size_is_configuration_error() {
        let t = video_track(Size::ZERO, AffineTransform::IDENTITY, 25.0);
        assert!(matches!(
            build_default_composition(&t, None, None, MediaTime::new(1, 1)),
            Err(FramestampError::Configuration { .. })
        ));
    }

    fn solid(width: u32, height: u32, bgra: [u8; 4]) -> PixelBuffer {
        let mut b = PixelBuffer::new(width, height);
        b.fill(bgra);
        b
    }

    #[test]
    fn test_identity_copy_and_out_of_range_black() {
        let t = video_track(Size::new(4.0, 4.0), AffineTransform::IDENTITY, 25.0);
        let comp = build_default_composition(&t, None, None, MediaTime::new(1, 1)).unwrap();
        let compositor = FrameCompositor::new(comp).unwrap();
        let source = solid(4, 4, [10, 20, 30, 255]);
        let mut canvas = compositor.make_canvas();

        compositor
            .compose(MediaTime::ZERO, &[(TrackId(1), &source)], &mut canvas)
            .unwrap();
        assert_eq!(canvas, source);

        compositor
            .compose(MediaTime::new(2, 1), &[(TrackId(1), &source)], &mut canvas)
            .unwrap();
        assert_eq!(canvas.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn test_letterbox_leaves_black_bars() {
        let t = video_track(Size::new(4.0, 2.0), AffineTransform::IDENTITY, 25.0);
        let comp = build_default_composition(&t, Some(Size::new(4.0, 4.0)), None, MediaTime::new(1, 1))
            .unwrap();
        let compositor = FrameCompositor::new(comp).unwrap();
        let source = solid(4, 2, [200, 100, 50, 255]);
        let mut canvas = compositor.make_canvas();
        compositor
            .compose(MediaTime::ZERO, &[(TrackId(1), &source)], &mut canvas)
            .unwrap();

        assert_eq!(canvas.pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(canvas.pixel(0, 1), [200, 100, 50, 255]);
        assert_eq!(canvas.pixel(3, 2), [200, 100, 50, 255]);
        assert_eq!(canvas.pixel(3, 3), [0, 0, 0, 255]);
    }

    #[test]
    fn test_rotation_moves_top_left_to_top_right() {
        let natural = Size::new(4.0, 2.0);
        let t = video_track(natural, AffineTransform::for_clockwise_rotation(90, natural), 25.0);
        let comp = build_default_composition(&t, None, None, MediaTime::new(1, 1)).unwrap();
        assert_eq!(comp.render_size, Size::new(2.0, 4.0));
        let compositor = FrameCompositor::new(comp).unwrap();

        let mut source = solid(4, 2, [0, 0, 0, 255]);
        source.set_pixel(0, 0, [255, 255, 255, 255]);
        let mut canvas = compositor.make_canvas();
        compositor
            .compose(MediaTime::ZERO, &[(TrackId(1), &source)], &mut canvas)
            .unwrap();

        assert_eq!((canvas.width(), canvas.height()), (2, 4));
        assert_eq!(canvas.pixel(1, 0), [255, 255, 255, 255]);
        assert_eq!(canvas.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn test_overlay_rows_are_flipped_from_bottom_left_origin() {
        let t = video_track(Size::new(8.0, 8.0), AffineTransform::IDENTITY, 25.0);
        let mut comp = build_default_composition(&t, None, None, MediaTime::new(1, 1)).unwrap();

        // 2x2 overlay: top row red, bottom row green.
        let mut image = RgbaImage::new(2, 2);
        for x in 0..2 {
            image.put_pixel(x, 0, Rgba([255, 0, 0, 255]));
            image.put_pixel(x, 1, Rgba([0, 255, 0, 255]));
        }
        let placement = Placement::BottomLeft {
            bottom: 1.0,
            left: 1.0,
        };
        comp.overlay = Some(OverlayLayer {
            frame: placement.resolve(Size::new(2.0, 2.0), comp.render_size),
            image: Arc::new(image),
        });

        let compositor = FrameCompositor::new(comp).unwrap();
        let source = solid(8, 8, [0, 0, 0, 255]);
        let mut canvas = compositor.make_canvas();
        compositor
            .compose(MediaTime::ZERO, &[(TrackId(1), &source)], &mut canvas)
            .unwrap();

        // One pixel above the bottom edge: raster rows 5 (red) and 6 (green).
        assert_eq!(canvas.pixel(1, 5), [0, 0, 255, 255]);
        assert_eq!(canvas.pixel(2, 6), [0, 255, 0, 255]);
        assert_eq!(canvas.pixel(1, 7), [0, 0, 0, 255]);
        assert_eq!(canvas.pixel(0, 5), [0, 0, 0, 255]);
    }

    #[test]
    fn test_half_opacity_blends() {
        let mut comp = build_default_composition(
            &video_track(Size::new(2.0, 2.0), AffineTransform::IDENTITY, 25.0),
            None,
            None,
            MediaTime::new(1, 1),
        )
        .unwrap();
        comp.instructions[0].layers[0].opacity = OpacityRamp::constant(0.5);
        let compositor = FrameCompositor::new(comp).unwrap();
        let source = solid(2, 2, [200, 200, 200, 255]);
        let mut canvas = compositor.make_canvas();
        compositor
            .compose(MediaTime::ZERO, &[(TrackId(1), &source)], &mut canvas)
            .unwrap();
        assert_eq!(canvas.pixel(0, 0), [100, 100, 100, 255]);
    }

    #[test]
    fn test_wrong_canvas_size_rejected() {
        let comp = build_default_composition(
            &video_track(Size::new(2.0, 2.0), AffineTransform::IDENTITY, 25.0),
            None,
            None,
            MediaTime::new(1, 1),
        )
        .unwrap();
        let compositor = FrameCompositor::new(comp).unwrap();
        let mut canvas = PixelBuffer::new(3, 3);
        assert!(compositor.compose(MediaTime::ZERO, &[], &mut canvas).is_err());
    }
}
