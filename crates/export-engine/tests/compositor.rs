use proptest::prelude::*;

use framestamp_export_engine::compositor::{fit_transform, sanitize_transform, BOGUS_TRANSLATION};
use framestamp_export_engine::memory::synthetic_frame;
use framestamp_export_engine::{build_default_composition, FrameCompositor};
use framestamp_media_model::{AffineTransform, AssetTrack, MediaTime, Rect, Size, TrackId};

const EPS: f64 = 1e-6;

#[test]
fn test_sentinel_translation_does_not_shift_frames() {
    let natural = Size::new(8.0, 4.0);
    let mut broken = AffineTransform::IDENTITY;
    broken.tx = BOGUS_TRANSLATION;
    let track = AssetTrack::video(
        TrackId(1),
        "/virtual/cam.mp4",
        0,
        MediaTime::new(1, 1),
        natural,
        25.0,
    )
    .with_preferred_transform(broken);

    let composition = build_default_composition(&track, None, None, MediaTime::new(1, 1)).unwrap();
    assert_eq!(composition.render_size, natural);
    let layer = &composition.instructions[0].layers[0];
    assert!(layer.transform.is_identity());

    let compositor = FrameCompositor::new(composition).unwrap();
    let mut canvas = compositor.make_canvas();
    let frame = synthetic_frame(8, 4, 7);
    compositor
        .compose(MediaTime::ZERO, &[(TrackId(1), &frame)], &mut canvas)
        .unwrap();
    assert_eq!(canvas.data(), frame.data());
}

proptest! {
    #[test]
    fn prop_fit_stays_inside_canvas_and_fills_one_axis(
        nw in 1u32..4000,
        nh in 1u32..4000,
        tw in 1u32..4000,
        th in 1u32..4000,
        quarter_turns in 0i32..4,
    ) {
        let natural = Size::new(nw as f64, nh as f64);
        let target = Size::new(tw as f64, th as f64);
        let orientation = AffineTransform::for_clockwise_rotation(quarter_turns * 90, natural);

        let (transform, scale) = fit_transform(natural, &orientation, target);
        prop_assert!(scale > 0.0);

        let placed = transform.apply_to_rect(Rect::from_size(natural));
        let tol = EPS * target.width.max(target.height);
        prop_assert!(placed.x >= -tol);
        prop_assert!(placed.y >= -tol);
        prop_assert!(placed.max_x() <= target.width + tol);
        prop_assert!(placed.max_y() <= target.height + tol);

        let fills_width = (placed.width - target.width).abs() <= tol;
        let fills_height = (placed.height - target.height).abs() <= tol;
        prop_assert!(fills_width || fills_height);

        // Centered on both axes.
        prop_assert!((placed.x - (target.width - placed.max_x())).abs() <= tol * 2.0);
        prop_assert!((placed.y - (target.height - placed.max_y())).abs() <= tol * 2.0);
    }

    #[test]
    fn prop_sanitize_only_touches_sentinel(tx in -2000.0f64..2000.0, ty in -2000.0f64..2000.0) {
        let transform = AffineTransform::translation(tx, ty);
        prop_assert_eq!(sanitize_transform(transform), transform);

        let sentinel = AffineTransform::translation(BOGUS_TRANSLATION, ty);
        let fixed = sanitize_transform(sentinel);
        prop_assert_eq!(fixed.tx, 0.0);
        prop_assert_eq!(fixed.ty, ty);
    }
}
