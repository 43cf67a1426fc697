// tests/test_pipeline.rs — Staged pipeline on the CPU device: equivalence
// with the sequential reference and the session state machine.

use std::time::Duration;

use hogpipe::compare::{compare_descriptors, Tolerance};
use hogpipe::error::{GeometryError, HogError};
use hogpipe::geometry::{configure, HogConfig, Settings};
use hogpipe::hog::SequentialHog;
use hogpipe::image::Image;
use hogpipe::pipeline::{CpuDevice, HogPipeline, PipelineState};

fn textured(w: usize, h: usize, seed: u32) -> Image<u8> {
    let mut state = seed | 1;
    Image::from_fn(w, h, |x, y| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let smooth = 100.0 + 50.0 * ((x as f32) * 0.21).sin() * ((y as f32) * 0.13).cos();
        (smooth + (state % 40) as f32).clamp(0.0, 255.0) as u8
    })
}

fn pipeline(settings: Settings) -> HogPipeline<CpuDevice> {
    let mut p = HogPipeline::new(CpuDevice::with_threads(4).unwrap());
    p.configure(settings).unwrap();
    p
}

fn assert_equivalent(settings: Settings, img: &Image<u8>) {
    let reference = SequentialHog::new(settings.clone()).calculate(img).unwrap();
    let ours = pipeline(settings.clone()).process(img, None).unwrap();
    let stats = compare_descriptors(&reference, &ours, Tolerance::default());
    assert!(stats.is_equivalent(), "{:?}: {stats}", settings.tile_size());
    assert!(stats.reference_nonzero > 0);
}

// ===== Equivalence =====

#[test]
fn matches_reference_across_tiles() {
    let img = textured(64, 64, 7);
    for tile in [[1, 1], [2, 2], [4, 4], [8, 8], [4, 2], [2, 8], [16, 16]] {
        let settings = configure(64, 64, 4, 9, 0.2, tile).unwrap();
        assert_equivalent(settings, &img);
    }
}

#[test]
fn matches_reference_across_cell_sizes_and_bins() {
    let img = textured(96, 48, 99);
    for (cs, bins) in [(4, 9), (8, 9), (6, 6), (4, 4), (2, 12)] {
        let settings = configure(96, 48, cs, bins, 0.2, [2, 2]).unwrap();
        assert_equivalent(settings, &img);
    }
}

#[test]
fn matches_reference_with_other_truncation() {
    let img = textured(32, 32, 3);
    for trunc in [0.05, 0.2, 1.0] {
        assert_equivalent(configure(32, 32, 4, 9, trunc, [4, 4]).unwrap(), &img);
    }
}

#[test]
fn step_edge_matches_reference() {
    let img = Image::from_fn(16, 16, |x, _| if x < 8 { 0u8 } else { 255 });
    assert_equivalent(configure(16, 16, 4, 9, 0.2, [2, 2]).unwrap(), &img);
}

#[test]
fn flat_image_gives_zero_descriptor() {
    let settings = configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap();
    let desc = pipeline(settings).process(&Image::from_fn(16, 16, |_, _| 77u8), None).unwrap();
    assert_eq!(desc.cell_count(), [4, 4]);
    assert!(desc.as_slice().iter().all(|&v| v == 0.0));
}

#[test]
fn float_input_matches_u8_input() {
    let settings = configure(32, 32, 4, 9, 0.2, [4, 4]).unwrap();
    let img8 = textured(32, 32, 11);
    let img32 = Image::from_fn(32, 32, |x, y| img8.get(x, y) as f32);
    let mut p = pipeline(settings);
    let a = p.process(&img8, None).unwrap();
    let b = p.process(&img32, None).unwrap();
    assert_eq!(a.as_slice(), b.as_slice());
}

#[test]
fn consecutive_frames_do_not_leak_state() {
    let settings = configure(32, 32, 4, 9, 0.2, [2, 2]).unwrap();
    let a = textured(32, 32, 1);
    let b = textured(32, 32, 2);
    let mut p = pipeline(settings.clone());
    let first = p.process(&a, None).unwrap();
    p.process(&b, None).unwrap();
    let again = p.process(&a, None).unwrap();
    assert_eq!(first.as_slice(), again.as_slice());
    assert_eq!(p.frames_processed(), 3);
    assert!(p.mean_frame_time().is_some());
}

// ===== State machine =====

#[test]
fn starts_idle_and_requires_configure() {
    let mut p = HogPipeline::new(CpuDevice::new().unwrap());
    assert_eq!(p.state(), PipelineState::Idle);
    assert!(p.settings().is_none());
    assert!(p.mean_frame_time().is_none());
    let err = p.process(&Image::<u8>::new(16, 16), None).unwrap_err();
    assert!(matches!(err, HogError::NotConfigured), "{err}");
}

#[test]
fn configured_then_completed() {
    let mut p = pipeline(configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap());
    assert_eq!(p.state(), PipelineState::Configured);
    let frame = p.calculate(&textured(16, 16, 5)).unwrap();
    let desc = frame.wait(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(desc.len(), 16 * 31);
    assert_eq!(p.state(), PipelineState::Completed);
}

#[test]
fn image_size_mismatch_is_rejected_without_state_change() {
    let mut p = pipeline(configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap());
    let err = p.process(&Image::<u8>::new(32, 16), None).unwrap_err();
    assert!(
        matches!(err, HogError::ImageMismatch { expected_width: 16, actual_width: 32, .. }),
        "{err}"
    );
    assert_eq!(p.state(), PipelineState::Configured);
}

#[test]
fn configure_for_rejects_bad_geometry_and_keeps_session() {
    let mut p = HogPipeline::new(CpuDevice::new().unwrap());
    p.configure_for(&HogConfig::default(), 32, 32).unwrap();

    let err = p.configure_for(&HogConfig::default(), 30, 32).unwrap_err();
    assert!(matches!(err, HogError::InvalidGeometry(GeometryError::NotCellMultiple { .. })), "{err}");
    assert_eq!(p.state(), PipelineState::Configured);
    assert_eq!(p.settings().map(|s| s.image_size()), Some([32, 32]));
    p.process(&textured(32, 32, 4), None).unwrap();
}

#[test]
fn reconfigure_switches_geometry() {
    let mut p = pipeline(configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap());
    p.process(&textured(16, 16, 1), None).unwrap();

    let settings = configure(48, 32, 8, 6, 0.2, [2, 2]).unwrap();
    p.configure(settings.clone()).unwrap();
    assert_eq!(p.frames_processed(), 0);
    let img = textured(48, 32, 9);
    let ours = p.process(&img, None).unwrap();
    let reference = SequentialHog::new(settings).calculate(&img).unwrap();
    assert!(compare_descriptors(&reference, &ours, Tolerance::default()).is_equivalent());
}

#[test]
fn cancel_returns_to_configured() {
    let mut p = pipeline(configure(32, 32, 4, 9, 0.2, [4, 4]).unwrap());
    let frame = p.calculate(&textured(32, 32, 8)).unwrap();
    frame.cancel();
    assert_eq!(p.state(), PipelineState::Configured);
    p.process(&textured(32, 32, 8), None).unwrap();
    assert_eq!(p.state(), PipelineState::Completed);
}

#[test]
fn dropping_a_pending_frame_returns_to_configured() {
    let mut p = pipeline(configure(32, 32, 4, 9, 0.2, [4, 4]).unwrap());
    {
        let _frame = p.calculate(&textured(32, 32, 8)).unwrap();
    }
    assert_eq!(p.state(), PipelineState::Configured);
    assert_eq!(p.frames_processed(), 0);
}

#[test]
fn pipelines_can_share_one_device() {
    let device = CpuDevice::with_threads(2).unwrap();
    let settings = configure(32, 32, 4, 9, 0.2, [4, 4]).unwrap();
    let img = textured(32, 32, 21);

    let mut a = HogPipeline::new(&device);
    let mut b = HogPipeline::new(&device);
    a.configure(settings.clone()).unwrap();
    b.configure(settings).unwrap();
    let da = a.process(&img, None).unwrap();
    let db = b.process(&img, None).unwrap();
    assert_eq!(da.as_slice(), db.as_slice());
}
