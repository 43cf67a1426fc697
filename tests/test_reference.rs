// tests/test_reference.rs — Integration tests for the sequential descriptor.

use hogpipe::geometry::{configure, HogConfig};
use hogpipe::hog::SequentialHog;
use hogpipe::image::Image;

fn step_edge(w: usize, h: usize, column: usize) -> Image<u8> {
    Image::from_fn(w, h, |x, _| if x < column { 0 } else { 255 })
}

// ===== Scenarios =====

#[test]
fn flat_gray_gives_all_zero_descriptor() {
    let settings = configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap();
    assert_eq!(settings.cell_count(), [4, 4]);
    assert_eq!(settings.channels_per_block(), 31);

    let img = Image::from_fn(16, 16, |_, _| 128u8);
    let mut hog = SequentialHog::new(settings);
    let desc = hog.calculate(&img).unwrap();

    assert_eq!(desc.len(), 4 * 4 * 31);
    assert!(desc.as_slice().iter().all(|&v| v == 0.0));
    assert!(hog.cell_histogram().iter().all(|&v| v == 0.0));
}

#[test]
fn six_insensitive_bins_give_22_channels() {
    let settings = configure(16, 16, 4, 6, 0.2, [4, 4]).unwrap();
    assert_eq!(settings.sensitive_bin_count(), 12);
    assert_eq!(settings.channels_per_cell(), 18);
    assert_eq!(settings.channels_per_block(), 22);

    let desc = SequentialHog::new(settings)
        .calculate(&Image::from_fn(16, 16, |_, _| 90u8))
        .unwrap();
    assert_eq!(desc.channels_per_block(), 22);
    assert!(desc.as_slice().iter().all(|&v| v == 0.0));
}

#[test]
fn vertical_step_edge_lands_in_bin_zero_of_columns_one_and_two() {
    let settings = configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap();
    let sens = settings.sensitive_bin_count();
    let cpc = settings.channels_per_cell();
    let [cells_x, cells_y] = settings.cell_count();

    let mut hog = SequentialHog::new(settings);
    let desc = hog.calculate(&step_edge(16, 16, 8)).unwrap();
    let hist = hog.cell_histogram();

    for cy in 0..cells_y {
        for cx in 0..cells_x {
            let cell = &hist[(cx + cy * cells_x) * cpc..][..cpc];
            let sensitive: f32 = cell[..sens].iter().sum();
            if cx == 1 || cx == 2 {
                assert!(sensitive > 0.0, "cell ({cx},{cy}) should see the edge");
                assert!((cell[0] - sensitive).abs() <= 1e-4 * sensitive, "cell ({cx},{cy}) energy off bin 0");
            } else {
                assert_eq!(sensitive, 0.0, "cell ({cx},{cy}) should be empty");
                assert!(desc.cell(cx, cy).iter().all(|&v| v == 0.0));
            }
        }
    }
}

#[test]
fn reversed_step_edge_lands_in_the_opposite_bin() {
    // Bright-to-dark flips the gradient to π, the first bin of the second
    // half of the sensitive histogram. The insensitive fold merges both.
    let settings = configure(16, 16, 4, 9, 0.2, [4, 4]).unwrap();
    let cpc = settings.channels_per_cell();
    let img = Image::from_fn(16, 16, |x, _| if x < 8 { 255u8 } else { 0 });
    let mut hog = SequentialHog::new(settings);
    hog.calculate(&img).unwrap();

    let cell = &hog.cell_histogram()[cpc..2 * cpc];
    assert_eq!(cell[0], 0.0);
    assert!(cell[9] > 0.0);
    assert!((cell[18] - cell[9]).abs() < 1e-4, "insensitive bin 0 folds bins 0 and 9");
}

// ===== Properties =====

#[test]
fn descriptor_is_bounded_on_noise() {
    let settings = configure(48, 32, 4, 9, 0.2, [4, 4]).unwrap();
    let texture_max = settings.insensitive_bin_count() as f32 * settings.texture_weight() * 0.2;

    let mut state = 0x1234_5678u32;
    let img = Image::from_fn(48, 32, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state & 0xff) as u8
    });
    let desc = SequentialHog::new(settings).calculate(&img).unwrap();

    for y in 0..desc.cell_count()[1] {
        for x in 0..desc.cell_count()[0] {
            for &v in desc.orientation(x, y) {
                assert!((0.0..=0.4 + 1e-6).contains(&v), "orientation {v} at ({x},{y})");
            }
            for &v in desc.texture(x, y) {
                assert!((0.0..=texture_max + 1e-6).contains(&v), "texture {v} at ({x},{y})");
            }
        }
    }
}

#[test]
fn u8_and_f32_inputs_agree() {
    let settings = HogConfig::default().settings_for(32, 32).unwrap();
    let img8 = Image::from_fn(32, 32, |x, y| ((x * 13 + y * 7) % 200) as u8);
    let img32 = Image::from_fn(32, 32, |x, y| img8.get(x, y) as f32);

    let a = SequentialHog::new(settings.clone()).calculate(&img8).unwrap();
    let b = SequentialHog::new(settings).calculate(&img32).unwrap();
    assert_eq!(a.as_slice(), b.as_slice());
}

#[test]
fn strided_image_matches_dense_image() {
    let settings = configure(16, 16, 4, 9, 0.2, [2, 2]).unwrap();
    let dense = Image::from_fn(16, 16, |x, y| ((x * x + 3 * y) % 256) as u8);
    let mut strided: Image<u8> = Image::new_with_stride(16, 16, 24);
    for (x, y, v) in dense.pixels() {
        strided.set(x, y, v);
    }

    let a = SequentialHog::new(settings.clone()).calculate(&dense).unwrap();
    let b = SequentialHog::new(settings).calculate(&strided).unwrap();
    assert_eq!(a.as_slice(), b.as_slice());
}

#[test]
fn calculate_is_repeatable() {
    let settings = configure(32, 32, 8, 9, 0.2, [2, 2]).unwrap();
    let img = step_edge(32, 32, 13);
    let mut hog = SequentialHog::new(settings);
    let first = hog.calculate(&img).unwrap();
    hog.calculate(&Image::from_fn(32, 32, |x, y| (x ^ y) as u8)).unwrap();
    let again = hog.calculate(&img).unwrap();
    assert_eq!(first.as_slice(), again.as_slice());
}
