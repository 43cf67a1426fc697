// gradient.rs — Per-pixel gradient and orientation voting.
//
// HOG uses the plain central difference, not Sobel: the descriptor's own
// spatial interpolation already smooths the votes.
//
//   gx = P(x+1, y) − P(x−1, y)
//   gy = P(x, y+1) − P(x, y−1)
//
// Border handling has two parts:
//   * A sample that lies outside the image has zero gradient. Cell windows
//     overhang the image by half a cell, and those overhanging samples
//     must not vote.
//   * A sample inside the image whose neighbour falls one pixel outside
//     reads the nearest edge pixel instead (`Image::get_clamped`). A flat
//     image therefore has zero gradient everywhere, border included.
//
// Orientation voting maps the angle in [0, 2π) to a fractional bin over
// `sensitive` bins and splits the magnitude linearly between the two
// nearest bins, wrapping the upper one modulo `sensitive`:
//
//   bin  = sensitive · θ / 2π          e.g. 18 bins, θ = 25° → bin 1.25
//   b0   = ⌊bin⌋ mod sensitive          → 1, weight 0.75·m
//   b1   = (b0 + 1) mod sensitive       → 2, weight 0.25·m
//
// The same functions are used by the sequential reference and by the CPU
// pipeline kernel; the WGSL kernel mirrors them line for line.

use std::f32::consts::PI;

use crate::image::{Image, Pixel};

const TWO_PI: f32 = 2.0 * PI;

/// Central-difference gradient at one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Gradient {
    pub gx: f32,
    pub gy: f32,
}

impl Gradient {
    #[inline]
    pub fn magnitude(&self) -> f32 {
        (self.gx * self.gx + self.gy * self.gy).sqrt()
    }

    /// Gradient direction in [0, 2π).
    #[inline]
    pub fn angle(&self) -> f32 {
        let a = self.gy.atan2(self.gx);
        if a < 0.0 {
            a + TWO_PI
        } else {
            a
        }
    }
}

/// Gradient at `(x, y)`; zero when the sample lies outside the image.
///
/// A sample on the border is not zeroed. Its missing neighbour takes the
/// edge value, so on column 0 `gx = P(1, y) − P(0, y)`, a one-sided
/// difference. Only samples outside the image contribute nothing.
#[inline]
pub fn central_difference<T: Pixel>(img: &Image<T>, x: isize, y: isize) -> Gradient {
    if x < 0 || y < 0 || x >= img.width() as isize || y >= img.height() as isize {
        return Gradient::default();
    }
    Gradient {
        gx: img.get_clamped(x + 1, y) - img.get_clamped(x - 1, y),
        gy: img.get_clamped(x, y + 1) - img.get_clamped(x, y - 1),
    }
}

/// Same as [`central_difference`] over a dense row-major f32 buffer, the
/// layout the pipeline kernels receive.
#[inline]
pub fn central_difference_dense(pixels: &[f32], width: usize, height: usize, x: isize, y: isize) -> Gradient {
    if x < 0 || y < 0 || x >= width as isize || y >= height as isize {
        return Gradient::default();
    }
    let at = |px: isize, py: isize| {
        let cx = px.clamp(0, width as isize - 1) as usize;
        let cy = py.clamp(0, height as isize - 1) as usize;
        pixels[cy * width + cx]
    };
    Gradient {
        gx: at(x + 1, y) - at(x - 1, y),
        gy: at(x, y + 1) - at(x, y - 1),
    }
}

/// The two (bin, energy) pairs a gradient votes into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationVote {
    pub bins: [usize; 2],
    pub energy: [f32; 2],
}

/// Split `g`'s magnitude between the two nearest of `sensitive_bins`
/// orientation bins. Returns `None` for a zero gradient.
#[inline]
pub fn orientation_vote(g: Gradient, sensitive_bins: usize) -> Option<OrientationVote> {
    let magnitude = g.magnitude();
    if magnitude == 0.0 {
        return None;
    }
    let bin = sensitive_bins as f32 * g.angle() / TWO_PI;
    let lower = bin.floor();
    let frac = bin - lower;
    let b0 = (lower as usize) % sensitive_bins;
    let b1 = (b0 + 1) % sensitive_bins;
    Some(OrientationVote {
        bins: [b0, b1],
        energy: [magnitude * (1.0 - frac), magnitude * frac],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_image_has_no_gradient() {
        let img = Image::from_fn(6, 5, |_, _| 128u8);
        for y in -1..6 {
            for x in -1..7 {
                assert_eq!(central_difference(&img, x, y), Gradient::default());
            }
        }
    }

    #[test]
    fn test_horizontal_ramp() {
        // P(x, y) = 10x → gx = 20 in the interior, 10 on the replicated border.
        let img = Image::from_fn(8, 4, |x, _| (10 * x) as f32);
        assert_eq!(central_difference(&img, 3, 2), Gradient { gx: 20.0, gy: 0.0 });
        assert_eq!(central_difference(&img, 0, 2), Gradient { gx: 10.0, gy: 0.0 });
        assert_eq!(central_difference(&img, 7, 2), Gradient { gx: 10.0, gy: 0.0 });
    }

    #[test]
    fn test_corner_sample_is_one_sided_not_zero() {
        let img = Image::from_vec(3, 3, vec![0u8, 4, 9, 2, 5, 7, 8, 1, 3]);
        // (0,0): gx = P(1,0) − P(0,0), gy = P(0,1) − P(0,0).
        assert_eq!(central_difference(&img, 0, 0), Gradient { gx: 4.0, gy: 2.0 });
        // (2,2): gx = P(2,2) − P(1,2), gy = P(2,2) − P(2,1).
        assert_eq!(central_difference(&img, 2, 2), Gradient { gx: 2.0, gy: -4.0 });
    }

    #[test]
    fn test_outside_samples_have_zero_gradient() {
        let img = Image::from_fn(4, 4, |x, y| (x * 7 + y * 3) as u8);
        assert_eq!(central_difference(&img, -1, 0), Gradient::default());
        assert_eq!(central_difference(&img, 0, 4), Gradient::default());
    }

    #[test]
    fn test_dense_matches_image_lookup() {
        let img = Image::from_fn(7, 5, |x, y| ((x * x + 3 * y) % 11) as u8);
        let dense = img.to_dense_f32();
        for y in -2..7 {
            for x in -2..9 {
                assert_eq!(
                    central_difference(&img, x, y),
                    central_difference_dense(&dense, 7, 5, x, y),
                    "({x},{y})"
                );
            }
        }
    }

    #[test]
    fn test_angle_range() {
        let down = Gradient { gx: 0.0, gy: -1.0 };
        assert!((down.angle() - 1.5 * PI).abs() < 1e-6);
        let right = Gradient { gx: 1.0, gy: 0.0 };
        assert_eq!(right.angle(), 0.0);
    }

    #[test]
    fn test_vote_conserves_energy() {
        for i in 0..64 {
            let theta = i as f32 * TWO_PI / 64.0 + 0.01;
            let m = 3.5;
            let g = Gradient { gx: m * theta.cos(), gy: m * theta.sin() };
            let vote = orientation_vote(g, 18).unwrap();
            let total = vote.energy[0] + vote.energy[1];
            assert!((total - m).abs() < 1e-4, "θ={theta}: {total}");
            assert!(vote.bins[0] < 18 && vote.bins[1] < 18);
            assert_eq!(vote.bins[1], (vote.bins[0] + 1) % 18);
        }
    }

    #[test]
    fn test_vote_split_quarter_bin() {
        // 18 bins of 20°; 25° sits a quarter of the way from bin 1 to bin 2.
        let theta = 25.0f32.to_radians();
        let g = Gradient { gx: theta.cos(), gy: theta.sin() };
        let vote = orientation_vote(g, 18).unwrap();
        assert_eq!(vote.bins, [1, 2]);
        assert!((vote.energy[0] - 0.75).abs() < 1e-4);
        assert!((vote.energy[1] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_vote_wraps_last_bin() {
        let theta = 355.0f32.to_radians();
        let g = Gradient { gx: theta.cos(), gy: theta.sin() };
        let vote = orientation_vote(g, 18).unwrap();
        assert_eq!(vote.bins, [17, 0]);
    }

    #[test]
    fn test_zero_gradient_does_not_vote() {
        assert!(orientation_vote(Gradient::default(), 18).is_none());
    }
}
