// compare.rs — Element-wise descriptor comparison.
//
// Two descriptors are considered equivalent when every element agrees with
// the reference within max(5% of the reference value, 1e-3). Floating-point
// summation order differs between the sequential reference and the
// parallel kernels, so bit-exact equality is never expected.

use std::fmt;

use crate::hog::FeatureDescriptor;

/// Per-element acceptance rule: `|candidate − reference| ≤ max(relative·|reference|, absolute)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub relative: f32,
    pub absolute: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance {
            relative: 0.05,
            absolute: 1e-3,
        }
    }
}

impl Tolerance {
    #[inline]
    pub fn accepts(&self, reference: f32, candidate: f32) -> bool {
        (candidate - reference).abs() <= (self.relative * reference.abs()).max(self.absolute)
    }
}

/// Summary of a comparison run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MismatchStats {
    /// Elements examined (length of the longer input).
    pub compared: usize,
    pub mismatches: usize,
    /// Mismatches that fell in texture-energy channels.
    pub texture_mismatches: usize,
    pub max_abs_error: f32,
    /// Flat index of the worst element, if any element differs at all.
    pub worst_index: Option<usize>,
    /// Reference elements with magnitude above the absolute tolerance.
    pub reference_nonzero: usize,
    pub candidate_nonzero: usize,
}

impl MismatchStats {
    pub fn ratio(&self) -> f32 {
        if self.compared == 0 {
            0.0
        } else {
            self.mismatches as f32 / self.compared as f32
        }
    }

    pub fn is_equivalent(&self) -> bool {
        self.mismatches == 0
    }
}

impl fmt::Display for MismatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mismatched {} of {} (ratio {:.5}, {} in texture channels), max |Δ| {:.3e}, non-zero ref/ours {}/{}",
            self.mismatches,
            self.compared,
            self.ratio(),
            self.texture_mismatches,
            self.max_abs_error,
            self.reference_nonzero,
            self.candidate_nonzero,
        )
    }
}

/// Compare two flat buffers. Elements present in only one input count as
/// mismatches.
pub fn compare_slices(reference: &[f32], candidate: &[f32], tol: Tolerance) -> MismatchStats {
    compare_impl(reference, candidate, tol, |_| false)
}

/// Compare two descriptors channel by channel, also counting how many of
/// the mismatches are texture channels.
pub fn compare_descriptors(
    reference: &FeatureDescriptor,
    candidate: &FeatureDescriptor,
    tol: Tolerance,
) -> MismatchStats {
    let cpb = reference.channels_per_block();
    let texture = reference.texture_range();
    compare_impl(reference.as_slice(), candidate.as_slice(), tol, |i| {
        texture.contains(&(i % cpb))
    })
}

fn compare_impl(
    reference: &[f32],
    candidate: &[f32],
    tol: Tolerance,
    is_texture: impl Fn(usize) -> bool,
) -> MismatchStats {
    let mut stats = MismatchStats {
        compared: reference.len().max(candidate.len()),
        ..MismatchStats::default()
    };
    let common = reference.len().min(candidate.len());

    for (i, (&r, &c)) in reference.iter().zip(candidate).enumerate() {
        stats.reference_nonzero += (r.abs() > tol.absolute) as usize;
        stats.candidate_nonzero += (c.abs() > tol.absolute) as usize;

        let err = (c - r).abs();
        // NaN compares false everywhere, so test acceptance explicitly.
        if !tol.accepts(r, c) {
            stats.mismatches += 1;
            stats.texture_mismatches += is_texture(i) as usize;
        }
        if err > stats.max_abs_error || (err.is_nan() && !stats.max_abs_error.is_nan()) {
            stats.max_abs_error = err;
            stats.worst_index = Some(i);
        }
    }
    stats.mismatches += stats.compared - common;
    stats
}
