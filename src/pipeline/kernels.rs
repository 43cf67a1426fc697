// pipeline/kernels.rs — Kernel bodies for the CPU device.
//
// These are the host-side twins of the WGSL shaders in src/shaders/. Each
// one emulates the folded NdRange of its stage: the item rows a launch
// covers (`tile.y × iterations`) are split into bands of `tile.y` rows, one
// band per rayon task, which is what one row of work groups would process
// on a GPU. Inside a band every item writes only its own output slot.
//
// Buffers use the padded layouts described in geometry.rs. A kernel that
// is handed a buffer too small for its range reports an error instead of
// panicking, and the launch's completion fails with that message.

use rayon::prelude::*;

use crate::geometry::NORM_EPSILON;
use crate::geometry::ORIENTATION_WEIGHT;
use crate::gradient::{central_difference_dense, orientation_vote};
use crate::pipeline::device::KernelConstants;

pub(crate) type KernelResult = Result<(), String>;

fn ensure_len(what: &str, actual: usize, needed: usize) -> KernelResult {
    if actual < needed {
        Err(format!("{what}: buffer holds {actual} elements, range needs {needed}"))
    } else {
        Ok(())
    }
}

fn item_rows(k: &KernelConstants, iterations: i32) -> Result<usize, String> {
    if iterations < 0 {
        return Err(format!("negative iteration count {iterations}"));
    }
    Ok(k.tile[1] as usize * iterations as usize)
}

/// calc_cell_desc: raw per-cell histogram with the insensitive fold.
pub(crate) fn calc_cell_desc(
    k: &KernelConstants,
    image: &[f32],
    weights: &[f32],
    cell_desc: &mut [f32],
    iterations: i32,
) -> KernelResult {
    let [w, h] = k.image_size;
    let cs = k.cell_size;
    let sens = k.sensitive_bins();
    let ins = k.insensitive_bins;
    let cpc = k.channels_per_cell();
    let cells_x = k.cell_count[0];
    let tile_y = k.tile[1] as usize;
    let rows = item_rows(k, iterations)?;
    let row_len = cells_x * cpc;

    ensure_len("image", image.len(), w * h)?;
    ensure_len("weights", weights.len(), 2 * cs)?;
    ensure_len("cell_desc", cell_desc.len(), rows * row_len)?;
    if rows == 0 || row_len == 0 {
        return Ok(());
    }

    cell_desc[..rows * row_len]
        .par_chunks_mut(tile_y * row_len)
        .enumerate()
        .for_each(|(band, chunk)| {
            for (r, row) in chunk.chunks_mut(row_len).enumerate() {
                let cy = band * tile_y + r;
                let y0 = (cy * cs) as isize - (cs / 2) as isize;
                for (cx, hist) in row.chunks_mut(cpc).enumerate() {
                    let x0 = (cx * cs) as isize - (cs / 2) as isize;
                    hist.fill(0.0);
                    for (j, &wy) in weights[..2 * cs].iter().enumerate() {
                        for (i, &wx) in weights[..2 * cs].iter().enumerate() {
                            let g = central_difference_dense(image, w, h, x0 + i as isize, y0 + j as isize);
                            if let Some(vote) = orientation_vote(g, sens) {
                                let wgt = wx * wy;
                                hist[vote.bins[0]] += vote.energy[0] * wgt;
                                hist[vote.bins[1]] += vote.energy[1] * wgt;
                            }
                        }
                    }
                    for b in 0..ins {
                        hist[sens + b] = hist[b] + hist[b + ins];
                    }
                }
            }
        });
    Ok(())
}

/// calc_cell_norms: squared norm of each cell's insensitive bins, written
/// to padded position (x + 1, y + 1).
pub(crate) fn calc_cell_norms(
    k: &KernelConstants,
    cell_desc: &[f32],
    cell_norms: &mut [f32],
    iterations: i32,
) -> KernelResult {
    let sens = k.sensitive_bins();
    let ins = k.insensitive_bins;
    let cpc = k.channels_per_cell();
    let cells_x = k.cell_count[0];
    let pw = k.padded_grid[0];
    let tile_y = k.tile[1] as usize;
    let rows = item_rows(k, iterations)?;

    ensure_len("cell_desc", cell_desc.len(), rows * cells_x * cpc)?;
    ensure_len("cell_norms", cell_norms.len(), (rows + 1) * pw)?;
    if cells_x + 1 > pw {
        return Err(format!("padded width {pw} too small for {cells_x} cells"));
    }
    if rows == 0 {
        return Ok(());
    }

    cell_norms[pw..(rows + 1) * pw]
        .par_chunks_mut(tile_y * pw)
        .enumerate()
        .for_each(|(band, chunk)| {
            for (r, row) in chunk.chunks_mut(pw).enumerate() {
                let cy = band * tile_y + r;
                for cx in 0..cells_x {
                    let base = (cx + cy * cells_x) * cpc + sens;
                    row[cx + 1] = cell_desc[base..base + ins].iter().map(|v| v * v).sum();
                }
            }
        });
    Ok(())
}

/// calc_inv_block_norms: for every padded block position, the inverse
/// norm of its 2×2 cell neighbourhood.
pub(crate) fn calc_inv_block_norms(
    k: &KernelConstants,
    cell_norms: &[f32],
    inv_block_norms: &mut [f32],
    iterations: i32,
) -> KernelResult {
    let pw = k.padded_grid[0];
    let cols = k.cell_count[0] + k.tile[0] as usize;
    let tile_y = k.tile[1] as usize;
    let rows = item_rows(k, iterations)?;

    if cols + 1 > pw {
        return Err(format!("padded width {pw} too small for {cols} block columns"));
    }
    ensure_len("cell_norms", cell_norms.len(), (rows + 1) * pw)?;
    ensure_len("inv_block_norms", inv_block_norms.len(), rows * pw)?;
    if rows == 0 {
        return Ok(());
    }

    inv_block_norms[..rows * pw]
        .par_chunks_mut(tile_y * pw)
        .enumerate()
        .for_each(|(band, chunk)| {
            for (r, row) in chunk.chunks_mut(pw).enumerate() {
                let by = band * tile_y + r;
                let top = &cell_norms[by * pw..][..pw];
                let bottom = &cell_norms[(by + 1) * pw..][..pw];
                for bx in 0..cols {
                    let sum = top[bx] + top[bx + 1] + bottom[bx] + bottom[bx + 1];
                    row[bx] = 1.0 / (sum + NORM_EPSILON).sqrt();
                }
            }
        });
    Ok(())
}

/// apply_normalization: truncated, block-normalized channels plus the four
/// texture energies per cell.
pub(crate) fn apply_normalization(
    k: &KernelConstants,
    cell_desc: &[f32],
    inv_block_norms: &[f32],
    descriptor: &mut [f32],
    iterations: i32,
    padding_x: i32,
) -> KernelResult {
    let sens = k.sensitive_bins();
    let ins = k.insensitive_bins;
    let cpc = k.channels_per_cell();
    let cpb = k.channels_per_block();
    let cells_x = k.cell_count[0];
    let tile_y = k.tile[1] as usize;
    let rows = item_rows(k, iterations)?;
    if padding_x < 1 {
        return Err(format!("padding_x must be at least 1, got {padding_x}"));
    }
    let pw = cells_x + padding_x as usize;
    let trunc = k.truncation;
    let texture_weight = k.texture_weight;

    ensure_len("cell_desc", cell_desc.len(), rows * cells_x * cpc)?;
    ensure_len("inv_block_norms", inv_block_norms.len(), (rows + 1) * pw)?;
    ensure_len("descriptor", descriptor.len(), rows * cells_x * cpb)?;
    if rows == 0 || cells_x == 0 {
        return Ok(());
    }

    let row_len = cells_x * cpb;
    descriptor[..rows * row_len]
        .par_chunks_mut(tile_y * row_len)
        .enumerate()
        .for_each(|(band, chunk)| {
            for (r, row) in chunk.chunks_mut(row_len).enumerate() {
                let y = band * tile_y + r;
                for (x, out) in row.chunks_mut(cpb).enumerate() {
                    let inv = [
                        inv_block_norms[(y + 1) * pw + x + 1],
                        inv_block_norms[(y + 1) * pw + x],
                        inv_block_norms[y * pw + x + 1],
                        inv_block_norms[y * pw + x],
                    ];
                    let raw = &cell_desc[(x + y * cells_x) * cpc..][..cpc];
                    for (ch, &v) in raw.iter().enumerate() {
                        out[ch] = inv.iter().map(|&n| (v * n).min(trunc) * ORIENTATION_WEIGHT).sum();
                    }
                    for (slot, &n) in inv.iter().enumerate() {
                        out[cpc + slot] = raw[sens..sens + ins]
                            .iter()
                            .map(|&v| (n * v).min(trunc) * texture_weight)
                            .sum();
                    }
                }
            }
        });
    Ok(())
}
