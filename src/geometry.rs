// geometry.rs — Cell grid, padding and per-stage launch ranges.
//
// Everything the descriptor implementations need to know about the shape
// of the problem is derived here, once, from the image size and a
// `HogConfig`. The result is an immutable `Settings` value: if the image
// size or any parameter changes, a new `Settings` is produced and every
// derived buffer is re-created from it.
//
// LAUNCH RANGES
// ─────────────
// Every pipeline kernel is launched over a 2-D range in the style of an
// OpenCL NDRange, but with the y axis folded:
//
//   global = [items_x, tile_y]     local = [tile_x, tile_y]
//
// Work item (gx, ly) processes rows ly, ly + tile_y, ly + 2·tile_y, ...
// `iterations` times. Only one tile row of work groups is dispatched; the
// y extent is covered by the loop. This keeps the dispatch small and lets
// each invocation reuse its per-row setup.
//
// PADDED NORM GRIDS
// ─────────────────
// The two block-normalization kernels read and write grids that carry a
// ring of zero cells around the real grid, so the 2×2 block sums never
// need bounds checks:
//
//        padding = tile + 1 (per axis)
//
//        padded x:   0    1 .. cells.x    cells.x+1 .. cells.x+padding.x-1
//                   [0]  [  real cells  ]  [        zeros              ]
//
// Cell (x, y) lives at padded (x + 1, y + 1). The block with top-left
// cell (x, y), where x and y may be -1, lives at padded (x + 1, y + 1) as
// well. The inverse-norm kernel iterates `cells + tile` block columns, a
// multiple of the tile whenever `cells` is, and the widest block it
// touches still lies inside the padded grid.

use serde::{Deserialize, Serialize};

use crate::error::{Axis, GeometryError};

/// Default number of contrast-insensitive orientation bins.
pub const DEFAULT_INSENSITIVE_BINS: usize = 9;

/// Added under the square root of every block norm.
pub const NORM_EPSILON: f32 = 1e-7;

/// Weight of each of the four block-normalized copies of an orientation
/// channel.
pub const ORIENTATION_WEIGHT: f32 = 0.5;

/// Number of texture-energy channels appended to every cell (one per block
/// the cell belongs to).
pub const TEXTURE_CHANNELS: usize = 4;

// ============================================================
// Configuration
// ============================================================

/// User-facing descriptor configuration.
///
/// `Default` gives the classic FHOG setup: 4-pixel cells, 9 insensitive
/// bins (18 sensitive), truncation 0.2, 4×4 work tiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HogConfig {
    /// Pixels per cell edge.
    pub cell_size: usize,
    /// Contrast-insensitive orientation bins over [0, π).
    pub insensitive_bin_count: usize,
    /// Clamp applied to every normalized contribution.
    pub truncation: f32,
    /// Work-tile (workgroup) size for every pipeline stage, in cells.
    pub tile_size: [u32; 2],
}

impl Default for HogConfig {
    fn default() -> Self {
        HogConfig {
            cell_size: 4,
            insensitive_bin_count: DEFAULT_INSENSITIVE_BINS,
            truncation: 0.2,
            tile_size: [4, 4],
        }
    }
}

impl HogConfig {
    /// Validate this configuration against an image size.
    pub fn settings_for(&self, image_width: usize, image_height: usize) -> Result<Settings, GeometryError> {
        configure(
            image_width,
            image_height,
            self.cell_size,
            self.insensitive_bin_count,
            self.truncation,
            self.tile_size,
        )
    }
}

// ============================================================
// Launch ranges
// ============================================================

/// The four compute passes of the staged pipeline, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// Raw per-cell orientation histogram.
    CellHistogram,
    /// Per-cell squared norm of the insensitive sub-vector.
    CellNorms,
    /// Per-block inverse norm on the padded block grid.
    InvBlockNorms,
    /// Truncated normalization into the final descriptor.
    Assembly,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::CellHistogram,
        KernelKind::CellNorms,
        KernelKind::InvBlockNorms,
        KernelKind::Assembly,
    ];

    /// Kernel entry-point name as acquired from the compute program.
    pub fn name(self) -> &'static str {
        match self {
            KernelKind::CellHistogram => "calc_cell_desc",
            KernelKind::CellNorms => "calc_cell_norms",
            KernelKind::InvBlockNorms => "calc_inv_block_norms",
            KernelKind::Assembly => "apply_normalization",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A 2-D launch range with folded y iterations (see module comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [u32; 2],
    pub local: [u32; 2],
    pub iterations: u32,
}

impl NdRange {
    /// Number of work groups to dispatch along x and y.
    pub fn work_groups(&self) -> [u32; 2] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1]]
    }

    /// Total item rows covered by the range (`global.y × iterations`).
    pub fn rows(&self) -> usize {
        self.global[1] as usize * self.iterations as usize
    }

    /// Item columns covered by the range.
    pub fn columns(&self) -> usize {
        self.global[0] as usize
    }
}

fn stage_range(
    kind: KernelKind,
    items: [usize; 2],
    tile: [u32; 2],
) -> Result<NdRange, GeometryError> {
    for (axis, count, t) in [(Axis::X, items[0], tile[0]), (Axis::Y, items[1], tile[1])] {
        if count % t as usize != 0 {
            return Err(GeometryError::TileMismatch {
                stage: kind.name(),
                axis,
                iterations: count,
                tile: t,
            });
        }
    }
    Ok(NdRange {
        global: [items[0] as u32, tile[1]],
        local: tile,
        iterations: (items[1] / tile[1] as usize) as u32,
    })
}

// ============================================================
// Settings
// ============================================================

/// Validated, immutable descriptor geometry. Produced by [`configure`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    image_size: [usize; 2],
    cell_size: usize,
    insensitive_bin_count: usize,
    truncation: f32,
    tile_size: [u32; 2],
    cell_count: [usize; 2],
    ranges: [NdRange; 4],
}

/// Validate the descriptor parameters against an image size and derive the
/// cell grid and every stage's launch range.
pub fn configure(
    image_width: usize,
    image_height: usize,
    cell_size: usize,
    insensitive_bin_count: usize,
    truncation: f32,
    tile_size: [u32; 2],
) -> Result<Settings, GeometryError> {
    if image_width == 0 || image_height == 0 {
        return Err(GeometryError::EmptyImage {
            width: image_width,
            height: image_height,
        });
    }
    if cell_size == 0 {
        return Err(GeometryError::ZeroCellSize);
    }
    if insensitive_bin_count == 0 {
        return Err(GeometryError::ZeroBinCount);
    }
    if !truncation.is_finite() || truncation <= 0.0 {
        return Err(GeometryError::InvalidTruncation(truncation));
    }
    if tile_size[0] == 0 || tile_size[1] == 0 {
        return Err(GeometryError::ZeroTile {
            x: tile_size[0],
            y: tile_size[1],
        });
    }
    for (axis, size) in [(Axis::X, image_width), (Axis::Y, image_height)] {
        if size % cell_size != 0 {
            return Err(GeometryError::NotCellMultiple {
                axis,
                size,
                cell_size,
            });
        }
    }

    let cells = [image_width / cell_size, image_height / cell_size];
    let tile = [tile_size[0] as usize, tile_size[1] as usize];
    let block_items = [cells[0] + tile[0], cells[1] + tile[1]];

    let ranges = [
        stage_range(KernelKind::CellHistogram, cells, tile_size)?,
        stage_range(KernelKind::CellNorms, cells, tile_size)?,
        stage_range(KernelKind::InvBlockNorms, block_items, tile_size)?,
        stage_range(KernelKind::Assembly, cells, tile_size)?,
    ];

    Ok(Settings {
        image_size: [image_width, image_height],
        cell_size,
        insensitive_bin_count,
        truncation,
        tile_size,
        cell_count: cells,
        ranges,
    })
}

impl Settings {
    pub fn image_size(&self) -> [usize; 2] {
        self.image_size
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn insensitive_bin_count(&self) -> usize {
        self.insensitive_bin_count
    }

    pub fn sensitive_bin_count(&self) -> usize {
        2 * self.insensitive_bin_count
    }

    pub fn channels_per_cell(&self) -> usize {
        self.insensitive_bin_count + self.sensitive_bin_count()
    }

    pub fn channels_per_block(&self) -> usize {
        self.channels_per_cell() + TEXTURE_CHANNELS
    }

    pub fn truncation(&self) -> f32 {
        self.truncation
    }

    pub fn tile_size(&self) -> [u32; 2] {
        self.tile_size
    }

    pub fn cell_count(&self) -> [usize; 2] {
        self.cell_count
    }

    /// Number of cells in the grid.
    pub fn cells_total(&self) -> usize {
        self.cell_count[0] * self.cell_count[1]
    }

    /// Length of the raw per-cell histogram buffer.
    pub fn cell_histogram_len(&self) -> usize {
        self.cells_total() * self.channels_per_cell()
    }

    /// Length of the final feature descriptor.
    pub fn descriptor_len(&self) -> usize {
        self.cells_total() * self.channels_per_block()
    }

    /// Zero ring added around the norm grids (`tile + 1` per axis).
    pub fn padding(&self) -> [usize; 2] {
        [self.tile_size[0] as usize + 1, self.tile_size[1] as usize + 1]
    }

    /// Dimensions of the padded cell-norm and block-norm grids.
    pub fn padded_grid(&self) -> [usize; 2] {
        let p = self.padding();
        [self.cell_count[0] + p[0], self.cell_count[1] + p[1]]
    }

    /// Element count of one padded grid.
    pub fn padded_len(&self) -> usize {
        let g = self.padded_grid();
        g[0] * g[1]
    }

    /// Weight of the texture-energy channels: `1 / sqrt(2·bins)`,
    /// 0.2357 for the default 9 insensitive bins.
    pub fn texture_weight(&self) -> f32 {
        1.0 / (2.0 * self.insensitive_bin_count as f32).sqrt()
    }

    /// Launch range of one pipeline kernel.
    pub fn range(&self, kind: KernelKind) -> NdRange {
        self.ranges[kind.index()]
    }

    /// Spatial interpolation weights for this cell size.
    pub fn interpolation_weights(&self) -> InterpolationWeights {
        InterpolationWeights::new(self.cell_size)
    }
}

// ============================================================
// Interpolation weights
// ============================================================

/// Triangular 1-D kernel over a cell's `2·cell_size` pixel window.
///
/// Offset `cell_size + i` (and its mirror `cell_size − 1 − i`) gets
/// `(cell_size − (i + 0.5)) / cell_size`: pixels at the cell centre vote
/// almost fully into the cell, pixels half a cell outside vote almost
/// nothing. Two neighbouring cells' weights for the same pixel sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationWeights {
    weights: Vec<f32>,
}

impl InterpolationWeights {
    pub fn new(cell_size: usize) -> Self {
        let mut weights = vec![0.0f32; 2 * cell_size];
        let cs = cell_size as f32;
        for i in 0..cell_size {
            let w = (cs - (i as f32 + 0.5)) / cs;
            weights[cell_size - 1 - i] = w;
            weights[cell_size + i] = w;
        }
        InterpolationWeights { weights }
    }

    #[inline]
    pub fn get(&self, offset: usize) -> f32 {
        self.weights[offset]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_16() -> Settings {
        HogConfig::default().settings_for(16, 16).unwrap()
    }

    #[test]
    fn test_channel_counts() {
        let s = default_16();
        assert_eq!(s.cell_count(), [4, 4]);
        assert_eq!(s.sensitive_bin_count(), 18);
        assert_eq!(s.channels_per_cell(), 27);
        assert_eq!(s.channels_per_block(), 31);
        assert_eq!(s.descriptor_len(), 16 * 31);
    }

    #[test]
    fn test_texture_weight_matches_fhog_constant() {
        let s = default_16();
        assert!((s.texture_weight() - 0.2357).abs() < 1e-4);

        let six = configure(16, 16, 4, 6, 0.2, [4, 4]).unwrap();
        assert!((six.texture_weight() - 1.0 / 12f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_interpolation_weights_cell4() {
        let w = InterpolationWeights::new(4);
        let expected = [0.125, 0.375, 0.625, 0.875, 0.875, 0.625, 0.375, 0.125];
        assert_eq!(w.len(), 8);
        for (i, e) in expected.iter().enumerate() {
            assert!((w.get(i) - e).abs() < 1e-6, "w[{i}] = {}", w.get(i));
        }
    }

    #[test]
    fn test_interpolation_weights_partition_of_unity() {
        // A pixel at offset i in one cell's window sits at offset i - cs in
        // the next cell's window; their weights must sum to one.
        let cs = 6;
        let w = InterpolationWeights::new(cs);
        for i in cs..2 * cs {
            let sum = w.get(i) + w.get(i - cs);
            assert!((sum - 1.0).abs() < 1e-6, "offset {i}: {sum}");
        }
    }

    #[test]
    fn test_ranges_fold_y_axis() {
        let s = configure(64, 32, 4, 9, 0.2, [4, 2]).unwrap();
        assert_eq!(s.cell_count(), [16, 8]);

        let hist = s.range(KernelKind::CellHistogram);
        assert_eq!(hist.global, [16, 2]);
        assert_eq!(hist.local, [4, 2]);
        assert_eq!(hist.iterations, 4);
        assert_eq!(hist.rows(), 8);
        assert_eq!(hist.work_groups(), [4, 1]);

        let blocks = s.range(KernelKind::InvBlockNorms);
        assert_eq!(blocks.global, [20, 2]);
        assert_eq!(blocks.iterations, 5);
    }

    #[test]
    fn test_padded_grid() {
        let s = default_16();
        assert_eq!(s.padding(), [5, 5]);
        assert_eq!(s.padded_grid(), [9, 9]);
        assert_eq!(s.padded_len(), 81);
        // Widest block item reads column (cells + tile - 1) + 1, which must
        // still be inside the padded grid.
        let r = s.range(KernelKind::InvBlockNorms);
        assert!((r.columns() - 1) + 1 < s.padded_grid()[0]);
        assert!((r.rows() - 1) + 1 < s.padded_grid()[1]);
    }

    #[test]
    fn test_rejects_non_multiple_of_cell() {
        let err = configure(18, 16, 4, 9, 0.2, [1, 1]).unwrap_err();
        assert_eq!(
            err,
            GeometryError::NotCellMultiple { axis: Axis::X, size: 18, cell_size: 4 }
        );
    }

    #[test]
    fn test_rejects_tile_not_dividing_cells() {
        // 24×16 → 6×4 cells; tile 4 does not divide 6 along x.
        let err = configure(24, 16, 4, 9, 0.2, [4, 4]).unwrap_err();
        match err {
            GeometryError::TileMismatch { stage, axis, iterations, tile } => {
                assert_eq!(stage, "calc_cell_desc");
                assert_eq!(axis, Axis::X);
                assert_eq!(iterations, 6);
                assert_eq!(tile, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_rejects_degenerate_parameters() {
        assert_eq!(configure(0, 16, 4, 9, 0.2, [1, 1]).unwrap_err(),
            GeometryError::EmptyImage { width: 0, height: 16 });
        assert_eq!(configure(16, 16, 0, 9, 0.2, [1, 1]).unwrap_err(), GeometryError::ZeroCellSize);
        assert_eq!(configure(16, 16, 4, 0, 0.2, [1, 1]).unwrap_err(), GeometryError::ZeroBinCount);
        assert!(matches!(
            configure(16, 16, 4, 9, 0.0, [1, 1]).unwrap_err(),
            GeometryError::InvalidTruncation(_)
        ));
        assert!(matches!(
            configure(16, 16, 4, 9, f32::NAN, [1, 1]).unwrap_err(),
            GeometryError::InvalidTruncation(_)
        ));
        assert_eq!(configure(16, 16, 4, 9, 0.2, [0, 4]).unwrap_err(),
            GeometryError::ZeroTile { x: 0, y: 4 });
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: HogConfig = serde_json::from_str(r#"{ "cell_size": 8 }"#).unwrap();
        assert_eq!(cfg.cell_size, 8);
        assert_eq!(cfg.insensitive_bin_count, DEFAULT_INSENSITIVE_BINS);
        assert_eq!(cfg.tile_size, [4, 4]);

        let json = serde_json::to_string(&HogConfig::default()).unwrap();
        let back: HogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HogConfig::default());
    }
}
