// image.rs — Grayscale input frame, generic over pixel type.
//
// Frames arrive from the capture collaborator either as 8-bit luminance or
// as f32 luminance in [0, 255]. Both descriptor implementations read pixels
// through the `Pixel` trait, so the same frame type feeds the sequential
// reference and the staged pipeline.
//
// Rows may carry trailing padding (stride > width), as capture buffers
// often do:
//
//   stride = 5, width = 4
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// The compute devices want a dense row-major f32 buffer with no padding,
// which is what `to_dense_f32()` produces before each upload.

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Luminance sample type accepted by the descriptor.
///
/// Values are used as raw intensities, not normalized to [0, 1], so
/// gradient magnitudes come out in intensity units for either type.
pub trait Pixel: Copy + Default + Send + Sync + 'static {
    fn to_f32(self) -> f32;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A single-channel frame with runtime dimensions and an optional row stride.
#[derive(Clone)]
pub struct Image<T: Pixel> {
    /// `height` rows of `stride` elements each.
    data: Vec<T>,
    width: usize,
    height: usize,
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// Zero-filled dense frame.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Zero-filled frame whose rows are `stride` elements apart.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Wrap a dense row-major pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "frame of {width}×{height} needs {} pixels, got {}",
            width * height,
            data.len(),
        );
        Image {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Dense frame with pixel `(x, y)` set to `f(x, y)`. Used for synthetic
    /// scenes in tests and benches.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Image::from_vec(width, height, data)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Pixel at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if `(x, y)` lies outside the frame.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.offset(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.offset(x, y);
        self.data[idx] = value;
    }

    /// Read pixel `(x, y)` as f32, replicating the nearest edge pixel for
    /// coordinates outside the image.
    ///
    /// This is the neighbour lookup used by the central-difference gradient:
    /// a pixel on the image border sees its missing neighbour as itself, so
    /// the border contributes no artificial step.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.stride + cx].to_f32()
    }

    /// `(x, y, value)` for every pixel, row by row, padding skipped.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| self.row(y).iter().enumerate().map(move |(x, &v)| (x, y, v)))
    }

    /// Compact the image into a dense row-major f32 buffer of
    /// `width * height` elements, the layout every compute device expects.
    pub fn to_dense_f32(&self) -> Vec<f32> {
        (0..self.height)
            .flat_map(|y| self.row(y).iter().map(|p| p.to_f32()))
            .collect()
    }

    fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    #[inline]
    fn offset(&self, x: usize, y: usize) -> usize {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
        y * self.stride + x
    }
}
