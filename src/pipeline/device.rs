// pipeline/device.rs — The compute-runtime seam.
//
// The staged pipeline never touches threads or GPU queues directly. It
// talks to a `ComputeDevice`, which offers the small OpenCL-shaped surface
// the orchestrator needs:
//
//   create_buffer   zero-initialized f32 buffer with an access flag
//   create_kernel   "build the program" for one kernel: bake the Settings
//                   constants in and fix the work-group size
//   set_arg         positional argument binding (buffer or scalar int)
//   enqueue_write   host → device copy, returns a Completion
//   enqueue_kernel  NdRange launch gated on a wait-list of Completions
//   map_read        blocking map-for-read of a buffer, gated on a wait-list
//   finish          drain every operation issued so far
//
// Two implementations live in this crate: `CpuDevice` (host threads and a
// rayon pool) and `GpuDevice` (wgpu compute). Tests wrap either of them to
// inject failures.
//
// KERNEL SIGNATURES
// ─────────────────
//   calc_cell_desc        0 image (ro)   1 weights (ro)       2 cell_desc (rw)     3 iterations
//   calc_cell_norms       0 cell_desc    1 cell_norms (rw)    2 iterations
//   calc_inv_block_norms  0 cell_norms   1 inv_block_norms    2 iterations
//   apply_normalization   0 cell_desc    1 inv_block_norms    2 descriptor (rw)    3 iterations
//                         4 padding_x
//
// Scalar arguments are i32. Every buffer holds f32.

use std::time::Instant;

use crate::error::DeviceError;
use crate::geometry::{KernelKind, NdRange, Settings};
use crate::pipeline::completion::Completion;

/// How a kernel uses a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Declared type of one positional kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Buffer(Access),
    Int,
}

/// One entry of a kernel's positional signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

const fn buffer(name: &'static str, access: Access) -> ParamSpec {
    ParamSpec { name, kind: ParamKind::Buffer(access) }
}

const fn int(name: &'static str) -> ParamSpec {
    ParamSpec { name, kind: ParamKind::Int }
}

static CALC_CELL_DESC: [ParamSpec; 4] = [
    buffer("image", Access::ReadOnly),
    buffer("weights", Access::ReadOnly),
    buffer("cell_desc", Access::ReadWrite),
    int("iterations"),
];

static CALC_CELL_NORMS: [ParamSpec; 3] = [
    buffer("cell_desc", Access::ReadOnly),
    buffer("cell_norms", Access::ReadWrite),
    int("iterations"),
];

static CALC_INV_BLOCK_NORMS: [ParamSpec; 3] = [
    buffer("cell_norms", Access::ReadOnly),
    buffer("inv_block_norms", Access::ReadWrite),
    int("iterations"),
];

static APPLY_NORMALIZATION: [ParamSpec; 5] = [
    buffer("cell_desc", Access::ReadOnly),
    buffer("inv_block_norms", Access::ReadOnly),
    buffer("descriptor", Access::ReadWrite),
    int("iterations"),
    int("padding_x"),
];

impl KernelKind {
    /// Positional parameter list of this kernel.
    pub fn params(self) -> &'static [ParamSpec] {
        match self {
            KernelKind::CellHistogram => &CALC_CELL_DESC,
            KernelKind::CellNorms => &CALC_CELL_NORMS,
            KernelKind::InvBlockNorms => &CALC_INV_BLOCK_NORMS,
            KernelKind::Assembly => &APPLY_NORMALIZATION,
        }
    }

    /// Index of the single read-write buffer parameter.
    pub fn output_param(self) -> u32 {
        self.params()
            .iter()
            .position(|p| p.kind == ParamKind::Buffer(Access::ReadWrite))
            .unwrap_or(0) as u32
    }
}

/// A value bound to one kernel parameter.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Int(i32),
}

/// Check that `arg` matches parameter `index` of `kind`, returning the
/// parameter spec. Shared by every device implementation.
pub fn check_arg<B>(kind: KernelKind, index: u32, arg: &KernelArg<'_, B>) -> Result<ParamSpec, DeviceError> {
    let spec = kind
        .params()
        .get(index as usize)
        .copied()
        .ok_or_else(|| DeviceError::Argument {
            kernel: kind.name(),
            index,
            reason: format!("kernel takes {} arguments", kind.params().len()),
        })?;
    match (spec.kind, arg) {
        (ParamKind::Buffer(_), KernelArg::Buffer(_)) | (ParamKind::Int, KernelArg::Int(_)) => Ok(spec),
        (ParamKind::Buffer(_), KernelArg::Int(_)) => Err(DeviceError::Argument {
            kernel: kind.name(),
            index,
            reason: format!("`{}` expects a buffer, got a scalar", spec.name),
        }),
        (ParamKind::Int, KernelArg::Buffer(_)) => Err(DeviceError::Argument {
            kernel: kind.name(),
            index,
            reason: format!("`{}` expects a scalar, got a buffer", spec.name),
        }),
    }
}

/// Compile-time constants every kernel is built with.
///
/// This is what the compute "program build" bakes in; everything that can
/// change per launch is a kernel argument instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelConstants {
    pub image_size: [usize; 2],
    pub cell_size: usize,
    pub insensitive_bins: usize,
    pub cell_count: [usize; 2],
    pub padded_grid: [usize; 2],
    pub tile: [u32; 2],
    pub truncation: f32,
    pub texture_weight: f32,
}

impl KernelConstants {
    pub fn from_settings(settings: &Settings) -> Self {
        KernelConstants {
            image_size: settings.image_size(),
            cell_size: settings.cell_size(),
            insensitive_bins: settings.insensitive_bin_count(),
            cell_count: settings.cell_count(),
            padded_grid: settings.padded_grid(),
            tile: settings.tile_size(),
            truncation: settings.truncation(),
            texture_weight: settings.texture_weight(),
        }
    }

    pub fn sensitive_bins(&self) -> usize {
        2 * self.insensitive_bins
    }

    pub fn channels_per_cell(&self) -> usize {
        3 * self.insensitive_bins
    }

    pub fn channels_per_block(&self) -> usize {
        self.channels_per_cell() + crate::geometry::TEXTURE_CHANNELS
    }
}

/// A compute runtime able to run the four HOG kernels.
///
/// Buffers and kernels are plain owned values: dropping them releases the
/// device resource. Completions are reference counted and released with
/// their last handle.
pub trait ComputeDevice: Send + Sync {
    type Buffer: Send + Sync;
    type Kernel: Send;

    /// Human-readable device description for logs.
    fn describe(&self) -> String;

    /// Allocate a zero-initialized buffer of `len` f32 elements.
    fn create_buffer(&self, label: &str, len: usize, access: Access) -> Result<Self::Buffer, DeviceError>;

    /// Build `kind` for `settings`, with the settings' tile as work-group size.
    fn create_kernel(&self, kind: KernelKind, settings: &Settings) -> Result<Self::Kernel, DeviceError>;

    /// Bind positional argument `index`.
    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> Result<(), DeviceError>;

    /// Copy `data` into `buffer` once every entry of `wait` has completed.
    fn enqueue_write(&self, buffer: &Self::Buffer, data: &[f32], wait: &[&Completion]) -> Result<Completion, DeviceError>;

    /// Launch `kernel` over `range` once every entry of `wait` has completed.
    fn enqueue_kernel(&self, kernel: &Self::Kernel, range: &NdRange, wait: &[&Completion]) -> Result<Completion, DeviceError>;

    /// Block on one completion, driving the device if it needs polling.
    fn wait(&self, completion: &Completion, deadline: Option<Instant>) -> Result<(), DeviceError>;

    /// Map `buffer` for reading after `wait` completes and hand the
    /// contents to `read`. The mapping is released before returning.
    fn map_read<R>(
        &self,
        buffer: &Self::Buffer,
        wait: &[&Completion],
        deadline: Option<Instant>,
        read: impl FnOnce(&[f32]) -> R,
    ) -> Result<R, DeviceError>;

    /// Block until every operation issued so far has finished.
    fn finish(&self) -> Result<(), DeviceError>;
}

/// A shared reference drives the same device, so several pipelines (or a
/// pipeline and a test) can use one device.
impl<D: ComputeDevice> ComputeDevice for &D {
    type Buffer = D::Buffer;
    type Kernel = D::Kernel;

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn create_buffer(&self, label: &str, len: usize, access: Access) -> Result<Self::Buffer, DeviceError> {
        (**self).create_buffer(label, len, access)
    }

    fn create_kernel(&self, kind: KernelKind, settings: &Settings) -> Result<Self::Kernel, DeviceError> {
        (**self).create_kernel(kind, settings)
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> Result<(), DeviceError> {
        (**self).set_arg(kernel, index, arg)
    }

    fn enqueue_write(&self, buffer: &Self::Buffer, data: &[f32], wait: &[&Completion]) -> Result<Completion, DeviceError> {
        (**self).enqueue_write(buffer, data, wait)
    }

    fn enqueue_kernel(&self, kernel: &Self::Kernel, range: &NdRange, wait: &[&Completion]) -> Result<Completion, DeviceError> {
        (**self).enqueue_kernel(kernel, range, wait)
    }

    fn wait(&self, completion: &Completion, deadline: Option<Instant>) -> Result<(), DeviceError> {
        (**self).wait(completion, deadline)
    }

    fn map_read<R>(
        &self,
        buffer: &Self::Buffer,
        wait: &[&Completion],
        deadline: Option<Instant>,
        read: impl FnOnce(&[f32]) -> R,
    ) -> Result<R, DeviceError> {
        (**self).map_read(buffer, wait, deadline, read)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        (**self).finish()
    }
}
