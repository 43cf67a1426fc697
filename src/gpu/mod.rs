// gpu/mod.rs — wgpu backend for the staged HOG pipeline.
//
// `GpuDevice` implements `pipeline::ComputeDevice`, so the same
// orchestrator drives host threads or a GPU queue:
//
//   HogPipeline<GpuDevice>
//     image upload → calc_cell_desc → calc_cell_norms
//                  → calc_inv_block_norms → apply_normalization → readback
//
// The sequential reference in `crate::hog` stays authoritative; every GPU
// kernel is checked against it within the descriptor tolerance.

pub mod backend;
pub mod device;
pub(crate) mod kernel;

pub use backend::{GpuBuffer, GpuKernel};
pub use device::{AdapterInfo, DeviceProfile, GpuDevice, GpuError};
