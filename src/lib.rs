// hogpipe: Histogram-of-Oriented-Gradients descriptor
//
// Two implementations of the same algorithm:
//   - `hog::SequentialHog`, a single-threaded reference that the parallel
//     code is validated against,
//   - `pipeline::HogPipeline`, four dependent compute stages launched on a
//     `ComputeDevice` (host threads in `pipeline::CpuDevice`, wgpu in
//     `gpu::GpuDevice`) and chained through completion signals.
//
// Reference: Felzenszwalb, Girshick, McAllester, Ramanan — "Object
// Detection with Discriminatively Trained Part-Based Models" (PAMI 2010)

pub mod image;
pub mod error;
pub mod geometry;
pub mod gradient;
pub mod hog;
pub mod compare;
pub mod pipeline;
pub mod gpu;

pub use compare::{compare_descriptors, compare_slices, MismatchStats, Tolerance};
pub use error::{DeviceError, GeometryError, HogError};
pub use geometry::{configure, HogConfig, KernelKind, NdRange, Settings};
pub use hog::{FeatureDescriptor, SequentialHog};
pub use image::{Image, Pixel};
pub use pipeline::{ComputeDevice, CpuDevice, HogPipeline, PipelineState};
