// pipeline/mod.rs — Staged data-parallel HOG.
//
// The descriptor is split into four dependent kernels (see stage.rs) run
// on any `ComputeDevice`. `HogPipeline` owns the session and drives one
// frame at a time; `CpuDevice` is the host backend, `crate::gpu` provides
// the wgpu one.

pub mod completion;
pub mod cpu;
pub mod device;
pub(crate) mod kernels;
pub mod orchestrator;
pub mod stage;

pub use completion::{Completion, CompletionStatus, WaitError};
pub use cpu::{CpuBuffer, CpuDevice, CpuKernel};
pub use device::{Access, ComputeDevice, KernelArg, KernelConstants, ParamKind, ParamSpec};
pub use orchestrator::{CancelHandle, HogPipeline, PendingFrame, PipelineState};
pub use stage::{build_graph, BufferSlot, StageInput, StageSpec};
