// error.rs — Error types shared by the reference and the staged pipeline.
//
// Three layers:
//   GeometryError — invalid image size / cell size / tiling, raised by
//                   `geometry::configure` before anything is allocated.
//   DeviceError   — what a `ComputeDevice` reports for one call
//                   (allocation, binding, launch, wait, readback).
//   HogError      — what callers of `SequentialHog` and `HogPipeline` see.
//                   Pipeline variants carry the stage name so a failure can
//                   be traced back to the kernel that caused it.

use thiserror::Error;

use crate::pipeline::completion::WaitError;

/// Axis of a 2-D quantity, used to make geometry errors readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

/// Setup-time validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("image is empty ({width}×{height})")]
    EmptyImage { width: usize, height: usize },

    #[error("cell size must be non-zero")]
    ZeroCellSize,

    #[error("insensitive bin count must be non-zero")]
    ZeroBinCount,

    #[error("truncation must be finite and positive, got {0}")]
    InvalidTruncation(f32),

    #[error("tile size must be non-zero, got {x}×{y}")]
    ZeroTile { x: u32, y: u32 },

    #[error("image {axis} size {size} is not a multiple of cell size {cell_size}")]
    NotCellMultiple {
        axis: Axis,
        size: usize,
        cell_size: usize,
    },

    #[error("stage `{stage}`: tile {axis} = {tile} does not divide iteration count {iterations}")]
    TileMismatch {
        stage: &'static str,
        axis: Axis,
        iterations: usize,
        tile: u32,
    },
}

/// Failure of a single compute-device call.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("allocation of `{label}` failed: {reason}")]
    Allocation { label: String, reason: String },

    #[error("kernel `{kernel}` could not be created: {reason}")]
    Kernel { kernel: &'static str, reason: String },

    #[error("argument {index} of `{kernel}`: {reason}")]
    Argument {
        kernel: &'static str,
        index: u32,
        reason: String,
    },

    #[error("launch of `{kernel}` failed: {reason}")]
    Launch { kernel: &'static str, reason: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Errors surfaced to users of the descriptor implementations.
#[derive(Debug, Error)]
pub enum HogError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(#[from] GeometryError),

    #[error("image is {actual_width}×{actual_height}, session configured for {expected_width}×{expected_height}")]
    ImageMismatch {
        expected_width: usize,
        expected_height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("stage `{stage}`: resource allocation failed")]
    ResourceAllocation {
        stage: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("stage `{stage}`: argument binding failed ({failed} of {total} arguments)")]
    ArgumentBinding {
        stage: &'static str,
        failed: usize,
        total: usize,
        #[source]
        source: DeviceError,
    },

    #[error("stage `{stage}`: launch failed")]
    Launch {
        stage: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("descriptor readback failed")]
    Readback(#[source] DeviceError),

    #[error("timed out waiting for the descriptor")]
    Timeout,

    #[error("frame was cancelled")]
    Cancelled,

    #[error("pipeline is not configured")]
    NotConfigured,

    #[error("operation `{operation}` is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl HogError {
    /// Map a readback-time device failure, keeping timeouts and
    /// cancellations distinguishable from genuine transfer errors.
    pub(crate) fn from_readback(err: DeviceError) -> Self {
        match err {
            DeviceError::Wait(WaitError::TimedOut) => HogError::Timeout,
            DeviceError::Wait(WaitError::Cancelled) => HogError::Cancelled,
            other => HogError::Readback(other),
        }
    }
}
