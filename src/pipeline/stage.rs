// pipeline/stage.rs — Data-only stage descriptors and the stage graph.
//
// A stage is fully described by a `StageSpec`: which kernel it runs, over
// which range, which positional arguments it takes and where they come
// from. The orchestrator turns each spec into a bound kernel; there is no
// per-stage wrapper type.
//
// Dependencies are not listed by hand. A stage waits on whoever last wrote
// each buffer it reads:
//
//   image ─upload─▶ Image ──┐
//                  Weights ─┴─▶ calc_cell_desc ─▶ CellHistogram ─┬────────────┐
//                                                                ▼            │
//                                       calc_cell_norms ─▶ CellNorms          │
//                                                                ▼            ▼
//                              calc_inv_block_norms ─▶ InvBlockNorms ─▶ apply_normalization ─▶ Descriptor
//
// Every buffer has exactly one writer, so the graph alone guarantees that
// no two live stages write the same memory.

use crate::geometry::{KernelKind, NdRange, Settings};
use crate::pipeline::device::Access;

/// Index into a session's buffer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// Dense f32 frame, written by the host upload.
    Image,
    /// 1-D interpolation weights, written once at configure time.
    InterpWeights,
    CellHistogram,
    /// Padded grid of per-cell squared norms.
    CellNorms,
    /// Padded grid of per-block inverse norms.
    InvBlockNorms,
    Descriptor,
}

impl BufferSlot {
    pub const ALL: [BufferSlot; 6] = [
        BufferSlot::Image,
        BufferSlot::InterpWeights,
        BufferSlot::CellHistogram,
        BufferSlot::CellNorms,
        BufferSlot::InvBlockNorms,
        BufferSlot::Descriptor,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            BufferSlot::Image => "image",
            BufferSlot::InterpWeights => "interp_weights",
            BufferSlot::CellHistogram => "cell_histogram",
            BufferSlot::CellNorms => "cell_norms",
            BufferSlot::InvBlockNorms => "inv_block_norms",
            BufferSlot::Descriptor => "descriptor",
        }
    }

    /// Element count for `settings`.
    pub fn len(self, settings: &Settings) -> usize {
        let [w, h] = settings.image_size();
        match self {
            BufferSlot::Image => w * h,
            BufferSlot::InterpWeights => 2 * settings.cell_size(),
            BufferSlot::CellHistogram => settings.cell_histogram_len(),
            BufferSlot::CellNorms | BufferSlot::InvBlockNorms => settings.padded_len(),
            BufferSlot::Descriptor => settings.descriptor_len(),
        }
    }

    /// Whether the host fills this buffer (as opposed to a stage).
    pub fn host_written(self) -> bool {
        matches!(self, BufferSlot::Image | BufferSlot::InterpWeights)
    }

    pub fn access(self) -> Access {
        if self.host_written() {
            Access::ReadOnly
        } else {
            Access::ReadWrite
        }
    }
}

/// Source of one positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    Buffer(BufferSlot),
    /// The stage range's `iterations`.
    Iterations,
    /// Padding of the norm grids along x.
    PaddingX,
}

/// Everything needed to build, bind and launch one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub kind: KernelKind,
    pub range: NdRange,
    pub args: &'static [StageInput],
    pub output: BufferSlot,
}

impl StageSpec {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Buffers this stage reads.
    pub fn reads(&self) -> impl Iterator<Item = BufferSlot> + '_ {
        self.args.iter().filter_map(move |a| match a {
            StageInput::Buffer(slot) if *slot != self.output => Some(*slot),
            _ => None,
        })
    }

    /// Value of a scalar argument.
    pub fn scalar(&self, input: StageInput, settings: &Settings) -> Option<i32> {
        match input {
            StageInput::Iterations => Some(self.range.iterations as i32),
            StageInput::PaddingX => Some(settings.padding()[0] as i32),
            StageInput::Buffer(_) => None,
        }
    }
}

use BufferSlot::*;

static CELL_DESC_ARGS: [StageInput; 4] = [
    StageInput::Buffer(Image),
    StageInput::Buffer(InterpWeights),
    StageInput::Buffer(CellHistogram),
    StageInput::Iterations,
];
static CELL_NORMS_ARGS: [StageInput; 3] = [
    StageInput::Buffer(CellHistogram),
    StageInput::Buffer(CellNorms),
    StageInput::Iterations,
];
static INV_BLOCK_ARGS: [StageInput; 3] = [
    StageInput::Buffer(CellNorms),
    StageInput::Buffer(InvBlockNorms),
    StageInput::Iterations,
];
static ASSEMBLY_ARGS: [StageInput; 5] = [
    StageInput::Buffer(CellHistogram),
    StageInput::Buffer(InvBlockNorms),
    StageInput::Buffer(Descriptor),
    StageInput::Iterations,
    StageInput::PaddingX,
];

/// The four stages in launch order.
pub fn build_graph(settings: &Settings) -> Vec<StageSpec> {
    let spec = |kind: KernelKind, args: &'static [StageInput], output: BufferSlot| StageSpec {
        kind,
        range: settings.range(kind),
        args,
        output,
    };
    vec![
        spec(KernelKind::CellHistogram, &CELL_DESC_ARGS[..], CellHistogram),
        spec(KernelKind::CellNorms, &CELL_NORMS_ARGS[..], CellNorms),
        spec(KernelKind::InvBlockNorms, &INV_BLOCK_ARGS[..], InvBlockNorms),
        spec(KernelKind::Assembly, &ASSEMBLY_ARGS[..], Descriptor),
    ]
}
