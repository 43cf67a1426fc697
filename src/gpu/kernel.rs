// gpu/kernel.rs — Shader templating and compute-pipeline construction.
//
// One WGSL file per HOG kernel under src/shaders/. Everything fixed for a
// configured session (image and grid sizes, bin counts, truncation, tile)
// is substituted as `{{NAME}}` text before compilation; naga does not
// accept pipeline-overridable constants inside @workgroup_size.
//
// Bind group layouts are derived from the kernel's positional signature:
// argument i is @binding(i). Buffers become storage bindings (read-only or
// read-write as declared) and scalar ints become 16-byte uniforms read
// through `.x`.

use crate::geometry::{KernelKind, NORM_EPSILON, ORIENTATION_WEIGHT};
use crate::gpu::device::GpuDevice;
use crate::pipeline::device::{Access, KernelConstants, ParamKind};

/// A compiled kernel: pipeline plus the layout its bind groups must match.
pub(crate) struct CompiledKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub bgl: wgpu::BindGroupLayout,
}

fn template(kind: KernelKind) -> &'static str {
    match kind {
        KernelKind::CellHistogram => include_str!("../shaders/calc_cell_desc.wgsl"),
        KernelKind::CellNorms => include_str!("../shaders/calc_cell_norms.wgsl"),
        KernelKind::InvBlockNorms => include_str!("../shaders/calc_inv_block_norms.wgsl"),
        KernelKind::Assembly => include_str!("../shaders/apply_normalization.wgsl"),
    }
}

/// Format an f32 so WGSL parses it as a float literal.
fn wgsl_f32(v: f32) -> String {
    let s = format!("{v:?}");
    if s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}

/// Shader source for `kind` with every placeholder filled in.
pub(crate) fn shader_source(kind: KernelKind, k: &KernelConstants) -> String {
    let subs: [(&str, String); 14] = [
        ("{{WG_X}}", k.tile[0].to_string()),
        ("{{WG_Y}}", k.tile[1].to_string()),
        ("{{IMAGE_W}}", k.image_size[0].to_string()),
        ("{{IMAGE_H}}", k.image_size[1].to_string()),
        ("{{CELL_SIZE}}", k.cell_size.to_string()),
        ("{{SENS_BINS}}", k.sensitive_bins().to_string()),
        ("{{INS_BINS}}", k.insensitive_bins.to_string()),
        ("{{CELLS_X}}", k.cell_count[0].to_string()),
        ("{{CELLS_Y}}", k.cell_count[1].to_string()),
        ("{{PADDED_W}}", k.padded_grid[0].to_string()),
        ("{{TRUNCATION}}", wgsl_f32(k.truncation)),
        ("{{TEXTURE_WEIGHT}}", wgsl_f32(k.texture_weight)),
        ("{{EPSILON}}", wgsl_f32(NORM_EPSILON)),
        ("{{ORIENTATION_WEIGHT}}", wgsl_f32(ORIENTATION_WEIGHT)),
    ];
    subs.iter()
        .fold(template(kind).to_string(), |src, (key, value)| src.replace(key, value))
}

fn layout_entries(kind: KernelKind) -> Vec<wgpu::BindGroupLayoutEntry> {
    kind.params()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let ty = match p.kind {
                ParamKind::Buffer(access) => wgpu::BufferBindingType::Storage {
                    read_only: access == Access::ReadOnly,
                },
                ParamKind::Int => wgpu::BufferBindingType::Uniform,
            };
            wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }
        })
        .collect()
}

/// Compile `kind` on `gpu`. Validation errors are collected by the caller
/// through an error scope.
pub(crate) fn compile(gpu: &GpuDevice, kind: KernelKind, k: &KernelConstants) -> CompiledKernel {
    let name = kind.name();
    let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label:  Some(name),
        source: wgpu::ShaderSource::Wgsl(shader_source(kind, k).into()),
    });

    let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label:   Some(name),
        entries: &layout_entries(kind),
    });

    let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label:                Some(name),
        bind_group_layouts:   &[&bgl],
        push_constant_ranges: &[],
    });

    let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label:               Some(name),
        layout:              Some(&pipeline_layout),
        module:              &shader,
        entry_point:         "main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache:               None,
    });

    CompiledKernel { pipeline, bgl }
}
