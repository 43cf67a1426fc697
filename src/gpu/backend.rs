// gpu/backend.rs — `ComputeDevice` on a wgpu queue.
//
// ORDERING
// ────────
// wgpu has one queue per device and executes submissions in order, so a
// wait-list entry that this device created is already satisfied by
// submission order. Only its status is checked: a failed or cancelled
// predecessor makes the launch fail or cancel without submitting. A
// foreign completion (a host gate, another device) that is still pending
// is waited on from the host before submitting.
//
// COMPLETION
// ──────────
// Each submission registers `on_submitted_work_done`; the callback fires
// from `device.poll`, which `wait` and `map_read` drive. Without a
// deadline they block in `Maintain::Wait`, otherwise they poll until the
// deadline passes.
//
// ERRORS
// ──────
// wgpu reports validation and out-of-memory errors asynchronously through
// the device error handler. Every call that can fail is wrapped in an
// error scope so the failure comes back as a `DeviceError` on that call.

use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use wgpu::util::DeviceExt;

use crate::error::DeviceError;
use crate::geometry::{KernelKind, NdRange, Settings};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernel::{compile, CompiledKernel};
use crate::pipeline::completion::{Completion, CompletionStatus, WaitError};
use crate::pipeline::device::{check_arg, Access, ComputeDevice, KernelArg, KernelConstants, ParamKind};

const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// A storage buffer of f32 elements.
#[derive(Clone)]
pub struct GpuBuffer {
    label: Arc<str>,
    access: Access,
    len: usize,
    buffer: Arc<wgpu::Buffer>,
}

impl GpuBuffer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<f32>()) as u64
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpuBuffer({}, {} elements)", self.label, self.len)
    }
}

// Uniform layout of a scalar argument (must match `vec4<i32>` in WGSL).
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ScalarParam {
    value: i32,
    _pad:  [i32; 3],
}

enum GpuArg {
    Buffer(GpuBuffer),
    /// Scalar int held in a `vec4<i32>` uniform.
    Int(i32, wgpu::Buffer),
}

/// A compiled kernel with its positional arguments.
pub struct GpuKernel {
    kind: KernelKind,
    tile: [u32; 2],
    compiled: CompiledKernel,
    args: Vec<Option<GpuArg>>,
    bind_group: Option<wgpu::BindGroup>,
}

impl GpuKernel {
    pub fn kind(&self) -> KernelKind {
        self.kind
    }
}

impl GpuDevice {
    fn pop_scope(&self) -> Option<wgpu::Error> {
        pollster::block_on(self.device.pop_error_scope())
    }

    /// Run `f` inside validation and out-of-memory scopes.
    fn scoped<R>(&self, f: impl FnOnce() -> R) -> (R, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let validation = self.pop_scope();
        let oom = self.pop_scope();
        (out, validation.or(oom))
    }

    fn track(&self, done: &Completion) {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(Completion::is_pending);
        issued.push(done.clone());
    }

    fn is_own(&self, c: &Completion) -> bool {
        let issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.iter().any(|o| o.same_signal(c))
    }

    /// Resolve a wait-list before submitting. `Some` is the completion to
    /// return instead of submitting.
    fn gate(&self, what: &str, wait: &[&Completion]) -> Option<Completion> {
        for c in wait {
            if c.is_pending() && !self.is_own(c) {
                trace!("{what}: waiting on a foreign predecessor");
                // Failure and cancellation are reported through the status below.
                if let Err(e) = c.wait(None) {
                    trace!("{what}: foreign predecessor resolved with {e}");
                }
            }
            match c.status() {
                CompletionStatus::Failed(msg) => {
                    return Some(Completion::failed(format!("predecessor of `{what}`: {msg}")));
                }
                CompletionStatus::Cancelled => {
                    let done = Completion::pending();
                    done.cancel();
                    return Some(done);
                }
                CompletionStatus::Pending | CompletionStatus::Complete => {}
            }
        }
        None
    }

    /// Signal a completion once everything submitted so far has run.
    fn signal_on_done(&self) -> Completion {
        let done = Completion::pending();
        let signal = done.clone();
        self.queue.on_submitted_work_done(move || signal.complete());
        self.track(&done);
        done
    }

    fn poll_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> Result<(), DeviceError> {
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            if ready() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WaitError::TimedOut.into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn rebuild_bind_group(&self, kernel: &mut GpuKernel) -> Result<(), DeviceError> {
        let mut entries = Vec::with_capacity(kernel.args.len());
        for (i, arg) in kernel.args.iter().enumerate() {
            let resource = match arg {
                Some(GpuArg::Buffer(b)) => b.buffer.as_entire_binding(),
                Some(GpuArg::Int(_, u)) => u.as_entire_binding(),
                None => {
                    kernel.bind_group = None;
                    return Ok(());
                }
            };
            entries.push(wgpu::BindGroupEntry { binding: i as u32, resource });
        }
        let (group, err) = self.scoped(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label:   Some(kernel.kind.name()),
                layout:  &kernel.compiled.bgl,
                entries: &entries,
            })
        });
        if let Some(e) = err {
            return Err(DeviceError::Argument {
                kernel: kernel.kind.name(),
                index: kernel.args.len() as u32 - 1,
                reason: e.to_string(),
            });
        }
        kernel.bind_group = Some(group);
        Ok(())
    }
}

impl ComputeDevice for GpuDevice {
    type Buffer = GpuBuffer;
    type Kernel = GpuKernel;

    fn describe(&self) -> String {
        self.to_string()
    }

    fn create_buffer(&self, label: &str, len: usize, access: Access) -> Result<GpuBuffer, DeviceError> {
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let (buffer, err) = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some(label),
                size,
                usage:              wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = err {
            return Err(DeviceError::Allocation {
                label: label.to_string(),
                reason: e.to_string(),
            });
        }
        debug!("GpuDevice: buffer `{label}` {size} bytes");
        Ok(GpuBuffer {
            label: Arc::from(label),
            access,
            len,
            buffer: Arc::new(buffer),
        })
    }

    fn create_kernel(&self, kind: KernelKind, settings: &Settings) -> Result<GpuKernel, DeviceError> {
        let tile = settings.tile_size();
        self.validate_tile(tile).map_err(|e| DeviceError::Kernel {
            kernel: kind.name(),
            reason: e.to_string(),
        })?;
        let constants = KernelConstants::from_settings(settings);
        let (compiled, err) = self.scoped(|| compile(self, kind, &constants));
        if let Some(e) = err {
            return Err(DeviceError::Kernel {
                kernel: kind.name(),
                reason: e.to_string(),
            });
        }
        Ok(GpuKernel {
            kind,
            tile,
            compiled,
            args: (0..kind.params().len()).map(|_| None).collect(),
            bind_group: None,
        })
    }

    fn set_arg(&self, kernel: &mut GpuKernel, index: u32, arg: KernelArg<'_, GpuBuffer>) -> Result<(), DeviceError> {
        let spec = check_arg(kernel.kind, index, &arg)?;
        let bound = match arg {
            KernelArg::Buffer(b) => {
                if spec.kind == ParamKind::Buffer(Access::ReadWrite) && b.access == Access::ReadOnly {
                    return Err(DeviceError::Argument {
                        kernel: kernel.kind.name(),
                        index,
                        reason: format!("`{}` is written but buffer `{}` is read-only", spec.name, b.label()),
                    });
                }
                GpuArg::Buffer(b.clone())
            }
            KernelArg::Int(v) => {
                let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label:    Some(spec.name),
                    contents: bytemuck::bytes_of(&ScalarParam { value: v, _pad: [0; 3] }),
                    usage:    wgpu::BufferUsages::UNIFORM,
                });
                GpuArg::Int(v, uniform)
            }
        };
        kernel.args[index as usize] = Some(bound);
        self.rebuild_bind_group(kernel)
    }

    fn enqueue_write(&self, buffer: &GpuBuffer, data: &[f32], wait: &[&Completion]) -> Result<Completion, DeviceError> {
        if data.len() > buffer.len() {
            return Err(DeviceError::Transfer(format!(
                "write of {} elements into `{}` ({} elements)",
                data.len(),
                buffer.label(),
                buffer.len()
            )));
        }
        if let Some(done) = self.gate(buffer.label(), wait) {
            return Ok(done);
        }
        let (_, err) = self.scoped(|| {
            self.queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
            self.queue.submit(std::iter::empty());
        });
        if let Some(e) = err {
            return Err(DeviceError::Transfer(e.to_string()));
        }
        Ok(self.signal_on_done())
    }

    fn enqueue_kernel(&self, kernel: &GpuKernel, range: &NdRange, wait: &[&Completion]) -> Result<Completion, DeviceError> {
        let name = kernel.kind.name();
        let launch_err = |reason: String| DeviceError::Launch { kernel: name, reason };

        if range.local != kernel.tile {
            return Err(launch_err(format!(
                "local size {:?} differs from the built work-group size {:?}",
                range.local, kernel.tile
            )));
        }
        if let Some(i) = kernel.args.iter().position(Option::is_none) {
            return Err(launch_err(format!("argument {i} is not bound")));
        }
        let bind_group = kernel
            .bind_group
            .as_ref()
            .ok_or_else(|| launch_err("no bind group".into()))?;

        let iterations = kernel.args.iter().find_map(|a| match a {
            Some(GpuArg::Int(v, _)) => Some(*v),
            _ => None,
        });
        if iterations != Some(range.iterations as i32) {
            return Err(launch_err(format!(
                "bound iteration count {iterations:?} differs from the range's {}",
                range.iterations
            )));
        }

        if let Some(done) = self.gate(name, wait) {
            return Ok(done);
        }

        let [groups_x, groups_y] = range.work_groups();
        let (_, err) = self.scoped(|| {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label:            Some(name),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.compiled.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = err {
            return Err(launch_err(e.to_string()));
        }
        trace!("{name}: dispatched {groups_x}×{groups_y} groups, {} iterations", range.iterations);
        Ok(self.signal_on_done())
    }

    fn wait(&self, completion: &Completion, deadline: Option<Instant>) -> Result<(), DeviceError> {
        if completion.is_pending() {
            match deadline {
                None => {
                    self.device.poll(wgpu::Maintain::Wait);
                }
                Some(d) => self.poll_until(d, || !completion.is_pending())?,
            }
        }
        // A foreign completion may still be pending after the queue drained.
        completion.wait(deadline).map_err(DeviceError::from)
    }

    fn map_read<R>(
        &self,
        buffer: &GpuBuffer,
        wait: &[&Completion],
        deadline: Option<Instant>,
        read: impl FnOnce(&[f32]) -> R,
    ) -> Result<R, DeviceError> {
        for c in wait {
            self.wait(c, deadline)?;
        }

        let size = buffer.byte_len();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some("hogpipe readback"),
            size,
            usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("hogpipe readback") });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });

        let mapped = match deadline {
            None => {
                self.device.poll(wgpu::Maintain::Wait);
                rx.recv().map_err(|e| DeviceError::Transfer(e.to_string()))?
            }
            Some(d) => {
                let mut result = None;
                self.poll_until(d, || match rx.try_recv() {
                    Ok(r) => {
                        result = Some(r);
                        true
                    }
                    Err(TryRecvError::Empty) => false,
                    Err(TryRecvError::Disconnected) => true,
                })?;
                result.ok_or_else(|| DeviceError::Transfer("map callback dropped".into()))?
            }
        };
        mapped.map_err(|e| DeviceError::Transfer(e.to_string()))?;

        let view = slice.get_mapped_range();
        let out = read(bytemuck::cast_slice(&view[..]));
        drop(view);
        staging.unmap();
        Ok(out)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::Wait);
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(Completion::is_pending);
        if !issued.is_empty() {
            debug!("GpuDevice: {} completions pending after drain", issued.len());
        }
        Ok(())
    }
}
