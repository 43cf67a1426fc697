// pipeline/cpu.rs — Host-thread implementation of `ComputeDevice`.
//
// EXECUTION MODEL
// ───────────────
// Every enqueue spawns one named launcher thread:
//
//   launcher ──wait on wait-list──▶ run kernel body in the rayon pool ──▶ signal
//
// So operations become runnable in whatever order their predecessors
// finish, exactly like an out-of-order command queue; only the completion
// handles in a wait-list impose ordering. Kernel bodies run inside a
// dedicated rayon `ThreadPool` (band-parallel, see kernels.rs).
//
// If a predecessor failed, the launch fails without running; if it was
// cancelled, the launch is cancelled too. A launch cancelled while it waits
// stops waiting within `CANCEL_POLL`. A kernel body that panics fails
// its completion instead of tearing down the launcher.
//
// Buffers are `Arc<RwLock<Vec<f32>>>`. A running kernel holds read locks
// on its inputs and the write lock on its output for the duration of the
// body. The stage graph guarantees no two concurrent launches write the
// same buffer, and binding a buffer as both input and output of one
// launch is rejected up front.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::DeviceError;
use crate::geometry::{KernelKind, NdRange, Settings};
use crate::pipeline::completion::{wait_all, Completion, WaitError};
use crate::pipeline::device::{check_arg, Access, ComputeDevice, KernelArg, KernelConstants, ParamKind};
use crate::pipeline::kernels;

/// How often a launcher blocked on its wait-list checks its own signal.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// A host buffer shared between the device and its launcher threads.
#[derive(Clone)]
pub struct CpuBuffer {
    label: Arc<str>,
    access: Access,
    data: Arc<RwLock<Vec<f32>>>,
}

impl CpuBuffer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn same_storage(&self, other: &CpuBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuBuffer({}, {} elements)", self.label, self.len())
    }
}

#[derive(Clone)]
enum Bound {
    Buffer(CpuBuffer),
    Int(i32),
}

/// A kernel "built" for one Settings value.
pub struct CpuKernel {
    kind: KernelKind,
    constants: KernelConstants,
    args: Vec<Option<Bound>>,
}

impl CpuKernel {
    pub fn kind(&self) -> KernelKind {
        self.kind
    }
}

/// Bound arguments captured by one launch.
struct Launch {
    kind: KernelKind,
    constants: KernelConstants,
    args: Vec<Bound>,
}

/// Compute device backed by host threads and a rayon pool.
pub struct CpuDevice {
    pool: Arc<rayon::ThreadPool>,
    launched: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuDevice {
    /// Device using one worker per available core.
    pub fn new() -> Result<Self, DeviceError> {
        Self::with_threads(0)
    }

    /// Device with an explicit worker count (0 = rayon's default).
    pub fn with_threads(threads: usize) -> Result<Self, DeviceError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hog-cpu-{i}"))
            .build()
            .map_err(|e| DeviceError::Allocation {
                label: "thread pool".into(),
                reason: e.to_string(),
            })?;
        debug!("CpuDevice: {} worker threads", pool.current_num_threads());
        Ok(CpuDevice {
            pool: Arc::new(pool),
            launched: Mutex::new(Vec::new()),
        })
    }

    /// Launcher threads that have not exited yet.
    pub fn in_flight(&self) -> usize {
        let launched = self.launched.lock().unwrap_or_else(|p| p.into_inner());
        launched.iter().filter(|h| !h.is_finished()).count()
    }

    /// Spawn a launcher thread that waits on `wait`, then runs `work`.
    fn spawn(
        &self,
        name: String,
        wait: &[&Completion],
        work: impl FnOnce() -> Result<(), String> + Send + 'static,
    ) -> Result<Completion, DeviceError> {
        let done = Completion::pending();
        let signal = done.clone();
        let predecessors: Vec<Completion> = wait.iter().map(|c| (*c).clone()).collect();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let refs: Vec<&Completion> = predecessors.iter().collect();
                loop {
                    match wait_all(&refs, Some(Instant::now() + CANCEL_POLL)) {
                        Ok(()) => break,
                        Err(WaitError::TimedOut) if signal.is_pending() => {}
                        // Cancelled while waiting.
                        Err(WaitError::TimedOut) => return,
                        Err(WaitError::Cancelled) => {
                            signal.cancel();
                            return;
                        }
                        Err(e) => {
                            signal.fail(format!("predecessor of `{name}`: {e}"));
                            return;
                        }
                    }
                }
                // Cancelled while queued: skip the work.
                if !signal.is_pending() {
                    return;
                }
                match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(())) => signal.complete(),
                    Ok(Err(msg)) => {
                        warn!("{name}: {msg}");
                        signal.fail(msg);
                    }
                    Err(_) => {
                        warn!("{name}: kernel body panicked");
                        signal.fail(format!("`{name}` panicked"));
                    }
                }
            })
            .map_err(|e| DeviceError::Launch {
                kernel: "launcher",
                reason: e.to_string(),
            })?;

        let mut launched = self.launched.lock().unwrap_or_else(|p| p.into_inner());
        launched.retain(|h| !h.is_finished());
        launched.push(handle);
        Ok(done)
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("CpuDevice: {e}");
        }
    }
}

fn lock_err(what: &str) -> String {
    format!("buffer `{what}` lock poisoned")
}

fn run_launch(launch: &Launch) -> Result<(), String> {
    let k = &launch.constants;
    let out_index = launch.kind.output_param() as usize;

    let buffer_at = |i: usize| -> Result<&CpuBuffer, String> {
        match launch.args.get(i) {
            Some(Bound::Buffer(b)) => Ok(b),
            _ => Err(format!("argument {i} is not a buffer")),
        }
    };
    let int_at = |i: usize| -> Result<i32, String> {
        match launch.args.get(i) {
            Some(Bound::Int(v)) => Ok(*v),
            _ => Err(format!("argument {i} is not a scalar")),
        }
    };

    let out = buffer_at(out_index)?;
    let mut out_data = out.data.write().map_err(|_| lock_err(out.label()))?;

    match launch.kind {
        KernelKind::CellHistogram => {
            let image = buffer_at(0)?;
            let weights = buffer_at(1)?;
            let image = image.data.read().map_err(|_| lock_err(image.label()))?;
            let weights = weights.data.read().map_err(|_| lock_err(weights.label()))?;
            kernels::calc_cell_desc(k, &image, &weights, &mut out_data, int_at(3)?)
        }
        KernelKind::CellNorms => {
            let desc = buffer_at(0)?;
            let desc = desc.data.read().map_err(|_| lock_err(desc.label()))?;
            kernels::calc_cell_norms(k, &desc, &mut out_data, int_at(2)?)
        }
        KernelKind::InvBlockNorms => {
            let norms = buffer_at(0)?;
            let norms = norms.data.read().map_err(|_| lock_err(norms.label()))?;
            kernels::calc_inv_block_norms(k, &norms, &mut out_data, int_at(2)?)
        }
        KernelKind::Assembly => {
            let desc = buffer_at(0)?;
            let inv = buffer_at(1)?;
            let desc = desc.data.read().map_err(|_| lock_err(desc.label()))?;
            let inv = inv.data.read().map_err(|_| lock_err(inv.label()))?;
            kernels::apply_normalization(k, &desc, &inv, &mut out_data, int_at(3)?, int_at(4)?)
        }
    }
}

impl ComputeDevice for CpuDevice {
    type Buffer = CpuBuffer;
    type Kernel = CpuKernel;

    fn describe(&self) -> String {
        format!("CpuDevice ({} threads)", self.pool.current_num_threads())
    }

    fn create_buffer(&self, label: &str, len: usize, access: Access) -> Result<CpuBuffer, DeviceError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| DeviceError::Allocation {
            label: label.to_string(),
            reason: e.to_string(),
        })?;
        data.resize(len, 0.0);
        Ok(CpuBuffer {
            label: Arc::from(label),
            access,
            data: Arc::new(RwLock::new(data)),
        })
    }

    fn create_kernel(&self, kind: KernelKind, settings: &Settings) -> Result<CpuKernel, DeviceError> {
        Ok(CpuKernel {
            kind,
            constants: KernelConstants::from_settings(settings),
            args: vec![None; kind.params().len()],
        })
    }

    fn set_arg(&self, kernel: &mut CpuKernel, index: u32, arg: KernelArg<'_, CpuBuffer>) -> Result<(), DeviceError> {
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
                Bound::Buffer(b.clone())
            }
            KernelArg::Int(v) => Bound::Int(v),
        };
        kernel.args[index as usize] = Some(bound);
        Ok(())
    }

    fn enqueue_write(&self, buffer: &CpuBuffer, data: &[f32], wait: &[&Completion]) -> Result<Completion, DeviceError> {
        if data.len() > buffer.len() {
            return Err(DeviceError::Transfer(format!(
                "write of {} elements into `{}` ({} elements)",
                data.len(),
                buffer.label(),
                buffer.len()
            )));
        }
        let target = buffer.clone();
        let payload = data.to_vec();
        self.spawn(format!("hog-write-{}", buffer.label()), wait, move || {
            let mut dst = target.data.write().map_err(|_| lock_err(target.label()))?;
            dst[..payload.len()].copy_from_slice(&payload);
            Ok(())
        })
    }

    fn enqueue_kernel(&self, kernel: &CpuKernel, range: &NdRange, wait: &[&Completion]) -> Result<Completion, DeviceError> {
        let name = kernel.kind.name();
        let launch_err = |reason: String| DeviceError::Launch { kernel: name, reason };

        if range.local != kernel.constants.tile {
            return Err(launch_err(format!(
                "local size {:?} differs from the built work-group size {:?}",
                range.local, kernel.constants.tile
            )));
        }
        let args = kernel
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| a.clone().ok_or_else(|| launch_err(format!("argument {i} is not bound"))))
            .collect::<Result<Vec<_>, _>>()?;

        let out_index = kernel.kind.output_param() as usize;
        if let Bound::Buffer(out) = &args[out_index] {
            for (i, a) in args.iter().enumerate() {
                if let Bound::Buffer(b) = a {
                    if i != out_index && b.same_storage(out) {
                        return Err(launch_err(format!(
                            "buffer `{}` bound as both input {i} and output",
                            b.label()
                        )));
                    }
                }
            }
        }

        let launch = Launch {
            kind: kernel.kind,
            constants: kernel.constants,
            args,
        };
        let pool = Arc::clone(&self.pool);
        self.spawn(format!("hog-{name}"), wait, move || pool.install(|| run_launch(&launch)))
    }

    fn wait(&self, completion: &Completion, deadline: Option<Instant>) -> Result<(), DeviceError> {
        completion.wait(deadline).map_err(DeviceError::from)
    }

    fn map_read<R>(
        &self,
        buffer: &CpuBuffer,
        wait: &[&Completion],
        deadline: Option<Instant>,
        read: impl FnOnce(&[f32]) -> R,
    ) -> Result<R, DeviceError> {
        wait_all(wait, deadline)?;
        let data = buffer
            .data
            .read()
            .map_err(|_| DeviceError::Transfer(lock_err(buffer.label())))?;
        Ok(read(&data))
    }

    fn finish(&self) -> Result<(), DeviceError> {
        let handles: Vec<JoinHandle<()>> = {
            let mut launched = self.launched.lock().unwrap_or_else(|p| p.into_inner());
            launched.drain(..).collect()
        };
        let mut panicked = 0;
        for h in handles {
            if h.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(DeviceError::Launch {
                kernel: "launcher",
                reason: format!("{panicked} launcher threads panicked"),
            });
        }
        Ok(())
    }
}
