// pipeline/orchestrator.rs — Session setup, per-frame launch and readback.
//
// STATE MACHINE
// ─────────────
//
//            configure()                calculate()             wait() ok
//   Idle ───────────────▶ Configured ─────────────▶ Running ───────────────▶ Completed
//                             ▲                        │                         │
//                             │ cancel()               │ launch / wait error     │ calculate()
//                             └────────────────────────┤                         ▼
//                                                      ▼                      Running
//                                                    Failed ──configure()──▶ Configured
//
// A `Session` owns everything derived from one `Settings` value: the
// buffer arena (one slot per `BufferSlot`) and the built, bound stage
// kernels. Dropping a session releases stages in reverse launch order,
// then buffers in reverse allocation order.
//
// PER FRAME
// ─────────
// `calculate` uploads the frame and launches the four stages, each with a
// wait-list made of the completions of whoever last wrote the buffers it
// reads. It returns a `PendingFrame` without blocking. The only blocking
// point is `PendingFrame::wait`, a map-for-read of the descriptor gated on
// the assembly stage, with an optional timeout.
//
// If stage N fails to launch, stages after N are never launched. Work
// already issued is drained before the error is returned, so no launcher
// outlives the call that reported the failure.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{DeviceError, HogError};
use crate::geometry::{HogConfig, Settings};
use crate::hog::FeatureDescriptor;
use crate::image::{Image, Pixel};
use crate::pipeline::completion::Completion;
use crate::pipeline::device::{ComputeDevice, KernelArg};
use crate::pipeline::stage::{build_graph, BufferSlot, StageInput, StageSpec};

/// Lifecycle state of a [`HogPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configured,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Configured => "Configured",
            PipelineState::Running => "Running",
            PipelineState::Completed => "Completed",
            PipelineState::Failed => "Failed",
        }
    }
}

// ============================================================
// Session
// ============================================================

/// Buffers indexed by `BufferSlot`. Released in reverse allocation order.
struct BufferArena<B> {
    slots: Vec<Option<B>>,
    order: Vec<BufferSlot>,
}

impl<B> BufferArena<B> {
    fn new() -> Self {
        BufferArena {
            slots: BufferSlot::ALL.iter().map(|_| None).collect(),
            order: Vec::with_capacity(BufferSlot::ALL.len()),
        }
    }

    fn insert(&mut self, slot: BufferSlot, buffer: B) {
        self.slots[slot.index()] = Some(buffer);
        self.order.push(slot);
    }

    fn get(&self, slot: BufferSlot) -> Option<&B> {
        self.slots[slot.index()].as_ref()
    }
}

impl<B> Drop for BufferArena<B> {
    fn drop(&mut self) {
        while let Some(slot) = self.order.pop() {
            debug!("release buffer `{}`", slot.label());
            self.slots[slot.index()] = None;
        }
    }
}

struct StageInstance<K> {
    spec: StageSpec,
    kernel: K,
}

struct Session<D: ComputeDevice> {
    settings: Settings,
    // Field order matters: stages drop before the buffers they reference.
    stages: Vec<StageInstance<D::Kernel>>,
    buffers: BufferArena<D::Buffer>,
    /// Completion of the one-off interpolation-weight upload.
    weights_ready: Completion,
}

impl<D: ComputeDevice> Drop for Session<D> {
    fn drop(&mut self) {
        while let Some(stage) = self.stages.pop() {
            debug!("release stage `{}`", stage.spec.name());
        }
    }
}

impl<D: ComputeDevice> Session<D> {
    fn buffer(&self, slot: BufferSlot) -> Result<&D::Buffer, HogError> {
        self.buffers.get(slot).ok_or(HogError::NotConfigured)
    }
}

/// Allocate one buffer, naming the stage that owns it on failure.
fn allocate<D: ComputeDevice>(
    device: &D,
    settings: &Settings,
    slot: BufferSlot,
    owner: &'static str,
) -> Result<D::Buffer, HogError> {
    device
        .create_buffer(slot.label(), slot.len(settings), slot.access())
        .map_err(|source| HogError::ResourceAllocation { stage: owner, source })
}

/// Bind every argument of `spec`, continuing past failures. Returns the
/// first failure together with the number of failed bindings.
fn bind_stage<'b, D: ComputeDevice>(
    device: &D,
    kernel: &mut D::Kernel,
    spec: &StageSpec,
    settings: &Settings,
    buffer: impl Fn(BufferSlot) -> Option<&'b D::Buffer>,
) -> Result<(), HogError>
where
    D::Buffer: 'b,
{
    let mut first: Option<DeviceError> = None;
    let mut failed = 0;

    for (index, input) in spec.args.iter().enumerate() {
        let index = index as u32;
        let result = match *input {
            StageInput::Buffer(slot) => match buffer(slot) {
                Some(b) => device.set_arg(kernel, index, KernelArg::Buffer(b)),
                None => Err(DeviceError::Argument {
                    kernel: spec.name(),
                    index,
                    reason: format!("buffer `{}` is not allocated", slot.label()),
                }),
            },
            scalar => match spec.scalar(scalar, settings) {
                Some(v) => device.set_arg(kernel, index, KernelArg::Int(v)),
                None => Err(DeviceError::Argument {
                    kernel: spec.name(),
                    index,
                    reason: "no scalar value".into(),
                }),
            },
        };
        if let Err(e) = result {
            warn!("{}: {e}", spec.name());
            failed += 1;
            first.get_or_insert(e);
        }
    }

    match first {
        None => Ok(()),
        Some(source) => Err(HogError::ArgumentBinding {
            stage: spec.name(),
            failed,
            total: spec.args.len(),
            source,
        }),
    }
}

fn build_session<D: ComputeDevice>(device: &D, settings: Settings) -> Result<Session<D>, HogError> {
    let mut buffers = BufferArena::new();

    buffers.insert(
        BufferSlot::Image,
        allocate(device, &settings, BufferSlot::Image, "image_upload")?,
    );
    let weights_buf = allocate(device, &settings, BufferSlot::InterpWeights, "calc_cell_desc")?;
    let weights_ready = device
        .enqueue_write(&weights_buf, settings.interpolation_weights().as_slice(), &[])
        .map_err(|source| HogError::ResourceAllocation {
            stage: "calc_cell_desc",
            source,
        })?;
    buffers.insert(BufferSlot::InterpWeights, weights_buf);

    // From here on an early return drops the partial session, which
    // releases the stages built so far in reverse order.
    let mut session = Session {
        stages: Vec::new(),
        buffers,
        weights_ready,
        settings,
    };

    for spec in build_graph(&session.settings) {
        // The output buffer and kernel stay local until the stage is fully
        // bound. On failure they drop here (kernel, then buffer) before the
        // partial session unwinds.
        let output = allocate(device, &session.settings, spec.output, spec.name())?;
        let mut kernel = device
            .create_kernel(spec.kind, &session.settings)
            .map_err(|source| HogError::ResourceAllocation {
                stage: spec.name(),
                source,
            })?;
        let (arena, own, own_slot) = (&session.buffers, &output, spec.output);
        bind_stage(device, &mut kernel, &spec, &session.settings, move |slot| {
            if slot == own_slot {
                Some(own)
            } else {
                arena.get(slot)
            }
        })?;

        session.buffers.insert(spec.output, output);

        debug!(
            "stage `{}`: global {:?}, local {:?}, {} iterations",
            spec.name(),
            spec.range.global,
            spec.range.local,
            spec.range.iterations
        );
        session.stages.push(StageInstance { spec, kernel });
    }

    Ok(session)
}

// ============================================================
// HogPipeline
// ============================================================

/// Staged, data-parallel HOG on a [`ComputeDevice`].
pub struct HogPipeline<D: ComputeDevice> {
    session: Option<Session<D>>,
    state: PipelineState,
    frames: u64,
    total_time: Duration,
    device: D,
}

impl<D: ComputeDevice> HogPipeline<D> {
    pub fn new(device: D) -> Self {
        HogPipeline {
            session: None,
            state: PipelineState::Idle,
            frames: 0,
            total_time: Duration::ZERO,
            device,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.session.as_ref().map(|s| &s.settings)
    }

    /// Tear down any previous session and build a new one for `settings`.
    ///
    /// On failure every resource allocated by this call is released and the
    /// pipeline is left `Failed` with no session.
    pub fn configure(&mut self, settings: Settings) -> Result<(), HogError> {
        if self.session.take().is_some() {
            debug!("releasing previous session");
        }
        self.frames = 0;
        self.total_time = Duration::ZERO;

        match build_session(&self.device, settings) {
            Ok(session) => {
                let [cx, cy] = session.settings.cell_count();
                info!(
                    "HOG pipeline configured on {}: {}×{} cells, {} channels per block",
                    self.device.describe(),
                    cx,
                    cy,
                    session.settings.channels_per_block()
                );
                self.session = Some(session);
                self.state = PipelineState::Configured;
                Ok(())
            }
            Err(e) => {
                warn!("HOG pipeline configuration failed: {e}");
                self.drain();
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    /// Validate `config` against an image size, then [`configure`](Self::configure).
    /// A geometry error leaves the current session untouched.
    pub fn configure_for(&mut self, config: &HogConfig, width: usize, height: usize) -> Result<(), HogError> {
        let settings = config.settings_for(width, height)?;
        self.configure(settings)
    }

    /// Upload `img` and launch every stage. Returns without blocking.
    pub fn calculate<T: Pixel>(&mut self, img: &Image<T>) -> Result<PendingFrame<'_, D>, HogError> {
        match self.state {
            PipelineState::Configured | PipelineState::Completed => {}
            PipelineState::Idle => return Err(HogError::NotConfigured),
            other => {
                return Err(HogError::InvalidState {
                    operation: "calculate",
                    state: other.name(),
                })
            }
        }
        let session = self.session.as_ref().ok_or(HogError::NotConfigured)?;
        let [w, h] = session.settings.image_size();
        if img.width() != w || img.height() != h {
            return Err(HogError::ImageMismatch {
                expected_width: w,
                expected_height: h,
                actual_width: img.width(),
                actual_height: img.height(),
            });
        }

        let started = Instant::now();
        self.state = PipelineState::Running;

        match launch_frame(&self.device, session, img) {
            Ok(issued) => Ok(PendingFrame {
                pipeline: self,
                issued,
                started,
                consumed: false,
            }),
            Err((e, issued)) => {
                warn!("{e}");
                drain_issued(&self.device, &issued);
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    /// Run one frame to completion.
    pub fn process<T: Pixel>(&mut self, img: &Image<T>, timeout: Option<Duration>) -> Result<FeatureDescriptor, HogError> {
        self.calculate(img)?.wait(timeout)
    }

    /// Mean wall time of completed frames since the last configure.
    pub fn mean_frame_time(&self) -> Option<Duration> {
        if self.frames == 0 {
            None
        } else {
            Some(self.total_time / self.frames as u32)
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    fn drain(&self) {
        if let Err(e) = self.device.finish() {
            warn!("draining device: {e}");
        }
    }
}

impl<D: ComputeDevice> Drop for HogPipeline<D> {
    fn drop(&mut self) {
        self.drain();
        self.session = None;
    }
}

/// Completions issued for one frame, in launch order.
struct Issued {
    upload: Option<Completion>,
    stages: Vec<(&'static str, Completion)>,
}

impl Issued {
    fn all(&self) -> impl Iterator<Item = &Completion> {
        self.upload.iter().chain(self.stages.iter().map(|(_, c)| c))
    }

    fn terminal(&self) -> Option<&Completion> {
        self.stages.last().map(|(_, c)| c)
    }
}

fn launch_frame<D: ComputeDevice, T: Pixel>(
    device: &D,
    session: &Session<D>,
    img: &Image<T>,
) -> Result<Issued, (HogError, Issued)> {
    let mut issued = Issued {
        upload: None,
        stages: Vec::with_capacity(session.stages.len()),
    };

    let image = match session.buffer(BufferSlot::Image) {
        Ok(b) => b,
        Err(e) => return Err((e, issued)),
    };
    match device.enqueue_write(image, &img.to_dense_f32(), &[]) {
        Ok(c) => issued.upload = Some(c),
        Err(source) => {
            return Err((
                HogError::Launch {
                    stage: "image_upload",
                    source,
                },
                issued,
            ))
        }
    }

    for stage in &session.stages {
        let wait: Vec<&Completion> = stage
            .spec
            .reads()
            .filter_map(|slot| writer_of(slot, session, &issued))
            .collect();
        match device.enqueue_kernel(&stage.kernel, &stage.spec.range, &wait) {
            Ok(c) => {
                debug!("launched `{}` after {} predecessors", stage.spec.name(), wait.len());
                issued.stages.push((stage.spec.name(), c));
            }
            Err(source) => {
                return Err((
                    HogError::Launch {
                        stage: stage.spec.name(),
                        source,
                    },
                    issued,
                ))
            }
        }
    }
    Ok(issued)
}

/// Completion of the most recent write to `slot` in this frame.
fn writer_of<'a, D: ComputeDevice>(slot: BufferSlot, session: &'a Session<D>, issued: &'a Issued) -> Option<&'a Completion> {
    match slot {
        BufferSlot::Image => issued.upload.as_ref(),
        BufferSlot::InterpWeights => Some(&session.weights_ready),
        _ => session
            .stages
            .iter()
            .zip(&issued.stages)
            .rev()
            .find(|(s, _)| s.spec.output == slot)
            .map(|(_, (_, c))| c),
    }
}

/// Wait for already-issued work without surfacing its errors.
///
/// A cancelled completion resolves at once, while its launch may still be
/// running; the final `finish` waits for that too.
fn drain_issued<D: ComputeDevice>(device: &D, issued: &Issued) {
    for c in issued.all() {
        if let Err(e) = device.wait(c, None) {
            debug!("drained operation ended with: {e}");
        }
    }
    if let Err(e) = device.finish() {
        warn!("draining device: {e}");
    }
}

// ============================================================
// PendingFrame
// ============================================================

/// A launched frame. Consume it with [`wait`](Self::wait) or
/// [`cancel`](Self::cancel); dropping it cancels and drains.
pub struct PendingFrame<'a, D: ComputeDevice> {
    pipeline: &'a mut HogPipeline<D>,
    issued: Issued,
    started: Instant,
    consumed: bool,
}

/// Cancels a pending frame from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    completions: Vec<Completion>,
}

impl CancelHandle {
    /// Cancel every operation of the frame that has not finished yet.
    pub fn cancel(&self) -> usize {
        self.completions.iter().filter(|c| c.cancel()).count()
    }
}

impl<'a, D: ComputeDevice> PendingFrame<'a, D> {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            completions: self.issued.all().cloned().collect(),
        }
    }

    /// Block until the descriptor is available, or until `timeout` expires.
    ///
    /// On any failure, timeout included, the frame's remaining operations
    /// are cancelled and then drained before this returns. Cancelled
    /// launches stop waiting on their predecessors, so the drain is short
    /// unless a kernel body is already running.
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<FeatureDescriptor, HogError> {
        self.consumed = true;
        let deadline = timeout.map(|t| Instant::now() + t);
        let result = self.read_descriptor(deadline);
        let pipeline = &mut *self.pipeline;

        match result {
            Ok(desc) => {
                let elapsed = self.started.elapsed();
                pipeline.frames += 1;
                pipeline.total_time += elapsed;
                pipeline.state = PipelineState::Completed;
                info!("frame {} computed in {:.2?}", pipeline.frames, elapsed);
                Ok(desc)
            }
            Err(e) => {
                warn!("frame failed: {e}");
                for c in self.issued.all() {
                    c.cancel();
                }
                drain_issued(&pipeline.device, &self.issued);
                pipeline.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    /// Cancel the frame, drain issued work and return to `Configured`.
    pub fn cancel(mut self) {
        self.consumed = true;
        self.cancel_and_drain();
        self.pipeline.state = PipelineState::Configured;
    }

    fn read_descriptor(&self, deadline: Option<Instant>) -> Result<FeatureDescriptor, HogError> {
        let pipeline = &*self.pipeline;
        let session = pipeline.session.as_ref().ok_or(HogError::NotConfigured)?;
        let terminal = self.issued.terminal().ok_or(HogError::NotConfigured)?;
        let descriptor = session.buffer(BufferSlot::Descriptor)?;
        let len = session.settings.descriptor_len();

        let data = pipeline
            .device
            .map_read(descriptor, &[terminal], deadline, |d| d[..len.min(d.len())].to_vec())
            .map_err(HogError::from_readback)?;
        if data.len() != len {
            return Err(HogError::Readback(DeviceError::Transfer(format!(
                "descriptor buffer holds {} elements, expected {len}",
                data.len()
            ))));
        }
        Ok(FeatureDescriptor::from_vec(&session.settings, data))
    }

    fn cancel_and_drain(&self) {
        let cancelled = self.issued.all().filter(|c| c.cancel()).count();
        debug!("cancelled {cancelled} pending operations");
        drain_issued(&self.pipeline.device, &self.issued);
    }
}

impl<'a, D: ComputeDevice> Drop for PendingFrame<'a, D> {
    fn drop(&mut self) {
        if !self.consumed {
            debug!("pending frame dropped unconsumed");
            self.cancel_and_drain();
            self.pipeline.state = PipelineState::Configured;
        }
    }
}
