//! A deterministic software [`GpuDevice`] that validates synchronization.
//!
//! Submitted work does not run on a timeline. It stays in flight until the CPU
//! observes its completion through [`GpuDevice::wait_fence`] or
//! [`GpuDevice::wait_idle`], which is exactly the knowledge a real CPU has.
//! Buffer copies execute at completion, so reading a destination early shows
//! stale data.
//!
//! Every misuse an explicit-sync API would reject is reported as a
//! [`ValidationMessage`]. That covers:
//! - host access to resources that pending work still references;
//! - fence and binary semaphore misuse;
//! - swapchain writes without an acquire wait;
//! - image layout mismatches;
//! - read/write hazards that no barrier orders.

use super::*;
use cinder_utils::Extent2D;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationMessage {
    pub submission: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Submitted {
        seq: u64,
        label: &'static str,
        fence: Option<FenceId>,
        wait: Vec<SemaphoreWait>,
        signal: Vec<SemaphoreId>,
        commands: CommandBuffer,
    },
    FenceWaited {
        fence: FenceId,
        status: FenceStatus,
    },
    FenceReset {
        fence: FenceId,
    },
    HostWrite {
        buffer: BufferId,
        bytes: usize,
    },
    SwapchainCreated {
        id: SwapchainId,
        extent: Extent2D,
    },
    Acquired {
        index: u32,
    },
    Presented {
        index: u32,
    },
    WaitIdle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum ResourceKey {
    Buffer(BufferId),
    Image(ImageId),
}

#[derive(Debug, Copy, Clone)]
struct WriteState {
    stages: PipelineStages,
    seq: u64,
    visible_to: PipelineStages,
}

/// Access history of one buffer or image layer, used to find unordered accesses.
#[derive(Debug, Default, Clone)]
struct Hazard {
    write: Option<WriteState>,
    reads: PipelineStages,
    read_seq: u64,
    reads_released_to: PipelineStages,
}

impl Hazard {
    fn live_write(&self, completed: u64) -> Option<WriteState> {
        self.write.filter(|w| w.seq > completed)
    }

    fn live_reads(&self, completed: u64) -> PipelineStages {
        if self.read_seq > completed {
            self.reads
        } else {
            PipelineStages::empty()
        }
    }

    fn read(&mut self, stages: PipelineStages, seq: u64, completed: u64) -> Result<(), String> {
        if let Some(write) = self.live_write(completed)
            && !write.visible_to.contains(stages)
        {
            return Err(format!(
                "read at {stages:?} is not ordered after the write at {:?}",
                write.stages
            ));
        }

        if self.read_seq <= completed {
            self.reads = PipelineStages::empty();
        }
        self.reads |= stages;
        self.read_seq = seq;
        self.reads_released_to = PipelineStages::empty();
        Ok(())
    }

    fn write(&mut self, stages: PipelineStages, seq: u64, completed: u64) -> Result<(), String> {
        if let Some(write) = self.live_write(completed)
            && !write.visible_to.contains(stages)
        {
            return Err(format!(
                "write at {stages:?} is not ordered after the write at {:?}",
                write.stages
            ));
        }

        let reads = self.live_reads(completed);
        if !reads.is_empty() && !self.reads_released_to.contains(stages) {
            return Err(format!(
                "write at {stages:?} is not ordered after reads at {reads:?}"
            ));
        }

        self.write = Some(WriteState {
            stages,
            seq,
            visible_to: PipelineStages::empty(),
        });
        self.reads = PipelineStages::empty();
        self.reads_released_to = PipelineStages::empty();
        Ok(())
    }

    fn barrier(&mut self, src: PipelineStages, dst: PipelineStages, completed: u64) {
        if let Some(write) = self.write.as_mut().filter(|w| w.seq > completed)
            && (src.contains(write.stages) || src.intersects(write.visible_to))
        {
            write.visible_to |= dst;
        }

        let reads = self.live_reads(completed);
        if !reads.is_empty()
            && (src.contains(reads) || src.intersects(self.reads_released_to))
        {
            self.reads_released_to |= dst;
        }
    }
}

struct BufferState {
    desc: BufferDesc,
    data: Vec<u8>,
    hazard: Hazard,
}

struct ImageState {
    desc: ImageDesc,
    layout: ImageLayout,
    layers: Vec<Hazard>,
    swapchain: Option<(SwapchainId, u32)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending(u64),
    Signaled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SemaphoreState {
    Unsignaled,
    Signaled,
}

struct SwapchainState {
    desc: SwapchainDesc,
    images: Vec<ImageId>,
    acquired: Vec<Option<SemaphoreId>>,
    next: u32,
}

enum PendingCopy {
    Buffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
}

struct InFlight {
    seq: u64,
    fence: Option<FenceId>,
    resources: HashSet<ResourceKey>,
    semaphores: SmallVec<[SemaphoreId; 4]>,
    copies: Vec<PendingCopy>,
}

#[derive(Default)]
struct BoundState {
    pipeline: Option<PipelineId>,
    vertex: Option<BufferId>,
    index: Option<BufferId>,
    groups: BTreeMap<u32, SmallVec<[Binding; 8]>>,
    render_pass: Option<&'static str>,
    compute_pass: Option<&'static str>,
}

struct Inner {
    buffers: SlotMap<BufferId, BufferState>,
    images: SlotMap<ImageId, ImageState>,
    pipelines: SlotMap<PipelineId, PipelineDesc>,
    fences: SlotMap<FenceId, FenceState>,
    semaphores: SlotMap<SemaphoreId, SemaphoreState>,
    swapchains: SlotMap<SwapchainId, SwapchainState>,

    surface_extent: Extent2D,
    force_suboptimal: bool,

    next_seq: u64,
    completed_seq: u64,
    in_flight: VecDeque<InFlight>,

    events: Vec<DeviceEvent>,
    messages: Vec<ValidationMessage>,
    sender: Option<Sender<ValidationMessage>>,
}

pub struct HeadlessDevice {
    caps: DeviceCapabilities,
    inner: Mutex<Inner>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            name: "Cinder Headless".to_string(),
            vendor: GpuVendor::Software,
            multi_draw_indirect: true,
            indirect_first_instance: true,
            compute: true,
            texture_binding_array: true,
            max_image_array_layers: 256,
            max_image_dimension: 16384,
            diagnostic_checkpoints: false,
        })
    }

    pub fn with_capabilities(caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            inner: Mutex::new(Inner {
                buffers: SlotMap::with_key(),
                images: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
                fences: SlotMap::with_key(),
                semaphores: SlotMap::with_key(),
                swapchains: SlotMap::with_key(),
                surface_extent: Extent2D::new(1280, 720),
                force_suboptimal: false,
                next_seq: 1,
                completed_seq: 0,
                in_flight: VecDeque::new(),
                events: Vec::new(),
                messages: Vec::new(),
                sender: None,
            }),
        }
    }

    /// Forwards every validation message to `sender` as it is raised.
    pub fn with_message_sender(self, sender: Sender<ValidationMessage>) -> Self {
        self.inner.lock().sender = Some(sender);
        self
    }

    /// Simulates the window being resized by the platform.
    pub fn set_surface_extent(&self, extent: Extent2D) {
        self.inner.lock().surface_extent = extent;
    }

    pub fn surface_extent(&self) -> Extent2D {
        self.inner.lock().surface_extent
    }

    /// The next present reports a suboptimal swapchain.
    pub fn force_suboptimal_present(&self) {
        self.inner.lock().force_suboptimal = true;
    }

    /// Contents of a buffer as seen by the GPU after all completed work.
    pub fn read_buffer(&self, buffer: BufferId) -> GpuResult<Vec<u8>> {
        let inner = self.inner.lock();
        let state = inner
            .buffers
            .get(buffer)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
        Ok(state.data.clone())
    }

    pub fn image_layout(&self, image: ImageId) -> GpuResult<ImageLayout> {
        let inner = self.inner.lock();
        inner
            .images
            .get(image)
            .map(|i| i.layout)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })
    }

    pub fn validation_messages(&self) -> Vec<ValidationMessage> {
        self.inner.lock().messages.clone()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.inner.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    /// Submissions that have not been observed complete yet.
    pub fn pending_submissions(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.inner.lock().images.len()
    }
}

impl Inner {
    fn report(&mut self, submission: Option<&'static str>, message: String) {
        warn!(target: "cinder::validation", "{}", message);
        let message = ValidationMessage {
            submission,
            message,
        };
        if let Some(sender) = &self.sender {
            let _ = sender.send(message.clone());
        }
        self.messages.push(message);
    }

    fn in_use(&self, key: ResourceKey) -> bool {
        self.in_flight.iter().any(|w| w.resources.contains(&key))
    }

    fn semaphore_in_use(&self, semaphore: SemaphoreId) -> bool {
        self.in_flight
            .iter()
            .any(|w| w.semaphores.contains(&semaphore))
    }

    fn complete_through(&mut self, seq: u64) {
        while self.in_flight.front().is_some_and(|w| w.seq <= seq) {
            let Some(work) = self.in_flight.pop_front() else {
                break;
            };

            for copy in work.copies {
                match copy {
                    PendingCopy::Buffer {
                        src,
                        src_offset,
                        dst,
                        dst_offset,
                        size,
                    } => {
                        let Some(data) = self.buffers.get(src).map(|b| {
                            b.data[src_offset as usize..(src_offset + size) as usize].to_vec()
                        }) else {
                            continue;
                        };
                        if let Some(dst) = self.buffers.get_mut(dst) {
                            dst.data[dst_offset as usize..(dst_offset + size) as usize]
                                .copy_from_slice(&data);
                        }
                    }
                }
            }

            if let Some(fence) = work.fence
                && let Some(state) = self.fences.get_mut(fence)
            {
                *state = FenceState::Signaled;
            }
            self.completed_seq = work.seq;
            trace!("Headless submission {} completed", work.seq);
        }
    }

    fn buffer_access(
        &mut self,
        ctx: &mut Execution,
        buffer: BufferId,
        stages: PipelineStages,
        write: bool,
    ) -> GpuResult<()> {
        let completed = self.completed_seq;
        let state = self
            .buffers
            .get_mut(buffer)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
        ctx.resources.insert(ResourceKey::Buffer(buffer));

        let result = if write {
            state.hazard.write(stages, ctx.seq, completed)
        } else {
            state.hazard.read(stages, ctx.seq, completed)
        };
        if let Err(message) = result {
            let label = state.desc.label.clone();
            self.report(Some(ctx.label), format!("Buffer {label:?}: {message}"));
        }
        Ok(())
    }

    fn image_access(
        &mut self,
        ctx: &mut Execution,
        image: ImageId,
        layer: Option<u32>,
        stages: PipelineStages,
        write: bool,
        expected_layout: ImageLayout,
    ) -> GpuResult<()> {
        let completed = self.completed_seq;
        let state = self
            .images
            .get_mut(image)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
        ctx.resources.insert(ResourceKey::Image(image));

        let mut problems: SmallVec<[String; 2]> = SmallVec::new();
        if state.layout != expected_layout {
            problems.push(format!(
                "is in layout {:?} but {:?} is required",
                state.layout, expected_layout
            ));
        }

        let layer_count = state.layers.len() as u32;
        let range = match layer {
            Some(layer) if layer >= layer_count => {
                problems.push(format!("has no layer {layer} ({layer_count} layers)"));
                0..0
            }
            Some(layer) => layer..layer + 1,
            None => 0..layer_count,
        };

        for layer in range {
            let hazard = &mut state.layers[layer as usize];
            let result = if write {
                hazard.write(stages, ctx.seq, completed)
            } else {
                hazard.read(stages, ctx.seq, completed)
            };
            if let Err(message) = result {
                problems.push(format!("layer {layer}: {message}"));
            }
        }

        let label = state.desc.label.clone();
        for problem in problems {
            self.report(Some(ctx.label), format!("Image {label:?} {problem}"));
        }
        Ok(())
    }

    fn bound_resource_access(
        &mut self,
        ctx: &mut Execution,
        bound: &BoundState,
        stages: PipelineStages,
        compute: bool,
    ) -> GpuResult<()> {
        let bindings: Vec<Binding> = bound.groups.values().flatten().cloned().collect();
        for binding in bindings {
            match binding.resource {
                BindingResource::Buffer { buffer, access, .. } => {
                    let write = access == BufferAccess::ReadWrite;
                    if write && !compute {
                        self.report(
                            Some(ctx.label),
                            "Graphics pipelines may not write storage buffers".to_string(),
                        );
                    }
                    self.buffer_access(ctx, buffer, stages, write)?;
                }
                BindingResource::Image(image) => {
                    self.image_access(ctx, image, None, stages, false, ImageLayout::ShaderReadOnly)?;
                }
                BindingResource::ImageArray(images) => {
                    for image in images.iter() {
                        self.image_access(
                            ctx,
                            *image,
                            None,
                            stages,
                            false,
                            ImageLayout::ShaderReadOnly,
                        )?;
                    }
                }
                BindingResource::Sampler(_) => {}
            }
        }
        Ok(())
    }

    fn check_usage(
        &mut self,
        ctx: &Execution,
        buffer: BufferId,
        usage: BufferUsage,
    ) -> GpuResult<u64> {
        let state = self
            .buffers
            .get(buffer)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
        let size = state.desc.size;
        if !state.desc.usage.contains(usage) {
            let message = format!(
                "Buffer {:?} used as {usage:?} but was created with {:?}",
                state.desc.label, state.desc.usage
            );
            self.report(Some(ctx.label), message);
        }
        Ok(size)
    }

    fn run_commands(
        &mut self,
        ctx: &mut Execution,
        commands: &[Command],
        waited: &[SemaphoreWait],
        caps: &DeviceCapabilities,
    ) -> GpuResult<()> {
        let mut bound = BoundState::default();

        for command in commands {
            match command {
                Command::PipelineBarrier(barrier) => {
                    if bound.render_pass.is_some() {
                        self.report(Some(ctx.label), "Barrier recorded inside a render pass".into());
                    }
                    self.apply_barrier(ctx, barrier)?;
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src_size = self.check_usage(ctx, *src, BufferUsage::TRANSFER_SRC)?;
                    let dst_size = self.check_usage(ctx, *dst, BufferUsage::TRANSFER_DST)?;
                    if src_offset + size > src_size || dst_offset + size > dst_size {
                        self.report(Some(ctx.label), "Buffer copy out of bounds".into());
                        continue;
                    }
                    self.buffer_access(ctx, *src, PipelineStages::TRANSFER, false)?;
                    self.buffer_access(ctx, *dst, PipelineStages::TRANSFER, true)?;
                    ctx.copies.push(PendingCopy::Buffer {
                        src: *src,
                        src_offset: *src_offset,
                        dst: *dst,
                        dst_offset: *dst_offset,
                        size: *size,
                    });
                }
                Command::CopyBufferToImage {
                    src,
                    bytes_per_row,
                    dst,
                    extent,
                } => {
                    let src_size = self.check_usage(ctx, *src, BufferUsage::TRANSFER_SRC)?;
                    if (*bytes_per_row as u64) * (extent.height as u64) > src_size {
                        self.report(Some(ctx.label), "Image upload reads past the staging buffer".into());
                    }
                    self.buffer_access(ctx, *src, PipelineStages::TRANSFER, false)?;
                    self.image_access(
                        ctx,
                        *dst,
                        None,
                        PipelineStages::TRANSFER,
                        true,
                        ImageLayout::TransferDst,
                    )?;
                }
                Command::BeginRenderPass(begin) => {
                    if bound.render_pass.is_some() || bound.compute_pass.is_some() {
                        self.report(Some(ctx.label), format!("Render pass {:?} begins inside another pass", begin.label));
                    }
                    bound.render_pass = Some(begin.label);
                    self.begin_render_pass(ctx, begin, waited)?;
                }
                Command::EndRenderPass => {
                    if bound.render_pass.take().is_none() {
                        self.report(Some(ctx.label), "EndRenderPass without a render pass".into());
                    }
                }
                Command::BeginComputePass { label } => {
                    if bound.render_pass.is_some() || bound.compute_pass.is_some() {
                        self.report(Some(ctx.label), format!("Compute pass {label:?} begins inside another pass"));
                    }
                    bound.compute_pass = Some(label);
                }
                Command::EndComputePass => {
                    if bound.compute_pass.take().is_none() {
                        self.report(Some(ctx.label), "EndComputePass without a compute pass".into());
                    }
                }
                Command::BindPipeline(pipeline) => {
                    if !self.pipelines.contains_key(*pipeline) {
                        return Err(GpuError::InvalidHandle { kind: "Pipeline" });
                    }
                    bound.pipeline = Some(*pipeline);
                }
                Command::BindResources { group, bindings } => {
                    for binding in bindings {
                        let alive = match &binding.resource {
                            BindingResource::Buffer { buffer, .. } => {
                                self.buffers.contains_key(*buffer)
                            }
                            BindingResource::Image(image) => self.images.contains_key(*image),
                            BindingResource::ImageArray(images) => {
                                images.iter().all(|i| self.images.contains_key(*i))
                            }
                            BindingResource::Sampler(_) => true,
                        };
                        if !alive {
                            return Err(GpuError::InvalidHandle { kind: "Binding" });
                        }
                    }
                    bound.groups.insert(*group, bindings.clone());
                }
                Command::BindVertexBuffer { buffer, .. } => {
                    self.check_usage(ctx, *buffer, BufferUsage::VERTEX)?;
                    bound.vertex = Some(*buffer);
                }
                Command::BindIndexBuffer { buffer, .. } => {
                    self.check_usage(ctx, *buffer, BufferUsage::INDEX)?;
                    bound.index = Some(*buffer);
                }
                Command::Draw { .. } => {
                    self.check_graphics_draw(ctx, &bound)?;
                    self.bound_resource_access(
                        ctx,
                        &bound,
                        PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
                        false,
                    )?;
                }
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                } => {
                    self.check_graphics_draw(ctx, &bound)?;
                    if *draw_count == 0 {
                        self.report(Some(ctx.label), "Multi-draw issued with a draw count of 0".into());
                    }
                    if *draw_count > 1 && !caps.multi_draw_indirect {
                        self.report(Some(ctx.label), "Multi-draw-indirect is not supported".into());
                    }
                    let size = self.check_usage(ctx, *buffer, BufferUsage::INDIRECT)?;
                    let end = offset + *draw_count as u64 * DRAW_INDEXED_INDIRECT_STRIDE;
                    if end > size {
                        self.report(Some(ctx.label), format!("Indirect draw reads {end} bytes of a {size} byte buffer"));
                    }
                    self.buffer_access(ctx, *buffer, PipelineStages::DRAW_INDIRECT, false)?;

                    match (bound.vertex, bound.index) {
                        (Some(vertex), Some(index)) => {
                            self.buffer_access(ctx, vertex, PipelineStages::VERTEX_INPUT, false)?;
                            self.buffer_access(ctx, index, PipelineStages::VERTEX_INPUT, false)?;
                        }
                        _ => self.report(
                            Some(ctx.label),
                            "Indexed draw without bound vertex and index buffers".into(),
                        ),
                    }

                    self.bound_resource_access(
                        ctx,
                        &bound,
                        PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
                        false,
                    )?;
                }
                Command::Dispatch { x, y, z } => {
                    if bound.compute_pass.is_none() {
                        self.report(Some(ctx.label), "Dispatch outside of a compute pass".into());
                    }
                    let is_compute = bound
                        .pipeline
                        .and_then(|p| self.pipelines.get(p))
                        .is_some_and(|p| matches!(p.kind, PipelineKind::Compute { .. }));
                    if !is_compute {
                        self.report(Some(ctx.label), "Dispatch without a compute pipeline".into());
                    }
                    if *x == 0 || *y == 0 || *z == 0 {
                        self.report(Some(ctx.label), "Dispatch with an empty workgroup count".into());
                    }
                    self.bound_resource_access(ctx, &bound, PipelineStages::COMPUTE_SHADER, true)?;
                }
                Command::Checkpoint(label) => {
                    trace!("Checkpoint {label} in {}", ctx.label);
                }
            }
        }

        if bound.render_pass.is_some() || bound.compute_pass.is_some() {
            self.report(Some(ctx.label), "Command buffer ends inside a pass".into());
        }
        Ok(())
    }

    fn check_graphics_draw(&mut self, ctx: &Execution, bound: &BoundState) -> GpuResult<()> {
        if bound.render_pass.is_none() {
            self.report(Some(ctx.label), "Draw outside of a render pass".into());
        }

        let layout = bound
            .pipeline
            .and_then(|p| self.pipelines.get(p))
            .and_then(|p| match p.kind {
                PipelineKind::Graphics { vertex_layout, .. } => Some(vertex_layout),
                PipelineKind::Compute { .. } => None,
            });

        match layout {
            None => self.report(Some(ctx.label), "Draw without a graphics pipeline".into()),
            Some(VertexLayout::None) => {}
            Some(_) if bound.vertex.is_none() => {
                self.report(Some(ctx.label), "Draw without a bound vertex buffer".into())
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn apply_barrier(&mut self, ctx: &mut Execution, barrier: &Barrier) -> GpuResult<()> {
        let completed = self.completed_seq;

        for b in &barrier.buffers {
            let state = self
                .buffers
                .get_mut(b.buffer)
                .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
            state.hazard.barrier(b.src_stages, b.dst_stages, completed);
            ctx.resources.insert(ResourceKey::Buffer(b.buffer));
        }

        for b in &barrier.images {
            let state = self
                .images
                .get_mut(b.image)
                .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
            let mismatch = (b.old_layout != ImageLayout::Undefined && b.old_layout != state.layout)
                .then(|| {
                    format!(
                        "Image {:?} transitions from {:?} but is in {:?}",
                        state.desc.label, b.old_layout, state.layout
                    )
                });

            state.layout = b.new_layout;
            for hazard in &mut state.layers {
                hazard.barrier(b.src_stages, b.dst_stages, completed);
            }
            ctx.resources.insert(ResourceKey::Image(b.image));

            if let Some(message) = mismatch {
                self.report(Some(ctx.label), message);
            }
        }
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        ctx: &mut Execution,
        begin: &RenderPassBegin,
        waited: &[SemaphoreWait],
    ) -> GpuResult<()> {
        for color in &begin.color {
            self.check_attachment(ctx, begin, color.image, ImageUsage::COLOR_ATTACHMENT)?;
            self.check_swapchain_write(ctx, color.image, waited);
            self.image_access(
                ctx,
                color.image,
                Some(0),
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                true,
                ImageLayout::ColorAttachment,
            )?;
        }

        if let Some(depth) = &begin.depth {
            self.check_attachment(ctx, begin, depth.image, ImageUsage::DEPTH_ATTACHMENT)?;
            self.image_access(
                ctx,
                depth.image,
                Some(depth.layer.unwrap_or(0)),
                PipelineStages::FRAGMENT_TESTS,
                true,
                ImageLayout::DepthAttachment,
            )?;
        }
        Ok(())
    }

    fn check_attachment(
        &mut self,
        ctx: &Execution,
        begin: &RenderPassBegin,
        image: ImageId,
        usage: ImageUsage,
    ) -> GpuResult<()> {
        let state = self
            .images
            .get(image)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;

        let mut problems: SmallVec<[String; 2]> = SmallVec::new();
        if !state.desc.usage.contains(usage) {
            problems.push(format!(
                "Image {:?} is used as {usage:?} but was created with {:?}",
                state.desc.label, state.desc.usage
            ));
        }
        if state.desc.extent != begin.extent {
            problems.push(format!(
                "Render pass {:?} is {} but attachment {:?} is {}",
                begin.label, begin.extent, state.desc.label, state.desc.extent
            ));
        }

        for problem in problems {
            self.report(Some(ctx.label), problem);
        }
        Ok(())
    }

    fn check_swapchain_write(&mut self, ctx: &Execution, image: ImageId, waited: &[SemaphoreWait]) {
        let Some((swapchain, index)) = self.images.get(image).and_then(|i| i.swapchain) else {
            return;
        };
        let acquired = self
            .swapchains
            .get(swapchain)
            .and_then(|s| s.acquired.get(index as usize).copied().flatten());

        let message = match acquired {
            None => Some(format!("Swapchain image {index} is written without being acquired")),
            Some(semaphore) => {
                let ordered = waited.iter().any(|w| {
                    w.semaphore == semaphore
                        && w.stages.intersects(
                            PipelineStages::COLOR_ATTACHMENT_OUTPUT | PipelineStages::TOP_OF_PIPE,
                        )
                });
                (!ordered).then(|| {
                    format!("Swapchain image {index} is written without waiting on its acquire semaphore")
                })
            }
        };

        if let Some(message) = message {
            self.report(Some(ctx.label), message);
        }
    }
}

struct Execution {
    seq: u64,
    label: &'static str,
    resources: HashSet<ResourceKey>,
    copies: Vec<PendingCopy>,
}

impl GpuDevice for HeadlessDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId> {
        let mut inner = self.inner.lock();
        if desc.size == 0 {
            inner.report(None, format!("Buffer {:?} created with size 0", desc.label));
            return ValidationFailedErr {
                message: "zero sized buffer",
            }
            .fail();
        }

        Ok(inner.buffers.insert(BufferState {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            hazard: Hazard::default(),
        }))
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let (label, location, size) = {
            let state = inner
                .buffers
                .get(buffer)
                .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
            (state.desc.label.clone(), state.desc.location, state.desc.size)
        };

        if location != MemoryLocation::CpuToGpu {
            inner.report(None, format!("Host write to device local buffer {label:?}"));
            return ValidationFailedErr {
                message: format!("{label} is not host visible"),
            }
            .fail();
        }
        if offset + data.len() as u64 > size {
            return ValidationFailedErr {
                message: format!("write of {} bytes at {offset} overflows {label}", data.len()),
            }
            .fail();
        }
        if inner.in_use(ResourceKey::Buffer(buffer)) {
            inner.report(
                None,
                format!("Host write to buffer {label:?} while pending GPU work still uses it"),
            );
        }

        if let Some(state) = inner.buffers.get_mut(buffer) {
            state.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        inner.events.push(DeviceEvent::HostWrite {
            buffer,
            bytes: data.len(),
        });
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> GpuResult<u64> {
        let inner = self.inner.lock();
        inner
            .buffers
            .get(buffer)
            .map(|b| b.desc.size)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })
    }

    fn destroy_buffer(&self, buffer: BufferId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.in_use(ResourceKey::Buffer(buffer)) {
            let label = inner
                .buffers
                .get(buffer)
                .map(|b| b.desc.label.clone())
                .unwrap_or_default();
            inner.report(None, format!("Buffer {label:?} destroyed while in use"));
        }
        inner
            .buffers
            .remove(buffer)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageId> {
        let mut inner = self.inner.lock();
        let valid = !desc.extent.is_zero_area()
            && desc.layers >= 1
            && desc.layers <= self.caps.max_image_array_layers
            && desc.extent.width.max(desc.extent.height) <= self.caps.max_image_dimension;
        if !valid {
            inner.report(None, format!("Image {:?} has an invalid size", desc.label));
            return ValidationFailedErr {
                message: format!("invalid image {}", desc.label),
            }
            .fail();
        }

        Ok(inner.images.insert(ImageState {
            desc: desc.clone(),
            layout: ImageLayout::Undefined,
            layers: vec![Hazard::default(); desc.layers as usize],
            swapchain: None,
        }))
    }

    fn image_desc(&self, image: ImageId) -> GpuResult<ImageDesc> {
        let inner = self.inner.lock();
        inner
            .images
            .get(image)
            .map(|i| i.desc.clone())
            .ok_or(GpuError::InvalidHandle { kind: "Image" })
    }

    fn destroy_image(&self, image: ImageId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.in_use(ResourceKey::Image(image)) {
            let label = inner
                .images
                .get(image)
                .map(|i| i.desc.label.clone())
                .unwrap_or_default();
            inner.report(None, format!("Image {label:?} destroyed while in use"));
        }
        inner
            .images
            .remove(image)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Image" })
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> GpuResult<PipelineId> {
        let mut inner = self.inner.lock();
        if desc.shader.code.is_empty() {
            inner.report(None, format!("Pipeline {:?} has no shader code", desc.label));
        }
        if let PipelineKind::Compute { workgroup_size: 0 } = desc.kind {
            inner.report(None, format!("Pipeline {:?} has no workgroup size", desc.label));
        }
        Ok(inner.pipelines.insert(desc.clone()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        inner
            .pipelines
            .remove(pipeline)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Pipeline" })
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId> {
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        Ok(self.inner.lock().fences.insert(state))
    }

    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> GpuResult<FenceStatus> {
        let mut inner = self.inner.lock();
        let state = *inner
            .fences
            .get(fence)
            .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;

        let status = match state {
            FenceState::Pending(seq) => {
                inner.complete_through(seq);
                FenceStatus::Signaled
            }
            FenceState::Signaled => FenceStatus::Signaled,
            FenceState::Unsignaled => {
                trace!("Fence wait would block forever, reporting timeout after {timeout:?}");
                FenceStatus::Timeout
            }
        };

        inner.events.push(DeviceEvent::FenceWaited { fence, status });
        Ok(status)
    }

    fn reset_fence(&self, fence: FenceId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .fences
            .get_mut(fence)
            .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;
        let was = *state;
        *state = FenceState::Unsignaled;

        if let FenceState::Pending(_) = was {
            inner.report(None, "Fence reset while its submission is pending".into());
        }
        inner.events.push(DeviceEvent::FenceReset { fence });
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .fences
            .remove(fence)
            .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;
        if let FenceState::Pending(_) = state {
            inner.report(None, "Fence destroyed while its submission is pending".into());
        }
        Ok(())
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        Ok(self.inner.lock().semaphores.insert(SemaphoreState::Unsignaled))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.semaphore_in_use(semaphore) {
            inner.report(None, "Semaphore destroyed while pending work uses it".into());
        }
        inner
            .semaphores
            .remove(semaphore)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })
    }

    fn submit(&self, submission: Submission<'_>) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let label = submission.label;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some(fence) = submission.fence {
            match inner.fences.get(fence) {
                None => return Err(GpuError::InvalidHandle { kind: "Fence" }),
                Some(FenceState::Unsignaled) => {}
                Some(FenceState::Pending(_)) => {
                    inner.report(Some(label), "Submitted with a fence that is still pending".into())
                }
                Some(FenceState::Signaled) => {
                    inner.report(Some(label), "Submitted with a fence that was not reset".into())
                }
            }
        }

        let mut semaphores: SmallVec<[SemaphoreId; 4]> = SmallVec::new();
        for wait in submission.wait {
            let state = inner
                .semaphores
                .get_mut(wait.semaphore)
                .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })?;
            let was = *state;
            *state = SemaphoreState::Unsignaled;
            if was != SemaphoreState::Signaled {
                inner.report(Some(label), "Waits on a semaphore that has no pending signal".into());
            }
            semaphores.push(wait.semaphore);
        }

        let mut ctx = Execution {
            seq,
            label,
            resources: HashSet::new(),
            copies: Vec::new(),
        };
        inner.run_commands(
            &mut ctx,
            submission.command_buffer.commands(),
            submission.wait,
            &self.caps,
        )?;

        for semaphore in submission.signal {
            let state = inner
                .semaphores
                .get_mut(*semaphore)
                .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })?;
            let was = *state;
            *state = SemaphoreState::Signaled;
            if was == SemaphoreState::Signaled {
                inner.report(Some(label), "Signals a semaphore that is already signaled".into());
            }
            semaphores.push(*semaphore);
        }

        if let Some(fence) = submission.fence
            && let Some(state) = inner.fences.get_mut(fence)
        {
            *state = FenceState::Pending(seq);
        }

        inner.in_flight.push_back(InFlight {
            seq,
            fence: submission.fence,
            resources: ctx.resources,
            semaphores,
            copies: ctx.copies,
        });
        inner.events.push(DeviceEvent::Submitted {
            seq,
            label,
            fence: submission.fence,
            wait: submission.wait.to_vec(),
            signal: submission.signal.to_vec(),
            commands: submission.command_buffer.clone(),
        });
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<SwapchainId>,
    ) -> GpuResult<SwapchainInfo> {
        let mut inner = self.inner.lock();
        if desc.extent.is_zero_area() {
            return ValidationFailedErr {
                message: "swapchain with zero area",
            }
            .fail();
        }
        if let Some(old) = old
            && !inner.swapchains.contains_key(old)
        {
            return Err(GpuError::InvalidHandle { kind: "Swapchain" });
        }

        let id = inner.swapchains.insert(SwapchainState {
            desc: desc.clone(),
            images: Vec::new(),
            acquired: vec![None; desc.image_count as usize],
            next: 0,
        });

        let images: Vec<ImageId> = (0..desc.image_count)
            .map(|index| {
                inner.images.insert(ImageState {
                    desc: ImageDesc {
                        label: format!("Swapchain Image {index}"),
                        extent: desc.extent,
                        layers: 1,
                        array: false,
                        format: desc.format,
                        usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::PRESENT,
                    },
                    layout: ImageLayout::Undefined,
                    layers: vec![Hazard::default()],
                    swapchain: Some((id, index)),
                })
            })
            .collect();

        if let Some(state) = inner.swapchains.get_mut(id) {
            state.images = images.clone();
        }
        inner.events.push(DeviceEvent::SwapchainCreated {
            id,
            extent: desc.extent,
        });

        Ok(SwapchainInfo {
            id,
            images,
            extent: desc.extent,
            format: desc.format,
        })
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
    ) -> GpuResult<AcquiredImage> {
        let mut inner = self.inner.lock();
        let surface = inner.surface_extent;
        let (extent, count, next) = {
            let state = inner
                .swapchains
                .get(swapchain)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;
            (state.desc.extent, state.images.len() as u32, state.next)
        };

        if surface != extent {
            return Err(GpuError::SurfaceStale);
        }

        let semaphore = *inner
            .semaphores
            .get(signal)
            .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })?;
        if semaphore == SemaphoreState::Signaled {
            inner.report(None, "Acquire signals a semaphore that is already signaled".into());
        }

        let free = (0..count)
            .map(|i| (next + i) % count)
            .find(|i| {
                inner
                    .swapchains
                    .get(swapchain)
                    .is_some_and(|s| s.acquired[*i as usize].is_none())
            });
        let Some(index) = free else {
            inner.report(None, "Acquired more swapchain images than exist".into());
            return BackendErr {
                message: "no swapchain image available",
            }
            .fail();
        };

        let image = {
            let Some(state) = inner.swapchains.get_mut(swapchain) else {
                return Err(GpuError::InvalidHandle { kind: "Swapchain" });
            };
            state.acquired[index as usize] = Some(signal);
            state.next = (index + 1) % count;
            state.images[index as usize]
        };

        if let Some(state) = inner.semaphores.get_mut(signal) {
            *state = SemaphoreState::Signaled;
        }
        if let Some(state) = inner.images.get_mut(image) {
            state.layout = ImageLayout::Undefined;
            state.layers.iter_mut().for_each(|h| *h = Hazard::default());
        }
        inner.events.push(DeviceEvent::Acquired { index });

        Ok(AcquiredImage {
            index,
            image,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        swapchain: SwapchainId,
        image_index: u32,
        wait: &[SemaphoreId],
    ) -> GpuResult<PresentStatus> {
        let mut inner = self.inner.lock();
        let (image, acquired, extent) = {
            let state = inner
                .swapchains
                .get(swapchain)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;
            let image = *state
                .images
                .get(image_index as usize)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain Image" })?;
            (
                image,
                state.acquired[image_index as usize].is_some(),
                state.desc.extent,
            )
        };

        if !acquired {
            inner.report(None, format!("Presenting image {image_index} which was not acquired"));
        }

        for semaphore in wait {
            let state = inner
                .semaphores
                .get_mut(*semaphore)
                .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })?;
            let was = *state;
            *state = SemaphoreState::Unsignaled;
            if was != SemaphoreState::Signaled {
                inner.report(None, "Present waits on a semaphore that has no pending signal".into());
            }
        }

        let layout = inner.images.get(image).map(|i| i.layout);
        if layout != Some(ImageLayout::Present) {
            inner.report(
                None,
                format!("Presenting image {image_index} in layout {layout:?}"),
            );
        }

        if let Some(state) = inner.swapchains.get_mut(swapchain) {
            state.acquired[image_index as usize] = None;
        }
        inner.events.push(DeviceEvent::Presented { index: image_index });

        if inner.surface_extent != extent {
            return Err(GpuError::SurfaceStale);
        }
        if std::mem::take(&mut inner.force_suboptimal) {
            return Ok(PresentStatus::Suboptimal);
        }
        Ok(PresentStatus::Optimal)
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .swapchains
            .remove(swapchain)
            .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;

        for image in state.images {
            if inner.in_use(ResourceKey::Image(image)) {
                inner.report(None, "Swapchain destroyed while its images are in use".into());
            }
            inner.images.remove(image);
        }
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let last = inner.next_seq.saturating_sub(1);
        inner.complete_through(last);
        inner.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn upload_buffers(device: &HeadlessDevice) -> (BufferId, BufferId) {
        let staging = device
            .create_buffer(&BufferDesc::staging("staging", 16))
            .unwrap();
        let dst = device
            .create_buffer(&BufferDesc::gpu_only(
                "dst",
                16,
                BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            ))
            .unwrap();
        (staging, dst)
    }

    #[test]
    fn untouched_resource_has_no_access_history() {
        let hazard = Hazard::default();
        assert_eq!(PipelineStages::default(), PipelineStages::empty());
        assert!(hazard.live_write(0).is_none());
        assert_eq!(hazard.live_reads(0), PipelineStages::empty());
        assert_eq!(hazard.reads_released_to, PipelineStages::empty());
    }

    #[test]
    fn copies_execute_on_completion() {
        let device = HeadlessDevice::new();
        let (staging, dst) = upload_buffers(&device);
        device.write_buffer(staging, 0, &[7; 16]).unwrap();

        let mut cmd = CommandBuffer::new("upload");
        cmd.copy_buffer(staging, dst, 0, 16);
        let fence = device.create_fence(false).unwrap();
        device
            .submit(Submission {
                label: "upload",
                command_buffer: &cmd,
                wait: &[],
                signal: &[],
                fence: Some(fence),
            })
            .unwrap();

        assert_eq!(device.read_buffer(dst).unwrap(), vec![0; 16]);
        assert_eq!(
            device.wait_fence(fence, TIMEOUT).unwrap(),
            FenceStatus::Signaled
        );
        assert_eq!(device.read_buffer(dst).unwrap(), vec![7; 16]);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn host_write_to_in_flight_buffer_is_reported() {
        let (tx, rx) = unbounded();
        let device = HeadlessDevice::new().with_message_sender(tx);
        let (staging, dst) = upload_buffers(&device);

        let mut cmd = CommandBuffer::new("upload");
        cmd.copy_buffer(staging, dst, 0, 16);
        device
            .submit(Submission {
                label: "upload",
                command_buffer: &cmd,
                wait: &[],
                signal: &[],
                fence: None,
            })
            .unwrap();

        device.write_buffer(staging, 0, &[1; 16]).unwrap();
        assert_eq!(rx.try_iter().count(), 1);

        device.wait_idle().unwrap();
        device.write_buffer(staging, 0, &[1; 16]).unwrap();
        assert_eq!(device.validation_messages().len(), 1);
    }

    #[test]
    fn fence_reuse_without_wait_is_reported() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cmd = CommandBuffer::new("empty");
        let submit = |device: &HeadlessDevice| {
            device
                .submit(Submission {
                    label: "empty",
                    command_buffer: &cmd,
                    wait: &[],
                    signal: &[],
                    fence: Some(fence),
                })
                .unwrap()
        };

        submit(&device);
        submit(&device);
        assert_eq!(device.validation_messages().len(), 1);

        device.wait_fence(fence, TIMEOUT).unwrap();
        device.reset_fence(fence).unwrap();
        submit(&device);
        assert_eq!(device.validation_messages().len(), 1);
    }

    #[test]
    fn waiting_on_unsubmitted_fence_times_out() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(
            device.wait_fence(fence, TIMEOUT).unwrap(),
            FenceStatus::Timeout
        );
    }

    #[test]
    fn unordered_compute_write_then_vertex_read_is_a_hazard() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc::gpu_only(
                "skinned",
                64,
                BufferUsage::STORAGE | BufferUsage::VERTEX,
            ))
            .unwrap();
        let pipeline = device
            .create_pipeline(&PipelineDesc {
                label: "skinning".into(),
                shader: ShaderBinary {
                    kind: ShaderKind::Skinning,
                    code: Arc::from(&b"main"[..]),
                },
                kind: PipelineKind::Compute { workgroup_size: 64 },
            })
            .unwrap();

        let record = || {
            let mut cmd = CommandBuffer::new("frame");
            cmd.begin_compute_pass("skinning");
            cmd.bind_pipeline(pipeline);
            cmd.bind_resources(0, [Binding::read_write(0, buffer)]);
            cmd.dispatch(1, 1, 1);
            cmd.end_compute_pass();
            cmd.barrier(Barrier::new().buffer(
                buffer,
                (PipelineStages::COMPUTE_SHADER, Access::SHADER_WRITE),
                (PipelineStages::VERTEX_INPUT, Access::VERTEX_ATTRIBUTE_READ),
            ));
            cmd
        };

        let mut hazard = Hazard::default();
        assert!(hazard.write(PipelineStages::COMPUTE_SHADER, 1, 0).is_ok());
        assert!(hazard.read(PipelineStages::VERTEX_INPUT, 1, 0).is_err());

        let cmd = record();
        device
            .submit(Submission {
                label: "frame",
                command_buffer: &cmd,
                wait: &[],
                signal: &[],
                fence: None,
            })
            .unwrap();
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn barrier_chain_orders_write_after_read() {
        let mut hazard = Hazard::default();
        let color = PipelineStages::COLOR_ATTACHMENT_OUTPUT;
        let fragment = PipelineStages::FRAGMENT_SHADER;

        hazard.write(color, 1, 0).unwrap();
        hazard.barrier(color, fragment, 0);
        hazard.read(fragment, 1, 0).unwrap();
        assert!(hazard.clone().write(color, 2, 0).is_err());

        hazard.barrier(fragment, color, 0);
        assert!(hazard.write(color, 2, 0).is_ok());
    }

    #[test]
    fn completed_work_clears_hazards() {
        let mut hazard = Hazard::default();
        hazard.write(PipelineStages::TRANSFER, 1, 0).unwrap();
        assert!(hazard.read(PipelineStages::FRAGMENT_SHADER, 2, 1).is_ok());
    }

    #[test]
    fn stale_surface_fails_acquire() {
        let device = HeadlessDevice::new();
        let swapchain = device
            .create_swapchain(
                &SwapchainDesc {
                    extent: Extent2D::new(1280, 720),
                    image_count: 3,
                    format: ImageFormat::Bgra8Srgb,
                    vsync: true,
                },
                None,
            )
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.set_surface_extent(Extent2D::new(640, 480));
        assert!(matches!(
            device.acquire_next_image(swapchain.id, semaphore),
            Err(GpuError::SurfaceStale)
        ));
    }
}
