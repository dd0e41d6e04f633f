//! [`GpuDevice`] on top of wgpu.
//!
//! wgpu tracks hazards and layouts itself, so barriers are not translated and
//! semaphores only carry ordering that single queue submission already gives.
//! A fence remembers the submission index of the work it guards and waits on
//! exactly that submission, so the frame in flight after it keeps running.

use super::*;
use cinder_utils::FRAMES_IN_FLIGHT;
use futures::executor::block_on;
use parking_lot::Mutex;
use slotmap::SlotMap;
use snafu::{ResultExt, Snafu, ensure};
use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};
use wgpu::{
    Adapter, CommandEncoder, Device, DeviceDescriptor, ExperimentalFeatures, Features, Instance,
    MemoryHints, PollType, PowerPreference, Queue, RequestAdapterError, RequestAdapterOptions,
    RequestDeviceError, Sampler, Surface, SurfaceTexture, TextureFormat, TextureView,
    TextureViewDescriptor,
};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum WgpuDeviceError {
    #[snafu(display("No adapter supports rendering: {source}"))]
    NoAdapter { source: RequestAdapterError },

    #[snafu(display("Unable to get device: {source}"))]
    RequestDevice { source: RequestDeviceError },

    #[snafu(display(
        "Can only present to Bgra8UnormSrgb currently, but the surface only offers {formats:?}"
    ))]
    ColorFormatNotAvailable { formats: Vec<TextureFormat> },
}

const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 4] =
    wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x4, 3 => Float32x2];
const GUI_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2, 2 => Float32x4];

struct FenceEntry {
    submitted: AtomicBool,
    signaled: Arc<AtomicBool>,
    submission: Option<wgpu::SubmissionIndex>,
}

/// Maps the outcome of waiting on one submission to the fence state.
fn fence_status(polled: Result<wgpu::PollStatus, wgpu::PollError>) -> GpuResult<FenceStatus> {
    match polled {
        Ok(_) => Ok(FenceStatus::Signaled),
        Err(wgpu::PollError::Timeout) => Ok(FenceStatus::Timeout),
        Err(e) => Err(GpuError::Backend {
            message: e.to_string(),
        }),
    }
}

enum ImageTexture {
    Owned(wgpu::Texture),
    Swapchain(Option<SurfaceTexture>),
}

struct ImageEntry {
    desc: ImageDesc,
    texture: ImageTexture,
}

enum PipelineEntry {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

impl PipelineEntry {
    fn bind_group_layout(&self, group: u32) -> wgpu::BindGroupLayout {
        match self {
            PipelineEntry::Render(p) => p.get_bind_group_layout(group),
            PipelineEntry::Compute(p) => p.get_bind_group_layout(group),
        }
    }
}

struct SwapchainEntry {
    images: Vec<ImageId>,
    next: u32,
    suboptimal: bool,
}

#[derive(Default)]
struct Resources {
    buffers: SlotMap<BufferId, (BufferDesc, wgpu::Buffer)>,
    images: SlotMap<ImageId, ImageEntry>,
    pipelines: SlotMap<PipelineId, PipelineEntry>,
    fences: SlotMap<FenceId, FenceEntry>,
    semaphores: SlotMap<SemaphoreId, ()>,
    swapchains: SlotMap<SwapchainId, SwapchainEntry>,
}

enum OwnedBinding {
    Buffer(wgpu::Buffer, u64, Option<u64>),
    View(TextureView),
    Views(Vec<TextureView>),
    Sampler(Sampler),
}

pub struct WgpuDevice {
    adapter: Adapter,
    device: Device,
    queue: Queue,
    surface: Option<Surface<'static>>,
    caps: DeviceCapabilities,
    samplers: [Sampler; 3],
    resources: Mutex<Resources>,
}

impl WgpuDevice {
    /// Opens the best adapter for `surface`. Without a surface the device can
    /// still render offscreen but cannot create swapchains.
    pub fn new(
        instance: &Instance,
        surface: Option<Surface<'static>>,
    ) -> Result<Self, WgpuDeviceError> {
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            ..RequestAdapterOptions::default()
        }))
        .context(NoAdapterErr)?;

        if let Some(surface) = &surface {
            let formats = surface.get_capabilities(&adapter).formats;
            ensure!(
                formats.contains(&TextureFormat::Bgra8UnormSrgb),
                ColorFormatNotAvailableErr { formats }
            );
        }

        let wanted = Features::INDIRECT_FIRST_INSTANCE | Features::TEXTURE_BINDING_ARRAY;
        let required_features = adapter.features() & wanted;

        let (device, queue) = block_on(adapter.request_device(&DeviceDescriptor {
            label: Some("Renderer Hardware"),
            required_features,
            required_limits: adapter.limits(),
            experimental_features: ExperimentalFeatures::disabled(),
            memory_hints: MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .context(RequestDeviceErr)?;

        let info = adapter.get_info();
        info!("Selected adapter {} ({:?})", info.name, info.backend);

        let limits = device.limits();
        let caps = DeviceCapabilities {
            name: info.name.clone(),
            vendor: GpuVendor::from_pci_id(info.vendor),
            multi_draw_indirect: true,
            indirect_first_instance: required_features.contains(Features::INDIRECT_FIRST_INSTANCE),
            compute: true,
            texture_binding_array: required_features.contains(Features::TEXTURE_BINDING_ARRAY),
            max_image_array_layers: limits.max_texture_array_layers,
            max_image_dimension: limits.max_texture_dimension_2d,
            diagnostic_checkpoints: false,
        };

        let samplers = [
            Self::create_sampler(&device, "Linear Sampler", wgpu::FilterMode::Linear, None),
            Self::create_sampler(&device, "Nearest Sampler", wgpu::FilterMode::Nearest, None),
            Self::create_sampler(
                &device,
                "Shadow Sampler",
                wgpu::FilterMode::Linear,
                Some(wgpu::CompareFunction::LessEqual),
            ),
        ];

        Ok(Self {
            adapter,
            device,
            queue,
            surface,
            caps,
            samplers,
            resources: Mutex::new(Resources::default()),
        })
    }

    fn create_sampler(
        device: &Device,
        label: &'static str,
        filter: wgpu::FilterMode,
        compare: Option<wgpu::CompareFunction>,
    ) -> Sampler {
        device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(label),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            compare,
            ..wgpu::SamplerDescriptor::default()
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    fn sampler(&self, kind: SamplerKind) -> &Sampler {
        match kind {
            SamplerKind::Linear => &self.samplers[0],
            SamplerKind::Nearest => &self.samplers[1],
            SamplerKind::ShadowCompare => &self.samplers[2],
        }
    }

    /// Blocks until everything submitted so far has completed.
    fn drain(&self) -> GpuResult<()> {
        self.device
            .poll(PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| GpuError::Backend {
                message: e.to_string(),
            })
    }
}

fn texture_format(format: ImageFormat) -> TextureFormat {
    match format {
        ImageFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        ImageFormat::Rgba8Srgb => TextureFormat::Rgba8UnormSrgb,
        ImageFormat::Bgra8Srgb => TextureFormat::Bgra8UnormSrgb,
        ImageFormat::Rgba16Float => TextureFormat::Rgba16Float,
        ImageFormat::Depth32Float => TextureFormat::Depth32Float,
    }
}

fn buffer_usages(desc: &BufferDesc) -> wgpu::BufferUsages {
    let mut usages = wgpu::BufferUsages::empty();
    let map = [
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
        (BufferUsage::TRANSFER_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::TRANSFER_DST, wgpu::BufferUsages::COPY_DST),
    ];
    for (ours, theirs) in map {
        if desc.usage.contains(ours) {
            usages |= theirs;
        }
    }
    // host writes go through the queue
    if desc.location == MemoryLocation::CpuToGpu {
        usages |= wgpu::BufferUsages::COPY_DST;
    }
    usages
}

fn texture_usages(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut usages = wgpu::TextureUsages::empty();
    if usage.intersects(ImageUsage::COLOR_ATTACHMENT | ImageUsage::DEPTH_ATTACHMENT) {
        usages |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        usages |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(ImageUsage::STORAGE) {
        usages |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        usages |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        usages |= wgpu::TextureUsages::COPY_DST;
    }
    usages
}

fn surface_error(error: wgpu::SurfaceError) -> GpuError {
    match error {
        wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => GpuError::SurfaceStale,
        wgpu::SurfaceError::Timeout => {
            warn!("Surface acquire timed out, recreating the swapchain");
            GpuError::SurfaceStale
        }
        wgpu::SurfaceError::OutOfMemory => GpuError::OutOfMemory {
            what: "swapchain image".to_string(),
        },
        other => GpuError::Backend {
            message: other.to_string(),
        },
    }
}

impl Resources {
    fn buffer(&self, id: BufferId) -> GpuResult<&wgpu::Buffer> {
        self.buffers
            .get(id)
            .map(|(_, b)| b)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })
    }

    fn texture(&self, id: ImageId) -> GpuResult<&wgpu::Texture> {
        let entry = self
            .images
            .get(id)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
        match &entry.texture {
            ImageTexture::Owned(texture) => Ok(texture),
            ImageTexture::Swapchain(Some(surface)) => Ok(&surface.texture),
            ImageTexture::Swapchain(None) => Err(GpuError::InvalidHandle {
                kind: "Unacquired Swapchain Image",
            }),
        }
    }

    /// A view over every layer, or a single layer when `layer` is given.
    fn view(&self, id: ImageId, layer: Option<u32>) -> GpuResult<TextureView> {
        let texture = self.texture(id)?;
        let array = self.images.get(id).is_some_and(|e| e.desc.array);

        let desc = match layer {
            Some(layer) => TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: layer,
                array_layer_count: Some(1),
                ..TextureViewDescriptor::default()
            },
            None if array => TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                ..TextureViewDescriptor::default()
            },
            None => TextureViewDescriptor::default(),
        };
        Ok(texture.create_view(&desc))
    }
}

impl WgpuDevice {
    fn bind_group(
        &self,
        res: &Resources,
        pipeline: Option<PipelineId>,
        group: u32,
        bindings: &[Binding],
    ) -> GpuResult<wgpu::BindGroup> {
        let pipeline = pipeline
            .and_then(|p| res.pipelines.get(p))
            .ok_or(GpuError::InvalidHandle { kind: "Pipeline" })?;
        let layout = pipeline.bind_group_layout(group);

        let owned = bindings
            .iter()
            .map(|binding| {
                Ok(match &binding.resource {
                    BindingResource::Buffer {
                        buffer,
                        offset,
                        size,
                        ..
                    } => OwnedBinding::Buffer(res.buffer(*buffer)?.clone(), *offset, *size),
                    BindingResource::Image(image) => OwnedBinding::View(res.view(*image, None)?),
                    BindingResource::ImageArray(images) => OwnedBinding::Views(
                        images
                            .iter()
                            .map(|i| res.view(*i, None))
                            .collect::<GpuResult<_>>()?,
                    ),
                    BindingResource::Sampler(kind) => OwnedBinding::Sampler(self.sampler(*kind).clone()),
                })
            })
            .collect::<GpuResult<Vec<_>>>()?;

        let arrays: Vec<Vec<&TextureView>> = owned
            .iter()
            .map(|o| match o {
                OwnedBinding::Views(views) => views.iter().collect(),
                _ => Vec::new(),
            })
            .collect();

        let entries: Vec<wgpu::BindGroupEntry> = bindings
            .iter()
            .zip(&owned)
            .zip(&arrays)
            .map(|((binding, owned), array)| wgpu::BindGroupEntry {
                binding: binding.slot,
                resource: match owned {
                    OwnedBinding::Buffer(buffer, offset, size) => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer,
                            offset: *offset,
                            size: size.and_then(NonZeroU64::new),
                        })
                    }
                    OwnedBinding::View(view) => wgpu::BindingResource::TextureView(view),
                    OwnedBinding::Views(_) => wgpu::BindingResource::TextureViewArray(array),
                    OwnedBinding::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                },
            })
            .collect();

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        }))
    }

    fn encode(&self, res: &Resources, encoder: &mut CommandEncoder, commands: &[Command]) -> GpuResult<()> {
        let mut i = 0;
        while i < commands.len() {
            match &commands[i] {
                Command::BeginRenderPass(begin) => {
                    let end = find_end(commands, i, |c| matches!(c, Command::EndRenderPass));
                    self.encode_render_pass(res, encoder, begin, &commands[i + 1..end])?;
                    i = end + 1;
                    continue;
                }
                Command::BeginComputePass { label } => {
                    let end = find_end(commands, i, |c| matches!(c, Command::EndComputePass));
                    self.encode_compute_pass(res, encoder, label, &commands[i + 1..end])?;
                    i = end + 1;
                    continue;
                }
                Command::PipelineBarrier(_) => {}
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(
                        res.buffer(*src)?,
                        *src_offset,
                        res.buffer(*dst)?,
                        *dst_offset,
                        *size,
                    );
                }
                Command::CopyBufferToImage {
                    src,
                    bytes_per_row,
                    dst,
                    extent,
                } => {
                    encoder.copy_buffer_to_texture(
                        wgpu::TexelCopyBufferInfo {
                            buffer: res.buffer(*src)?,
                            layout: wgpu::TexelCopyBufferLayout {
                                offset: 0,
                                bytes_per_row: Some(*bytes_per_row),
                                rows_per_image: Some(extent.height),
                            },
                        },
                        wgpu::TexelCopyTextureInfo {
                            texture: res.texture(*dst)?,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: extent.width,
                            height: extent.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::Checkpoint(label) => encoder.insert_debug_marker(label),
                other => {
                    warn!("Command {other:?} recorded outside of a pass is ignored");
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn encode_render_pass(
        &self,
        res: &Resources,
        encoder: &mut CommandEncoder,
        begin: &RenderPassBegin,
        body: &[Command],
    ) -> GpuResult<()> {
        let color_views = begin
            .color
            .iter()
            .map(|c| res.view(c.image, None))
            .collect::<GpuResult<Vec<_>>>()?;
        let depth_view = begin
            .depth
            .as_ref()
            .map(|d| res.view(d.image, d.layer))
            .transpose()?;

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = begin
            .color
            .iter()
            .zip(&color_views)
            .map(|(color, view)| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match color.load {
                            LoadOp::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                                r: r as f64,
                                g: g as f64,
                                b: b as f64,
                                a: a as f64,
                            }),
                            LoadOp::Load | LoadOp::DontCare => wgpu::LoadOp::Load,
                        },
                        store: store_op(color.store),
                    },
                })
            })
            .collect();

        let depth_stencil_attachment = begin.depth.as_ref().zip(depth_view.as_ref()).map(
            |(depth, view)| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: match depth.load {
                        LoadOp::Clear(d) => wgpu::LoadOp::Clear(d),
                        LoadOp::Load | LoadOp::DontCare => wgpu::LoadOp::Load,
                    },
                    store: store_op(depth.store),
                }),
                stencil_ops: None,
            },
        );

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: (!begin.label.is_empty()).then_some(begin.label),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            ..wgpu::RenderPassDescriptor::default()
        });

        let mut pipeline = None;
        for command in body {
            match command {
                Command::BindPipeline(id) => match res.pipelines.get(*id) {
                    Some(PipelineEntry::Render(p)) => {
                        pass.set_pipeline(p);
                        pipeline = Some(*id);
                    }
                    _ => return Err(GpuError::InvalidHandle { kind: "Render Pipeline" }),
                },
                Command::BindResources { group, bindings } => {
                    let bind_group = self.bind_group(res, pipeline, *group, bindings)?;
                    pass.set_bind_group(*group, &bind_group, &[]);
                }
                Command::BindVertexBuffer {
                    slot,
                    buffer,
                    offset,
                } => pass.set_vertex_buffer(*slot, res.buffer(*buffer)?.slice(*offset..)),
                Command::BindIndexBuffer { buffer, offset } => pass.set_index_buffer(
                    res.buffer(*buffer)?.slice(*offset..),
                    wgpu::IndexFormat::Uint32,
                ),
                Command::Draw {
                    vertices,
                    instances,
                } => pass.draw(0..*vertices, 0..*instances),
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                } => {
                    let buffer = res.buffer(*buffer)?;
                    if self.caps.multi_draw_indirect {
                        pass.multi_draw_indexed_indirect(buffer, *offset, *draw_count);
                    } else {
                        for k in 0..*draw_count as u64 {
                            pass.draw_indexed_indirect(
                                buffer,
                                offset + k * DRAW_INDEXED_INDIRECT_STRIDE,
                            );
                        }
                    }
                }
                Command::Checkpoint(label) => pass.insert_debug_marker(label),
                other => warn!("Command {other:?} is not valid inside a render pass"),
            }
        }
        Ok(())
    }

    fn encode_compute_pass(
        &self,
        res: &Resources,
        encoder: &mut CommandEncoder,
        label: &'static str,
        body: &[Command],
    ) -> GpuResult<()> {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: (!label.is_empty()).then_some(label),
            timestamp_writes: None,
        });

        let mut pipeline = None;
        for command in body {
            match command {
                Command::BindPipeline(id) => match res.pipelines.get(*id) {
                    Some(PipelineEntry::Compute(p)) => {
                        pass.set_pipeline(p);
                        pipeline = Some(*id);
                    }
                    _ => return Err(GpuError::InvalidHandle { kind: "Compute Pipeline" }),
                },
                Command::BindResources { group, bindings } => {
                    let bind_group = self.bind_group(res, pipeline, *group, bindings)?;
                    pass.set_bind_group(*group, &bind_group, &[]);
                }
                Command::Dispatch { x, y, z } => pass.dispatch_workgroups(*x, *y, *z),
                Command::Checkpoint(label) => pass.insert_debug_marker(label),
                other => warn!("Command {other:?} is not valid inside a compute pass"),
            }
        }
        Ok(())
    }
}

fn store_op(store: bool) -> wgpu::StoreOp {
    if store {
        wgpu::StoreOp::Store
    } else {
        wgpu::StoreOp::Discard
    }
}

fn find_end(commands: &[Command], begin: usize, is_end: impl Fn(&Command) -> bool) -> usize {
    commands[begin..]
        .iter()
        .position(is_end)
        .map(|p| begin + p)
        .unwrap_or(commands.len())
}

impl GpuDevice for WgpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size,
            usage: buffer_usages(desc),
            mapped_at_creation: false,
        });
        Ok(self.resources.lock().buffers.insert((desc.clone(), buffer)))
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let res = self.resources.lock();
        let (desc, buffer) = res
            .buffers
            .get(buffer)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
        ensure!(
            desc.location == MemoryLocation::CpuToGpu,
            ValidationFailedErr {
                message: format!("{} is not host visible", desc.label)
            }
        );
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> GpuResult<u64> {
        let res = self.resources.lock();
        res.buffers
            .get(buffer)
            .map(|(d, _)| d.size)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })
    }

    fn destroy_buffer(&self, buffer: BufferId) -> GpuResult<()> {
        let (_, buffer) = self
            .resources
            .lock()
            .buffers
            .remove(buffer)
            .ok_or(GpuError::InvalidHandle { kind: "Buffer" })?;
        buffer.destroy();
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageId> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.extent.width.max(1),
                height: desc.extent.height.max(1),
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: texture_usages(desc.usage),
            view_formats: &[],
        });

        Ok(self.resources.lock().images.insert(ImageEntry {
            desc: desc.clone(),
            texture: ImageTexture::Owned(texture),
        }))
    }

    fn image_desc(&self, image: ImageId) -> GpuResult<ImageDesc> {
        let res = self.resources.lock();
        res.images
            .get(image)
            .map(|e| e.desc.clone())
            .ok_or(GpuError::InvalidHandle { kind: "Image" })
    }

    fn destroy_image(&self, image: ImageId) -> GpuResult<()> {
        let entry = self
            .resources
            .lock()
            .images
            .remove(image)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
        if let ImageTexture::Owned(texture) = entry.texture {
            texture.destroy();
        }
        Ok(())
    }

    #[instrument(skip_all, fields(label = %desc.label))]
    fn create_pipeline(&self, desc: &PipelineDesc) -> GpuResult<PipelineId> {
        let source = std::str::from_utf8(&desc.shader.code).map_err(|e| GpuError::ValidationFailed {
            message: format!("{} is not WGSL text: {e}", desc.label),
        })?;
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
            });

        let entry = match &desc.kind {
            PipelineKind::Graphics {
                color_formats,
                depth_format,
                vertex_layout,
                depth_bias,
                blend,
            } => {
                let buffers: Vec<wgpu::VertexBufferLayout> = match vertex_layout {
                    VertexLayout::None => Vec::new(),
                    VertexLayout::Mesh => vec![wgpu::VertexBufferLayout {
                        array_stride: 48,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &MESH_ATTRIBUTES,
                    }],
                    VertexLayout::Gui => vec![wgpu::VertexBufferLayout {
                        array_stride: 32,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &GUI_ATTRIBUTES,
                    }],
                };

                let targets: Vec<Option<wgpu::ColorTargetState>> = color_formats
                    .iter()
                    .map(|format| {
                        Some(wgpu::ColorTargetState {
                            format: texture_format(*format),
                            blend: blend.then_some(wgpu::BlendState::ALPHA_BLENDING),
                            write_mask: wgpu::ColorWrites::all(),
                        })
                    })
                    .collect();

                let depth_stencil = depth_format.map(|format| wgpu::DepthStencilState {
                    format: texture_format(format),
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState {
                        constant: (*depth_bias * 1000.0) as i32,
                        slope_scale: if *depth_bias > 0.0 { 1.5 } else { 0.0 },
                        clamp: 0.0,
                    },
                });

                let fragment = (!targets.is_empty()).then(|| wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                });

                let cull_mode = (*vertex_layout == VertexLayout::Mesh).then_some(wgpu::Face::Back);

                PipelineEntry::Render(self.device.create_render_pipeline(
                    &wgpu::RenderPipelineDescriptor {
                        label: Some(&desc.label),
                        layout: None,
                        vertex: wgpu::VertexState {
                            module: &module,
                            entry_point: Some("vs_main"),
                            compilation_options: wgpu::PipelineCompilationOptions::default(),
                            buffers: &buffers,
                        },
                        primitive: wgpu::PrimitiveState {
                            topology: wgpu::PrimitiveTopology::TriangleList,
                            cull_mode,
                            ..wgpu::PrimitiveState::default()
                        },
                        depth_stencil,
                        multisample: wgpu::MultisampleState::default(),
                        fragment,
                        multiview_mask: None,
                        cache: None,
                    },
                ))
            }
            PipelineKind::Compute { .. } => PipelineEntry::Compute(
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(&desc.label),
                        layout: None,
                        module: &module,
                        entry_point: Some("main"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    }),
            ),
        };

        Ok(self.resources.lock().pipelines.insert(entry))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) -> GpuResult<()> {
        self.resources
            .lock()
            .pipelines
            .remove(pipeline)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Pipeline" })
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId> {
        Ok(self.resources.lock().fences.insert(FenceEntry {
            submitted: AtomicBool::new(signaled),
            signaled: Arc::new(AtomicBool::new(signaled)),
            submission: None,
        }))
    }

    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> GpuResult<FenceStatus> {
        let (signaled, submission) = {
            let res = self.resources.lock();
            let entry = res
                .fences
                .get(fence)
                .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;
            if !entry.submitted.load(Ordering::Acquire) {
                return Ok(FenceStatus::Timeout);
            }
            (entry.signaled.clone(), entry.submission.clone())
        };

        if signaled.load(Ordering::Acquire) {
            return Ok(FenceStatus::Signaled);
        }
        let Some(submission) = submission else {
            return Ok(FenceStatus::Timeout);
        };

        trace!("Waiting up to {timeout:?} for fence");
        let status = fence_status(self.device.poll(PollType::Wait {
            submission_index: Some(submission),
            timeout: Some(timeout),
        }))?;
        if status == FenceStatus::Signaled {
            signaled.store(true, Ordering::Release);
        }
        Ok(status)
    }

    fn reset_fence(&self, fence: FenceId) -> GpuResult<()> {
        let mut res = self.resources.lock();
        let entry = res
            .fences
            .get_mut(fence)
            .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;
        entry.submitted.store(false, Ordering::Release);
        entry.signaled.store(false, Ordering::Release);
        entry.submission = None;
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceId) -> GpuResult<()> {
        self.resources
            .lock()
            .fences
            .remove(fence)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Fence" })
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        Ok(self.resources.lock().semaphores.insert(()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) -> GpuResult<()> {
        self.resources
            .lock()
            .semaphores
            .remove(semaphore)
            .map(|_| ())
            .ok_or(GpuError::InvalidHandle { kind: "Semaphore" })
    }

    #[instrument(skip_all, fields(label = submission.label))]
    fn submit(&self, submission: Submission<'_>) -> GpuResult<()> {
        let mut res = self.resources.lock();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(submission.label),
            });
        self.encode(&res, &mut encoder, submission.command_buffer.commands())?;
        let index = self.queue.submit(Some(encoder.finish()));

        if let Some(fence) = submission.fence {
            let entry = res
                .fences
                .get_mut(fence)
                .ok_or(GpuError::InvalidHandle { kind: "Fence" })?;
            entry.submission = Some(index);
            entry.submitted.store(true, Ordering::Release);
            let signaled = entry.signaled.clone();
            self.queue.on_submitted_work_done(move || {
                signaled.store(true, Ordering::Release);
            });
        }
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        _old: Option<SwapchainId>,
    ) -> GpuResult<SwapchainInfo> {
        let surface = self.surface.as_ref().ok_or(GpuError::Unsupported {
            feature: "presentation without a surface",
        })?;
        let caps = surface.get_capabilities(&self.adapter);
        let present_mode = if desc.vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        surface.configure(
            &self.device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: texture_format(desc.format),
                width: desc.extent.width,
                height: desc.extent.height,
                present_mode,
                alpha_mode: caps
                    .alpha_modes
                    .first()
                    .copied()
                    .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                view_formats: vec![],
                desired_maximum_frame_latency: FRAMES_IN_FLIGHT as u32,
            },
        );
        debug!("Configured surface at {}", desc.extent);

        let mut res = self.resources.lock();
        let images: Vec<ImageId> = (0..desc.image_count)
            .map(|index| {
                res.images.insert(ImageEntry {
                    desc: ImageDesc {
                        label: format!("Swapchain Image {index}"),
                        extent: desc.extent,
                        layers: 1,
                        array: false,
                        format: desc.format,
                        usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::PRESENT,
                    },
                    texture: ImageTexture::Swapchain(None),
                })
            })
            .collect();

        let id = res.swapchains.insert(SwapchainEntry {
            images: images.clone(),
            next: 0,
            suboptimal: false,
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
        _signal: SemaphoreId,
    ) -> GpuResult<AcquiredImage> {
        let surface = self.surface.as_ref().ok_or(GpuError::Unsupported {
            feature: "presentation without a surface",
        })?;
        let output = surface.get_current_texture().map_err(surface_error)?;
        let suboptimal = output.suboptimal;

        let mut res = self.resources.lock();
        let (index, image) = {
            let entry = res
                .swapchains
                .get_mut(swapchain)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;
            let index = entry.next;
            entry.next = (entry.next + 1) % entry.images.len().max(1) as u32;
            entry.suboptimal = suboptimal;
            (index, entry.images[index as usize])
        };

        let entry = res
            .images
            .get_mut(image)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
        entry.texture = ImageTexture::Swapchain(Some(output));

        Ok(AcquiredImage {
            index,
            image,
            suboptimal,
        })
    }

    fn present(
        &self,
        swapchain: SwapchainId,
        image_index: u32,
        _wait: &[SemaphoreId],
    ) -> GpuResult<PresentStatus> {
        let mut res = self.resources.lock();
        let (image, suboptimal) = {
            let entry = res
                .swapchains
                .get(swapchain)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;
            let image = *entry
                .images
                .get(image_index as usize)
                .ok_or(GpuError::InvalidHandle { kind: "Swapchain Image" })?;
            (image, entry.suboptimal)
        };

        let entry = res
            .images
            .get_mut(image)
            .ok_or(GpuError::InvalidHandle { kind: "Image" })?;
        let ImageTexture::Swapchain(slot) = &mut entry.texture else {
            return Err(GpuError::InvalidHandle { kind: "Swapchain Image" });
        };
        let output = slot.take().ok_or(GpuError::InvalidHandle {
            kind: "Unacquired Swapchain Image",
        })?;
        drop(res);

        output.present();
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Optimal
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) -> GpuResult<()> {
        let mut res = self.resources.lock();
        let entry = res
            .swapchains
            .remove(swapchain)
            .ok_or(GpuError::InvalidHandle { kind: "Swapchain" })?;
        for image in entry.images {
            res.images.remove(image);
        }
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_visible_buffers_accept_queue_writes() {
        let desc = BufferDesc::host_visible("instances", 64, BufferUsage::STORAGE);
        let usages = buffer_usages(&desc);
        assert!(usages.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST));
    }

    #[test]
    fn attachments_are_render_targets() {
        let usages = texture_usages(ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED);
        assert_eq!(
            usages,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        );
    }

    #[test]
    fn fence_waits_time_out_instead_of_failing() {
        assert_eq!(
            fence_status(Ok(wgpu::PollStatus::WaitSucceeded)).unwrap(),
            FenceStatus::Signaled
        );
        assert_eq!(
            fence_status(Ok(wgpu::PollStatus::QueueEmpty)).unwrap(),
            FenceStatus::Signaled
        );
        assert_eq!(
            fence_status(Err(wgpu::PollError::Timeout)).unwrap(),
            FenceStatus::Timeout
        );
        assert!(fence_status(Err(wgpu::PollError::WrongSubmissionIndex(4, 2))).is_err());
    }

    #[test]
    fn stale_surface_errors_recover() {
        assert!(surface_error(wgpu::SurfaceError::Outdated).is_surface_stale());
        assert!(surface_error(wgpu::SurfaceError::Lost).is_surface_stale());
        assert!(!surface_error(wgpu::SurfaceError::OutOfMemory).is_surface_stale());
    }

    #[test]
    fn unterminated_pass_runs_to_the_end() {
        let commands = [
            Command::BeginComputePass { label: "test" },
            Command::Dispatch { x: 1, y: 1, z: 1 },
        ];
        assert_eq!(find_end(&commands, 0, |c| matches!(c, Command::EndComputePass)), 2);
    }
}
