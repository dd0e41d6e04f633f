//! Backend independent command recording.
//!
//! A [`CommandBuffer`] is an ordered list of [`Command`]s. Backends translate it
//! at submission time, which keeps recording free of device locks and lets the
//! frame recording run on any thread.

use super::types::*;
use cinder_utils::Extent2D;
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

/// Byte size of one indexed indirect draw record.
pub const DRAW_INDEXED_INDIRECT_STRIDE: u64 = 20;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
    DontCare,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub image: ImageId,
    pub load: LoadOp<[f32; 4]>,
    pub store: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub image: ImageId,
    /// Array layer rendered into. `None` renders into layer 0 of a plain image.
    pub layer: Option<u32>,
    pub load: LoadOp<f32>,
    pub store: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassBegin {
    pub label: &'static str,
    pub extent: Extent2D,
    pub color: SmallVec<[ColorAttachment; 4]>,
    pub depth: Option<DepthAttachment>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    Linear,
    Nearest,
    ShadowCompare,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingResource {
    Buffer {
        buffer: BufferId,
        offset: u64,
        size: Option<u64>,
        access: BufferAccess,
    },
    Image(ImageId),
    ImageArray(Arc<[ImageId]>),
    Sampler(SamplerKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub resource: BindingResource,
}

impl Binding {
    pub fn read(slot: u32, buffer: BufferId) -> Self {
        Self {
            slot,
            resource: BindingResource::Buffer {
                buffer,
                offset: 0,
                size: None,
                access: BufferAccess::Read,
            },
        }
    }

    pub fn read_range(slot: u32, buffer: BufferId, offset: u64, size: u64) -> Self {
        Self {
            slot,
            resource: BindingResource::Buffer {
                buffer,
                offset,
                size: Some(size),
                access: BufferAccess::Read,
            },
        }
    }

    pub fn read_write(slot: u32, buffer: BufferId) -> Self {
        Self {
            slot,
            resource: BindingResource::Buffer {
                buffer,
                offset: 0,
                size: None,
                access: BufferAccess::ReadWrite,
            },
        }
    }

    pub fn image(slot: u32, image: ImageId) -> Self {
        Self {
            slot,
            resource: BindingResource::Image(image),
        }
    }

    pub fn images(slot: u32, images: Arc<[ImageId]>) -> Self {
        Self {
            slot,
            resource: BindingResource::ImageArray(images),
        }
    }

    pub fn sampler(slot: u32, sampler: SamplerKind) -> Self {
        Self {
            slot,
            resource: BindingResource::Sampler(sampler),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: Access,
    pub dst_access: Access,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBarrier {
    pub image: ImageId,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: Access,
    pub dst_access: Access,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// Producer/consumer dependency recorded between two GPU operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Barrier {
    pub buffers: SmallVec<[BufferBarrier; 4]>,
    pub images: SmallVec<[ImageBarrier; 4]>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(
        mut self,
        buffer: BufferId,
        (src_stages, src_access): (PipelineStages, Access),
        (dst_stages, dst_access): (PipelineStages, Access),
    ) -> Self {
        self.buffers.push(BufferBarrier {
            buffer,
            src_stages,
            dst_stages,
            src_access,
            dst_access,
        });
        self
    }

    pub fn image(
        mut self,
        image: ImageId,
        (src_stages, src_access, old_layout): (PipelineStages, Access, ImageLayout),
        (dst_stages, dst_access, new_layout): (PipelineStages, Access, ImageLayout),
    ) -> Self {
        self.images.push(ImageBarrier {
            image,
            src_stages,
            dst_stages,
            src_access,
            dst_access,
            old_layout,
            new_layout,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PipelineBarrier(Barrier),
    CopyBuffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: BufferId,
        bytes_per_row: u32,
        dst: ImageId,
        extent: Extent2D,
    },
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    BeginComputePass {
        label: &'static str,
    },
    EndComputePass,
    BindPipeline(PipelineId),
    BindResources {
        group: u32,
        bindings: SmallVec<[Binding; 8]>,
    },
    BindVertexBuffer {
        slot: u32,
        buffer: BufferId,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferId,
        offset: u64,
    },
    Draw {
        vertices: u32,
        instances: u32,
    },
    /// Multi-draw of `draw_count` indexed indirect records starting at `offset`.
    DrawIndexedIndirect {
        buffer: BufferId,
        offset: u64,
        draw_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// A vendor diagnostic checkpoint or plain debug marker.
    Checkpoint(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    label: &'static str,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Drops every recorded command while keeping the allocation.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        if !barrier.is_empty() {
            self.commands.push(Command::PipelineBarrier(barrier));
        }
    }

    pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, dst_offset: u64, size: u64) {
        self.commands.push(Command::CopyBuffer {
            src,
            src_offset: 0,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn begin_render_pass(&mut self, begin: RenderPassBegin) {
        self.commands.push(Command::BeginRenderPass(begin));
    }

    pub fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    pub fn begin_compute_pass(&mut self, label: &'static str) {
        self.commands.push(Command::BeginComputePass { label });
    }

    pub fn end_compute_pass(&mut self) {
        self.commands.push(Command::EndComputePass);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_resources(&mut self, group: u32, bindings: impl IntoIterator<Item = Binding>) {
        self.commands.push(Command::BindResources {
            group,
            bindings: bindings.into_iter().collect(),
        });
    }

    pub fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferId, offset: u64) {
        self.commands.push(Command::BindVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferId, offset: u64) {
        self.commands
            .push(Command::BindIndexBuffer { buffer, offset });
    }

    pub fn draw_fullscreen(&mut self) {
        self.commands.push(Command::Draw {
            vertices: 3,
            instances: 1,
        });
    }

    pub fn draw(&mut self, vertices: u32, instances: u32) {
        self.commands.push(Command::Draw {
            vertices,
            instances,
        });
    }

    /// Records a multi-draw. A zero count records nothing.
    pub fn draw_indexed_indirect(&mut self, buffer: BufferId, first_record: u32, draw_count: u32) {
        if draw_count == 0 {
            return;
        }
        self.commands.push(Command::DrawIndexedIndirect {
            buffer,
            offset: first_record as u64 * DRAW_INDEXED_INDIRECT_STRIDE,
            draw_count,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn checkpoint(&mut self, label: &'static str) {
        self.commands.push(Command::Checkpoint(label));
    }

    /// Counts the recorded commands that match `predicate`.
    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }
}

/// A fullscreen color target with a clear.
pub fn clear_color(image: ImageId) -> SmallVec<[ColorAttachment; 4]> {
    smallvec![ColorAttachment {
        image,
        load: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
        store: true,
    }]
}
