use crate::cache::StagingUploader;
use crate::error::Result;
use crate::gpu::*;
use crate::passes::{
    PassOutput, PassOutputs, PassSetup, RecordContext, RenderPass, destroy_image,
};
use crate::scene::DrawIndexedIndirect;
use bytemuck::{Pod, Zeroable};
use cinder_asset::TextureData;
use cinder_utils::FRAMES_IN_FLIGHT;
use smallvec::{SmallVec, smallvec};
use static_assertions::const_assert_eq;
use tracing::debug;

const INITIAL_VERTICES: usize = 1024;
const INITIAL_INDICES: usize = 3072;

/// One vertex of GUI geometry in surface pixels.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct GuiVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

const_assert_eq!(size_of::<GuiVertex>(), 32);

/// Triangles an overlay wants drawn on top of the frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GuiDrawData {
    pub vertices: Vec<GuiVertex>,
    pub indices: Vec<u32>,
}

impl GuiDrawData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an axis aligned, untextured rectangle.
    pub fn rect(&mut self, min: [f32; 2], max: [f32; 2], color: [f32; 4]) {
        let base = self.vertices.len() as u32;
        let corners = [
            [min[0], min[1]],
            [max[0], min[1]],
            [max[0], max[1]],
            [min[0], max[1]],
        ];
        self.vertices.extend(corners.map(|position| GuiVertex {
            position,
            uv: [0.0, 0.0],
            color,
        }));
        self.indices
            .extend([0, 1, 2, 0, 2, 3].map(|i| base + i));
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty() || self.vertices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }
}

struct GuiBuffers {
    vertex: BufferId,
    index: BufferId,
    indirect: BufferId,
    vertex_capacity: usize,
    index_capacity: usize,
}

impl GuiBuffers {
    fn new(device: &dyn GpuDevice, vertices: usize, indices: usize) -> Result<Self> {
        let vertex = device.create_buffer(&BufferDesc::host_visible(
            "GUI Vertices",
            (vertices * size_of::<GuiVertex>()) as u64,
            BufferUsage::VERTEX,
        ))?;
        let index = device.create_buffer(&BufferDesc::host_visible(
            "GUI Indices",
            (indices * size_of::<u32>()) as u64,
            BufferUsage::INDEX,
        ))?;
        let indirect = device.create_buffer(&BufferDesc::host_visible(
            "GUI Draw",
            DRAW_INDEXED_INDIRECT_STRIDE,
            BufferUsage::INDIRECT,
        ))?;
        Ok(Self {
            vertex,
            index,
            indirect,
            vertex_capacity: vertices,
            index_capacity: indices,
        })
    }

    fn retire(&self, deletion: &mut DeletionQueue, frame: u64) {
        for buffer in [self.vertex, self.index, self.indirect] {
            deletion.defer(frame, GpuResource::Buffer(buffer));
        }
    }

    fn destroy(&self, device: &dyn GpuDevice) -> Result<()> {
        device.destroy_buffer(self.vertex)?;
        device.destroy_buffer(self.index)?;
        device.destroy_buffer(self.indirect)?;
        Ok(())
    }
}

/// Draws the overlay's triangles over the post processed color with alpha blending.
#[derive(Default)]
pub struct GuiPass {
    pipeline: Option<PipelineId>,
    atlas: Option<ImageId>,
    buffers: SmallVec<[GuiBuffers; FRAMES_IN_FLIGHT]>,
}

impl GuiPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure the buffers of `slot` hold `data`, replacing them if they are
    /// too small.
    fn prepare(&mut self, ctx: &mut RecordContext, data: &GuiDrawData) -> Result<&GuiBuffers> {
        let device = ctx.frame.device;
        let slot = ctx.frame.slot;
        let buffers = &mut self.buffers[slot];

        if data.vertices.len() > buffers.vertex_capacity || data.indices.len() > buffers.index_capacity {
            let vertices = data.vertices.len().max(buffers.vertex_capacity).next_power_of_two();
            let indices = data.indices.len().max(buffers.index_capacity).next_power_of_two();
            debug!("Growing GUI buffers of slot {slot} to {vertices} vertices");
            let grown = GuiBuffers::new(device, vertices, indices)?;
            std::mem::replace(buffers, grown).retire(ctx.deletion, ctx.retire_frame);
        }

        let draw = DrawIndexedIndirect {
            index_count: data.indices.len() as u32,
            instance_count: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        };
        device.write_buffer(buffers.vertex, 0, bytemuck::cast_slice(&data.vertices))?;
        device.write_buffer(buffers.index, 0, bytemuck::cast_slice(&data.indices))?;
        device.write_buffer(buffers.indirect, 0, bytemuck::bytes_of(&draw))?;
        Ok(buffers)
    }
}

impl RenderPass for GuiPass {
    fn name(&self) -> &'static str {
        "GUI"
    }

    fn create(&mut self, setup: &PassSetup, _outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "GUI Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Gui).clone(),
            kind: PipelineKind::Graphics {
                color_formats: smallvec![ImageFormat::Rgba8Unorm],
                depth_format: None,
                vertex_layout: VertexLayout::Gui,
                depth_bias: 0.0,
                blend: true,
            },
        })?);

        let mut uploader = StagingUploader::new(setup.device, setup.config.fence_timeout());
        let atlas = uploader.image(&TextureData::solid("GUI Atlas", [u8::MAX; 4]))?;
        uploader.finish()?;
        self.atlas = Some(atlas);

        self.buffers = (0..FRAMES_IN_FLIGHT)
            .map(|_| GuiBuffers::new(setup.device, INITIAL_VERTICES, INITIAL_INDICES))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// GUI geometry is in pixels, the shader rescales it from the frame uniforms.
    fn resize(&mut self, _setup: &PassSetup, _outputs: &mut PassOutputs) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        destroy_image(device, &mut self.atlas)?;
        for buffers in self.buffers.drain(..) {
            buffers.destroy(device)?;
        }
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        if frame.gui.is_empty() {
            return Ok(());
        }
        let (Some(pipeline), Some(atlas)) = (self.pipeline, self.atlas) else {
            return Ok(());
        };
        let color = frame.outputs.require(PassOutput::PostColor)?;
        let buffers = self.prepare(ctx, frame.gui)?;
        let (vertex, index, indirect) = (buffers.vertex, buffers.index, buffers.indirect);

        let color_write = PipelineStages::COLOR_ATTACHMENT_OUTPUT;
        ctx.cmd.barrier(Barrier::new().image(
            color,
            (color_write, Access::COLOR_ATTACHMENT_WRITE, ImageLayout::ColorAttachment),
            (
                color_write,
                Access::COLOR_ATTACHMENT_WRITE | Access::COLOR_ATTACHMENT_READ,
                ImageLayout::ColorAttachment,
            ),
        ));

        ctx.cmd.begin_render_pass(RenderPassBegin {
            label: frame.label("GUI Pass"),
            extent: frame.extent,
            color: smallvec![ColorAttachment {
                image: color,
                load: LoadOp::Load,
                store: true,
            }],
            depth: None,
        });
        ctx.cmd.bind_pipeline(pipeline);
        ctx.cmd.bind_resources(
            0,
            [
                Binding::read(0, frame.frame_uniforms),
                Binding::image(1, atlas),
                Binding::sampler(2, SamplerKind::Linear),
            ],
        );
        ctx.cmd.bind_vertex_buffer(0, vertex, 0);
        ctx.cmd.bind_index_buffer(index, 0);
        ctx.cmd.draw_indexed_indirect(indirect, 0, 1);
        ctx.cmd.end_render_pass();
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        SmallVec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rects_share_one_vertex_buffer() {
        let mut gui = GuiDrawData::new();
        assert!(gui.is_empty());

        gui.rect([0.0, 0.0], [10.0, 10.0], [1.0; 4]);
        gui.rect([20.0, 0.0], [30.0, 10.0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(gui.vertices.len(), 8);
        assert_eq!(&gui.indices[6..], &[4, 5, 6, 4, 6, 7]);

        gui.clear();
        assert!(gui.is_empty());
    }
}
