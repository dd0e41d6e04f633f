use crate::error::Result;
use crate::gpu::*;
use crate::lighting::ShadowUniform;
use crate::passes::{
    PassOutput, PassOutputs, PassSetup, RecordContext, RenderPass, destroy_image,
};
use cinder_utils::Extent2D;
use smallvec::{SmallVec, smallvec};
use tracing::debug;

/// Renders the scene's depth from the light once per cascade, each cascade
/// into its own layer of the shadow map.
#[derive(Debug, Default)]
pub struct ShadowPass {
    pipeline: Option<PipelineId>,
    shadow_map: Option<ImageId>,
    resolution: u32,
    layers: u32,
}

impl ShadowPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }
}

impl RenderPass for ShadowPass {
    fn name(&self) -> &'static str {
        "Shadow"
    }

    fn create(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "Shadow Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Shadow).clone(),
            kind: PipelineKind::Graphics {
                color_formats: SmallVec::new(),
                depth_format: Some(ImageFormat::Depth32Float),
                vertex_layout: VertexLayout::Mesh,
                depth_bias: setup.config.shadow_bias,
                blend: false,
            },
        })?);

        self.resolution = setup.config.shadow_map_resolution;
        self.layers = setup.config.cascade_count;
        let extent = Extent2D::new(self.resolution, self.resolution);
        let shadow_map = setup.device.create_image(
            &ImageDesc::attachment("Shadow Map", extent, ImageFormat::Depth32Float)
                .with_layers(self.layers),
        )?;
        debug!(
            "Shadow map is {}x{} with {} cascades",
            self.resolution, self.resolution, self.layers
        );

        outputs.publish(PassOutput::ShadowMap, shadow_map);
        self.shadow_map = Some(shadow_map);
        Ok(())
    }

    /// The shadow map does not follow the surface.
    fn resize(&mut self, _setup: &PassSetup, _outputs: &mut PassOutputs) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        destroy_image(device, &mut self.shadow_map)
    }

    #[profiling::function]
    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        let shadow_map = frame.outputs.require(PassOutput::ShadowMap)?;
        let sampled = (
            PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
            Access::SHADER_READ,
            ImageLayout::ShaderReadOnly,
        );
        let depth_write = (
            PipelineStages::FRAGMENT_TESTS,
            Access::DEPTH_STENCIL_WRITE,
            ImageLayout::DepthAttachment,
        );

        ctx.cmd.barrier(Barrier::new().image(
            shadow_map,
            (sampled.0, sampled.1, ImageLayout::Undefined),
            depth_write,
        ));

        let extent = Extent2D::new(self.resolution, self.resolution);
        let cascades = frame.cascades.len().min(self.layers as usize);
        for layer in 0..cascades {
            ctx.cmd.begin_render_pass(RenderPassBegin {
                label: frame.label("Shadow Cascade"),
                extent,
                color: smallvec![],
                depth: Some(DepthAttachment {
                    image: shadow_map,
                    layer: Some(layer as u32),
                    load: LoadOp::Clear(1.0),
                    store: true,
                }),
            });

            if let Some(pipeline) = self.pipeline
                && !frame.scene.is_empty()
            {
                let stride = size_of::<ShadowUniform>() as u64;
                ctx.cmd.bind_pipeline(pipeline);
                ctx.cmd.bind_resources(
                    0,
                    [
                        Binding::read_range(0, frame.shadow_uniforms, layer as u64 * stride, stride),
                        Binding::read(1, frame.instances),
                    ],
                );
                for batch in &frame.scene.batches {
                    ctx.cmd.bind_vertex_buffer(0, batch.vertex_buffer, 0);
                    ctx.cmd.bind_index_buffer(batch.index_buffer, 0);
                    ctx.cmd
                        .draw_indexed_indirect(frame.indirect, batch.first_record, batch.count);
                }
            }

            ctx.cmd.end_render_pass();
        }

        ctx.cmd
            .barrier(Barrier::new().image(shadow_map, depth_write, sampled));
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        self.shadow_map.into_iter().collect()
    }
}
