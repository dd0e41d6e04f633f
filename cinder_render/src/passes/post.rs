use crate::error::Result;
use crate::gpu::*;
use crate::passes::{
    PassOutput, PassOutputs, PassSetup, RecordContext, RenderPass, destroy_image,
};
use smallvec::{SmallVec, smallvec};

const POST_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;

/// Tonemaps the HDR color into a display range image.
#[derive(Debug, Default)]
pub struct PostPass {
    pipeline: Option<PipelineId>,
    color: Option<ImageId>,
}

impl PostPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_attachments(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        let color = setup.attachment("Post Color", POST_FORMAT)?;
        outputs.publish(PassOutput::PostColor, color);
        self.color = Some(color);
        Ok(())
    }
}

impl RenderPass for PostPass {
    fn name(&self) -> &'static str {
        "Post"
    }

    fn create(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "Post Process Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Post).clone(),
            kind: PipelineKind::Graphics {
                color_formats: smallvec![POST_FORMAT],
                depth_format: None,
                vertex_layout: VertexLayout::None,
                depth_bias: 0.0,
                blend: false,
            },
        })?);
        self.create_attachments(setup, outputs)
    }

    fn resize(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        destroy_image(setup.device, &mut self.color)?;
        self.create_attachments(setup, outputs)
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        destroy_image(device, &mut self.color)
    }

    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        let hdr = frame.outputs.require(PassOutput::Hdr)?;
        let color = frame.outputs.require(PassOutput::PostColor)?;
        let shader_stages = PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER;
        let color_write = (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            Access::COLOR_ATTACHMENT_WRITE,
            ImageLayout::ColorAttachment,
        );

        ctx.cmd.barrier(
            Barrier::new()
                .image(
                    hdr,
                    color_write,
                    (shader_stages, Access::SHADER_READ, ImageLayout::ShaderReadOnly),
                )
                .image(
                    color,
                    (shader_stages, Access::SHADER_READ, ImageLayout::Undefined),
                    color_write,
                ),
        );

        ctx.cmd.begin_render_pass(RenderPassBegin {
            label: frame.label("Post Process Pass"),
            extent: frame.extent,
            color: clear_color(color),
            depth: None,
        });
        if let Some(pipeline) = self.pipeline {
            ctx.cmd.bind_pipeline(pipeline);
            ctx.cmd.bind_resources(
                0,
                [
                    Binding::image(0, hdr),
                    Binding::sampler(1, SamplerKind::Linear),
                ],
            );
            ctx.cmd.draw_fullscreen();
        }
        ctx.cmd.end_render_pass();
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        self.color.into_iter().collect()
    }
}
