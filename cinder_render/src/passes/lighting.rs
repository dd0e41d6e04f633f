use crate::error::Result;
use crate::gpu::*;
use crate::passes::{
    PassOutput, PassOutputs, PassSetup, RecordContext, RenderPass, destroy_image,
};
use smallvec::{SmallVec, smallvec};

const HDR_FORMAT: ImageFormat = ImageFormat::Rgba16Float;

/// Resolves the G-buffer into lit HDR color, sampling the cascade that covers
/// each fragment.
#[derive(Debug, Default)]
pub struct LightingPass {
    pipeline: Option<PipelineId>,
    hdr: Option<ImageId>,
}

impl LightingPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_attachments(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        let hdr = setup.attachment("HDR Color", HDR_FORMAT)?;
        outputs.publish(PassOutput::Hdr, hdr);
        self.hdr = Some(hdr);
        Ok(())
    }
}

impl RenderPass for LightingPass {
    fn name(&self) -> &'static str {
        "Lighting"
    }

    fn create(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "Lighting Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Lighting).clone(),
            kind: PipelineKind::Graphics {
                color_formats: smallvec![HDR_FORMAT],
                depth_format: None,
                vertex_layout: VertexLayout::None,
                depth_bias: 0.0,
                blend: false,
            },
        })?);
        self.create_attachments(setup, outputs)
    }

    fn resize(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        destroy_image(setup.device, &mut self.hdr)?;
        self.create_attachments(setup, outputs)
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        destroy_image(device, &mut self.hdr)
    }

    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        let outputs = frame.outputs;
        let albedo = outputs.require(PassOutput::GBufferAlbedo)?;
        let normal = outputs.require(PassOutput::GBufferNormal)?;
        let material = outputs.require(PassOutput::GBufferMaterial)?;
        let depth = outputs.require(PassOutput::Depth)?;
        let shadow_map = outputs.require(PassOutput::ShadowMap)?;
        let hdr = outputs.require(PassOutput::Hdr)?;

        let shader_stages = PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER;
        let color_written = (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            Access::COLOR_ATTACHMENT_WRITE,
            ImageLayout::ColorAttachment,
        );
        let sampled = (shader_stages, Access::SHADER_READ, ImageLayout::ShaderReadOnly);

        ctx.cmd.barrier(
            Barrier::new()
                .image(albedo, color_written, sampled)
                .image(normal, color_written, sampled)
                .image(material, color_written, sampled)
                .image(
                    depth,
                    (
                        PipelineStages::FRAGMENT_TESTS,
                        Access::DEPTH_STENCIL_WRITE,
                        ImageLayout::DepthAttachment,
                    ),
                    sampled,
                )
                .image(
                    hdr,
                    (shader_stages, Access::SHADER_READ, ImageLayout::Undefined),
                    color_written,
                ),
        );

        ctx.cmd.begin_render_pass(RenderPassBegin {
            label: frame.label("Lighting Pass"),
            extent: frame.extent,
            color: clear_color(hdr),
            depth: None,
        });
        if let Some(pipeline) = self.pipeline {
            ctx.cmd.bind_pipeline(pipeline);
            ctx.cmd.bind_resources(
                0,
                [
                    Binding::read(0, frame.frame_uniforms),
                    Binding::read(1, frame.shadow_uniforms),
                    Binding::image(2, albedo),
                    Binding::image(3, normal),
                    Binding::image(4, material),
                    Binding::image(5, depth),
                    Binding::image(6, shadow_map),
                    Binding::sampler(7, SamplerKind::ShadowCompare),
                ],
            );
            ctx.cmd.draw_fullscreen();
        }
        ctx.cmd.end_render_pass();
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        self.hdr.into_iter().collect()
    }
}
