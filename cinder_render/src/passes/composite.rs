use crate::error::Result;
use crate::gpu::*;
use crate::passes::{PassOutput, PassOutputs, PassSetup, PassStage, RecordContext, RenderPass};
use smallvec::{SmallVec, smallvec};

/// Copies the finished frame into the acquired swapchain image and hands the
/// image over to presentation.
#[derive(Debug, Default)]
pub struct CompositePass {
    pipeline: Option<PipelineId>,
}

impl CompositePass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderPass for CompositePass {
    fn name(&self) -> &'static str {
        "Composite"
    }

    fn stage(&self) -> PassStage {
        PassStage::Present
    }

    fn create(&mut self, setup: &PassSetup, _outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "Composite Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Composite).clone(),
            kind: PipelineKind::Graphics {
                color_formats: smallvec![setup.surface_format],
                depth_format: None,
                vertex_layout: VertexLayout::None,
                depth_bias: 0.0,
                blend: false,
            },
        })?);
        Ok(())
    }

    /// Renders into whatever swapchain image it is given, nothing to rebuild.
    fn resize(&mut self, _setup: &PassSetup, _outputs: &mut PassOutputs) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        let source = frame.outputs.require(PassOutput::PostColor)?;
        let target = frame
            .target
            .ok_or(GpuError::InvalidHandle { kind: "Swapchain Image" })?;

        let color_write = (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            Access::COLOR_ATTACHMENT_WRITE,
            ImageLayout::ColorAttachment,
        );
        ctx.cmd.barrier(
            Barrier::new()
                .image(
                    source,
                    color_write,
                    (
                        PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
                        Access::SHADER_READ,
                        ImageLayout::ShaderReadOnly,
                    ),
                )
                // the acquire semaphore wait orders this against presentation
                .image(
                    target,
                    (
                        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                        Access::empty(),
                        ImageLayout::Undefined,
                    ),
                    color_write,
                ),
        );

        ctx.cmd.begin_render_pass(RenderPassBegin {
            label: frame.label("Composite Pass"),
            extent: frame.extent,
            color: clear_color(target),
            depth: None,
        });
        if let Some(pipeline) = self.pipeline {
            ctx.cmd.bind_pipeline(pipeline);
            ctx.cmd.bind_resources(
                0,
                [
                    Binding::image(0, source),
                    Binding::sampler(1, SamplerKind::Linear),
                ],
            );
            ctx.cmd.draw_fullscreen();
        }
        ctx.cmd.end_render_pass();

        ctx.cmd.barrier(Barrier::new().image(
            target,
            color_write,
            (
                PipelineStages::BOTTOM_OF_PIPE,
                Access::empty(),
                ImageLayout::Present,
            ),
        ));
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        SmallVec::new()
    }
}
