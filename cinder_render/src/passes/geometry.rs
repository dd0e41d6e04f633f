use crate::error::Result;
use crate::gpu::*;
use crate::passes::{
    PassOutput, PassOutputs, PassSetup, RecordContext, RenderPass, destroy_image,
};
use smallvec::{SmallVec, smallvec};

const ALBEDO_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;
const NORMAL_FORMAT: ImageFormat = ImageFormat::Rgba16Float;
const MATERIAL_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;

/// Rasterizes every scene draw into the G-buffer with one multi-draw per batch.
#[derive(Debug, Default)]
pub struct GeometryPass {
    pipeline: Option<PipelineId>,
    albedo: Option<ImageId>,
    normal: Option<ImageId>,
    material: Option<ImageId>,
    depth: Option<ImageId>,
}

impl GeometryPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_attachments(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        let albedo = setup.attachment("GBuffer Albedo", ALBEDO_FORMAT)?;
        let normal = setup.attachment("GBuffer Normal", NORMAL_FORMAT)?;
        let material = setup.attachment("GBuffer Material", MATERIAL_FORMAT)?;
        let depth = setup.attachment("Depth", ImageFormat::Depth32Float)?;

        outputs.publish(PassOutput::GBufferAlbedo, albedo);
        outputs.publish(PassOutput::GBufferNormal, normal);
        outputs.publish(PassOutput::GBufferMaterial, material);
        outputs.publish(PassOutput::Depth, depth);

        self.albedo = Some(albedo);
        self.normal = Some(normal);
        self.material = Some(material);
        self.depth = Some(depth);
        Ok(())
    }

    fn destroy_attachments(&mut self, device: &dyn GpuDevice) -> Result<()> {
        destroy_image(device, &mut self.albedo)?;
        destroy_image(device, &mut self.normal)?;
        destroy_image(device, &mut self.material)?;
        destroy_image(device, &mut self.depth)
    }
}

impl RenderPass for GeometryPass {
    fn name(&self) -> &'static str {
        "Geometry"
    }

    fn create(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        self.pipeline = Some(setup.device.create_pipeline(&PipelineDesc {
            label: "Geometry Pipeline".to_string(),
            shader: setup.shaders.get(ShaderKind::Geometry).clone(),
            kind: PipelineKind::Graphics {
                color_formats: smallvec![ALBEDO_FORMAT, NORMAL_FORMAT, MATERIAL_FORMAT],
                depth_format: Some(ImageFormat::Depth32Float),
                vertex_layout: VertexLayout::Mesh,
                depth_bias: 0.0,
                blend: false,
            },
        })?);
        self.create_attachments(setup, outputs)
    }

    fn resize(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        self.destroy_attachments(setup.device)?;
        self.create_attachments(setup, outputs)
    }

    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            device.destroy_pipeline(pipeline)?;
        }
        self.destroy_attachments(device)
    }

    #[profiling::function]
    fn record(&mut self, ctx: &mut RecordContext) -> Result<()> {
        let frame = ctx.frame;
        let albedo = frame.outputs.require(PassOutput::GBufferAlbedo)?;
        let normal = frame.outputs.require(PassOutput::GBufferNormal)?;
        let material = frame.outputs.require(PassOutput::GBufferMaterial)?;
        let depth = frame.outputs.require(PassOutput::Depth)?;
        let shader_read = (
            PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
            Access::SHADER_READ,
            ImageLayout::Undefined,
        );
        let color_write = (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            Access::COLOR_ATTACHMENT_WRITE,
            ImageLayout::ColorAttachment,
        );

        // the previous frame's lighting pass may still sample these
        ctx.cmd.barrier(
            Barrier::new()
                .image(albedo, shader_read, color_write)
                .image(normal, shader_read, color_write)
                .image(material, shader_read, color_write)
                .image(
                    depth,
                    shader_read,
                    (
                        PipelineStages::FRAGMENT_TESTS,
                        Access::DEPTH_STENCIL_WRITE,
                        ImageLayout::DepthAttachment,
                    ),
                ),
        );

        let clear = |image| ColorAttachment {
            image,
            load: LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
            store: true,
        };
        ctx.cmd.begin_render_pass(RenderPassBegin {
            label: frame.label("Geometry Pass"),
            extent: frame.extent,
            color: smallvec![clear(albedo), clear(normal), clear(material)],
            depth: Some(DepthAttachment {
                image: depth,
                layer: None,
                load: LoadOp::Clear(1.0),
                store: true,
            }),
        });

        let materials = frame.cache.materials.layout();
        if let (Some(pipeline), Some(materials)) = (self.pipeline, materials)
            && !frame.scene.is_empty()
        {
            ctx.cmd.bind_pipeline(pipeline);
            let mut bindings: SmallVec<[Binding; 8]> = smallvec![
                Binding::read(0, frame.frame_uniforms),
                Binding::read(1, frame.instances),
            ];
            bindings.extend(materials.bindings(2));
            bindings.push(Binding::images(5, frame.cache.textures.images()));
            bindings.push(Binding::sampler(6, SamplerKind::Linear));
            ctx.cmd.bind_resources(0, bindings);

            for batch in &frame.scene.batches {
                ctx.cmd.bind_vertex_buffer(0, batch.vertex_buffer, 0);
                ctx.cmd.bind_index_buffer(batch.index_buffer, 0);
                ctx.cmd
                    .draw_indexed_indirect(frame.indirect, batch.first_record, batch.count);
            }
        }

        ctx.cmd.end_render_pass();
        Ok(())
    }

    fn attachments(&self) -> SmallVec<[ImageId; 4]> {
        [self.albedo, self.normal, self.material, self.depth]
            .into_iter()
            .flatten()
            .collect()
    }
}
