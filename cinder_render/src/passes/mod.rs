//! The render passes of a frame and the arena that owns them.
//!
//! Passes are owned by a [`PassArena`] and addressed by [`PassId`]. A pass
//! never holds a reference back to the renderer: everything it needs while
//! recording arrives through a [`RecordContext`], and the images it produces
//! are published by name in [`PassOutputs`] for the passes after it.

mod animation;
mod composite;
mod geometry;
mod gui;
mod lighting;
mod post;
mod shadow;

pub use animation::{AnimationPass, SKINNING_WORKGROUP_SIZE, SkinParams};
pub use composite::CompositePass;
pub use geometry::GeometryPass;
pub use gui::{GuiDrawData, GuiPass, GuiVertex};
pub use lighting::LightingPass;
pub use post::PostPass;
pub use shadow::ShadowPass;

use crate::cache::AssetCache;
use crate::error::Result;
use crate::gpu::{
    BufferId, CommandBuffer, DeletionQueue, DiagnosticCheckpoints, GpuDevice, GpuError, ImageDesc,
    ImageFormat, ImageId,
};
use crate::lighting::CascadeSet;
use crate::scene::FrameSceneData;
use crate::shaders::ShaderLibrary;
use cinder_utils::{Extent2D, RenderConfig};
use smallvec::SmallVec;
use tracing::{debug, instrument};

/// Where in the frame a pass records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PassStage {
    /// Before the swapchain image is acquired.
    Offscreen,
    /// Into the acquired swapchain image.
    Present,
}

/// Images passed forward from the pass that writes them to the passes that read them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PassOutput {
    GBufferAlbedo,
    GBufferNormal,
    GBufferMaterial,
    Depth,
    ShadowMap,
    Hdr,
    PostColor,
}

impl PassOutput {
    pub const COUNT: usize = 7;

    pub const fn name(&self) -> &'static str {
        match self {
            PassOutput::GBufferAlbedo => "GBuffer Albedo",
            PassOutput::GBufferNormal => "GBuffer Normal",
            PassOutput::GBufferMaterial => "GBuffer Material",
            PassOutput::Depth => "Depth",
            PassOutput::ShadowMap => "Shadow Map",
            PassOutput::Hdr => "HDR Color",
            PassOutput::PostColor => "Post Color",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassOutputs {
    images: [Option<ImageId>; PassOutput::COUNT],
}

impl PassOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, output: PassOutput, image: ImageId) {
        self.images[output as usize] = Some(image);
    }

    pub fn get(&self, output: PassOutput) -> Option<ImageId> {
        self.images[output as usize]
    }

    /// The image behind `output`. A pass reading an output no earlier pass
    /// produced is a wiring error.
    pub fn require(&self, output: PassOutput) -> Result<ImageId> {
        self.get(output).ok_or_else(|| {
            GpuError::InvalidHandle {
                kind: output.name(),
            }
            .into()
        })
    }
}

/// What a pass needs to build its pipelines and attachments.
pub struct PassSetup<'a> {
    pub device: &'a dyn GpuDevice,
    pub config: &'a RenderConfig,
    pub shaders: &'a ShaderLibrary,
    pub extent: Extent2D,
    pub surface_format: ImageFormat,
}

impl PassSetup<'_> {
    /// Creates a screen sized attachment.
    pub fn attachment(&self, label: &str, format: ImageFormat) -> Result<ImageId> {
        Ok(self
            .device
            .create_image(&ImageDesc::attachment(label, self.extent, format))?)
    }
}

/// Read-only frame data shared by every pass of one frame.
pub struct FrameContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub config: &'a RenderConfig,
    pub cache: &'a AssetCache,
    pub diagnostics: DiagnosticCheckpoints,
    pub slot: usize,
    pub frame: u64,
    pub extent: Extent2D,
    pub outputs: &'a PassOutputs,
    pub scene: &'a FrameSceneData,
    pub instances: BufferId,
    pub indirect: BufferId,
    pub frame_uniforms: BufferId,
    pub shadow_uniforms: BufferId,
    pub cascades: &'a CascadeSet,
    pub gui: &'a GuiDrawData,
    /// The acquired swapchain image. Only set for [`PassStage::Present`].
    pub target: Option<ImageId>,
}

impl FrameContext<'_> {
    /// The debug label of a pass, or an empty label when labels are disabled.
    pub fn label(&self, name: &'static str) -> &'static str {
        if self.config.debug_labels { name } else { "" }
    }
}

pub struct RecordContext<'a, 'f> {
    pub frame: &'a FrameContext<'f>,
    pub cmd: &'a mut CommandBuffer,
    /// Frame-owned resources a pass replaced while recording.
    pub deletion: &'a mut DeletionQueue,
    /// Frame number the replaced resources are retired at.
    pub retire_frame: u64,
}

impl RecordContext<'_, '_> {
    pub fn checkpoint(&mut self, label: &'static str) {
        self.frame.diagnostics.insert(self.cmd, label);
    }
}

pub trait RenderPass: Send {
    fn name(&self) -> &'static str;

    fn stage(&self) -> PassStage {
        PassStage::Offscreen
    }

    /// Builds pipelines and attachments, then publishes the outputs.
    fn create(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()>;

    /// Rebuilds every attachment that depends on the surface extent. The
    /// device is idle when this runs.
    fn resize(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()>;

    /// Releases everything the pass created. The device is idle when this runs.
    fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()>;

    fn record(&mut self, ctx: &mut RecordContext) -> Result<()>;

    /// The images this pass renders into.
    fn attachments(&self) -> SmallVec<[ImageId; 4]>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PassId(usize);

impl PassId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Owns the passes in recording order.
#[derive(Default)]
pub struct PassArena {
    passes: Vec<Box<dyn RenderPass>>,
}

impl PassArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Geometry, shadow, lighting, post, GUI and composite, in that order.
    pub fn standard() -> Self {
        let mut arena = Self::new();
        arena.push(Box::new(GeometryPass::new()));
        arena.push(Box::new(ShadowPass::new()));
        arena.push(Box::new(LightingPass::new()));
        arena.push(Box::new(PostPass::new()));
        arena.push(Box::new(GuiPass::new()));
        arena.push(Box::new(CompositePass::new()));
        arena
    }

    pub fn push(&mut self, pass: Box<dyn RenderPass>) -> PassId {
        self.passes.push(pass);
        PassId(self.passes.len() - 1)
    }

    pub fn get(&self, id: PassId) -> Option<&dyn RenderPass> {
        self.passes.get(id.0).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, id: PassId) -> Option<&mut (dyn RenderPass + 'static)> {
        self.passes.get_mut(id.0).map(Box::as_mut)
    }

    pub fn find(&self, name: &str) -> Option<PassId> {
        self.passes.iter().position(|p| p.name() == name).map(PassId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PassId, &dyn RenderPass)> {
        self.passes
            .iter()
            .enumerate()
            .map(|(i, pass)| (PassId(i), pass.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    #[instrument(skip_all)]
    pub fn create_all(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        for pass in &mut self.passes {
            pass.create(setup, outputs)?;
            debug!("Created the {} pass", pass.name());
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn resize_all(&mut self, setup: &PassSetup, outputs: &mut PassOutputs) -> Result<()> {
        for pass in &mut self.passes {
            pass.resize(setup, outputs)?;
        }
        debug!("Resized pass attachments to {}", setup.extent);
        Ok(())
    }

    pub fn destroy_all(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for pass in &mut self.passes {
            pass.destroy(device)?;
        }
        Ok(())
    }

    /// Records every pass of `stage` in arena order.
    #[profiling::function]
    pub fn record(&mut self, stage: PassStage, ctx: &mut RecordContext) -> Result<()> {
        for pass in self.passes.iter_mut().filter(|p| p.stage() == stage) {
            profiling::scope!("record pass", pass.name());
            ctx.checkpoint(pass.name());
            pass.record(ctx)?;
        }
        Ok(())
    }

    /// Every attachment of every pass.
    pub fn attachments(&self) -> Vec<ImageId> {
        self.passes.iter().flat_map(|p| p.attachments()).collect()
    }
}

/// Releases `image` if it is set.
pub(crate) fn destroy_image(device: &dyn GpuDevice, image: &mut Option<ImageId>) -> Result<()> {
    if let Some(image) = image.take() {
        device.destroy_image(image)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn standard_arena_is_ordered() {
        let arena = PassArena::standard();
        let names: Vec<_> = arena.iter().map(|(_, p)| p.name()).collect();
        assert_eq!(
            names,
            ["Geometry", "Shadow", "Lighting", "Post", "GUI", "Composite"]
        );

        let composite = arena.find("Composite").unwrap();
        assert_eq!(composite.index(), 5);
        assert_eq!(arena.get(composite).unwrap().stage(), PassStage::Present);
        assert_eq!(
            arena.get(arena.find("Lighting").unwrap()).unwrap().stage(),
            PassStage::Offscreen
        );
    }

    #[test]
    fn outputs_are_published_by_creation() {
        let device = HeadlessDevice::new();
        let config = RenderConfig::default();
        let shaders = ShaderLibrary::builtin();
        let setup = PassSetup {
            device: &device,
            config: &config,
            shaders: &shaders,
            extent: Extent2D::new(320, 200),
            surface_format: ImageFormat::Bgra8Srgb,
        };

        let mut outputs = PassOutputs::new();
        assert!(outputs.require(PassOutput::Hdr).is_err());

        let mut arena = PassArena::standard();
        arena.create_all(&setup, &mut outputs).unwrap();
        for output in [
            PassOutput::GBufferAlbedo,
            PassOutput::GBufferNormal,
            PassOutput::GBufferMaterial,
            PassOutput::Depth,
            PassOutput::ShadowMap,
            PassOutput::Hdr,
            PassOutput::PostColor,
        ] {
            assert!(outputs.get(output).is_some(), "{output:?} missing");
        }

        arena.destroy_all(&device).unwrap();
        assert_eq!(device.live_images(), 0);
        assert!(device.validation_messages().is_empty());
    }
}
