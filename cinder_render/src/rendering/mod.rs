//! The frame loop.
//!
//! A [`Renderer`] keeps [`FRAMES_IN_FLIGHT`] frames in flight. Every frame
//! waits on its slot's fence, releases resources retired by frames that are
//! now known complete, rebuilds the scene buffers, runs the skinning dispatch,
//! records the offscreen passes, acquires a swapchain image, records the
//! composite into it and submits. A surface that stops matching the swapchain
//! moves the renderer into [`RendererState::Resizing`], and the next frame
//! with a nonzero surface rebuilds everything sized by it.

mod frame;
mod render_data;
mod swapchain;

pub use frame::{FrameSlot, FrameSlots};
pub use render_data::FrameUniforms;
pub use swapchain::{SURFACE_FORMAT, Swapchain};

use crate::audio::AudioListener;
use crate::cache::{AssetCache, LoadReport};
use crate::error::{ConfigErr, RenderError, Result, Severity};
use crate::gpu::*;
use crate::lighting::{CascadeSet, CascadeTracker};
use crate::passes::{
    AnimationPass, FrameContext, GuiDrawData, PassArena, PassOutputs, PassSetup, PassStage,
    RecordContext,
};
use crate::scene::{EntityId, Scene, SceneBuffers};
use crate::shaders::ShaderLibrary;
use cinder_asset::AssetStore;
use cinder_utils::{Extent2D, FRAMES_IN_FLIGHT, RenderConfig};
use snafu::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use web_time::Instant;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum RendererState {
    #[default]
    Steady,
    /// The swapchain and every surface sized attachment are rebuilt before the
    /// next frame is drawn.
    Resizing,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameOutcome {
    Rendered,
    /// The surface has no area. Nothing was recorded or submitted.
    Paused,
    /// The surface went stale mid frame. The frame was dropped and the
    /// renderer is resizing.
    SkippedStale,
}

/// What the windowing side hands to every frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameInput {
    pub surface_extent: Extent2D,
    pub gui: GuiDrawData,
}

impl FrameInput {
    pub fn new(surface_extent: Extent2D) -> Self {
        Self {
            surface_extent,
            gui: GuiDrawData::default(),
        }
    }

    pub fn with_gui(mut self, gui: GuiDrawData) -> Self {
        self.gui = gui;
        self
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct FrameStats {
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub frames_paused: u64,
    pub resizes: u64,
    /// Indirect draw records of the last rendered frame.
    pub last_draw_count: u32,
    pub animated_dispatches: u64,
    /// CPU time spent recording and submitting the last rendered frame.
    pub last_cpu_time: Duration,
}

fn check_capabilities(caps: &DeviceCapabilities, config: &RenderConfig) -> Result<()> {
    let missing = [
        (caps.multi_draw_indirect, "multi draw indirect"),
        (caps.indirect_first_instance, "indirect first instance"),
        (caps.compute, "compute shaders"),
        (caps.texture_binding_array, "texture binding arrays"),
        (
            caps.max_image_array_layers >= config.cascade_count,
            "one image array layer per shadow cascade",
        ),
    ]
    .into_iter()
    .find(|(supported, _)| !supported);

    if let Some((_, capability)) = missing {
        return Err(RenderError::MissingCapability { capability });
    }

    if config.shadow_map_resolution > caps.max_image_dimension {
        return Err(RenderError::CapacityExceeded {
            kind: "shadow map texels per side",
            limit: caps.max_image_dimension,
            requested: config.shadow_map_resolution as usize,
        });
    }
    Ok(())
}

pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    config: RenderConfig,
    shaders: ShaderLibrary,
    diagnostics: DiagnosticCheckpoints,
    state: RendererState,
    extent: Extent2D,
    swapchain: Swapchain,
    slots: FrameSlots,
    passes: PassArena,
    outputs: PassOutputs,
    animation: AnimationPass,
    scene_buffers: SceneBuffers,
    cache: AssetCache,
    cascades: CascadeTracker,
    deletion: DeletionQueue,
    frame_number: u64,
    start_time: Instant,
    stats: FrameStats,
    audio: Option<Box<dyn AudioListener>>,
    shut_down: bool,
}

impl Renderer {
    /// Creates every frame resource for a surface of `extent`. A surface
    /// without area starts out [`RendererState::Resizing`].
    #[instrument(skip_all)]
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: RenderConfig,
        extent: Extent2D,
        shaders: ShaderLibrary,
    ) -> Result<Self> {
        config.validate().context(ConfigErr)?;

        let caps = device.capabilities();
        check_capabilities(&caps, &config)?;
        let diagnostics = DiagnosticCheckpoints::resolve(config.diagnostic_checkpoints, &caps);
        info!("Rendering on {} ({:?})", caps.name, caps.vendor);

        let (extent, state) = if extent.is_zero_area() {
            (extent.clamped(), RendererState::Resizing)
        } else {
            (extent, RendererState::Steady)
        };

        let dev = device.as_ref();
        let swapchain = Swapchain::new(dev, &config, extent)?;
        let slots = FrameSlots::new(dev)?;

        let mut passes = PassArena::standard();
        let mut outputs = PassOutputs::new();
        passes.create_all(
            &PassSetup {
                device: dev,
                config: &config,
                shaders: &shaders,
                extent,
                surface_format: swapchain.format(),
            },
            &mut outputs,
        )?;

        let animation = AnimationPass::new(dev, &shaders)?;
        let scene_buffers = SceneBuffers::new(dev)?;

        Ok(Self {
            device,
            config,
            shaders,
            diagnostics,
            state,
            extent,
            swapchain,
            slots,
            passes,
            outputs,
            animation,
            scene_buffers,
            cache: AssetCache::new(),
            cascades: CascadeTracker::new(),
            deletion: DeletionQueue::new(),
            frame_number: 0,
            start_time: Instant::now(),
            stats: FrameStats::default(),
            audio: None,
            shut_down: false,
        })
    }

    /// Uploads everything added to `store` since the last load. Assets that
    /// fail to load are reported and left out of rendering.
    pub fn load_assets(&mut self, store: &AssetStore) -> Result<LoadReport> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }

        let report = self
            .cache
            .load_all(store, self.device.as_ref(), &self.config)?;
        for degraded in &report.degraded {
            warn!("{degraded}");
        }

        // the frame submitted last may still read what was replaced
        let retire = self.frame_number.saturating_sub(1);
        for buffer in &report.retired {
            self.deletion.defer(retire, GpuResource::Buffer(*buffer));
        }
        Ok(report)
    }

    /// Draws and presents one frame of `scene`.
    pub fn render(&mut self, scene: &Scene, input: &FrameInput) -> Result<FrameOutcome> {
        self.render_with(scene, input, &mut || {})
    }

    /// Draws a snapshot of `scene` while `update` advances the scene itself on
    /// another thread. The update is joined before the frame is submitted.
    pub fn render_overlapped<F>(
        &mut self,
        scene: &mut Scene,
        input: &FrameInput,
        update: F,
    ) -> Result<FrameOutcome>
    where
        F: FnOnce(&mut Scene) + Send,
    {
        let snapshot = scene.clone();
        std::thread::scope(|s| {
            let mut worker = Some(s.spawn(move || update(scene)));
            let mut join = || {
                if let Some(handle) = worker.take()
                    && let Err(panic) = handle.join()
                {
                    std::panic::resume_unwind(panic);
                }
            };

            let outcome = self.render_with(&snapshot, input, &mut join);
            join();
            outcome
        })
    }

    fn render_with(
        &mut self,
        scene: &Scene,
        input: &FrameInput,
        before_submit: &mut dyn FnMut(),
    ) -> Result<FrameOutcome> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }

        if input.surface_extent.is_zero_area() {
            self.stats.frames_paused += 1;
            return Ok(FrameOutcome::Paused);
        }

        if self.state == RendererState::Resizing || input.surface_extent != self.extent {
            self.recreate(input.surface_extent)?;
        }

        match self.draw_frame(scene, &input.gui, before_submit) {
            Ok(outcome) => Ok(outcome),
            Err(e) => match e.severity() {
                Severity::Recoverable => {
                    warn!("Dropping frame {}: {e}", self.frame_number);
                    self.state = RendererState::Resizing;
                    self.stats.frames_skipped += 1;
                    Ok(FrameOutcome::SkippedStale)
                }
                Severity::Degraded | Severity::Fatal => {
                    error!("Frame {} failed: {e}", self.frame_number);
                    Err(e)
                }
            },
        }
    }

    #[instrument(skip_all, fields(frame = self.frame_number))]
    #[profiling::function]
    fn draw_frame(
        &mut self,
        scene: &Scene,
        gui: &GuiDrawData,
        before_submit: &mut dyn FnMut(),
    ) -> Result<FrameOutcome> {
        let started = Instant::now();
        let device = self.device.as_ref();
        let timeout = self.config.fence_timeout();
        let slot = self.slots.index();
        let (fence, image_available, render_finished, frame_uniforms, shadow_uniforms) = {
            let current = self.slots.current();
            (
                current.fence,
                current.image_available,
                current.render_finished,
                current.uniforms,
                current.shadow_uniforms,
            )
        };

        if device.wait_fence(fence, timeout)? == FenceStatus::Timeout {
            return Err(RenderError::FenceTimeout { slot, timeout });
        }
        if let Some(completed) = self.frame_number.checked_sub(FRAMES_IN_FLIGHT as u64) {
            let released = self.deletion.collect(completed, device)?;
            if released > 0 {
                debug!("Released {released} retired resources");
            }
        }
        let retire_frame = self.frame_number.saturating_sub(1);

        self.animation.prepare(
            slot,
            scene,
            &self.cache,
            device,
            &mut self.deletion,
            retire_frame,
        )?;
        let animation = &self.animation;
        let data = self.scene_buffers.assemble(scene, &self.cache, |entity, mesh| {
            animation.skinned_buffer(slot, entity, mesh)
        });
        self.scene_buffers
            .upload(slot, &data, device, &mut self.deletion, retire_frame)?;
        let dispatches =
            self.animation
                .record_and_submit(slot, device, self.diagnostics, timeout)?;

        self.cascades
            .update(&scene.camera, self.extent.aspect(), &scene.light, &self.config);
        let cascades = self.cascades.cascades();
        let uniforms = FrameUniforms::new(
            scene,
            cascades,
            self.extent,
            &self.config,
            self.start_time.elapsed().as_secs_f32(),
        );
        device.write_buffer(frame_uniforms, 0, bytemuck::bytes_of(&uniforms))?;
        device.write_buffer(
            shadow_uniforms,
            0,
            bytemuck::cast_slice(&cascades.uniforms(self.config.shadow_bias)),
        )?;

        let frame = FrameContext {
            device,
            config: &self.config,
            cache: &self.cache,
            diagnostics: self.diagnostics,
            slot,
            frame: self.frame_number,
            extent: self.extent,
            outputs: &self.outputs,
            scene: &data,
            instances: self.scene_buffers.instances(slot),
            indirect: self.scene_buffers.indirect(slot),
            frame_uniforms,
            shadow_uniforms,
            cascades,
            gui,
            target: None,
        };

        let cmd = &mut self.slots.current_mut().command_buffer;
        cmd.reset();
        self.passes.record(
            PassStage::Offscreen,
            &mut RecordContext {
                frame: &frame,
                cmd,
                deletion: &mut self.deletion,
                retire_frame,
            },
        )?;

        let acquired = match self.swapchain.acquire(device, image_available) {
            Ok(acquired) => acquired,
            Err(e) if e.severity() == Severity::Recoverable => {
                debug!("Surface went stale before acquire, skipping the frame");
                self.state = RendererState::Resizing;
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::SkippedStale);
            }
            Err(e) => return Err(e),
        };

        let present = FrameContext {
            target: Some(acquired.image),
            ..frame
        };
        self.passes.record(
            PassStage::Present,
            &mut RecordContext {
                frame: &present,
                cmd: &mut self.slots.current_mut().command_buffer,
                deletion: &mut self.deletion,
                retire_frame,
            },
        )?;

        before_submit();

        device.reset_fence(fence)?;
        device.submit(Submission {
            label: "Frame",
            command_buffer: &self.slots.current().command_buffer,
            wait: &[SemaphoreWait {
                semaphore: image_available,
                stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            }],
            signal: &[render_finished],
            fence: Some(fence),
        })?;
        let presented = self
            .swapchain
            .present(device, acquired.index, render_finished);

        self.frame_number += 1;
        self.slots.advance();
        self.stats.frames_rendered += 1;
        self.stats.last_draw_count = data.draw_count();
        self.stats.animated_dispatches += dispatches as u64;
        self.stats.last_cpu_time = started.elapsed();
        if let Some(listener) = &mut self.audio {
            listener.set_listener(&scene.camera.transform);
        }

        match presented {
            Ok(PresentStatus::Optimal) if !acquired.suboptimal => {}
            Ok(_) => {
                debug!("Swapchain is suboptimal for the surface");
                self.state = RendererState::Resizing;
            }
            Err(e) if e.severity() == Severity::Recoverable => {
                debug!("Surface went stale during present");
                self.state = RendererState::Resizing;
            }
            Err(e) => return Err(e),
        }
        Ok(FrameOutcome::Rendered)
    }

    /// Rebuilds the swapchain and every surface sized attachment for `extent`.
    #[instrument(skip(self))]
    fn recreate(&mut self, extent: Extent2D) -> Result<()> {
        let device = self.device.as_ref();
        device.wait_idle()?;
        self.deletion.flush(device)?;

        self.swapchain.recreate(device, extent)?;
        self.passes.resize_all(
            &PassSetup {
                device,
                config: &self.config,
                shaders: &self.shaders,
                extent,
                surface_format: self.swapchain.format(),
            },
            &mut self.outputs,
        )?;
        self.slots.recreate_semaphores(device)?;

        self.extent = extent;
        self.cascades.invalidate();
        self.stats.resizes += 1;
        self.state = RendererState::Steady;
        info!("Resized the renderer to {extent}");
        Ok(())
    }

    /// Rebuilds the surface sized resources before the next frame.
    pub fn request_resize(&mut self) {
        self.state = RendererState::Resizing;
    }

    /// Waits for the device and releases every resource. Safe to call twice.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let device = self.device.as_ref();
        device.wait_idle()?;
        self.deletion.flush(device)?;
        self.passes.destroy_all(device)?;
        self.animation.destroy(device)?;
        self.scene_buffers.destroy(device)?;
        self.cache.destroy(device)?;
        self.slots.destroy(device)?;
        self.swapchain.destroy(device)?;
        info!("Renderer shut down after {} frames", self.frame_number);
        Ok(())
    }

    pub fn set_audio_listener(&mut self, listener: impl AudioListener + 'static) {
        self.audio = Some(Box::new(listener));
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn swapchain_extent(&self) -> Extent2D {
        self.swapchain.extent()
    }

    /// Number of frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot the next frame records into.
    pub fn current_slot(&self) -> usize {
        self.slots.index()
    }

    pub fn slots(&self) -> &FrameSlots {
        &self.slots
    }

    pub fn diagnostics(&self) -> DiagnosticCheckpoints {
        self.diagnostics
    }

    pub fn passes(&self) -> &PassArena {
        &self.passes
    }

    pub fn outputs(&self) -> &PassOutputs {
        &self.outputs
    }

    /// Every surface sized and shadow attachment the passes render into.
    pub fn attachments(&self) -> Vec<ImageId> {
        self.passes.attachments()
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn scene_buffers(&self) -> &SceneBuffers {
        &self.scene_buffers
    }

    pub fn cascades(&self) -> &CascadeSet {
        self.cascades.cascades()
    }

    /// The posed vertices of an animated entity's mesh in `slot`.
    pub fn skinned_buffer(&self, slot: usize, entity: EntityId, mesh: usize) -> Option<BufferId> {
        self.animation.skinned_buffer(slot, entity, mesh)
    }

    /// Resources waiting for the frames that may still use them.
    pub fn pending_deletions(&self) -> usize {
        self.deletion.len()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to shut the renderer down: {e}");
        }
    }
}
