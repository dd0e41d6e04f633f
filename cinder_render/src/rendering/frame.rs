use crate::error::Result;
use crate::gpu::*;
use crate::lighting::ShadowUniform;
use crate::rendering::FrameUniforms;
use cinder_utils::{FRAMES_IN_FLIGHT, MAX_CASCADES};
use smallvec::SmallVec;
use tracing::trace;

/// Everything one frame in flight owns exclusively.
///
/// A slot is only re-recorded after its fence was observed signaled, so its
/// command buffer and host visible buffers are never touched while the GPU
/// still reads them.
pub struct FrameSlot {
    pub command_buffer: CommandBuffer,
    /// Created signaled so the first wait on a fresh slot returns immediately.
    pub fence: FenceId,
    pub image_available: SemaphoreId,
    pub render_finished: SemaphoreId,
    pub uniforms: BufferId,
    pub shadow_uniforms: BufferId,
}

impl FrameSlot {
    fn new(device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self {
            command_buffer: CommandBuffer::new("Frame"),
            fence: device.create_fence(true)?,
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            uniforms: device.create_buffer(&BufferDesc::host_visible(
                "Frame Uniforms",
                size_of::<FrameUniforms>() as u64,
                BufferUsage::UNIFORM,
            ))?,
            shadow_uniforms: device.create_buffer(&BufferDesc::host_visible(
                "Cascade Uniforms",
                MAX_CASCADES as u64 * size_of::<ShadowUniform>() as u64,
                BufferUsage::UNIFORM,
            ))?,
        })
    }

    fn destroy(self, device: &dyn GpuDevice) -> Result<()> {
        device.destroy_fence(self.fence)?;
        device.destroy_semaphore(self.image_available)?;
        device.destroy_semaphore(self.render_finished)?;
        device.destroy_buffer(self.uniforms)?;
        device.destroy_buffer(self.shadow_uniforms)?;
        Ok(())
    }
}

/// The ring of [`FRAMES_IN_FLIGHT`] slots.
pub struct FrameSlots {
    slots: SmallVec<[FrameSlot; FRAMES_IN_FLIGHT]>,
    current: usize,
}

impl FrameSlots {
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(device))
            .collect::<Result<_>>()?;
        Ok(Self { slots, current: 0 })
    }

    pub fn index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    pub fn get(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Replaces every semaphore. A skipped frame can leave the acquire
    /// semaphore signaled with nothing waiting on it, fresh ones start clean.
    /// The device must be idle.
    pub fn recreate_semaphores(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for slot in &mut self.slots {
            device.destroy_semaphore(slot.image_available)?;
            device.destroy_semaphore(slot.render_finished)?;
            slot.image_available = device.create_semaphore()?;
            slot.render_finished = device.create_semaphore()?;
        }
        trace!("Recreated frame semaphores");
        Ok(())
    }

    /// The device must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for slot in self.slots.drain(..) {
            slot.destroy(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_rotate() {
        let device = HeadlessDevice::new();
        let mut slots = FrameSlots::new(&device).unwrap();
        let first = slots.current().fence;

        assert_eq!(slots.index(), 0);
        slots.advance();
        assert_eq!(slots.index(), 1);
        assert_ne!(slots.current().fence, first);
        slots.advance();
        assert_eq!(slots.index(), 0);

        assert_eq!(
            device
                .wait_fence(first, std::time::Duration::ZERO)
                .unwrap(),
            FenceStatus::Signaled
        );

        slots.destroy(&device).unwrap();
        assert_eq!(device.live_buffers(), 0);
    }
}
