use crate::error::Result;
use crate::gpu::*;
use cinder_utils::{Extent2D, RenderConfig};
use tracing::debug;

pub const SURFACE_FORMAT: ImageFormat = ImageFormat::Bgra8Srgb;

/// The presentable images of the surface.
pub struct Swapchain {
    info: SwapchainInfo,
    image_count: u32,
    vsync: bool,
}

impl Swapchain {
    pub fn new(device: &dyn GpuDevice, config: &RenderConfig, extent: Extent2D) -> Result<Self> {
        let image_count = config.requested_swapchain_images();
        let info = device.create_swapchain(
            &SwapchainDesc {
                extent,
                image_count,
                format: SURFACE_FORMAT,
                vsync: config.vsync,
            },
            None,
        )?;
        debug!("Created a {extent} swapchain with {} images", info.images.len());
        Ok(Self {
            info,
            image_count,
            vsync: config.vsync,
        })
    }

    /// Builds a swapchain for `extent` from the current one, then releases the
    /// old one. The device must be idle.
    pub fn recreate(&mut self, device: &dyn GpuDevice, extent: Extent2D) -> Result<()> {
        let info = device.create_swapchain(
            &SwapchainDesc {
                extent,
                image_count: self.image_count,
                format: SURFACE_FORMAT,
                vsync: self.vsync,
            },
            Some(self.info.id),
        )?;
        let old = std::mem::replace(&mut self.info, info);
        device.destroy_swapchain(old.id)?;
        debug!("Recreated the swapchain at {extent}");
        Ok(())
    }

    pub fn acquire(&self, device: &dyn GpuDevice, signal: SemaphoreId) -> Result<AcquiredImage> {
        Ok(device.acquire_next_image(self.info.id, signal)?)
    }

    pub fn present(
        &self,
        device: &dyn GpuDevice,
        index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentStatus> {
        Ok(device.present(self.info.id, index, &[wait])?)
    }

    pub fn extent(&self) -> Extent2D {
        self.info.extent
    }

    pub fn format(&self) -> ImageFormat {
        self.info.format
    }

    pub fn images(&self) -> &[ImageId] {
        &self.info.images
    }

    pub fn destroy(&self, device: &dyn GpuDevice) -> Result<()> {
        device.destroy_swapchain(self.info.id)?;
        Ok(())
    }
}
