//! The GPU abstraction the frame loop is written against.
//!
//! [`GpuDevice`] exposes explicit synchronization: fences the CPU waits on,
//! binary semaphores ordering queue operations, and pipeline barriers recorded
//! into [`CommandBuffer`]s. Two backends implement it: [`HeadlessDevice`], a
//! validating software device, and [`WgpuDevice`], which maps the contract onto wgpu.

mod command;
mod deletion;
mod diagnostics;
mod headless;
mod types;
mod wgpu_backend;

pub use command::*;
pub use deletion::{DeletionQueue, GpuResource};
pub use diagnostics::DiagnosticCheckpoints;
pub use headless::{DeviceEvent, HeadlessDevice, ValidationMessage};
pub use types::*;
pub use wgpu_backend::{WgpuDevice, WgpuDeviceError};

use snafu::Snafu;
use std::time::Duration;

pub type GpuResult<T, E = GpuError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)), visibility(pub))]
pub enum GpuError {
    #[snafu(display("The surface no longer matches the swapchain"))]
    SurfaceStale,
    #[snafu(display("The device ran out of memory while creating {what}"))]
    OutOfMemory { what: String },
    #[snafu(display("The device was lost"))]
    DeviceLost,
    #[snafu(display("{kind} handle is not alive"))]
    InvalidHandle { kind: &'static str },
    #[snafu(display("Fence did not signal within {timeout:?}"))]
    FenceTimeout { timeout: Duration },
    #[snafu(display("Validation failed: {message}"))]
    ValidationFailed { message: String },
    #[snafu(display("{feature} is not supported by this device"))]
    Unsupported { feature: &'static str },
    #[snafu(display("Backend error: {message}"))]
    Backend { message: String },
}

impl GpuError {
    /// Swapchain out-of-date and surface-lost conditions recover by resizing.
    pub fn is_surface_stale(&self) -> bool {
        matches!(self, GpuError::SurfaceStale)
    }
}

pub trait GpuDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId>;
    /// Writes into a host visible buffer. The buffer must not be referenced by
    /// GPU work that has not been observed complete.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()>;
    fn buffer_size(&self, buffer: BufferId) -> GpuResult<u64>;
    fn destroy_buffer(&self, buffer: BufferId) -> GpuResult<()>;

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageId>;
    fn image_desc(&self, image: ImageId) -> GpuResult<ImageDesc>;
    fn destroy_image(&self, image: ImageId) -> GpuResult<()>;

    fn create_pipeline(&self, desc: &PipelineDesc) -> GpuResult<PipelineId>;
    fn destroy_pipeline(&self, pipeline: PipelineId) -> GpuResult<()>;

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId>;
    /// Blocks until the fence signals or `timeout` elapses.
    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> GpuResult<FenceStatus>;
    fn reset_fence(&self, fence: FenceId) -> GpuResult<()>;
    fn destroy_fence(&self, fence: FenceId) -> GpuResult<()>;

    fn create_semaphore(&self) -> GpuResult<SemaphoreId>;
    fn destroy_semaphore(&self, semaphore: SemaphoreId) -> GpuResult<()>;

    fn submit(&self, submission: Submission<'_>) -> GpuResult<()>;

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<SwapchainId>,
    ) -> GpuResult<SwapchainInfo>;
    /// Requests the next presentable image without blocking on the display.
    /// `signal` is signaled once the image may be written.
    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
    ) -> GpuResult<AcquiredImage>;
    fn present(
        &self,
        swapchain: SwapchainId,
        image_index: u32,
        wait: &[SemaphoreId],
    ) -> GpuResult<PresentStatus>;
    fn destroy_swapchain(&self, swapchain: SwapchainId) -> GpuResult<()>;

    /// Blocks until every submitted piece of work has completed.
    fn wait_idle(&self) -> GpuResult<()>;
}
