use crate::error::Result;
use crate::gpu::*;
use cinder_asset::TextureData;
use cinder_utils::Extent2D;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Row pitch alignment of buffer to image copies.
pub const COPY_ROW_ALIGNMENT: u32 = 256;

/// One-shot upload of immutable data into device local memory.
///
/// Source data goes into host visible staging buffers, copies into the final
/// resources are recorded on a single command buffer, and [`finish`] submits
/// it and blocks on a dedicated fence before releasing the staging memory.
///
/// The resources the uploader creates belong to it until [`finish`] succeeded.
/// Dropping it earlier releases them together with the staging memory.
///
/// [`finish`]: StagingUploader::finish
pub struct StagingUploader<'a> {
    device: &'a dyn GpuDevice,
    timeout: Duration,
    cmd: CommandBuffer,
    staging: Vec<BufferId>,
    created: Vec<GpuResource>,
    fence: Option<FenceId>,
    /// Set while submitted copies may still be executing.
    in_flight: bool,
    bytes: u64,
}

impl<'a> StagingUploader<'a> {
    pub fn new(device: &'a dyn GpuDevice, timeout: Duration) -> Self {
        Self {
            device,
            timeout,
            cmd: CommandBuffer::new("Asset Upload"),
            staging: Vec::new(),
            created: Vec::new(),
            fence: None,
            in_flight: false,
            bytes: 0,
        }
    }

    fn stage(&mut self, label: &str, bytes: &[u8]) -> Result<BufferId> {
        let staging = self
            .device
            .create_buffer(&BufferDesc::staging(format!("{label} Staging"), bytes.len() as u64))?;
        self.staging.push(staging);
        self.device.write_buffer(staging, 0, bytes)?;
        self.bytes += bytes.len() as u64;
        Ok(staging)
    }

    /// Creates an empty device local buffer that the upload fills.
    pub fn allocate(&mut self, label: &str, size: u64, usage: BufferUsage) -> Result<BufferId> {
        let buffer = self.device.create_buffer(&BufferDesc::gpu_only(
            label,
            size,
            usage | BufferUsage::TRANSFER_DST,
        ))?;
        self.created.push(GpuResource::Buffer(buffer));
        Ok(buffer)
    }

    /// Creates a device local buffer of exactly `bytes.len()` bytes holding `bytes`.
    pub fn buffer(&mut self, label: &str, bytes: &[u8], usage: BufferUsage) -> Result<BufferId> {
        let buffer = self.allocate(label, bytes.len() as u64, usage)?;
        self.write(label, buffer, 0, bytes)?;
        Ok(buffer)
    }

    /// Copies `bytes` into `dst` at `offset`.
    pub fn write(&mut self, label: &str, dst: BufferId, offset: u64, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        let staging = self.stage(label, bytes)?;
        self.cmd.copy_buffer(staging, dst, offset, size);
        trace!("Staged {size} bytes for {label:?}");
        Ok(())
    }

    /// Copies the first `size` bytes of `src` to the start of `dst`. `src`
    /// needs [`BufferUsage::TRANSFER_SRC`].
    pub fn copy(&mut self, src: BufferId, dst: BufferId, size: u64) {
        self.cmd.copy_buffer(src, dst, 0, size);
    }

    /// Creates a sampled image holding `texture`. The image is in
    /// [`ImageLayout::ShaderReadOnly`] once the upload finished.
    pub fn image(&mut self, texture: &TextureData) -> Result<ImageId> {
        let row = texture.width * TextureData::BYTES_PER_PIXEL;
        let bytes_per_row = row.div_ceil(COPY_ROW_ALIGNMENT) * COPY_ROW_ALIGNMENT;

        let padded;
        let data = if bytes_per_row == row {
            texture.pixels.as_slice()
        } else {
            let mut rows = vec![0u8; bytes_per_row as usize * texture.height as usize];
            for (dst, src) in rows
                .chunks_exact_mut(bytes_per_row as usize)
                .zip(texture.pixels.chunks_exact(row as usize))
            {
                dst[..row as usize].copy_from_slice(src);
            }
            padded = rows;
            padded.as_slice()
        };

        let staging = self.stage(&texture.name, data)?;
        let extent = Extent2D::new(texture.width, texture.height);
        let image = self.device.create_image(&ImageDesc::sampled(
            texture.name.clone(),
            extent,
            ImageFormat::Rgba8Srgb,
        ))?;
        self.created.push(GpuResource::Image(image));

        self.cmd.barrier(Barrier::new().image(
            image,
            (PipelineStages::TOP_OF_PIPE, Access::empty(), ImageLayout::Undefined),
            (PipelineStages::TRANSFER, Access::TRANSFER_WRITE, ImageLayout::TransferDst),
        ));
        self.cmd.push(Command::CopyBufferToImage {
            src: staging,
            bytes_per_row,
            dst: image,
            extent,
        });
        self.cmd.barrier(Barrier::new().image(
            image,
            (PipelineStages::TRANSFER, Access::TRANSFER_WRITE, ImageLayout::TransferDst),
            (
                PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
                Access::SHADER_READ,
                ImageLayout::ShaderReadOnly,
            ),
        ));
        Ok(image)
    }

    /// Submits every recorded copy and blocks until the GPU finished them.
    /// Returns the number of bytes that went through staging memory.
    ///
    /// On success the created resources are handed over to the caller.
    pub fn finish(mut self) -> Result<u64> {
        let device = self.device;

        if !self.cmd.is_empty() {
            let fence = device.create_fence(false)?;
            self.fence = Some(fence);
            device.submit(Submission {
                label: "Asset Upload",
                command_buffer: &self.cmd,
                wait: &[],
                signal: &[],
                fence: Some(fence),
            })?;
            self.in_flight = true;

            let status = device.wait_fence(fence, self.timeout)?;
            if status == FenceStatus::Timeout {
                return Err(GpuError::FenceTimeout {
                    timeout: self.timeout,
                }
                .into());
            }
            self.in_flight = false;
        }

        if let Some(fence) = self.fence.take() {
            device.destroy_fence(fence)?;
        }
        for staging in self.staging.drain(..) {
            device.destroy_buffer(staging)?;
        }
        self.created.clear();

        debug!("Uploaded {} bytes through staging memory", self.bytes);
        Ok(self.bytes)
    }
}

impl Drop for StagingUploader<'_> {
    fn drop(&mut self) {
        if self.staging.is_empty() && self.created.is_empty() && self.fence.is_none() {
            return;
        }
        if self.in_flight {
            warn!(
                "Abandoned an asset upload that is still executing, leaking {} resources",
                self.staging.len() + self.created.len()
            );
            return;
        }

        let resources = self
            .staging
            .drain(..)
            .map(GpuResource::Buffer)
            .chain(self.created.drain(..));
        for resource in resources {
            if let Err(e) = resource.destroy(self.device) {
                warn!("Failed to release {resource:?} of an abandoned upload: {e}");
            }
        }
        if let Some(fence) = self.fence.take()
            && let Err(e) = self.device.destroy_fence(fence)
        {
            warn!("Failed to release the fence of an abandoned upload: {e}");
        }
        debug!("Released the resources of an abandoned upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn uploads_exact_sized_buffers() {
        let device = HeadlessDevice::new();
        let mut uploader = StagingUploader::new(&device, TIMEOUT);
        let data: Vec<u8> = (0..100).collect();
        let buffer = uploader
            .buffer("data", &data, BufferUsage::STORAGE)
            .unwrap();

        assert_eq!(uploader.finish().unwrap(), 100);
        assert_eq!(device.buffer_size(buffer).unwrap(), 100);
        assert_eq!(device.read_buffer(buffer).unwrap(), data);
        // only the destination survives
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.pending_submissions(), 0);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn images_end_up_shader_readable() {
        let device = HeadlessDevice::new();
        let mut uploader = StagingUploader::new(&device, TIMEOUT);
        let texture = TextureData::new("checker", 3, 2, vec![200; 24]);
        let image = uploader.image(&texture).unwrap();

        // three texels per row get padded to a full copy row
        assert_eq!(uploader.finish().unwrap(), COPY_ROW_ALIGNMENT as u64 * 2);
        assert_eq!(
            device.image_layout(image).unwrap(),
            ImageLayout::ShaderReadOnly
        );
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn dropped_upload_releases_everything() {
        let device = HeadlessDevice::new();
        let mut uploader = StagingUploader::new(&device, TIMEOUT);
        uploader
            .buffer("data", &[1; 64], BufferUsage::STORAGE)
            .unwrap();
        uploader
            .image(&TextureData::solid("white", [255; 4]))
            .unwrap();
        assert_eq!(device.live_buffers(), 3);
        assert_eq!(device.live_images(), 1);

        drop(uploader);

        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_images(), 0);
        assert_eq!(device.pending_submissions(), 0);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn grown_buffer_keeps_the_old_contents() {
        let device = HeadlessDevice::new();
        let mut uploader = StagingUploader::new(&device, TIMEOUT);
        let old = uploader
            .buffer("old", &[1; 8], BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC)
            .unwrap();
        uploader.finish().unwrap();

        let mut uploader = StagingUploader::new(&device, TIMEOUT);
        let grown = uploader.allocate("grown", 12, BufferUsage::STORAGE).unwrap();
        uploader.copy(old, grown, 8);
        uploader.write("tail", grown, 8, &[2; 4]).unwrap();
        uploader.finish().unwrap();

        let mut expected = vec![1; 8];
        expected.extend([2; 4]);
        assert_eq!(device.read_buffer(grown).unwrap(), expected);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn empty_upload_submits_nothing() {
        let device = HeadlessDevice::new();
        StagingUploader::new(&device, TIMEOUT).finish().unwrap();
        assert!(device.events().is_empty());
    }
}
