use super::{BufferId, GpuDevice, GpuResult, ImageId, PipelineId};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpuResource {
    Buffer(BufferId),
    Image(ImageId),
    Pipeline(PipelineId),
}

impl GpuResource {
    pub(crate) fn destroy(self, device: &dyn GpuDevice) -> GpuResult<()> {
        match self {
            GpuResource::Buffer(buffer) => device.destroy_buffer(buffer),
            GpuResource::Image(image) => device.destroy_image(image),
            GpuResource::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
        }
    }
}

/// Resources that are no longer used by the CPU but may still be read by frames
/// in flight.
///
/// Every entry is keyed by the number of the last frame that could reference it.
/// It is released once that frame's fence has been observed signaled.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    pending: VecDeque<(u64, GpuResource)>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, frame: u64, resource: GpuResource) {
        debug_assert!(
            self.pending.back().is_none_or(|(last, _)| *last <= frame),
            "deletion queue entries must be pushed in frame order"
        );
        self.pending.push_back((frame, resource));
    }

    /// Releases everything whose frame is known to be complete.
    pub fn collect(&mut self, completed_frame: u64, device: &dyn GpuDevice) -> GpuResult<usize> {
        let mut released = 0;
        while let Some((frame, _)) = self.pending.front() {
            if *frame > completed_frame {
                break;
            }
            let Some((frame, resource)) = self.pending.pop_front() else {
                break;
            };
            trace!("Releasing {resource:?} deferred at frame {frame}");
            resource.destroy(device)?;
            released += 1;
        }
        Ok(released)
    }

    /// Releases everything. Only valid after the device went idle.
    pub fn flush(&mut self, device: &dyn GpuDevice) -> GpuResult<usize> {
        self.collect(u64::MAX, device)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferDesc, BufferUsage, HeadlessDevice};

    #[test]
    fn releases_only_completed_frames() {
        let device = HeadlessDevice::new();
        let desc = BufferDesc::gpu_only("deferred", 64, BufferUsage::STORAGE);
        let a = device.create_buffer(&desc).unwrap();
        let b = device.create_buffer(&desc).unwrap();

        let mut queue = DeletionQueue::new();
        queue.defer(3, GpuResource::Buffer(a));
        queue.defer(5, GpuResource::Buffer(b));

        assert_eq!(queue.collect(2, &device).unwrap(), 0);
        assert_eq!(queue.collect(4, &device).unwrap(), 1);
        assert!(device.buffer_size(a).is_err());
        assert!(device.buffer_size(b).is_ok());

        assert_eq!(queue.flush(&device).unwrap(), 1);
        assert!(queue.is_empty());
        assert!(device.validation_messages().is_empty());
    }
}
