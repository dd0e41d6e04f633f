use crate::cache::{LoadReport, StagingUploader};
use crate::error::{RenderError, Result};
use crate::gpu::{BufferId, BufferUsage, GpuDevice};
use cinder_asset::{AnimationClip, HAnimation, Store};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct GpuClip {
    pub name: String,
    pub joint_count: usize,
    /// One joint matrix buffer per frame.
    pub frames: Vec<BufferId>,
}

/// Joint matrices of every animation frame, resident on the GPU.
#[derive(Debug, Default, Clone)]
pub struct AnimationCache {
    clips: Vec<Option<GpuClip>>,
}

impl AnimationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn load(
        &mut self,
        store: &Store<AnimationClip>,
        uploader: &mut StagingUploader,
    ) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for (handle, clip) in store.snapshot().into_iter().skip(self.clips.len()) {
            if let Err(e) = clip.validate() {
                report.degraded.push(RenderError::AnimationLoad {
                    name: clip.name.clone(),
                    reason: e.to_string(),
                });
                self.clips.push(None);
                continue;
            }

            // a clip without joints still needs a bindable buffer
            let frames = clip
                .frames
                .iter()
                .enumerate()
                .map(|(i, joints)| {
                    let label = format!("{} Frame {i}", clip.name);
                    if joints.is_empty() {
                        let identity = [cinder_utils::math::Mat4::IDENTITY];
                        uploader.buffer(&label, bytemuck::cast_slice(&identity), BufferUsage::STORAGE)
                    } else {
                        uploader.buffer(&label, bytemuck::cast_slice(joints), BufferUsage::STORAGE)
                    }
                })
                .collect::<Result<Vec<_>>>()?;

            trace!("Uploaded {} frames of {handle:?}", frames.len());
            self.clips.push(Some(GpuClip {
                name: clip.name.clone(),
                joint_count: clip.joint_count,
                frames,
            }));
            report.uploaded += 1;
        }

        Ok(report)
    }

    pub fn get(&self, handle: HAnimation) -> Option<&GpuClip> {
        self.clips.get(handle.index()).and_then(Option::as_ref)
    }

    /// The joint buffer of `frame`, wrapped into the clip's frame range.
    pub fn frame_buffer(&self, handle: HAnimation, frame: usize) -> Option<BufferId> {
        let clip = self.get(handle)?;
        clip.frames.get(frame % clip.frames.len()).copied()
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for clip in self.clips.drain(..).flatten() {
            for frame in clip.frames {
                device.destroy_buffer(frame)?;
            }
        }
        Ok(())
    }
}
