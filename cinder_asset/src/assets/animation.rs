use crate::store::StoreType;
use glamx::Mat4;
use snafu::{Snafu, ensure};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum AnimationError {
    #[snafu(display("Animation {name:?} has no frames"))]
    NoFrames { name: String },
    #[snafu(display("Animation {name:?} frame {frame} has {actual} joints, expected {expected}"))]
    JointCount {
        name: String,
        frame: usize,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Animation {name:?} has a non-positive frame rate"))]
    FrameRate { name: String },
}

/// A named clip of pre-sampled poses. Every frame holds one matrix per joint.
#[derive(Debug, Clone)]
pub struct AnimationClip {
    pub name: String,
    pub joint_count: usize,
    pub fps: f32,
    pub frames: Vec<Vec<Mat4>>,
}

impl AnimationClip {
    pub fn new(
        name: impl Into<String>,
        joint_count: usize,
        fps: f32,
        frames: Vec<Vec<Mat4>>,
    ) -> Self {
        Self {
            name: name.into(),
            joint_count,
            fps,
            frames,
        }
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames.len() as f32 / self.fps
    }

    pub fn validate(&self) -> Result<(), AnimationError> {
        ensure!(!self.frames.is_empty(), NoFramesErr { name: &self.name });
        ensure!(
            self.fps.is_finite() && self.fps > 0.0,
            FrameRateErr { name: &self.name }
        );

        for (frame, joints) in self.frames.iter().enumerate() {
            ensure!(
                joints.len() == self.joint_count,
                JointCountErr {
                    name: &self.name,
                    frame,
                    expected: self.joint_count,
                    actual: joints.len()
                }
            );
        }
        Ok(())
    }
}

impl StoreType for AnimationClip {
    const KIND: &'static str = "Animation";

    fn name(&self) -> &str {
        &self.name
    }
}
