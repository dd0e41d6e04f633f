use cinder_asset::{AnimationClip, HAnimation};

/// Playback position of one entity's animation clip.
///
/// The update step advances it between frames. The renderer only reads
/// `frame`, which selects the joint matrices the skinning dispatch binds.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AnimationState {
    pub clip: HAnimation,
    pub frame: usize,
    pub started: bool,
    elapsed: f32,
}

impl AnimationState {
    /// A playing animation at its first frame.
    pub fn new(clip: HAnimation) -> Self {
        Self {
            clip,
            frame: 0,
            started: true,
            elapsed: 0.0,
        }
    }

    /// An animation that holds `frame` until it is started.
    pub fn paused(clip: HAnimation, frame: usize) -> Self {
        Self {
            clip,
            frame,
            started: false,
            elapsed: 0.0,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn stop(&mut self) {
        self.started = false;
    }

    /// Moves playback forward by `dt` seconds at the clip's frame rate,
    /// wrapping at the end of the clip.
    pub fn advance(&mut self, dt: f32, clip: &AnimationClip) {
        let frames = clip.frame_count();
        if !self.started || frames == 0 || clip.fps <= 0.0 {
            return;
        }

        let duration = clip.duration_secs();
        self.elapsed = (self.elapsed + dt.max(0.0)).rem_euclid(duration);
        self.frame = ((self.elapsed * clip.fps) as usize).min(frames - 1);
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_utils::math::Mat4;

    fn clip(frames: usize) -> AnimationClip {
        AnimationClip::new("walk", 1, 10.0, vec![vec![Mat4::IDENTITY]; frames])
    }

    #[test]
    fn advances_at_clip_rate_and_wraps() {
        let clip = clip(4);
        let mut state = AnimationState::new(HAnimation::new(0));

        state.advance(0.25, &clip);
        assert_eq!(state.frame, 2);

        state.advance(0.1, &clip);
        assert_eq!(state.frame, 3);

        // 0.45s into a 0.4s clip
        state.advance(0.1, &clip);
        assert_eq!(state.frame, 0);
        assert!(state.elapsed() < 0.4);
    }

    #[test]
    fn paused_state_holds_its_frame() {
        let clip = clip(4);
        let mut state = AnimationState::paused(HAnimation::new(0), 1);
        state.advance(1.0, &clip);
        assert_eq!(state.frame, 1);

        state.start();
        state.advance(0.05, &clip);
        assert_eq!(state.frame, 0);
    }
}
