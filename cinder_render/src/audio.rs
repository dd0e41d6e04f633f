//! Hook for keeping a spatial audio listener on the camera.

use cinder_utils::math::Affine3A;

/// Receives the camera transform of every rendered frame.
pub trait AudioListener: Send {
    fn set_listener(&mut self, transform: &Affine3A);
}

impl<F> AudioListener for F
where
    F: FnMut(&Affine3A) + Send,
{
    fn set_listener(&mut self, transform: &Affine3A) {
        self(transform)
    }
}
