//! Directional light shadows.

pub mod cascades;

pub use cascades::{
    CascadeSet, CascadeTracker, ShadowUniform, build_cascade_vp, compute_cascade_splits,
    frustum_slice_corners,
};
