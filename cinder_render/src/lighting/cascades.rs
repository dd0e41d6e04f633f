//! Cascaded shadow map fitting for the directional light.
//!
//! The camera's depth range is cut into `cascade_count` slices with the
//! practical split scheme. Each slice gets a tight orthographic light-space
//! projection, snapped to the shadow map texel grid so it does not shimmer
//! while the camera moves.

use crate::scene::{Camera, DirectionalLight};
use bytemuck::{Pod, Zeroable};
use cinder_utils::math::{Mat4, Vec3};
use cinder_utils::{BoundingBox, MAX_CASCADES, RenderConfig};
use smallvec::SmallVec;
use static_assertions::const_assert_eq;
use tracing::trace;

/// Light-space depth added in front of a slice so casters outside the view
/// still land in the shadow map.
const CASTER_EXTENSION: f32 = 50.0;

pub type CascadeVec<T> = SmallVec<[T; MAX_CASCADES as usize]>;

/// Far distance of every cascade. The first cascade starts at `near` and the
/// last one always ends exactly at `far`.
pub fn compute_cascade_splits(count: u32, near: f32, far: f32, lambda: f32) -> CascadeVec<f32> {
    let count = count.clamp(1, MAX_CASCADES);
    let mut splits: CascadeVec<f32> = (1..=count)
        .map(|i| {
            let p = i as f32 / count as f32;
            let log = near * (far / near).powf(p);
            let uniform = near + (far - near) * p;
            lambda * log + (1.0 - lambda) * uniform
        })
        .collect();

    if let Some(last) = splits.last_mut() {
        *last = far;
    }
    splits
}

/// World space corners of the camera frustum between two view depths.
/// The near face comes first, both faces wind counter-clockwise.
pub fn frustum_slice_corners(camera: &Camera, aspect: f32, near: f32, far: f32) -> [Vec3; 8] {
    let tan_half = (camera.fov_y * 0.5).tan();
    let face = |depth: f32| {
        let h = tan_half * depth;
        let w = h * aspect;
        [
            Vec3::new(-w, -h, -depth),
            Vec3::new(w, -h, -depth),
            Vec3::new(w, h, -depth),
            Vec3::new(-w, h, -depth),
        ]
    };

    let [a, b, c, d] = face(near);
    let [e, f, g, h] = face(far);
    [a, b, c, d, e, f, g, h].map(|corner| camera.transform.transform_point3(corner))
}

/// Orthographic light view-projection enclosing `corners`.
pub fn build_cascade_vp(light_direction: Vec3, corners: &[Vec3; 8], resolution: u32) -> Mat4 {
    let direction = light_direction.normalize_or(Vec3::NEG_Z);
    let center = corners.iter().copied().sum::<Vec3>() / 8.0;
    let up = if direction.y.abs() > 0.99 { Vec3::X } else { Vec3::Y };
    let light_view = Mat4::look_at_rh(center - direction, center, up);

    let mut bounds = BoundingBox::from_transformed_points(&light_view, corners);
    let depth = (bounds.max.z - bounds.min.z).max(1.0);
    bounds.max.z += depth.max(CASTER_EXTENSION);
    bounds.min.z -= depth.max(CASTER_EXTENSION);

    let texel = (bounds.max - bounds.min) / resolution.max(1) as f32;
    if texel.x > 0.0 {
        bounds.min.x = (bounds.min.x / texel.x).floor() * texel.x;
        bounds.max.x = (bounds.max.x / texel.x).ceil() * texel.x;
    }
    if texel.y > 0.0 {
        bounds.min.y = (bounds.min.y / texel.y).floor() * texel.y;
        bounds.max.y = (bounds.max.y / texel.y).ceil() * texel.y;
    }

    // looking down -Z, so the nearest point has the largest z
    let projection = Mat4::orthographic_rh(
        bounds.min.x,
        bounds.max.x,
        bounds.min.y,
        bounds.max.y,
        -bounds.max.z,
        -bounds.min.z,
    );
    projection * light_view
}

/// One cascade as the shadow and lighting shaders read it. Padded to the
/// uniform offset alignment so every cascade can be bound on its own.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ShadowUniform {
    pub view_proj: Mat4,
    /// Split near, split far, depth bias, array layer.
    pub params: [f32; 4],
    pub _pad: [[f32; 4]; 11],
}

const_assert_eq!(size_of::<ShadowUniform>(), 256);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeSet {
    /// View depth range of every cascade, ordered from the camera outwards.
    pub ranges: CascadeVec<(f32, f32)>,
    pub view_proj: CascadeVec<Mat4>,
}

impl CascadeSet {
    pub fn compute(
        camera: &Camera,
        aspect: f32,
        light: &DirectionalLight,
        config: &RenderConfig,
    ) -> Self {
        let splits = compute_cascade_splits(
            config.cascade_count,
            camera.near,
            camera.far,
            config.cascade_split_lambda,
        );

        let mut set = CascadeSet::default();
        let mut start = camera.near;
        for end in splits {
            let corners = frustum_slice_corners(camera, aspect, start, end);
            set.view_proj.push(build_cascade_vp(
                light.direction,
                &corners,
                config.shadow_map_resolution,
            ));
            set.ranges.push((start, end));
            start = end;
        }
        set
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The cascade covering a fragment at `view_depth`. Depths past the last
    /// split use the last cascade.
    pub fn select(&self, view_depth: f32) -> usize {
        self.ranges
            .iter()
            .position(|(_, far)| view_depth <= *far)
            .unwrap_or(self.len().saturating_sub(1))
    }

    /// Far distance of every cascade, padded with the last one.
    pub fn split_distances(&self) -> [f32; MAX_CASCADES as usize] {
        let last = self.ranges.last().map_or(0.0, |(_, far)| *far);
        std::array::from_fn(|i| self.ranges.get(i).map_or(last, |(_, far)| *far))
    }

    pub fn uniforms(&self, bias: f32) -> CascadeVec<ShadowUniform> {
        self.ranges
            .iter()
            .zip(&self.view_proj)
            .enumerate()
            .map(|(layer, ((near, far), view_proj))| ShadowUniform {
                view_proj: *view_proj,
                params: [*near, *far, bias, layer as f32],
                _pad: [[0.0; 4]; 11],
            })
            .collect()
    }
}

/// Inputs that invalidate the cascades when they change.
#[derive(Debug, Copy, Clone, PartialEq)]
struct CascadeKey {
    camera: Camera,
    aspect: f32,
    light: Vec3,
}

/// Keeps the cascades of the previous frame until the camera or the light moves.
#[derive(Debug, Default)]
pub struct CascadeTracker {
    key: Option<CascadeKey>,
    set: CascadeSet,
    recomputed: u64,
}

impl CascadeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the cascades had to be recomputed.
    pub fn update(
        &mut self,
        camera: &Camera,
        aspect: f32,
        light: &DirectionalLight,
        config: &RenderConfig,
    ) -> bool {
        let key = CascadeKey {
            camera: *camera,
            aspect,
            light: light.direction,
        };
        if self.key == Some(key) {
            return false;
        }

        self.set = CascadeSet::compute(camera, aspect, light, config);
        self.key = Some(key);
        self.recomputed += 1;
        trace!("Recomputed {} shadow cascades", self.set.len());
        true
    }

    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn cascades(&self) -> &CascadeSet {
        &self.set
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputed
    }
}
