use crate::lighting::CascadeSet;
use crate::scene::Scene;
use bytemuck::{Pod, Zeroable};
use cinder_utils::math::{Mat4, Vec4};
use cinder_utils::{Extent2D, RenderConfig};
use static_assertions::const_assert_eq;

/// Per frame uniform data, laid out like `Frame` in `frame.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub inv_view_proj: Mat4,
    pub camera_position: Vec4,
    /// Direction the light travels, intensity in `w`.
    pub sun_direction: Vec4,
    pub sun_color: Vec4,
    pub cascade_splits: Vec4,
    /// Width, height and their reciprocals.
    pub screen: Vec4,
    /// Time, cascade count, shadow bias.
    pub params: Vec4,
}

const_assert_eq!(size_of::<FrameUniforms>(), 352);

impl FrameUniforms {
    pub fn new(
        scene: &Scene,
        cascades: &CascadeSet,
        extent: Extent2D,
        config: &RenderConfig,
        time: f32,
    ) -> Self {
        let camera = &scene.camera;
        let view = camera.view();
        let proj = camera.projection(extent.aspect());
        let view_proj = proj * view;
        let light = &scene.light;
        let (width, height) = (extent.width.max(1) as f32, extent.height.max(1) as f32);

        Self {
            view,
            proj,
            view_proj,
            inv_view_proj: view_proj.inverse(),
            camera_position: camera.position().extend(1.0),
            sun_direction: light.direction.extend(light.intensity),
            sun_color: light.color.extend(1.0),
            cascade_splits: Vec4::from_array(cascades.split_distances()),
            screen: Vec4::new(width, height, 1.0 / width, 1.0 / height),
            params: Vec4::new(time, cascades.len() as f32, config.shadow_bias, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::DirectionalLight;

    #[test]
    fn packs_screen_and_cascades() {
        let config = RenderConfig::default();
        let scene = Scene::new(&config);
        let cascades =
            CascadeSet::compute(&scene.camera, 2.0, &DirectionalLight::default(), &config);
        let uniforms =
            FrameUniforms::new(&scene, &cascades, Extent2D::new(800, 400), &config, 1.5);

        assert_eq!(uniforms.screen, Vec4::new(800.0, 400.0, 1.0 / 800.0, 1.0 / 400.0));
        assert_eq!(uniforms.params.x, 1.5);
        assert_eq!(uniforms.params.y, config.cascade_count as f32);
        assert_eq!(uniforms.cascade_splits.w, config.camera_far);
        assert_eq!(uniforms.sun_direction.w, scene.light.intensity);
    }
}
