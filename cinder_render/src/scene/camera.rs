use cinder_utils::RenderConfig;
use cinder_utils::math::{Affine3A, Mat4, Vec3};

/// A perspective camera. `transform` places the camera in the world, looking
/// down its local -Z axis.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Camera {
    pub transform: Affine3A,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            transform: Affine3A::IDENTITY,
            fov_y: config.camera_fov_y,
            near: config.camera_near,
            far: config.camera_far,
        }
    }

    /// Moves the camera to `eye` and turns it towards `target`.
    pub fn look_at(&mut self, eye: Vec3, target: Vec3) {
        let up = if (target - eye).normalize_or_zero().y.abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        self.transform = Affine3A::look_at_rh(eye, target, up).inverse();
    }

    pub fn position(&self) -> Vec3 {
        self.transform.translation.into()
    }

    pub fn forward(&self) -> Vec3 {
        self.transform.transform_vector3(Vec3::NEG_Z).normalize_or_zero()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::from(self.transform.inverse())
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::from_config(&RenderConfig::default())
    }
}

/// The sun. `direction` is the direction the light travels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or(Vec3::NEG_Y),
            color,
            intensity,
        }
    }
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self::new(Vec3::new(-0.4, -1.0, -0.3), Vec3::ONE, 3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_faces_the_target() {
        let mut camera = Camera::default();
        camera.look_at(Vec3::new(0.0, 2.0, 10.0), Vec3::new(0.0, 2.0, 0.0));

        assert!(camera.position().abs_diff_eq(Vec3::new(0.0, 2.0, 10.0), 1e-5));
        assert!(camera.forward().abs_diff_eq(Vec3::NEG_Z, 1e-5));

        let in_view = camera.view().transform_point3(Vec3::new(0.0, 2.0, 0.0));
        assert!(in_view.abs_diff_eq(Vec3::new(0.0, 0.0, -10.0), 1e-4));
    }

    #[test]
    fn light_direction_is_normalized() {
        let light = DirectionalLight::new(Vec3::new(0.0, -5.0, 0.0), Vec3::ONE, 1.0);
        assert_eq!(light.direction, Vec3::NEG_Y);

        let degenerate = DirectionalLight::new(Vec3::ZERO, Vec3::ONE, 1.0);
        assert_eq!(degenerate.direction, Vec3::NEG_Y);
    }
}
