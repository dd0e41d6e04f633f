use glamx::{Mat4, Vec3};

/// AABB
#[derive(Debug, Copy, Clone)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    pub const fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.extend(*point);
        }
        bounds
    }

    /// Bounds of `points` after transforming each one by `matrix`.
    pub fn from_transformed_points<'a>(
        matrix: &Mat4,
        points: impl IntoIterator<Item = &'a Vec3>,
    ) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.extend(matrix.transform_point3(*point));
        }
        bounds
    }

    pub fn extend(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_box_grows_to_fit_points() {
        let points = [Vec3::new(-1.0, 2.0, 0.5), Vec3::new(3.0, -4.0, 1.0)];
        let bounds = BoundingBox::from_points(&points);

        assert!(!bounds.is_empty());
        assert_eq!(bounds.min, Vec3::new(-1.0, -4.0, 0.5));
        assert_eq!(bounds.max, Vec3::new(3.0, 2.0, 1.0));
        assert!(bounds.contains(Vec3::new(0.0, 0.0, 0.75)));
        assert!(BoundingBox::empty().is_empty());
    }
}
