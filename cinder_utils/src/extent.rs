use glamx::UVec2;
use std::fmt::{Display, Formatter};

/// Size of a surface, swapchain or attachment in pixels.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const ZERO: Extent2D = Extent2D::new(0, 0);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a surface with no area.
    #[inline]
    pub const fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width over height. Zero area surfaces report 1.0.
    pub fn aspect(&self) -> f32 {
        if self.is_zero_area() {
            return 1.0;
        }
        self.width as f32 / self.height as f32
    }

    pub fn clamped(&self) -> Self {
        Self::new(self.width.max(1), self.height.max(1))
    }

    #[inline]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl From<UVec2> for Extent2D {
    fn from(value: UVec2) -> Self {
        Self::new(value.x, value.y)
    }
}

impl From<Extent2D> for UVec2 {
    fn from(value: Extent2D) -> Self {
        UVec2::new(value.width, value.height)
    }
}

impl Display for Extent2D {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
