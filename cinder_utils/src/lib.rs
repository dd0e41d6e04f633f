//! Shared building blocks of the Cinder renderer: the immutable [`RenderConfig`],
//! surface extents, bounds math and logging helpers.

mod bounds;
mod config;
mod extent;
pub mod logging;

pub use bounds::BoundingBox;
pub use config::{ConfigError, FRAMES_IN_FLIGHT, MAX_CASCADES, RenderArgs, RenderConfig};
pub use extent::Extent2D;
pub use logging::init_tracing;

pub use glamx as math;
