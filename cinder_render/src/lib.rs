//! The Cinder renderer core.
//!
//! [`Renderer`] drives a fixed pipeline of passes (geometry, cascaded shadows,
//! lighting, post, GUI, composite) with two frames in flight over any
//! [`gpu::GpuDevice`]. Uploaded asset data lives in the [`cache`], per-frame
//! scene data is rebuilt in [`scene::SceneBuffers`], and skinned meshes are
//! posed by the animation compute pass before drawing.

pub mod audio;
pub mod cache;
pub mod error;
pub mod gpu;
pub mod lighting;
pub mod passes;
pub mod rendering;
pub mod scene;
pub mod shaders;

pub use error::{RenderError, Severity};
pub use rendering::{FrameInput, FrameOutcome, FrameStats, Renderer, RendererState};
pub use scene::{AnimationState, Camera, DirectionalLight, EntityId, Scene, SceneEntity};
