pub mod animation;
pub mod material;
pub mod mesh;
pub mod texture;

pub use animation::{AnimationClip, AnimationError};
pub use material::MaterialDesc;
pub use mesh::{MeshData, MeshError, ModelData, SkinWeights, Vertex3D};
pub use texture::{TextureData, TextureError};

use crate::store::H;

pub type HModel = H<ModelData>;
pub type HMaterial = H<MaterialDesc>;
pub type HTexture = H<TextureData>;
pub type HAnimation = H<AnimationClip>;
