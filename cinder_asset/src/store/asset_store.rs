//! The [`AssetStore`] holds the "raw" data the importer produced: meshes, textures,
//! materials and animation clips.
//!
//! It exists to cleanly separate plain-old-data from GPU state. The GPU side
//! `AssetCache` uploads everything in here once and is read-only afterwards.

use crate::assets::*;
use crate::store::{AssetError, H, Store, StoreType};
use std::sync::Arc;

#[derive(Default)]
pub struct AssetStore {
    pub models: Store<ModelData>,
    pub materials: Store<MaterialDesc>,
    pub textures: Store<TextureData>,
    pub animations: Store<AnimationClip>,
}

impl AssetStore {
    pub fn new() -> Arc<AssetStore> {
        Arc::new(AssetStore::default())
    }

    pub fn resolve<T: StoreType>(&self, name: &str) -> Result<H<T>, AssetError>
    where
        Self: AsRef<Store<T>>,
    {
        AsRef::<Store<T>>::as_ref(self).resolve(name)
    }
}

impl AsRef<Store<ModelData>> for AssetStore {
    fn as_ref(&self) -> &Store<ModelData> {
        &self.models
    }
}

impl AsRef<Store<MaterialDesc>> for AssetStore {
    fn as_ref(&self) -> &Store<MaterialDesc> {
        &self.materials
    }
}

impl AsRef<Store<TextureData>> for AssetStore {
    fn as_ref(&self) -> &Store<TextureData> {
        &self.textures
    }
}

impl AsRef<Store<AnimationClip>> for AssetStore {
    fn as_ref(&self) -> &Store<AnimationClip> {
        &self.animations
    }
}
