use crate::cache::{LoadReport, StagingUploader};
use crate::error::{CapacityExceededErr, RenderError, Result};
use crate::gpu::{GpuDevice, ImageId};
use cinder_asset::{HTexture, Store, TextureData};
use cinder_utils::RenderConfig;
use snafu::ensure;
use std::sync::Arc;
use tracing::debug;

/// Uploaded textures, addressed by the positional index of their handle.
///
/// Textures that fail validation resolve to a 1x1 white fallback, which is
/// appended after the last texture in [`TextureCache::images`].
#[derive(Debug, Default, Clone)]
pub struct TextureCache {
    slots: Vec<TextureSlot>,
    fallback: Option<ImageId>,
    images: Arc<[ImageId]>,
}

#[derive(Debug, Copy, Clone)]
struct TextureSlot {
    image: Option<ImageId>,
    translucent: bool,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn load(
        &mut self,
        store: &Store<TextureData>,
        uploader: &mut StagingUploader,
        config: &RenderConfig,
    ) -> Result<LoadReport> {
        let requested = store.len();
        ensure!(
            requested <= config.max_textures as usize,
            CapacityExceededErr {
                kind: "textures",
                limit: config.max_textures,
                requested
            }
        );
        ensure!(
            requested < config.max_descriptors as usize,
            CapacityExceededErr {
                kind: "texture descriptors",
                limit: config.max_descriptors,
                requested: requested + 1
            }
        );

        if self.fallback.is_none() {
            let white = TextureData::solid("Fallback Texture", [u8::MAX; 4]);
            self.fallback = Some(uploader.image(&white)?);
        }

        let mut report = LoadReport::default();
        for (handle, texture) in store.snapshot().into_iter().skip(self.slots.len()) {
            if let Err(e) = texture.validate() {
                report.degraded.push(RenderError::TextureLoad {
                    name: texture.name.clone(),
                    reason: e.to_string(),
                });
                self.slots.push(TextureSlot {
                    image: None,
                    translucent: false,
                });
                continue;
            }

            let image = uploader.image(&texture)?;
            debug!("Uploaded texture {:?} as {handle:?}", texture.name);
            self.slots.push(TextureSlot {
                image: Some(image),
                translucent: texture.has_translucent_texels(),
            });
            report.uploaded += 1;
        }

        self.rebuild_images();
        Ok(report)
    }

    fn rebuild_images(&mut self) {
        let Some(fallback) = self.fallback else {
            return;
        };
        self.images = self
            .slots
            .iter()
            .map(|slot| slot.image.unwrap_or(fallback))
            .chain(std::iter::once(fallback))
            .collect();
    }

    /// Index into [`TextureCache::images`]. Missing and failed textures map to the fallback.
    pub fn index(&self, handle: Option<HTexture>) -> u32 {
        match handle {
            Some(h) if self.is_loaded(h) => h.id(),
            _ => self.fallback_index(),
        }
    }

    pub fn fallback_index(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_translucent(&self, handle: HTexture) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.translucent)
    }

    pub fn is_loaded(&self, handle: HTexture) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.image.is_some())
    }

    /// Every texture followed by the fallback, the image array the geometry pass binds.
    pub fn images(&self) -> Arc<[ImageId]> {
        self.images.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for image in self.slots.drain(..).filter_map(|slot| slot.image) {
            device.destroy_image(image)?;
        }
        if let Some(fallback) = self.fallback.take() {
            device.destroy_image(fallback)?;
        }
        self.images = Arc::from([]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use std::time::Duration;

    fn load(store: &Store<TextureData>, device: &HeadlessDevice, cache: &mut TextureCache) -> Result<LoadReport> {
        let mut uploader = StagingUploader::new(device, Duration::from_secs(1));
        let report = cache.load(store, &mut uploader, &RenderConfig::default())?;
        uploader.finish()?;
        Ok(report)
    }

    #[test]
    fn broken_textures_use_the_fallback() {
        let device = HeadlessDevice::new();
        let store = Store::empty();
        let good = store.add(TextureData::new("good", 1, 1, vec![255, 255, 255, 100]));
        let broken = store.add(TextureData::new("broken", 2, 2, vec![0; 3]));

        let mut cache = TextureCache::new();
        let report = load(&store, &device, &mut cache).unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(cache.index(Some(good)), 0);
        assert_eq!(cache.index(Some(broken)), cache.fallback_index());
        assert_eq!(cache.index(None), 2);
        assert!(cache.is_translucent(good));
        assert_eq!(cache.images().len(), 3);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn loads_incrementally() {
        let device = HeadlessDevice::new();
        let store = Store::empty();
        store.add(TextureData::solid("a", [1, 2, 3, 255]));

        let mut cache = TextureCache::new();
        load(&store, &device, &mut cache).unwrap();
        let b = store.add(TextureData::solid("b", [4, 5, 6, 255]));
        let report = load(&store, &device, &mut cache).unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(cache.index(Some(b)), 1);
        assert_eq!(cache.fallback_index(), 2);
        assert_eq!(device.live_images(), 3);
    }

    #[test]
    fn capacity_is_enforced() {
        let device = HeadlessDevice::new();
        let store = Store::empty();
        store.add(TextureData::solid("a", [0; 4]));
        store.add(TextureData::solid("b", [0; 4]));

        let config = RenderConfig::builder().max_textures(1).build();
        let mut uploader = StagingUploader::new(&device, Duration::from_secs(1));
        let err = TextureCache::new()
            .load(&store, &mut uploader, &config)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::CapacityExceeded {
                kind: "textures",
                limit: 1,
                requested: 2
            }
        ));
    }
}
