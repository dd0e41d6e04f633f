//! GPU resident copies of the [`AssetStore`], uploaded once through staging memory.
//!
//! Uploaded resources are immutable and addressed by the positional index of
//! their asset handle, so frame recording reads them without locking. Loading
//! is incremental: assets added to the store since the previous
//! [`AssetCache::load_all`] are uploaded as a new batch.

mod animation;
mod material;
mod model;
mod staging;
mod texture;

pub use animation::{AnimationCache, GpuClip};
pub use material::{
    MATERIAL_TRANSPARENT, MaterialCache, MaterialLayout, MaterialSurface, MaterialTextures,
    STORAGE_OFFSET_ALIGNMENT, SoaSection,
};
pub use model::{BufferRegion, GeometryPool, GpuModel, MeshRegion, ModelCache, ModelSlot};
pub use staging::{COPY_ROW_ALIGNMENT, StagingUploader};
pub use texture::TextureCache;

use crate::error::{RenderError, Result};
use crate::gpu::{BufferId, GpuDevice};
use cinder_asset::AssetStore;
use cinder_utils::RenderConfig;
use tracing::{info, instrument};

pub const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Outcome of loading one batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub uploaded: usize,
    /// Assets that were skipped. Each error is [`crate::Severity::Degraded`].
    pub degraded: Vec<RenderError>,
    /// Resources replaced by this load that frames in flight may still read.
    pub retired: Vec<BufferId>,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.uploaded += other.uploaded;
        self.degraded.extend(other.degraded);
        self.retired.extend(other.retired);
    }
}

#[derive(Debug, Default, Clone)]
pub struct AssetCache {
    pub textures: TextureCache,
    pub materials: MaterialCache,
    pub models: ModelCache,
    pub animations: AnimationCache,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads everything added to `store` since the last call and blocks until
    /// the upload completed.
    ///
    /// The batch is loaded into a copy of the cache that replaces this one only
    /// once the upload finished. A failed load leaves the cache untouched, and
    /// the uploader releases whatever the batch created.
    #[instrument(skip_all)]
    #[profiling::function]
    pub fn load_all(
        &mut self,
        store: &AssetStore,
        device: &dyn GpuDevice,
        config: &RenderConfig,
    ) -> Result<LoadReport> {
        let mut uploader = StagingUploader::new(device, config.fence_timeout());
        let mut report = LoadReport::default();
        let mut next = self.clone();

        report.merge(next.textures.load(&store.textures, &mut uploader, config)?);
        report.merge(
            next.materials
                .load(store, &next.textures, &mut uploader, config)?,
        );
        report.merge(next.models.load(store, &next.materials, &mut uploader)?);
        report.merge(next.animations.load(&store.animations, &mut uploader)?);

        let bytes = uploader.finish()?;
        *self = next;
        info!(
            "Uploaded {} assets ({bytes} bytes), {} skipped",
            report.uploaded,
            report.degraded.len()
        );
        Ok(report)
    }

    /// Releases every cached resource. The device must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        self.models.destroy(device)?;
        self.animations.destroy(device)?;
        self.materials.destroy(device)?;
        self.textures.destroy(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Severity;
    use crate::gpu::HeadlessDevice;
    use cinder_asset::{
        AnimationClip, MaterialDesc, MeshData, ModelData, SkinWeights, TextureData, Vertex3D,
    };
    use cinder_utils::math::{Mat4, Vec2, Vec3};

    fn triangle_strip(quads: usize, material: &str) -> MeshData {
        let vertices: Vec<Vertex3D> = (0..quads * 2 + 2)
            .map(|i| Vertex3D::basic(Vec3::new(i as f32, (i % 2) as f32, 0.0), Vec2::ZERO, Vec3::Z))
            .collect();
        let indices = (0..quads as u32 * 2)
            .flat_map(|i| [i, i + 1, i + 2])
            .collect();
        MeshData::new(vertices, indices, material)
    }

    fn store() -> AssetStore {
        let store = AssetStore::default();
        store.materials.add(MaterialDesc::builder().name("default").build());
        store
    }

    #[test]
    fn model_regions_have_exact_sizes() {
        let device = HeadlessDevice::new();
        let store = store();
        let quad = store.models.add(ModelData::unit_quad("quad", "default"));
        let strip = store.models.add(ModelData::new(
            "strip",
            vec![triangle_strip(3, "default"), triangle_strip(1, "default")],
        ));

        let mut cache = AssetCache::new();
        let report = cache
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap();
        assert_eq!(report.uploaded, 3);
        assert!(report.degraded.is_empty());

        let quad = cache.models.get(quad).unwrap();
        assert_eq!(quad.vertices.size, 4 * 48);
        assert_eq!(quad.indices.size, 6 * 4);
        assert_eq!(device.buffer_size(quad.vertices.buffer).unwrap(), 4 * 48 + 12 * 48);

        let strip = cache.models.get(strip).unwrap();
        assert_eq!(strip.vertices.size, (8 + 4) * 48);
        assert_eq!(strip.indices.size, (18 + 6) * 4);
        assert_eq!(strip.vertices.offset, 4 * 48);
        assert_eq!(strip.meshes[1].base_vertex, 4 + 8);
        assert_eq!(strip.meshes[1].first_index, 6 + 18);
        assert_eq!(strip.vertices.buffer, quad.vertices.buffer);

        let pool = cache.models.pool().unwrap();
        let bytes = device.read_buffer(pool.index).unwrap();
        let first: [u32; 6] = bytemuck::pod_read_unaligned(&bytes[..24]);
        assert_eq!(first, [0, 1, 2, 2, 3, 0]);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn invalid_models_are_degraded() {
        let device = HeadlessDevice::new();
        let store = store();
        let broken = store.models.add(ModelData::new("empty", vec![]));
        let fine = store.models.add(ModelData::unit_quad("quad", "default"));

        let mut cache = AssetCache::new();
        let report = cache
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap();

        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].severity(), Severity::Degraded);
        assert!(matches!(
            cache.models.slot(broken),
            Some(ModelSlot::Failed { .. })
        ));
        assert!(cache.models.get(fine).is_some());
    }

    #[test]
    fn unknown_material_is_fatal() {
        let device = HeadlessDevice::new();
        let store = store();
        store.models.add(ModelData::unit_quad("quad", "missing"));

        let err = AssetCache::new()
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn failed_load_commits_and_leaks_nothing() {
        let device = HeadlessDevice::new();
        let store = store();
        let config = RenderConfig::default();
        let quad = store.models.add(ModelData::unit_quad("quad", "default"));

        let mut cache = AssetCache::new();
        cache.load_all(&store, &device, &config).unwrap();
        let buffers = device.live_buffers();
        let images = device.live_images();
        let pool = *cache.models.pool().unwrap();

        store.textures.add(TextureData::solid("moss", [0, 128, 0, 255]));
        store.materials.add(MaterialDesc::builder().name("mossy").build());
        store.models.add(ModelData::unit_quad("wall", "missing"));
        let err = cache.load_all(&store, &device, &config).unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);

        // the staging memory and every resource of the failed batch are gone
        assert_eq!(device.live_buffers(), buffers);
        assert_eq!(device.live_images(), images);
        assert_eq!(device.pending_submissions(), 0);

        assert_eq!(cache.textures.len(), 0);
        assert_eq!(cache.materials.len(), 1);
        assert_eq!(cache.models.len(), 1);
        assert_eq!(*cache.models.pool().unwrap(), pool);
        assert_eq!(cache.models.get(quad).unwrap().vertices.buffer, pool.vertex);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn later_batches_append_to_the_shared_pool() {
        let device = HeadlessDevice::new();
        let store = store();
        let config = RenderConfig::default();
        let quad = store.models.add(ModelData::unit_quad("quad", "default"));

        let mut cache = AssetCache::new();
        cache.load_all(&store, &device, &config).unwrap();
        let first = *cache.models.pool().unwrap();

        let strip = store
            .models
            .add(ModelData::new("strip", vec![triangle_strip(3, "default")]));
        let report = cache.load_all(&store, &device, &config).unwrap();
        let pool = *cache.models.pool().unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.retired, vec![first.vertex, first.index]);
        assert_eq!(pool.vertex_count, 4 + 8);
        assert_eq!(pool.index_count, 6 + 18);
        assert_eq!(device.buffer_size(pool.vertex).unwrap(), 12 * 48);

        let quad = cache.models.get(quad).unwrap();
        let strip = cache.models.get(strip).unwrap();
        assert_eq!(quad.vertices.buffer, pool.vertex);
        assert_eq!(strip.indices.buffer, pool.index);
        assert_eq!(strip.meshes[0].base_vertex, 4);
        assert_eq!(strip.meshes[0].first_index, 6);
        assert_eq!(strip.vertices.offset, 4 * 48);

        // the first batch was carried over into the grown buffers
        let bytes = device.read_buffer(pool.index).unwrap();
        let carried: [u32; 6] = bytemuck::pod_read_unaligned(&bytes[..24]);
        assert_eq!(carried, [0, 1, 2, 2, 3, 0]);
        let appended: [u32; 3] = bytemuck::pod_read_unaligned(&bytes[24..36]);
        assert_eq!(appended, [0, 1, 2]);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn skinned_models_and_clips() {
        let device = HeadlessDevice::new();
        let store = store();
        let mut mesh = triangle_strip(1, "default");
        mesh.skin = Some(vec![SkinWeights::single(1); mesh.vertices.len()]);
        let model = store.models.add(ModelData::new("arm", vec![mesh]));
        let clip = store.animations.add(AnimationClip::new(
            "swing",
            2,
            24.0,
            vec![vec![Mat4::IDENTITY; 2]; 3],
        ));

        let mut cache = AssetCache::new();
        cache
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap();

        let model = cache.models.get(model).unwrap();
        assert!(model.is_skinned());
        assert_eq!(model.skin.unwrap().size, 4 * 32);
        assert_eq!(model.meshes[0].skin_offset, Some(0));

        let clip_gpu = cache.animations.get(clip).unwrap();
        assert_eq!(clip_gpu.frames.len(), 3);
        assert_eq!(device.buffer_size(clip_gpu.frames[0]).unwrap(), 2 * 64);
        assert_eq!(
            cache.animations.frame_buffer(clip, 4),
            Some(clip_gpu.frames[1])
        );
    }

    #[test]
    fn second_batch_retires_the_material_buffer() {
        let device = HeadlessDevice::new();
        let store = store();
        let config = RenderConfig::default();
        let mut cache = AssetCache::new();
        cache.load_all(&store, &device, &config).unwrap();
        let first = cache.materials.layout().unwrap().buffer;

        store.materials.add(MaterialDesc::builder().name("second").build());
        let report = cache.load_all(&store, &device, &config).unwrap();

        assert_eq!(report.retired, vec![first]);
        assert_ne!(cache.materials.layout().unwrap().buffer, first);
        assert_eq!(cache.materials.len(), 2);
    }
}
