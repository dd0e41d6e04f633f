use crate::cache::{LoadReport, StagingUploader, TextureCache, align_up};
use crate::error::{CapacityExceededErr, Result};
use crate::gpu::{Binding, BufferId, BufferUsage, GpuDevice};
use bytemuck::{Pod, Zeroable};
use cinder_asset::{AssetStore, HMaterial, HTexture, MaterialDesc};
use cinder_utils::RenderConfig;
use snafu::ensure;
use static_assertions::const_assert_eq;
use tracing::debug;

/// Storage buffer binding offsets must be aligned to this.
pub const STORAGE_OFFSET_ALIGNMENT: u64 = 256;

pub const MATERIAL_TRANSPARENT: u32 = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct MaterialSurface {
    pub roughness: f32,
    pub metallic: f32,
    pub transparent: f32,
    pub _pad: f32,
}

const_assert_eq!(size_of::<MaterialSurface>(), 16);

/// Texture array indices of one material: albedo, normal, metallic-roughness.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct MaterialTextures {
    pub albedo: u32,
    pub normal: u32,
    pub metallic_roughness: u32,
    pub _pad: u32,
}

const_assert_eq!(size_of::<MaterialTextures>(), 16);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SoaSection {
    pub offset: u64,
    pub size: u64,
}

/// Placement of the material arrays inside the single material buffer.
///
/// Each array is a separate binding, so every section starts at an aligned offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MaterialLayout {
    pub buffer: BufferId,
    pub count: u32,
    pub base_colors: SoaSection,
    pub surfaces: SoaSection,
    pub textures: SoaSection,
}

impl MaterialLayout {
    fn new(buffer: BufferId, count: u32) -> Self {
        let section = count as u64 * 16;
        let stride = align_up(section, STORAGE_OFFSET_ALIGNMENT);
        Self {
            buffer,
            count,
            base_colors: SoaSection {
                offset: 0,
                size: section,
            },
            surfaces: SoaSection {
                offset: stride,
                size: section,
            },
            textures: SoaSection {
                offset: stride * 2,
                size: section,
            },
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.textures.offset + self.textures.size
    }

    /// Binds the three arrays to consecutive slots starting at `first_slot`.
    pub fn bindings(&self, first_slot: u32) -> [Binding; 3] {
        let section = |slot: u32, s: SoaSection| Binding::read_range(slot, self.buffer, s.offset, s.size);
        [
            section(first_slot, self.base_colors),
            section(first_slot + 1, self.surfaces),
            section(first_slot + 2, self.textures),
        ]
    }
}

#[derive(Debug, Copy, Clone)]
struct MaterialEntry {
    transparent: bool,
}

/// Every material packed into one struct-of-arrays storage buffer, indexed by
/// the positional index of its handle.
#[derive(Debug, Default, Clone)]
pub struct MaterialCache {
    entries: Vec<MaterialEntry>,
    layout: Option<MaterialLayout>,
    /// Texture count the current buffer was packed against.
    texture_count: usize,
}

impl MaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the material buffer from every stored material. The buffer it
    /// replaces is reported as retired, since frames in flight may still read it.
    pub(crate) fn load(
        &mut self,
        store: &AssetStore,
        textures: &TextureCache,
        uploader: &mut StagingUploader,
        config: &RenderConfig,
    ) -> Result<LoadReport> {
        let materials = store.materials.snapshot();
        let requested = materials.len();
        ensure!(
            requested <= config.max_materials as usize,
            CapacityExceededErr {
                kind: "materials",
                limit: config.max_materials,
                requested
            }
        );
        let unchanged = materials.len() == self.entries.len() && textures.len() == self.texture_count;
        if materials.is_empty() || unchanged {
            return Ok(LoadReport::default());
        }

        let mut base_colors = Vec::with_capacity(materials.len());
        let mut surfaces = Vec::with_capacity(materials.len());
        let mut texture_ids = Vec::with_capacity(materials.len());
        let mut entries = Vec::with_capacity(materials.len());

        for (_, material) in &materials {
            let albedo = resolve_texture(store, material.albedo_texture.as_deref())?;
            let normal = resolve_texture(store, material.normal_texture.as_deref())?;
            let metallic_roughness =
                resolve_texture(store, material.metallic_roughness_texture.as_deref())?;

            let transparent = is_transparent(material, albedo, textures);
            base_colors.push(material.base_color.to_array());
            surfaces.push(MaterialSurface {
                roughness: material.roughness,
                metallic: material.metallic,
                transparent: if transparent { 1.0 } else { 0.0 },
                _pad: 0.0,
            });
            texture_ids.push(MaterialTextures {
                albedo: textures.index(albedo),
                normal: textures.index(normal),
                metallic_roughness: textures.index(metallic_roughness),
                _pad: 0,
            });
            entries.push(MaterialEntry { transparent });
        }

        let count = materials.len() as u32;
        // the buffer id is only known after creation, so lay out with a placeholder first
        let mut layout = MaterialLayout::new(BufferId::default(), count);
        let mut bytes = vec![0u8; layout.byte_size() as usize];
        write_section(&mut bytes, layout.base_colors, bytemuck::cast_slice(&base_colors));
        write_section(&mut bytes, layout.surfaces, bytemuck::cast_slice(&surfaces));
        write_section(&mut bytes, layout.textures, bytemuck::cast_slice(&texture_ids));

        layout.buffer = uploader.buffer("Materials", &bytes, BufferUsage::STORAGE)?;
        debug!("Packed {count} materials into {} bytes", bytes.len());

        let report = LoadReport {
            uploaded: materials.len() - self.entries.len(),
            degraded: Vec::new(),
            retired: self.layout.replace(layout).map(|l| l.buffer).into_iter().collect(),
        };
        self.entries = entries;
        self.texture_count = textures.len();
        Ok(report)
    }

    pub fn layout(&self) -> Option<&MaterialLayout> {
        self.layout.as_ref()
    }

    pub fn index(&self, handle: HMaterial) -> Option<u32> {
        (handle.index() < self.entries.len()).then_some(handle.id())
    }

    pub fn is_transparent(&self, handle: HMaterial) -> bool {
        self.entries
            .get(handle.index())
            .is_some_and(|e| e.transparent)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(layout) = self.layout.take() {
            device.destroy_buffer(layout.buffer)?;
        }
        self.entries.clear();
        Ok(())
    }
}

fn resolve_texture(store: &AssetStore, name: Option<&str>) -> Result<Option<HTexture>> {
    Ok(name.map(|n| store.textures.resolve(n)).transpose()?)
}

/// Translucent base color alpha or any translucent albedo texel.
fn is_transparent(material: &MaterialDesc, albedo: Option<HTexture>, textures: &TextureCache) -> bool {
    material.has_translucent_base_color() || albedo.is_some_and(|t| textures.is_translucent(t))
}

fn write_section(bytes: &mut [u8], section: SoaSection, data: &[u8]) {
    let start = section.offset as usize;
    bytes[start..start + data.len()].copy_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RenderError;
    use crate::gpu::HeadlessDevice;
    use cinder_asset::TextureData;
    use cinder_utils::math::Vec4;
    use std::time::Duration;

    fn load_all(store: &AssetStore, device: &HeadlessDevice) -> Result<(TextureCache, MaterialCache)> {
        let config = RenderConfig::default();
        let mut uploader = StagingUploader::new(device, Duration::from_secs(1));
        let mut textures = TextureCache::new();
        textures.load(&store.textures, &mut uploader, &config)?;
        let mut materials = MaterialCache::new();
        materials.load(store, &textures, &mut uploader, &config)?;
        uploader.finish()?;
        Ok((textures, materials))
    }

    #[test]
    fn packs_struct_of_arrays() {
        let device = HeadlessDevice::new();
        let store = AssetStore::default();
        store.textures.add(TextureData::solid("leaves", [0, 255, 0, 10]));
        let opaque = store.materials.add(
            MaterialDesc::builder()
                .name("stone")
                .base_color(Vec4::new(0.5, 0.5, 0.5, 1.0))
                .roughness(0.9)
                .build(),
        );
        let foliage = store.materials.add(
            MaterialDesc::builder()
                .name("foliage")
                .albedo_texture("leaves")
                .build(),
        );

        let (textures, materials) = load_all(&store, &device).unwrap();
        let layout = *materials.layout().unwrap();

        assert_eq!(materials.index(foliage), Some(1));
        assert!(!materials.is_transparent(opaque));
        assert!(materials.is_transparent(foliage));
        assert_eq!(layout.surfaces.offset % STORAGE_OFFSET_ALIGNMENT, 0);
        assert_eq!(layout.textures.offset % STORAGE_OFFSET_ALIGNMENT, 0);

        let bytes = device.read_buffer(layout.buffer).unwrap();
        let color: [f32; 4] = bytemuck::pod_read_unaligned(&bytes[..16]);
        assert_eq!(color, [0.5, 0.5, 0.5, 1.0]);

        let start = layout.textures.offset as usize;
        let ids: Vec<MaterialTextures> = bytes[start..start + 32]
            .chunks_exact(16)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(ids[0].albedo, textures.fallback_index());
        assert_eq!(ids[1].albedo, 0);
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn unknown_texture_is_fatal() {
        let device = HeadlessDevice::new();
        let store = AssetStore::default();
        store.materials.add(
            MaterialDesc::builder()
                .name("broken")
                .normal_texture("missing")
                .build(),
        );

        let err = load_all(&store, &device).err().unwrap();
        assert!(matches!(err, RenderError::Asset { .. }));
        assert_eq!(err.severity(), crate::Severity::Fatal);
    }
}
