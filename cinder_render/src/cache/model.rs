use crate::cache::{LoadReport, MaterialCache, StagingUploader};
use crate::error::{RenderError, Result};
use crate::gpu::{BufferId, BufferUsage, GpuDevice};
use cinder_asset::{AssetStore, HModel, ModelData, SkinWeights, Vertex3D};
use smallvec::SmallVec;
use tracing::{debug, instrument};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferRegion {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

/// One mesh of a model. Indices are local to the mesh and offsets are absolute
/// positions inside the geometry pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeshRegion {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: u32,
    pub vertex_count: u32,
    /// First skin weight of this mesh in the pool's skin buffer.
    pub skin_offset: Option<u32>,
    pub material: u32,
}

#[derive(Debug, Clone)]
pub struct GpuModel {
    pub name: String,
    pub vertices: BufferRegion,
    pub indices: BufferRegion,
    pub skin: Option<BufferRegion>,
    pub meshes: SmallVec<[MeshRegion; 2]>,
}

impl GpuModel {
    pub fn is_skinned(&self) -> bool {
        self.skin.is_some()
    }

    fn rebind(&mut self, pool: &GeometryPool) {
        self.vertices.buffer = pool.vertex;
        self.indices.buffer = pool.index;
        if let (Some(region), Some(buffer)) = (self.skin.as_mut(), pool.skin) {
            region.buffer = buffer;
        }
    }
}

/// The vertex, index and skin buffers shared by every loaded model.
///
/// A load that adds geometry replaces the buffers with larger ones holding the
/// old contents followed by the new models.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GeometryPool {
    pub vertex: BufferId,
    pub index: BufferId,
    pub skin: Option<BufferId>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub skin_count: u32,
}

#[derive(Debug, Clone)]
pub enum ModelSlot {
    Loaded(GpuModel),
    Failed { reason: String },
}

#[derive(Debug, Default, Clone)]
pub struct ModelCache {
    slots: Vec<ModelSlot>,
    pool: Option<GeometryPool>,
}

struct PendingModel {
    name: String,
    vertex_offset: u64,
    vertex_size: u64,
    index_offset: u64,
    index_size: u64,
    skin: Option<(u64, u64)>,
    meshes: SmallVec<[MeshRegion; 2]>,
}

/// Geometry of one load batch, appended after what the pool already holds.
#[derive(Default)]
struct Batch {
    base: (u32, u32, u32),
    vertices: Vec<Vertex3D>,
    indices: Vec<u32>,
    skin: Vec<SkinWeights>,
}

impl Batch {
    fn vertex_count(&self) -> u32 {
        self.base.0 + self.vertices.len() as u32
    }

    fn index_count(&self) -> u32 {
        self.base.1 + self.indices.len() as u32
    }

    fn skin_count(&self) -> u32 {
        self.base.2 + self.skin.len() as u32
    }
}

/// Replaces `old` with a buffer holding its contents followed by `bytes`, or
/// keeps it when there is nothing to append.
fn grow(
    uploader: &mut StagingUploader,
    label: &str,
    old: Option<(BufferId, u64)>,
    bytes: &[u8],
    usage: BufferUsage,
) -> Result<Option<BufferId>> {
    let usage = usage | BufferUsage::TRANSFER_SRC;
    Ok(match old {
        Some((buffer, _)) if bytes.is_empty() => Some(buffer),
        None if bytes.is_empty() => None,
        None => Some(uploader.buffer(label, bytes, usage)?),
        Some((buffer, size)) => {
            let grown = uploader.allocate(label, size + bytes.len() as u64, usage)?;
            uploader.copy(buffer, grown, size);
            uploader.write(label, grown, size, bytes)?;
            Some(grown)
        }
    })
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every model added since the last load to the geometry pool.
    ///
    /// Models that fail validation are kept as [`ModelSlot::Failed`]. A mesh
    /// naming an unknown material is a content mismatch and fails the load.
    /// Pool buffers that were replaced are reported as retired.
    #[instrument(skip_all)]
    pub(crate) fn load(
        &mut self,
        store: &AssetStore,
        materials: &MaterialCache,
        uploader: &mut StagingUploader,
    ) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut batch = Batch {
            base: self
                .pool
                .map(|p| (p.vertex_count, p.index_count, p.skin_count))
                .unwrap_or_default(),
            ..Batch::default()
        };
        let mut pending: Vec<Result<PendingModel, String>> = Vec::new();

        for (_, model) in store.models.snapshot().into_iter().skip(self.slots.len()) {
            if let Err(e) = model.validate() {
                report.degraded.push(RenderError::ModelLoad {
                    name: model.name.clone(),
                    reason: e.to_string(),
                });
                pending.push(Err(e.to_string()));
                continue;
            }
            pending.push(Ok(Self::append(&model, store, materials, &mut batch)?));
        }

        if pending.is_empty() {
            return Ok(report);
        }

        let pool = if batch.vertices.is_empty() {
            self.pool
        } else {
            Some(self.grow_pool(&batch, uploader, &mut report)?)
        };

        for entry in pending {
            let slot = match (entry, pool) {
                (Ok(model), Some(pool)) => {
                    report.uploaded += 1;
                    ModelSlot::Loaded(GpuModel {
                        name: model.name,
                        vertices: BufferRegion {
                            buffer: pool.vertex,
                            offset: model.vertex_offset,
                            size: model.vertex_size,
                        },
                        indices: BufferRegion {
                            buffer: pool.index,
                            offset: model.index_offset,
                            size: model.index_size,
                        },
                        skin: model.skin.zip(pool.skin).map(|((offset, size), buffer)| {
                            BufferRegion {
                                buffer,
                                offset,
                                size,
                            }
                        }),
                        meshes: model.meshes,
                    })
                }
                (Ok(_), None) => ModelSlot::Failed {
                    reason: "geometry pool missing".to_string(),
                },
                (Err(reason), _) => ModelSlot::Failed { reason },
            };
            self.slots.push(slot);
        }

        Ok(report)
    }

    fn grow_pool(
        &mut self,
        batch: &Batch,
        uploader: &mut StagingUploader,
        report: &mut LoadReport,
    ) -> Result<GeometryPool> {
        let old = self.pool;
        let region = |buffer: Option<BufferId>, count: u32, stride: u64| {
            buffer.map(|b| (b, count as u64 * stride))
        };

        let vertex = grow(
            uploader,
            "Geometry Vertices",
            old.and_then(|p| region(Some(p.vertex), p.vertex_count, Vertex3D::STRIDE)),
            bytemuck::cast_slice(&batch.vertices),
            BufferUsage::VERTEX | BufferUsage::STORAGE,
        )?;
        let index = grow(
            uploader,
            "Geometry Indices",
            old.and_then(|p| region(Some(p.index), p.index_count, size_of::<u32>() as u64)),
            bytemuck::cast_slice(&batch.indices),
            BufferUsage::INDEX,
        )?;
        let skin = grow(
            uploader,
            "Geometry Skin",
            old.and_then(|p| region(p.skin, p.skin_count, SkinWeights::STRIDE)),
            bytemuck::cast_slice(&batch.skin),
            BufferUsage::STORAGE,
        )?;

        let (Some(vertex), Some(index)) = (vertex, index) else {
            return Err(RenderError::ModelLoad {
                name: "Geometry Pool".to_string(),
                reason: "a batch with vertices has no indices".to_string(),
            });
        };
        let pool = GeometryPool {
            vertex,
            index,
            skin,
            vertex_count: batch.vertex_count(),
            index_count: batch.index_count(),
            skin_count: batch.skin_count(),
        };

        if let Some(old) = old {
            report.retired.extend(
                [
                    (old.vertex, pool.vertex),
                    (old.index, pool.index),
                ]
                .into_iter()
                .chain(old.skin.zip(pool.skin))
                .filter(|(before, after)| before != after)
                .map(|(before, _)| before),
            );
            for slot in &mut self.slots {
                if let ModelSlot::Loaded(model) = slot {
                    model.rebind(&pool);
                }
            }
        }

        debug!(
            "Geometry pool holds {} vertices and {} indices",
            pool.vertex_count, pool.index_count
        );
        self.pool = Some(pool);
        Ok(pool)
    }

    fn append(
        model: &ModelData,
        store: &AssetStore,
        materials: &MaterialCache,
        batch: &mut Batch,
    ) -> Result<PendingModel> {
        let vertex_start = batch.vertex_count();
        let index_start = batch.index_count();
        let skin_start = batch.skin_count();
        let mut meshes = SmallVec::new();

        for mesh in &model.meshes {
            let handle = store.materials.resolve(&mesh.material)?;
            let material = materials.index(handle).ok_or_else(|| {
                RenderError::from(cinder_asset::AssetError::InvalidHandle {
                    kind: "Material",
                    index: handle.id(),
                    len: materials.len(),
                })
            })?;

            meshes.push(MeshRegion {
                first_index: batch.index_count(),
                index_count: mesh.indices.len() as u32,
                base_vertex: batch.vertex_count(),
                vertex_count: mesh.vertices.len() as u32,
                skin_offset: mesh.skin.as_ref().map(|_| batch.skin_count()),
                material,
            });
            batch.vertices.extend_from_slice(&mesh.vertices);
            batch.indices.extend_from_slice(&mesh.indices);
            if let Some(weights) = &mesh.skin {
                batch.skin.extend_from_slice(weights);
            }
        }

        let skinned = batch.skin_count() > skin_start;
        Ok(PendingModel {
            name: model.name.clone(),
            vertex_offset: vertex_start as u64 * Vertex3D::STRIDE,
            vertex_size: (batch.vertex_count() - vertex_start) as u64 * Vertex3D::STRIDE,
            index_offset: index_start as u64 * size_of::<u32>() as u64,
            index_size: (batch.index_count() - index_start) as u64 * size_of::<u32>() as u64,
            skin: skinned.then(|| {
                (
                    skin_start as u64 * SkinWeights::STRIDE,
                    (batch.skin_count() - skin_start) as u64 * SkinWeights::STRIDE,
                )
            }),
            meshes,
        })
    }

    pub fn get(&self, handle: HModel) -> Option<&GpuModel> {
        match self.slots.get(handle.index()) {
            Some(ModelSlot::Loaded(model)) => Some(model),
            _ => None,
        }
    }

    pub fn slot(&self, handle: HModel) -> Option<&ModelSlot> {
        self.slots.get(handle.index())
    }

    /// The shared geometry pool, once a model was uploaded.
    pub fn pool(&self) -> Option<&GeometryPool> {
        self.pool.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            device.destroy_buffer(pool.vertex)?;
            device.destroy_buffer(pool.index)?;
            if let Some(skin) = pool.skin {
                device.destroy_buffer(skin)?;
            }
        }
        self.slots.clear();
        Ok(())
    }
}
