use crate::cache::{AssetCache, ModelSlot};
use crate::error::Result;
use crate::gpu::{
    BufferDesc, BufferId, BufferUsage, DRAW_INDEXED_INDIRECT_STRIDE, DeletionQueue, GpuDevice,
    GpuResource,
};
use crate::scene::{EntityId, Scene};
use bytemuck::{Pod, Zeroable};
use cinder_asset::{HMaterial, HModel};
use cinder_utils::FRAMES_IN_FLIGHT;
use cinder_utils::math::Mat4;
use itertools::Itertools;
use more_asserts::debug_assert_le;
use smallvec::SmallVec;
use static_assertions::const_assert_eq;
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

pub const INSTANCE_ANIMATED: u32 = 1 << 0;
pub const INSTANCE_TRANSPARENT: u32 = 1 << 1;

const INITIAL_CAPACITY: usize = 64;

/// One indexed indirect draw, laid out the way the GPU consumes it.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirect {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

const_assert_eq!(size_of::<DrawIndexedIndirect>() as u64, DRAW_INDEXED_INDIRECT_STRIDE);

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: Mat4,
    pub material: u32,
    pub flags: u32,
    pub _pad: [u32; 2],
}

const_assert_eq!(size_of::<InstanceData>(), 80);

/// A run of records drawing from the same vertex and index buffers, issued as
/// one multi-draw.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrawBatch {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub first_record: u32,
    pub count: u32,
}

/// Everything one frame draws, rebuilt from the entity list every frame.
///
/// `records[i]` draws `instances[i]`. Records are ordered by batch.
#[derive(Debug, Default, Clone)]
pub struct FrameSceneData {
    pub records: Vec<DrawIndexedIndirect>,
    pub instances: Vec<InstanceData>,
    pub batches: SmallVec<[DrawBatch; 4]>,
    /// Visible entities that contributed at least one record.
    pub entities: usize,
    /// Visible entities left out because their model is not loaded.
    pub skipped: usize,
}

impl FrameSceneData {
    pub fn draw_count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct SlotBuffers {
    indirect: BufferId,
    instances: BufferId,
    capacity: usize,
}

impl SlotBuffers {
    fn new(device: &dyn GpuDevice, capacity: usize) -> Result<Self> {
        let indirect = device.create_buffer(&BufferDesc::host_visible(
            "Indirect Draws",
            capacity as u64 * DRAW_INDEXED_INDIRECT_STRIDE,
            BufferUsage::INDIRECT,
        ))?;
        let instances = device.create_buffer(&BufferDesc::host_visible(
            "Instances",
            (capacity * size_of::<InstanceData>()) as u64,
            BufferUsage::STORAGE,
        ))?;
        Ok(Self {
            indirect,
            instances,
            capacity,
        })
    }
}

/// The per-slot instance and indirect draw arrays.
///
/// Each frame slot owns its own pair of host visible buffers, so a frame only
/// writes memory that no in-flight frame reads.
pub struct SceneBuffers {
    slots: SmallVec<[SlotBuffers; FRAMES_IN_FLIGHT]>,
    warned: HashSet<HModel>,
}

struct PendingDraw {
    buffers: (BufferId, BufferId),
    record: DrawIndexedIndirect,
    instance: InstanceData,
}

impl SceneBuffers {
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| SlotBuffers::new(device, INITIAL_CAPACITY))
            .collect::<Result<_>>()?;
        Ok(Self {
            slots,
            warned: HashSet::new(),
        })
    }

    /// Traverses the entity list once and emits one record per mesh of every
    /// visible entity with a loaded model.
    ///
    /// `skinned` returns the posed vertex buffer of an animated entity's mesh.
    /// Meshes without one draw their bind pose from the geometry pool.
    #[instrument(skip_all)]
    #[profiling::function]
    pub fn assemble(
        &mut self,
        scene: &Scene,
        cache: &AssetCache,
        skinned: impl Fn(EntityId, usize) -> Option<BufferId>,
    ) -> FrameSceneData {
        let mut data = FrameSceneData::default();
        let mut pending = Vec::with_capacity(scene.len());

        for (id, entity) in scene.iter().filter(|(_, e)| e.visible) {
            let model = match cache.models.slot(entity.model) {
                Some(ModelSlot::Loaded(model)) => model,
                Some(ModelSlot::Failed { reason }) => {
                    if self.warned.insert(entity.model) {
                        warn!("Skipping entities of {:?}: {reason}", entity.model);
                    }
                    data.skipped += 1;
                    continue;
                }
                None => {
                    if self.warned.insert(entity.model) {
                        warn!("Skipping entities of {:?}, it was never uploaded", entity.model);
                    }
                    data.skipped += 1;
                    continue;
                }
            };
            let Some(pool) = cache.models.pool() else {
                data.skipped += 1;
                continue;
            };

            let animated = entity.is_animating() && model.is_skinned();
            for (index, mesh) in model.meshes.iter().enumerate() {
                let posed = animated.then(|| skinned(id, index)).flatten();
                let (vertex_buffer, base_vertex) = match posed {
                    Some(buffer) => (buffer, 0),
                    None => (pool.vertex, mesh.base_vertex as i32),
                };

                let mut flags = 0;
                if posed.is_some() {
                    flags |= INSTANCE_ANIMATED;
                }
                if cache.materials.is_transparent(HMaterial::new(mesh.material)) {
                    flags |= INSTANCE_TRANSPARENT;
                }

                pending.push(PendingDraw {
                    buffers: (vertex_buffer, pool.index),
                    record: DrawIndexedIndirect {
                        index_count: mesh.index_count,
                        instance_count: 1,
                        first_index: mesh.first_index,
                        base_vertex,
                        first_instance: 0,
                    },
                    instance: InstanceData {
                        model: Mat4::from(entity.transform),
                        material: mesh.material,
                        flags,
                        _pad: [0; 2],
                    },
                });
            }
            data.entities += 1;
        }

        // stable, so entity order is kept within a batch
        pending.sort_by_key(|p| p.buffers);

        let mut first_record = 0;
        for ((vertex_buffer, index_buffer), group) in &pending.iter().chunk_by(|p| p.buffers) {
            let count = group.count() as u32;
            data.batches.push(DrawBatch {
                vertex_buffer,
                index_buffer,
                first_record,
                count,
            });
            first_record += count;
        }

        data.records.reserve(pending.len());
        data.instances.reserve(pending.len());
        for (slot, draw) in pending.into_iter().enumerate() {
            data.records.push(DrawIndexedIndirect {
                first_instance: slot as u32,
                ..draw.record
            });
            data.instances.push(draw.instance);
        }

        data
    }

    /// Writes `data` into the buffers of `slot`. The slot's previous frame must
    /// have been observed complete. Buffers that are too small are replaced and
    /// the old ones retired at `frame`.
    #[profiling::function]
    pub fn upload(
        &mut self,
        slot: usize,
        data: &FrameSceneData,
        device: &dyn GpuDevice,
        deletion: &mut DeletionQueue,
        frame: u64,
    ) -> Result<()> {
        let needed = data.records.len();
        let current = &mut self.slots[slot];
        if needed > current.capacity {
            let capacity = needed.next_power_of_two();
            debug!("Growing scene buffers of slot {slot} to {capacity} draws");
            let grown = SlotBuffers::new(device, capacity)?;
            let old = std::mem::replace(current, grown);
            deletion.defer(frame, GpuResource::Buffer(old.indirect));
            deletion.defer(frame, GpuResource::Buffer(old.instances));
        }

        if needed == 0 {
            return Ok(());
        }
        let current = &self.slots[slot];
        debug_assert_le!(needed, current.capacity);
        device.write_buffer(current.indirect, 0, bytemuck::cast_slice(&data.records))?;
        device.write_buffer(current.instances, 0, bytemuck::cast_slice(&data.instances))?;
        Ok(())
    }

    pub fn indirect(&self, slot: usize) -> BufferId {
        self.slots[slot].indirect
    }

    pub fn instances(&self, slot: usize) -> BufferId {
        self.slots[slot].instances
    }

    /// Draw records the buffers of `slot` can hold without growing.
    pub fn capacity(&self, slot: usize) -> usize {
        self.slots[slot].capacity
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for slot in self.slots.drain(..) {
            device.destroy_buffer(slot.indirect)?;
            device.destroy_buffer(slot.instances)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::scene::{AnimationState, SceneEntity};
    use cinder_asset::{AnimationClip, AssetStore, MaterialDesc, ModelData, SkinWeights};
    use cinder_utils::RenderConfig;
    use cinder_utils::math::{Affine3A, Vec3, Vec4};

    struct Fixture {
        device: HeadlessDevice,
        store: AssetStore,
        cache: AssetCache,
    }

    fn fixture() -> Fixture {
        let device = HeadlessDevice::new();
        let store = AssetStore::default();
        store.materials.add(MaterialDesc::builder().name("opaque").build());
        store.materials.add(
            MaterialDesc::builder()
                .name("glass")
                .base_color(Vec4::new(1.0, 1.0, 1.0, 0.5))
                .build(),
        );
        store.models.add(ModelData::unit_quad("quad", "opaque"));
        store.models.add(ModelData::unit_quad("window", "glass"));
        store.models.add(ModelData::new("broken", vec![]));

        let mut skinned = ModelData::unit_quad("arm", "opaque");
        for mesh in &mut skinned.meshes {
            mesh.skin = Some(vec![SkinWeights::single(0); mesh.vertices.len()]);
        }
        store.models.add(skinned);
        store.animations.add(AnimationClip::new(
            "wave",
            1,
            24.0,
            vec![vec![Mat4::IDENTITY]; 2],
        ));

        let mut cache = AssetCache::new();
        cache
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap();
        Fixture {
            device,
            store,
            cache,
        }
    }

    fn at(x: f32) -> Affine3A {
        Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn one_record_per_visible_loaded_entity() {
        let f = fixture();
        let mut buffers = SceneBuffers::new(&f.device).unwrap();
        let mut scene = Scene::default();
        scene.spawn_named(&f.store, "quad", at(0.0)).unwrap();
        scene.spawn_named(&f.store, "window", at(1.0)).unwrap();
        scene.spawn_named(&f.store, "broken", at(2.0)).unwrap();
        let hidden = scene.spawn_named(&f.store, "quad", at(3.0)).unwrap();
        scene.get_mut(hidden).unwrap().visible = false;

        let data = buffers.assemble(&scene, &f.cache, |_, _| None);

        assert_eq!(data.draw_count(), 2);
        assert_eq!(data.entities, 2);
        assert_eq!(data.skipped, 1);
        assert_eq!(data.batches.len(), 1);
        assert_eq!(data.batches[0].count, 2);

        for (slot, record) in data.records.iter().enumerate() {
            assert_eq!(record.first_instance, slot as u32);
            assert_eq!(record.index_count, 6);
            assert_eq!(record.instance_count, 1);
        }
        let transparent = data
            .instances
            .iter()
            .filter(|i| i.flags & INSTANCE_TRANSPARENT != 0)
            .count();
        assert_eq!(transparent, 1);
    }

    #[test]
    fn models_from_later_loads_share_the_static_batch() {
        let mut f = fixture();
        f.store
            .models
            .add(ModelData::unit_quad("late", "opaque"));
        f.cache
            .load_all(&f.store, &f.device, &RenderConfig::default())
            .unwrap();

        let mut buffers = SceneBuffers::new(&f.device).unwrap();
        let mut scene = Scene::default();
        scene.spawn_named(&f.store, "quad", at(0.0)).unwrap();
        scene.spawn_named(&f.store, "late", at(1.0)).unwrap();
        scene.spawn_named(&f.store, "window", at(2.0)).unwrap();

        let data = buffers.assemble(&scene, &f.cache, |_, _| None);

        assert_eq!(data.draw_count(), 3);
        assert_eq!(data.batches.len(), 1);
        let pool = f.cache.models.pool().unwrap();
        assert_eq!(data.batches[0].vertex_buffer, pool.vertex);
        assert_eq!(data.batches[0].count, 3);
        let late = data.records.iter().map(|r| r.base_vertex).max().unwrap();
        assert_eq!(late as u32, pool.vertex_count - 4);
    }

    #[test]
    fn empty_scene_has_no_draws() {
        let f = fixture();
        let mut buffers = SceneBuffers::new(&f.device).unwrap();
        let data = buffers.assemble(&Scene::default(), &f.cache, |_, _| None);

        assert!(data.is_empty());
        assert!(data.batches.is_empty());
    }

    #[test]
    fn animated_meshes_draw_from_their_posed_buffer() {
        let f = fixture();
        let mut buffers = SceneBuffers::new(&f.device).unwrap();
        let posed = f
            .device
            .create_buffer(&BufferDesc::gpu_only(
                "posed",
                4 * 48,
                BufferUsage::VERTEX | BufferUsage::STORAGE,
            ))
            .unwrap();

        let arm = f.store.models.resolve("arm").unwrap();
        let clip = f.store.animations.resolve("wave").unwrap();
        let mut scene = Scene::default();
        scene.spawn_named(&f.store, "quad", at(0.0)).unwrap();
        let animated = scene.spawn(
            SceneEntity::new(arm, at(1.0)).with_animation(AnimationState::new(clip)),
        );

        let data = buffers.assemble(&scene, &f.cache, |id, mesh| {
            (id == animated && mesh == 0).then_some(posed)
        });

        assert_eq!(data.draw_count(), 2);
        assert_eq!(data.batches.len(), 2);
        let batch = data
            .batches
            .iter()
            .find(|b| b.vertex_buffer == posed)
            .unwrap();
        let record = data.records[batch.first_record as usize];
        assert_eq!(record.base_vertex, 0);
        let instance = data.instances[record.first_instance as usize];
        assert_eq!(instance.flags & INSTANCE_ANIMATED, INSTANCE_ANIMATED);
        assert_eq!(instance.model, Mat4::from(at(1.0)));
    }

    #[test]
    fn growing_retires_the_old_buffers() {
        let f = fixture();
        let mut buffers = SceneBuffers::new(&f.device).unwrap();
        let mut scene = Scene::default();
        for i in 0..(INITIAL_CAPACITY + 1) {
            scene.spawn_named(&f.store, "quad", at(i as f32)).unwrap();
        }

        let old = buffers.indirect(0);
        let data = buffers.assemble(&scene, &f.cache, |_, _| None);
        let mut deletion = DeletionQueue::new();
        buffers.upload(0, &data, &f.device, &mut deletion, 7).unwrap();

        assert_eq!(buffers.capacity(0), 128);
        assert_ne!(buffers.indirect(0), old);
        assert_eq!(deletion.len(), 2);
        assert_eq!(
            f.device.buffer_size(buffers.indirect(0)).unwrap(),
            128 * DRAW_INDEXED_INDIRECT_STRIDE
        );

        let written = f.device.read_buffer(buffers.indirect(0)).unwrap();
        let last: DrawIndexedIndirect = bytemuck::pod_read_unaligned(
            &written[INITIAL_CAPACITY * 20..(INITIAL_CAPACITY + 1) * 20],
        );
        assert_eq!(last.first_instance, INITIAL_CAPACITY as u32);
        assert!(f.device.validation_messages().is_empty());
    }
}
