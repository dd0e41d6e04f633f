//! GPU skinning of animated meshes.
//!
//! Every visible, animating entity with a skinned model gets one posed vertex
//! buffer per mesh and frame slot. A compute dispatch per mesh blends the bind
//! pose from the geometry pool with the joint matrices of the frame the
//! entity's animation state selects when the frame is recorded. The dispatches
//! go out in their own submission with their own fence, ahead of the frame
//! that draws the posed vertices.

use crate::cache::{AssetCache, ModelSlot};
use crate::error::{RenderError, Result};
use crate::gpu::*;
use crate::scene::{EntityId, Scene};
use crate::shaders::ShaderLibrary;
use bytemuck::{Pod, Zeroable};
use cinder_asset::{HModel, Vertex3D};
use cinder_utils::FRAMES_IN_FLIGHT;
use smallvec::SmallVec;
use static_assertions::const_assert_eq;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace};

pub const SKINNING_WORKGROUP_SIZE: u32 = 64;

/// Uniform records are bound at offsets aligned to this.
const PARAMS_STRIDE: u64 = 256;
const INITIAL_PARAMS: usize = 16;

/// Per dispatch parameters of the skinning shader.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct SkinParams {
    /// First vertex of the mesh in the pool's vertex buffer.
    pub src_vertex: u32,
    /// First skin weight of the mesh in the pool's skin buffer.
    pub skin: u32,
    pub count: u32,
    pub _pad: u32,
}

const_assert_eq!(size_of::<SkinParams>(), 16);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct SkinJob {
    entity: EntityId,
    model: HModel,
    mesh: usize,
    params: SkinParams,
    vertices: BufferId,
    skin: BufferId,
    joints: BufferId,
    target: BufferId,
}

#[derive(Debug)]
struct SkinnedEntity {
    model: HModel,
    meshes: SmallVec<[Option<BufferId>; 2]>,
}

impl SkinnedEntity {
    fn retire(self, deletion: &mut DeletionQueue, frame: u64) {
        for buffer in self.meshes.into_iter().flatten() {
            deletion.defer(frame, GpuResource::Buffer(buffer));
        }
    }
}

struct AnimationSlot {
    cmd: CommandBuffer,
    fence: FenceId,
    params: BufferId,
    params_capacity: usize,
    skinned: HashMap<EntityId, SkinnedEntity>,
    jobs: Vec<SkinJob>,
}

fn params_buffer(device: &dyn GpuDevice, capacity: usize) -> Result<BufferId> {
    Ok(device.create_buffer(&BufferDesc::host_visible(
        "Skinning Params",
        capacity as u64 * PARAMS_STRIDE,
        BufferUsage::UNIFORM,
    ))?)
}

pub struct AnimationPass {
    pipeline: PipelineId,
    slots: SmallVec<[AnimationSlot; FRAMES_IN_FLIGHT]>,
}

impl AnimationPass {
    pub fn new(device: &dyn GpuDevice, shaders: &ShaderLibrary) -> Result<Self> {
        let pipeline = device.create_pipeline(&PipelineDesc {
            label: "Skinning Pipeline".to_string(),
            shader: shaders.get(ShaderKind::Skinning).clone(),
            kind: PipelineKind::Compute {
                workgroup_size: SKINNING_WORKGROUP_SIZE,
            },
        })?;

        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| {
                Ok(AnimationSlot {
                    cmd: CommandBuffer::new("Animation"),
                    fence: device.create_fence(true)?,
                    params: params_buffer(device, INITIAL_PARAMS)?,
                    params_capacity: INITIAL_PARAMS,
                    skinned: HashMap::new(),
                    jobs: Vec::new(),
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { pipeline, slots })
    }

    /// Collects the skinning work of `slot` and makes sure every job has a
    /// posed vertex buffer. Buffers of entities that stopped animating, were
    /// hidden or despawned are retired at `retire_frame`.
    #[instrument(skip_all)]
    pub fn prepare(
        &mut self,
        slot: usize,
        scene: &Scene,
        cache: &AssetCache,
        device: &dyn GpuDevice,
        deletion: &mut DeletionQueue,
        retire_frame: u64,
    ) -> Result<()> {
        let state = &mut self.slots[slot];
        state.jobs.clear();

        let mut animated: HashMap<EntityId, HModel> = HashMap::new();
        for (id, entity) in scene.iter() {
            let Some(animation) = entity.animation.filter(|_| entity.visible && entity.is_animating())
            else {
                continue;
            };
            let Some(ModelSlot::Loaded(model)) = cache.models.slot(entity.model) else {
                continue;
            };
            let Some(pool) = cache.models.pool() else {
                continue;
            };
            let (Some(skin), Some(joints)) = (
                pool.skin,
                cache.animations.frame_buffer(animation.clip, animation.frame),
            ) else {
                continue;
            };
            if !model.is_skinned() {
                continue;
            }

            for (index, mesh) in model.meshes.iter().enumerate() {
                let Some(skin_offset) = mesh.skin_offset else {
                    continue;
                };
                if mesh.vertex_count == 0 {
                    continue;
                }
                state.jobs.push(SkinJob {
                    entity: id,
                    model: entity.model,
                    mesh: index,
                    params: SkinParams {
                        src_vertex: mesh.base_vertex,
                        skin: skin_offset,
                        count: mesh.vertex_count,
                        _pad: 0,
                    },
                    vertices: pool.vertex,
                    skin,
                    joints,
                    target: BufferId::default(),
                });
            }
            animated.insert(id, entity.model);
        }

        let stale: Vec<EntityId> = state
            .skinned
            .iter()
            .filter(|(id, skinned)| animated.get(id) != Some(&skinned.model))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(skinned) = state.skinned.remove(&id) {
                trace!("Retiring posed vertices of {id:?}");
                skinned.retire(deletion, retire_frame);
            }
        }

        for job in &mut state.jobs {
            let skinned = state.skinned.entry(job.entity).or_insert_with(|| SkinnedEntity {
                model: job.model,
                meshes: SmallVec::new(),
            });
            if skinned.meshes.len() <= job.mesh {
                skinned.meshes.resize(job.mesh + 1, None);
            }

            job.target = match skinned.meshes[job.mesh] {
                Some(buffer) => buffer,
                None => {
                    let size = job.params.count as u64 * size_of::<Vertex3D>() as u64;
                    let buffer = device.create_buffer(&BufferDesc::gpu_only(
                        "Posed Vertices",
                        size,
                        BufferUsage::VERTEX | BufferUsage::STORAGE,
                    ))?;
                    debug!("Created {size} bytes of posed vertices for {:?}", job.entity);
                    skinned.meshes[job.mesh] = Some(buffer);
                    buffer
                }
            };
        }

        let needed = state.jobs.len();
        if needed > state.params_capacity {
            let capacity = needed.next_power_of_two();
            let grown = params_buffer(device, capacity)?;
            let old = std::mem::replace(&mut state.params, grown);
            deletion.defer(retire_frame, GpuResource::Buffer(old));
            state.params_capacity = capacity;
        }
        Ok(())
    }

    /// The posed vertex buffer of `entity`'s mesh for `slot`, once prepared.
    pub fn skinned_buffer(&self, slot: usize, entity: EntityId, mesh: usize) -> Option<BufferId> {
        self.slots[slot]
            .skinned
            .get(&entity)
            .and_then(|skinned| skinned.meshes.get(mesh).copied().flatten())
    }

    /// Number of dispatches the last [`prepare`](Self::prepare) of `slot` queued.
    pub fn job_count(&self, slot: usize) -> usize {
        self.slots[slot].jobs.len()
    }

    /// Records the prepared dispatches of `slot` and submits them. Returns the
    /// number of dispatches, nothing is submitted when there are none.
    #[profiling::function]
    pub fn record_and_submit(
        &mut self,
        slot: usize,
        device: &dyn GpuDevice,
        diagnostics: DiagnosticCheckpoints,
        timeout: Duration,
    ) -> Result<usize> {
        let pipeline = self.pipeline;
        let state = &mut self.slots[slot];
        if state.jobs.is_empty() {
            return Ok(0);
        }

        if device.wait_fence(state.fence, timeout)? == FenceStatus::Timeout {
            return Err(RenderError::FenceTimeout { slot, timeout });
        }

        let mut params = vec![0u8; state.jobs.len() * PARAMS_STRIDE as usize];
        for (record, job) in params
            .chunks_exact_mut(PARAMS_STRIDE as usize)
            .zip(&state.jobs)
        {
            record[..size_of::<SkinParams>()].copy_from_slice(bytemuck::bytes_of(&job.params));
        }
        device.write_buffer(state.params, 0, &params)?;

        let cmd = &mut state.cmd;
        cmd.reset();
        diagnostics.insert(cmd, "Animation");

        let drawn = (
            PipelineStages::VERTEX_INPUT,
            Access::VERTEX_ATTRIBUTE_READ,
        );
        let posed = (PipelineStages::COMPUTE_SHADER, Access::SHADER_WRITE);
        cmd.barrier(
            state
                .jobs
                .iter()
                .fold(Barrier::new(), |b, job| b.buffer(job.target, drawn, posed)),
        );

        cmd.begin_compute_pass("Skinning");
        cmd.bind_pipeline(pipeline);
        for (i, job) in state.jobs.iter().enumerate() {
            cmd.bind_resources(
                0,
                [
                    Binding::read_range(
                        0,
                        state.params,
                        i as u64 * PARAMS_STRIDE,
                        size_of::<SkinParams>() as u64,
                    ),
                    Binding::read(1, job.vertices),
                    Binding::read(2, job.skin),
                    Binding::read(3, job.joints),
                    Binding::read_write(4, job.target),
                ],
            );
            cmd.dispatch(job.params.count.div_ceil(SKINNING_WORKGROUP_SIZE), 1, 1);
        }
        cmd.end_compute_pass();

        cmd.barrier(
            state
                .jobs
                .iter()
                .fold(Barrier::new(), |b, job| b.buffer(job.target, posed, drawn)),
        );

        device.reset_fence(state.fence)?;
        device.submit(Submission {
            label: "Animation",
            command_buffer: &state.cmd,
            wait: &[],
            signal: &[],
            fence: Some(state.fence),
        })?;
        Ok(state.jobs.len())
    }

    /// Releases everything. The device must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for slot in self.slots.drain(..) {
            device.destroy_fence(slot.fence)?;
            device.destroy_buffer(slot.params)?;
            for buffer in slot.skinned.into_values().flat_map(|s| s.meshes).flatten() {
                device.destroy_buffer(buffer)?;
            }
        }
        device.destroy_pipeline(self.pipeline)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{AnimationState, SceneEntity};
    use cinder_asset::{AnimationClip, AssetStore, MaterialDesc, ModelData, SkinWeights};
    use cinder_utils::RenderConfig;
    use cinder_utils::math::{Affine3A, Mat4, Vec3};

    struct Fixture {
        device: HeadlessDevice,
        store: AssetStore,
        cache: AssetCache,
        pass: AnimationPass,
    }

    fn fixture() -> Fixture {
        let device = HeadlessDevice::new();
        let store = AssetStore::default();
        store.materials.add(MaterialDesc::builder().name("skin").build());
        store.models.add(ModelData::unit_quad("crate", "skin"));
        let mut arm = ModelData::unit_quad("arm", "skin");
        for mesh in &mut arm.meshes {
            mesh.skin = Some(vec![SkinWeights::single(0); mesh.vertices.len()]);
        }
        store.models.add(arm);
        store.animations.add(AnimationClip::new(
            "wave",
            1,
            24.0,
            (0..3)
                .map(|i| vec![Mat4::from_translation(Vec3::splat(i as f32))])
                .collect(),
        ));

        let mut cache = AssetCache::new();
        cache
            .load_all(&store, &device, &RenderConfig::default())
            .unwrap();
        let pass = AnimationPass::new(&device, &ShaderLibrary::builtin()).unwrap();
        Fixture {
            device,
            store,
            cache,
            pass,
        }
    }

    fn animated(f: &Fixture, scene: &mut Scene, frame: usize) -> EntityId {
        let arm = f.store.models.resolve("arm").unwrap();
        let clip = f.store.animations.resolve("wave").unwrap();
        let mut state = AnimationState::new(clip);
        state.frame = frame;
        scene.spawn(SceneEntity::new(arm, Affine3A::IDENTITY).with_animation(state))
    }

    #[test]
    fn posed_buffers_match_the_bind_pose_size() {
        let mut f = fixture();
        let mut scene = Scene::default();
        scene
            .spawn_named(&f.store, "crate", Affine3A::IDENTITY)
            .unwrap();
        let arm = animated(&f, &mut scene, 0);

        let mut deletion = DeletionQueue::new();
        f.pass
            .prepare(0, &scene, &f.cache, &f.device, &mut deletion, 0)
            .unwrap();

        assert_eq!(f.pass.job_count(0), 1);
        let posed = f.pass.skinned_buffer(0, arm, 0).unwrap();
        assert_eq!(f.device.buffer_size(posed).unwrap(), 4 * 48);
        assert!(f.pass.skinned_buffer(1, arm, 0).is_none());
    }

    #[test]
    fn dispatch_binds_the_selected_frame() {
        let mut f = fixture();
        let mut scene = Scene::default();
        let arm = animated(&f, &mut scene, 2);
        let clip = f.store.animations.resolve("wave").unwrap();

        let mut deletion = DeletionQueue::new();
        f.pass
            .prepare(0, &scene, &f.cache, &f.device, &mut deletion, 0)
            .unwrap();
        let dispatched = f
            .pass
            .record_and_submit(
                0,
                &f.device,
                DiagnosticCheckpoints::None,
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(dispatched, 1);

        let expected = f.cache.animations.frame_buffer(clip, 2).unwrap();
        let posed = f.pass.skinned_buffer(0, arm, 0).unwrap();
        let submitted = f
            .device
            .events()
            .into_iter()
            .find_map(|e| match e {
                DeviceEvent::Submitted {
                    label: "Animation",
                    commands,
                    ..
                } => Some(commands),
                _ => None,
            })
            .unwrap();
        let bindings = submitted
            .commands()
            .iter()
            .find_map(|c| match c {
                Command::BindResources { bindings, .. } => Some(bindings.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(bindings[3], Binding::read(3, expected));
        assert_eq!(bindings[4], Binding::read_write(4, posed));
        assert!(submitted.commands().contains(&Command::Dispatch { x: 1, y: 1, z: 1 }));

        f.device.wait_idle().unwrap();
        assert!(f.device.validation_messages().is_empty());
    }

    #[test]
    fn stopped_entities_retire_their_buffers() {
        let mut f = fixture();
        let mut scene = Scene::default();
        let arm = animated(&f, &mut scene, 0);

        let mut deletion = DeletionQueue::new();
        f.pass
            .prepare(0, &scene, &f.cache, &f.device, &mut deletion, 0)
            .unwrap();
        assert!(deletion.is_empty());

        scene.get_mut(arm).unwrap().animation.as_mut().unwrap().stop();
        f.pass
            .prepare(0, &scene, &f.cache, &f.device, &mut deletion, 3)
            .unwrap();

        assert_eq!(f.pass.job_count(0), 0);
        assert!(f.pass.skinned_buffer(0, arm, 0).is_none());
        assert_eq!(deletion.len(), 1);
        assert_eq!(
            f.pass
                .record_and_submit(0, &f.device, DiagnosticCheckpoints::None, Duration::ZERO)
                .unwrap(),
            0
        );

        deletion.flush(&f.device).unwrap();
        f.pass.destroy(&f.device).unwrap();
        assert!(f.device.validation_messages().is_empty());
    }
}
