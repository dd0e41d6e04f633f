#![allow(dead_code)]

use cinder_asset::{AnimationClip, AssetStore, MaterialDesc, ModelData, SkinWeights};
use cinder_render::gpu::{Command, CommandBuffer, DeviceEvent, HeadlessDevice};
use cinder_render::shaders::ShaderLibrary;
use cinder_render::{AnimationState, EntityId, Renderer, Scene, SceneEntity};
use cinder_utils::math::{Affine3A, Mat4, Vec3};
use cinder_utils::{Extent2D, RenderConfig};
use std::sync::Arc;

pub const SURFACE: Extent2D = Extent2D {
    width: 1280,
    height: 720,
};

pub struct Harness {
    pub device: Arc<HeadlessDevice>,
    pub store: AssetStore,
    pub renderer: Renderer,
}

/// A material, a static quad, a skinned quad and a three frame clip.
pub fn store() -> AssetStore {
    let store = AssetStore::default();
    store.materials.add(MaterialDesc::builder().name("stone").build());
    store.models.add(ModelData::unit_quad("crate", "stone"));
    store.models.add(ModelData::new("broken", vec![]));

    let mut arm = ModelData::unit_quad("arm", "stone");
    for mesh in &mut arm.meshes {
        mesh.skin = Some(vec![SkinWeights::single(0); mesh.vertices.len()]);
    }
    store.models.add(arm);
    store.animations.add(AnimationClip::new(
        "wave",
        1,
        24.0,
        (0..3)
            .map(|i| vec![Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0))])
            .collect(),
    ));
    store
}

pub fn harness_with(config: RenderConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let device = Arc::new(HeadlessDevice::new());
    let store = store();
    let mut renderer =
        Renderer::new(device.clone(), config, SURFACE, ShaderLibrary::builtin()).unwrap();
    renderer.load_assets(&store).unwrap();
    Harness {
        device,
        store,
        renderer,
    }
}

pub fn harness() -> Harness {
    harness_with(RenderConfig::default())
}

pub fn at(x: f32) -> Affine3A {
    Affine3A::from_translation(Vec3::new(x, 0.0, -5.0))
}

pub fn spawn_animated(store: &AssetStore, scene: &mut Scene, frame: usize) -> EntityId {
    let arm = store.models.resolve("arm").unwrap();
    let clip = store.animations.resolve("wave").unwrap();
    let mut state = AnimationState::new(clip);
    state.frame = frame;
    scene.spawn(SceneEntity::new(arm, at(1.0)).with_animation(state))
}

/// Command buffers submitted under `label`, in submission order.
pub fn submissions(device: &HeadlessDevice, label: &str) -> Vec<CommandBuffer> {
    device
        .events()
        .into_iter()
        .filter_map(|event| match event {
            DeviceEvent::Submitted {
                label: l, commands, ..
            } if l == label => Some(commands),
            _ => None,
        })
        .collect()
}

pub fn indirect_draws(commands: &CommandBuffer) -> Vec<u32> {
    commands
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::DrawIndexedIndirect { draw_count, .. } => Some(*draw_count),
            _ => None,
        })
        .collect()
}

pub fn assert_clean(device: &HeadlessDevice) {
    let messages = device.validation_messages();
    assert!(messages.is_empty(), "validation messages: {messages:#?}");
}
