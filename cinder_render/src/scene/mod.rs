//! The entity set the renderer draws.
//!
//! The update step owns and mutates the [`Scene`] between frames. During a
//! frame the renderer only reads it, and everything it needs on the GPU is
//! copied into the per-slot [`SceneBuffers`].

mod animation;
mod buffers;
mod camera;

pub use animation::AnimationState;
pub use buffers::{
    DrawBatch, DrawIndexedIndirect, FrameSceneData, INSTANCE_ANIMATED, INSTANCE_TRANSPARENT,
    InstanceData, SceneBuffers,
};
pub use camera::{Camera, DirectionalLight};

use cinder_asset::{AssetError, AssetStore, HModel};
use cinder_utils::RenderConfig;
use cinder_utils::math::Affine3A;
use slotmap::{SlotMap, new_key_type};
use std::time::Duration;

new_key_type! {
    pub struct EntityId;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneEntity {
    pub model: HModel,
    pub transform: Affine3A,
    pub animation: Option<AnimationState>,
    pub visible: bool,
}

impl SceneEntity {
    pub fn new(model: HModel, transform: Affine3A) -> Self {
        Self {
            model,
            transform,
            animation: None,
            visible: true,
        }
    }

    pub fn with_animation(mut self, animation: AnimationState) -> Self {
        self.animation = Some(animation);
        self
    }

    /// Whether the skinning dispatch should pose this entity.
    pub fn is_animating(&self) -> bool {
        self.animation.is_some_and(|a| a.started)
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    entities: SlotMap<EntityId, SceneEntity>,
    pub camera: Camera,
    pub light: DirectionalLight,
    timestep: Duration,
    accumulated: Duration,
}

impl Scene {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            entities: SlotMap::with_key(),
            camera: Camera::from_config(config),
            light: DirectionalLight::default(),
            timestep: config.update_interval(),
            accumulated: Duration::ZERO,
        }
    }

    pub fn spawn(&mut self, entity: SceneEntity) -> EntityId {
        self.entities.insert(entity)
    }

    /// Spawns an entity for the model registered under `model`. Unknown names
    /// are a content error.
    pub fn spawn_named(
        &mut self,
        store: &AssetStore,
        model: &str,
        transform: Affine3A,
    ) -> Result<EntityId, AssetError> {
        let model = store.models.resolve(model)?;
        Ok(self.spawn(SceneEntity::new(model, transform)))
    }

    pub fn despawn(&mut self, id: EntityId) -> Option<SceneEntity> {
        self.entities.remove(id)
    }

    pub fn get(&self, id: EntityId) -> Option<&SceneEntity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut SceneEntity> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &SceneEntity)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Runs every fixed update tick that fits into the time accumulated so far
    /// and returns how many ran. The remainder carries over to the next call.
    #[profiling::function]
    pub fn fixed_update(&mut self, elapsed: Duration, store: &AssetStore) -> u32 {
        self.accumulated += elapsed;
        let mut ticks = 0;
        while self.accumulated >= self.timestep {
            self.accumulated -= self.timestep;
            self.advance_animations(self.timestep.as_secs_f32(), store);
            ticks += 1;
        }
        ticks
    }

    pub fn timestep(&self) -> Duration {
        self.timestep
    }

    /// Steps every playing animation by `dt` seconds. Entities whose clip is
    /// not in `store` keep their frame.
    pub fn advance_animations(&mut self, dt: f32, store: &AssetStore) {
        for entity in self.entities.values_mut() {
            let Some(state) = entity.animation.as_mut() else {
                continue;
            };
            if let Some(clip) = store.animations.try_get(state.clip) {
                state.advance(dt, &clip);
            }
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(&RenderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_asset::{AnimationClip, ModelData};
    use cinder_utils::math::{Mat4, Vec3};

    #[test]
    fn spawns_by_name() {
        let store = AssetStore::default();
        let quad = store.models.add(ModelData::unit_quad("quad", "default"));

        let mut scene = Scene::default();
        let id = scene
            .spawn_named(&store, "quad", Affine3A::from_translation(Vec3::X))
            .unwrap();
        assert_eq!(scene.get(id).unwrap().model, quad);
        assert!(scene.spawn_named(&store, "ghost", Affine3A::IDENTITY).is_err());

        assert!(scene.despawn(id).is_some());
        assert!(!scene.contains(id));
        assert!(scene.is_empty());
    }

    #[test]
    fn advances_only_playing_animations() {
        let store = AssetStore::default();
        let model = store.models.add(ModelData::unit_quad("quad", "default"));
        let clip = store.animations.add(AnimationClip::new(
            "spin",
            1,
            10.0,
            vec![vec![Mat4::IDENTITY]; 8],
        ));

        let mut scene = Scene::default();
        let playing = scene.spawn(
            SceneEntity::new(model, Affine3A::IDENTITY).with_animation(AnimationState::new(clip)),
        );
        let paused = scene.spawn(
            SceneEntity::new(model, Affine3A::IDENTITY)
                .with_animation(AnimationState::paused(clip, 2)),
        );

        scene.advance_animations(0.35, &store);

        assert_eq!(scene.get(playing).unwrap().animation.unwrap().frame, 3);
        assert_eq!(scene.get(paused).unwrap().animation.unwrap().frame, 2);
        assert!(scene.get(playing).unwrap().is_animating());
        assert!(!scene.get(paused).unwrap().is_animating());
    }

    #[test]
    fn fixed_update_runs_whole_ticks_only() {
        let store = AssetStore::default();
        let model = store.models.add(ModelData::unit_quad("quad", "default"));
        let clip = store.animations.add(AnimationClip::new(
            "spin",
            1,
            10.0,
            vec![vec![Mat4::IDENTITY]; 8],
        ));

        let config = RenderConfig::builder().updates_per_second(10).build();
        let mut scene = Scene::new(&config);
        assert_eq!(scene.timestep(), Duration::from_millis(100));
        let id = scene.spawn(
            SceneEntity::new(model, Affine3A::IDENTITY).with_animation(AnimationState::new(clip)),
        );

        assert_eq!(scene.fixed_update(Duration::from_millis(50), &store), 0);
        assert_eq!(scene.get(id).unwrap().animation.unwrap().frame, 0);

        // 50ms carried over plus 260ms is three ticks with 10ms left
        assert_eq!(scene.fixed_update(Duration::from_millis(260), &store), 3);
        assert_eq!(scene.get(id).unwrap().animation.unwrap().frame, 3);

        assert_eq!(scene.fixed_update(Duration::from_millis(90), &store), 1);
        assert_eq!(scene.get(id).unwrap().animation.unwrap().frame, 4);
    }
}
