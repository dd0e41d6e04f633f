mod common;

use cinder_asset::ModelData;
use cinder_render::gpu::{
    Binding, Command, DeviceEvent, FenceId, FenceStatus, GpuDevice, HeadlessDevice,
};
use cinder_render::passes::GuiDrawData;
use cinder_render::{FrameInput, FrameOutcome, RenderError, Scene};
use cinder_utils::{FRAMES_IN_FLIGHT, RenderConfig};
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn frame_fence_of(event: &DeviceEvent) -> Option<FenceId> {
    match event {
        DeviceEvent::Submitted {
            label: "Frame",
            fence,
            ..
        } => *fence,
        _ => None,
    }
}

#[test]
fn slot_fence_is_waited_before_the_slot_is_recorded_again() {
    let mut h = harness();
    let mut scene = Scene::default();
    scene.spawn_named(&h.store, "crate", at(0.0)).unwrap();
    let input = FrameInput::new(SURFACE);

    for _ in 0..6 {
        assert_eq!(
            h.renderer.render(&scene, &input).unwrap(),
            FrameOutcome::Rendered
        );
    }

    let events = h.device.events();
    let mut last_submit: HashMap<FenceId, usize> = HashMap::new();
    let mut resubmitted = 0;
    for (i, event) in events.iter().enumerate() {
        let Some(fence) = frame_fence_of(event) else {
            continue;
        };
        if let Some(&previous) = last_submit.get(&fence) {
            let between = &events[previous + 1..i];
            let waited = between.iter().position(|e| {
                matches!(e, DeviceEvent::FenceWaited { fence: f, status: FenceStatus::Signaled } if *f == fence)
            });
            let reset = between
                .iter()
                .position(|e| matches!(e, DeviceEvent::FenceReset { fence: f } if *f == fence));
            let (Some(waited), Some(reset)) = (waited, reset) else {
                panic!("fence {fence:?} was submitted again without a signaled wait and reset");
            };
            assert!(waited < reset);
            resubmitted += 1;
        }
        last_submit.insert(fence, i);
    }

    assert_eq!(last_submit.len(), FRAMES_IN_FLIGHT);
    assert_eq!(resubmitted, 6 - FRAMES_IN_FLIGHT);
    assert_clean(&h.device);
}

#[test]
fn geometry_buffers_hold_48_byte_vertices_and_32_bit_indices() {
    let h = harness();
    let handle = h.store.models.resolve("crate").unwrap();
    let model = h.renderer.cache().models.get(handle).unwrap();

    assert_eq!(model.vertices.size, 4 * 48);
    assert_eq!(model.indices.size, 6 * 4);
    let pool = h.renderer.cache().models.pool().unwrap();
    assert!(h.device.buffer_size(pool.vertex).unwrap() >= model.vertices.size);
}

#[test]
fn assets_loaded_between_frames_draw_in_the_same_call() {
    let mut h = harness();
    let mut scene = Scene::default();
    scene.spawn_named(&h.store, "crate", at(0.0)).unwrap();
    let input = FrameInput::new(SURFACE);
    h.renderer.render(&scene, &input).unwrap();

    h.store.models.add(ModelData::unit_quad("barrel", "stone"));
    let report = h.renderer.load_assets(&h.store).unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.retired.len(), 2);
    scene.spawn_named(&h.store, "barrel", at(1.0)).unwrap();

    for _ in 0..=FRAMES_IN_FLIGHT {
        h.renderer.render(&scene, &input).unwrap();
    }

    let frame = submissions(&h.device, "Frame").pop().unwrap();
    let draws = indirect_draws(&frame);
    assert_eq!(draws.len(), 1 + 3);
    assert!(draws.iter().all(|count| *count == 2));
    assert_eq!(h.renderer.pending_deletions(), 0);
    assert_clean(&h.device);
}

#[test]
fn draw_count_matches_visible_loaded_entities() {
    let mut h = harness();
    let mut scene = Scene::default();
    scene.spawn_named(&h.store, "crate", at(0.0)).unwrap();
    scene.spawn_named(&h.store, "crate", at(1.0)).unwrap();
    scene.spawn_named(&h.store, "broken", at(2.0)).unwrap();
    let hidden = scene.spawn_named(&h.store, "crate", at(3.0)).unwrap();
    scene.get_mut(hidden).unwrap().visible = false;

    h.renderer.render(&scene, &FrameInput::new(SURFACE)).unwrap();

    assert_eq!(h.renderer.stats().last_draw_count, 2);
    let frame = submissions(&h.device, "Frame").pop().unwrap();
    let draws = indirect_draws(&frame);
    // one draw in the geometry pass and one per shadow cascade
    assert_eq!(draws.len(), 1 + 3);
    assert!(draws.iter().all(|count| *count == 2));
    assert_clean(&h.device);
}

#[test]
fn empty_scene_skips_every_indirect_draw() {
    let mut h = harness();
    let outcome = h
        .renderer
        .render(&Scene::default(), &FrameInput::new(SURFACE))
        .unwrap();

    assert_eq!(outcome, FrameOutcome::Rendered);
    assert_eq!(h.renderer.stats().last_draw_count, 0);
    let frame = submissions(&h.device, "Frame").pop().unwrap();
    assert!(indirect_draws(&frame).is_empty());
    assert_clean(&h.device);
}

#[test]
fn cascade_splits_cover_the_view_range() {
    let mut h = harness();
    let scene = Scene::default();
    h.renderer.render(&scene, &FrameInput::new(SURFACE)).unwrap();

    let cascades = h.renderer.cascades();
    assert_eq!(cascades.len(), 3);
    assert_eq!(cascades.ranges[0].0, scene.camera.near);
    assert_eq!(cascades.ranges[2].1, scene.camera.far);
    for (near, far) in &cascades.ranges {
        assert!(near < far);
    }
    for pair in cascades.ranges.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }

    let frame = submissions(&h.device, "Frame").pop().unwrap();
    let layers: Vec<u32> = frame
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::BeginRenderPass(begin) => begin.depth.as_ref().and_then(|d| d.layer),
            _ => None,
        })
        .collect();
    assert_eq!(layers, vec![0, 1, 2]);
}

#[test]
fn animated_entity_binds_the_frame_it_was_recorded_with() {
    let mut h = harness();
    let mut scene = Scene::default();
    scene.spawn_named(&h.store, "crate", at(0.0)).unwrap();
    let animated = spawn_animated(&h.store, &mut scene, 2);
    let clip = h.store.animations.resolve("wave").unwrap();
    let input = FrameInput::new(SURFACE);

    h.renderer.render(&scene, &input).unwrap();
    scene.get_mut(animated).unwrap().animation.as_mut().unwrap().frame = 1;
    h.renderer.render(&scene, &input).unwrap();

    let joints = |frame| {
        Binding::read(
            3,
            h.renderer
                .cache()
                .animations
                .frame_buffer(clip, frame)
                .unwrap(),
        )
    };
    let dispatches = submissions(&h.device, "Animation");
    assert_eq!(dispatches.len(), 2);
    for (commands, frame) in dispatches.iter().zip([2, 1]) {
        let bound = commands.commands().iter().any(|c| {
            matches!(c, Command::BindResources { bindings, .. } if bindings.contains(&joints(frame)))
        });
        assert!(bound, "joint frame {frame} was not bound");
        assert_eq!(
            commands.count(|c| matches!(c, Command::Dispatch { x: 1, y: 1, z: 1 })),
            1
        );
    }

    // the posed buffer replaces the bind pose in the draw
    let posed = h.renderer.skinned_buffer(0, animated, 0).unwrap();
    assert_eq!(h.device.buffer_size(posed).unwrap(), 4 * 48);
    assert_eq!(h.renderer.stats().animated_dispatches, 2);
    assert_clean(&h.device);
}

#[test]
fn static_and_animated_entities_render_without_timeouts() {
    let mut h = harness_with(RenderConfig::builder().cascade_count(3).build());
    let mut scene = Scene::new(h.renderer.config());
    scene.spawn_named(&h.store, "crate", at(0.0)).unwrap();
    spawn_animated(&h.store, &mut scene, 0);
    let input = FrameInput::new(SURFACE);
    let tick = h.renderer.config().update_interval();

    const FRAMES: u64 = 8;
    for _ in 0..FRAMES {
        assert_eq!(scene.fixed_update(tick, &h.store), 1);
        assert_eq!(
            h.renderer.render(&scene, &input).unwrap(),
            FrameOutcome::Rendered
        );
    }

    let stats = h.renderer.stats();
    assert_eq!(stats.frames_rendered, FRAMES);
    assert_eq!(stats.frames_skipped, 0);
    assert_eq!(stats.last_draw_count, 2);
    assert_eq!(stats.animated_dispatches, FRAMES);
    assert_eq!(h.renderer.frame_number(), FRAMES);
    assert!(h.device.events().iter().all(|e| !matches!(
        e,
        DeviceEvent::FenceWaited {
            status: FenceStatus::Timeout,
            ..
        }
    )));
    assert_clean(&h.device);
}

#[test]
fn overlapped_update_does_not_leak_into_the_frame() {
    let mut h = harness();
    let mut scene = Scene::default();
    let animated = spawn_animated(&h.store, &mut scene, 0);
    let clip = h.store.animations.resolve("wave").unwrap();

    let outcome = h
        .renderer
        .render_overlapped(&mut scene, &FrameInput::new(SURFACE), move |scene| {
            scene.get_mut(animated).unwrap().animation.as_mut().unwrap().frame = 2;
        })
        .unwrap();

    assert_eq!(outcome, FrameOutcome::Rendered);
    assert_eq!(scene.get(animated).unwrap().animation.unwrap().frame, 2);
    let joints = h.renderer.cache().animations.frame_buffer(clip, 0).unwrap();
    let dispatch = submissions(&h.device, "Animation").pop().unwrap();
    assert!(dispatch.commands().iter().any(|c| {
        matches!(c, Command::BindResources { bindings, .. } if bindings.contains(&Binding::read(3, joints)))
    }));
    assert_clean(&h.device);
}

#[test]
fn despawned_animations_release_their_buffers_after_both_slots_finish() {
    let mut h = harness();
    let mut scene = Scene::default();
    let animated = spawn_animated(&h.store, &mut scene, 0);
    let input = FrameInput::new(SURFACE);

    for _ in 0..3 {
        h.renderer.render(&scene, &input).unwrap();
    }
    assert_eq!(h.renderer.pending_deletions(), 0);
    scene.despawn(animated);

    let mut pending = Vec::new();
    for _ in 0..3 {
        h.renderer.render(&scene, &input).unwrap();
        pending.push(h.renderer.pending_deletions());
    }
    assert_eq!(pending, vec![1, 1, 0]);
    assert!(h.renderer.skinned_buffer(0, animated, 0).is_none());
    assert!(h.renderer.skinned_buffer(1, animated, 0).is_none());
    assert_clean(&h.device);
}

#[test]
fn gui_draws_on_top_and_grows_its_buffers() {
    let mut h = harness();
    let scene = Scene::default();

    let mut small = GuiDrawData::new();
    small.rect([10.0, 10.0], [200.0, 40.0], [0.1, 0.1, 0.1, 0.8]);
    h.renderer
        .render(&scene, &FrameInput::new(SURFACE).with_gui(small))
        .unwrap();
    let frame = submissions(&h.device, "Frame").pop().unwrap();
    assert_eq!(indirect_draws(&frame), vec![1]);
    assert_eq!(h.renderer.pending_deletions(), 0);

    let mut large = GuiDrawData::new();
    for i in 0..400 {
        let x = (i % 40) as f32 * 30.0;
        let y = (i / 40) as f32 * 30.0;
        large.rect([x, y], [x + 20.0, y + 20.0], [1.0; 4]);
    }
    let input = FrameInput::new(SURFACE).with_gui(large);
    h.renderer.render(&scene, &input).unwrap();
    assert!(h.renderer.pending_deletions() > 0);

    for _ in 0..3 {
        h.renderer.render(&scene, &input).unwrap();
    }
    assert_eq!(h.renderer.pending_deletions(), 0);
    assert_clean(&h.device);
}

#[test]
fn audio_listener_follows_the_camera() {
    let mut h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.renderer.set_audio_listener(move |_: &cinder_utils::math::Affine3A| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let scene = Scene::default();
    h.renderer.render(&scene, &FrameInput::new(SURFACE)).unwrap();
    h.renderer
        .render(&scene, &FrameInput::new(cinder_utils::Extent2D::ZERO))
        .unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn shutdown_releases_everything_once() {
    let device = Arc::new(HeadlessDevice::new());
    let store = store();
    let mut renderer = cinder_render::Renderer::new(
        device.clone(),
        RenderConfig::default(),
        SURFACE,
        cinder_render::shaders::ShaderLibrary::builtin(),
    )
    .unwrap();
    renderer.load_assets(&store).unwrap();
    let mut scene = Scene::default();
    scene.spawn_named(&store, "crate", at(0.0)).unwrap();
    spawn_animated(&store, &mut scene, 1);
    for _ in 0..3 {
        renderer.render(&scene, &FrameInput::new(SURFACE)).unwrap();
    }

    renderer.shutdown().unwrap();
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_images(), 0);
    assert_eq!(device.pending_submissions(), 0);

    renderer.shutdown().unwrap();
    assert!(matches!(
        renderer.render(&scene, &FrameInput::new(SURFACE)),
        Err(RenderError::ShutDown)
    ));
    assert!(matches!(
        renderer.load_assets(&store),
        Err(RenderError::ShutDown)
    ));
    assert_clean(&device);
}
