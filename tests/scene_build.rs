//! Acceleration-structure contents and rebuild behavior seen through the renderer.

use vrtracer::accel::SkipReason;
use vrtracer::prelude::*;
use vrtracer::scene::DEFAULT_INSTANCE_MASK;

fn cube(color: Vec3) -> Geometry {
    let mut mesh = MeshBuilder::new();
    mesh.add_cube(color, Mat4::IDENTITY);
    mesh.build().expect("cube geometry")
}

fn cutout_cube() -> Geometry {
    let mut mesh = MeshBuilder::new();
    mesh.add_cube(Vec3::ONE, Mat4::IDENTITY);
    mesh.build_with("cutout", Some(IntersectionFunction::Cutout { frequency: 4.0 }))
        .expect("cutout geometry")
}

fn renderer(scene: Scene) -> Renderer<SoftwareBackend> {
    let backend = SoftwareBackend::new(SoftwareOptions {
        surface_size: UVec2::splat(48),
        ..Default::default()
    });
    Renderer::new(backend, scene, RendererConfig::default()).expect("renderer")
}

#[test]
fn test_descriptors_follow_instances() {
    let mut scene = Scene::new();
    let solid = scene.add_geometry(cube(Vec3::X));
    let cut = scene.add_geometry(cutout_cube());
    let left = Mat4::from_translation(Vec3::new(-1.0, 0.0, 0.0));
    let right = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
    scene.add_instance(GeometryInstance::new(solid, left));
    scene.add_instance(GeometryInstance::new(cut, right).with_mask(0x0F));

    let renderer = renderer(scene);
    let accel = renderer.acceleration_structures().expect("built");
    let desc = accel.descriptors();
    assert_eq!(desc.len(), 2);

    assert_eq!(desc[0].acceleration_structure_index, 0);
    assert!(desc[0].is_opaque());
    assert_eq!(desc[0].mask, DEFAULT_INSTANCE_MASK);
    assert_eq!(desc[0].object_to_world(), left);

    assert_eq!(desc[1].acceleration_structure_index, 1);
    assert!(!desc[1].is_opaque());
    assert_eq!(desc[1].mask, 0x0F);
    let round = desc[1].world_to_object() * desc[1].object_to_world();
    assert!(round.abs_diff_eq(Mat4::IDENTITY, 1e-5));

    assert!(accel.uses_intersection_functions());
    assert_eq!(accel.records().len(), 2);
    assert_eq!(accel.records()[1].vertex_offset, 36);
    assert!(accel.records().iter().all(|r| r.triangle_count == 12));
}

#[test]
fn test_opaque_scene_binds_no_table() {
    let renderer = renderer(Scene::cube_scene().unwrap());
    let accel = renderer.acceleration_structures().unwrap();
    assert!(accel.descriptors().iter().all(|d| d.is_opaque()));
    assert!(!accel.uses_intersection_functions());
}

#[test]
fn test_bad_instances_are_skipped_and_reported() {
    let mut scene = Scene::new();
    let g = scene.add_geometry(cube(Vec3::ONE));
    scene.add_instance(GeometryInstance::new(g, Mat4::IDENTITY));
    scene.add_instance(GeometryInstance::new(GeometryId::new(7), Mat4::IDENTITY));
    scene.add_instance(GeometryInstance::new(g, Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0))));

    let mut renderer = renderer(scene);
    let report = renderer.acceleration_structures().unwrap().report().clone();
    assert_eq!(report.instances, 1);
    let reasons: Vec<_> = report.skipped.iter().map(|s| (s.index, s.reason)).collect();
    assert_eq!(
        reasons,
        vec![(1, SkipReason::UnknownGeometry), (2, SkipReason::SingularTransform)]
    );

    // The remaining instance still renders
    assert!(renderer.render_frame(&FrameInput::default()).unwrap().is_submitted());
}

#[test]
fn test_compaction_never_grows_structures() {
    let mut scene = Scene::new();
    let mut mesh = MeshBuilder::new();
    for i in 0..6 {
        mesh.add_cube(Vec3::ONE, Mat4::from_translation(Vec3::new(i as f32 * 1.5, 0.0, 0.0)));
    }
    let g = scene.add_geometry(mesh.build().unwrap());
    scene.add_instance(GeometryInstance::new(g, Mat4::IDENTITY));

    let renderer = renderer(scene);
    let report = renderer.acceleration_structures().unwrap().report();
    assert_eq!(report.primitive_structures, 1);
    assert!(report.resident_bytes > 0);
    assert!(report.resident_bytes <= report.allocated_bytes);
}

#[test]
fn test_edits_pick_the_smallest_rebuild() {
    let mut renderer = renderer(Scene::cube_scene().unwrap());
    renderer.render_frame(&FrameInput::default()).unwrap();
    assert_eq!((renderer.stats().full_builds, renderer.stats().instance_builds), (1, 0));

    // Camera motion alone rebuilds nothing
    let input = FrameInput {
        dt: 0.1,
        pointer_delta: Vec2::new(3.0, -2.0),
        ..Default::default()
    };
    renderer.render_frame(&input).unwrap();
    assert_eq!((renderer.stats().full_builds, renderer.stats().instance_builds), (1, 0));

    // Moving an instance rebuilds the instance level only
    let moved = Mat4::from_translation(Vec3::new(0.0, 0.25, 0.0));
    assert!(renderer.scene_mut().set_instance_transform(0, moved));
    renderer.render_frame(&FrameInput::default()).unwrap();
    assert_eq!((renderer.stats().full_builds, renderer.stats().instance_builds), (1, 1));
    assert_eq!(
        renderer.acceleration_structures().unwrap().descriptors()[0].object_to_world(),
        moved
    );

    // New geometry forces a full build
    let g = renderer.scene_mut().add_geometry(cutout_cube());
    renderer
        .scene_mut()
        .add_instance(GeometryInstance::new(g, Mat4::from_translation(Vec3::X * 2.0)));
    renderer.render_frame(&FrameInput::default()).unwrap();
    assert_eq!(renderer.stats().full_builds, 2);
    let accel = renderer.acceleration_structures().unwrap();
    assert_eq!(accel.instance_count(), 2);
    assert!(accel.uses_intersection_functions());
}

#[test]
fn test_shutdown_releases_device_memory() {
    let mut renderer = renderer(Scene::cube_scene().unwrap());
    for _ in 0..4 {
        renderer.render_frame(&FrameInput::default()).unwrap();
    }
    renderer.shutdown().unwrap();
    assert_eq!(renderer.backend().live_buffer_count(), 0);
    assert!(renderer.render_frame(&FrameInput::default()).is_err());
    // Second shutdown is a no-op
    renderer.shutdown().unwrap();
}

#[test]
fn test_config_file_drives_renderer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let config = RendererConfig {
        max_frames_in_flight: 2,
        background: [0.0, 0.5, 0.0],
        ..Default::default()
    };
    config.save_to(&path).unwrap();

    let loaded = RendererConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);

    let backend = SoftwareBackend::new(SoftwareOptions {
        surface_size: UVec2::splat(8),
        ..Default::default()
    });
    let mut scene = Scene::new();
    let g = scene.add_geometry(cube(Vec3::ONE));
    // Far behind the camera
    scene.add_instance(GeometryInstance::new(g, Mat4::from_translation(Vec3::new(0.0, 0.0, -50.0))));
    let mut renderer = Renderer::new(backend, scene, loaded).unwrap();
    assert_eq!(renderer.uniform_ring().unwrap().slot_count(), 2);

    renderer.render_frame(&FrameInput::default()).unwrap();
    let image = renderer.read_output().unwrap();
    assert_eq!(image.hit_count(), 0);
    assert_eq!(image.color(4, 4), Vec3::new(0.0, 0.5, 0.0));
}

#[cfg(feature = "gpu")]
#[test]
#[ignore = "requires GPU"]
fn test_wgpu_cube_render() {
    let backend = WgpuBackend::new(WgpuOptions {
        surface_size: UVec2::splat(128),
        ..Default::default()
    })
    .expect("wgpu adapter");
    let mut renderer = Renderer::new(backend, Scene::cube_scene().unwrap(), RendererConfig::default()).unwrap();
    for _ in 0..4 {
        renderer.render_frame(&FrameInput::default()).unwrap();
    }
    let image = renderer.read_output().unwrap();
    assert_eq!(image.size, UVec2::splat(128));
    assert!(image.hit_distance(64, 64).is_some());
    assert_eq!(image.hit_distance(0, 0), None);
}
