//! Patch-match stereo and fusion over a synthetic fronto-parallel plane.

use std::path::Path;

use aperture_core::{Camera, CameraModelId, Rigid3};
use aperture_image::Bitmap;
use aperture_mvs::depth_map::BinaryMap;
use aperture_mvs::fusion::write_visibility;
use aperture_mvs::{
    FusionOptions, PatchMatchController, PatchMatchOptions, StereoFusion, StereoInputType,
    Workspace, WorkspaceFormat,
};
use aperture_scene::{Reconstruction, SceneImage};
use nalgebra::Vector3;

const FOCAL: f64 = 100.0;
const WIDTH: usize = 48;
const HEIGHT: usize = 36;
const PLANE_Z: f64 = 5.0;

/// Smooth synthetic texture over the world plane z = PLANE_Z.
fn texture(x: f64, y: f64) -> f64 {
    0.5 + 0.2 * (8.0 * x).sin() + 0.2 * (7.3 * y).sin() + 0.1 * (3.0 * x + 5.0 * y).sin()
}

/// Renders the plane from a camera centered at (center_x, 0, 0).
fn render_view(center_x: f64) -> Bitmap {
    let (cx, cy) = (WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0);
    let mut bitmap = Bitmap::filled(WIDTH, HEIGHT, [0, 0, 0]);
    for py in 0..HEIGHT {
        for px in 0..WIDTH {
            let u = (px as f64 + 0.5 - cx) / FOCAL;
            let v = (py as f64 + 0.5 - cy) / FOCAL;
            let world_x = center_x + u * PLANE_Z;
            let world_y = v * PLANE_Z;
            let value = (texture(world_x, world_y).clamp(0.0, 1.0) * 255.0) as u8;
            bitmap.set(px, py, [value, value, value]);
        }
    }
    bitmap
}

/// Builds a COLMAP-format workspace with three posed views of the plane.
fn build_workspace(root: &Path) -> Vec<String> {
    let images_dir = root.join("images");
    let sparse_dir = root.join("sparse");
    let stereo_dir = root.join("stereo");
    std::fs::create_dir_all(&images_dir).unwrap();
    std::fs::create_dir_all(&sparse_dir).unwrap();
    std::fs::create_dir_all(stereo_dir.join("depth_maps")).unwrap();
    std::fs::create_dir_all(stereo_dir.join("normal_maps")).unwrap();

    let mut recon = Reconstruction::new();
    recon.add_camera(Camera {
        camera_id: 1,
        model_id: CameraModelId::Pinhole,
        width: WIDTH,
        height: HEIGHT,
        params: vec![FOCAL, FOCAL, WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0],
    });

    let centers = [0.0, 0.5, 1.0];
    let mut names = Vec::new();
    for (i, &center_x) in centers.iter().enumerate() {
        let name = format!("view{}.png", i);
        render_view(center_x).save(images_dir.join(&name)).unwrap();
        // cam_from_world: identity rotation, translation -center.
        recon.add_image(SceneImage {
            image_id: i as u32 + 1,
            camera_id: 1,
            name: name.clone(),
            cam_from_world: Rigid3::new(
                nalgebra::UnitQuaternion::identity(),
                Vector3::new(-center_x, 0.0, 0.0),
            ),
            points2: vec![],
        });
        names.push(name);
    }
    recon.write(&sparse_dir).unwrap();

    let mut config = String::new();
    for name in &names {
        config.push_str(name);
        config.push('\n');
        config.push_str("__auto__, 20\n");
    }
    std::fs::write(stereo_dir.join("patch-match.cfg"), config).unwrap();
    names
}

fn stereo_options() -> PatchMatchOptions {
    PatchMatchOptions {
        window_radius: 3,
        window_step: 1,
        num_iterations: 4,
        depth_min: 3.0,
        depth_max: 8.0,
        geom_consistency: true,
        geom_max_rel_depth_error: 0.05,
        geom_min_consistent: 1,
        seed: 0,
        ..PatchMatchOptions::default()
    }
}

#[test]
fn test_patch_match_recovers_plane_depth() {
    let dir = tempfile::tempdir().unwrap();
    let names = build_workspace(dir.path());

    let workspace = Workspace::load(dir.path(), WorkspaceFormat::Colmap).unwrap();
    PatchMatchController::new(workspace, stereo_options())
        .run()
        .unwrap();

    let depth_path = dir
        .path()
        .join("stereo")
        .join("depth_maps")
        .join(format!("{}.photometric.bin", names[1]));
    let depth_map = BinaryMap::read(&depth_path).unwrap();

    // Collect interior depth estimates.
    let mut depths = Vec::new();
    for y in 8..HEIGHT - 8 {
        for x in 8..WIDTH - 8 {
            let d = depth_map.get(x, y, 0) as f64;
            if d > 0.0 {
                depths.push(d);
            }
        }
    }
    assert!(
        depths.len() > (WIDTH - 16) * (HEIGHT - 16) / 2,
        "only {} valid depths",
        depths.len()
    );
    depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = depths[depths.len() / 2];
    assert!(
        (median - PLANE_Z).abs() / PLANE_Z < 0.1,
        "median depth {}",
        median
    );
}

#[test]
fn test_fusion_merges_consistent_views() {
    let dir = tempfile::tempdir().unwrap();
    let names = build_workspace(dir.path());

    // Perfect synthetic maps: constant plane depth, camera-facing normals.
    let workspace = Workspace::load(dir.path(), WorkspaceFormat::Colmap).unwrap();
    for name in &names {
        let mut depth = BinaryMap::new(WIDTH, HEIGHT, 1);
        let mut normal = BinaryMap::new(WIDTH, HEIGHT, 3);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                depth.set(x, y, 0, PLANE_Z as f32);
                normal.set(x, y, 2, -1.0);
            }
        }
        depth
            .write(workspace.depth_map_file(name, "geometric"))
            .unwrap();
        normal
            .write(workspace.normal_map_file(name, "geometric"))
            .unwrap();
    }

    let fused = StereoFusion::new(
        workspace,
        FusionOptions {
            input_type: StereoInputType::Geometric,
            min_num_pixels: 2,
            max_rel_depth_error: 0.01,
            max_normal_error_deg: 10.0,
        },
    )
    .run()
    .unwrap();

    assert!(
        fused.cloud.len() > 1000,
        "only {} fused points",
        fused.cloud.len()
    );
    for point in fused.cloud.points() {
        assert!((point[2] - PLANE_Z).abs() < 0.05, "point z {}", point[2]);
    }
    // Every fused point is supported by at least two views.
    for support in &fused.visibility {
        assert!(support.len() >= 2);
    }

    // The visibility sidecar round-trips.
    let vis_path = dir.path().join("fused.ply.vis");
    write_visibility(&vis_path, &fused.visibility).unwrap();
    assert_eq!(
        aperture_mvs::fusion::read_visibility(&vis_path).unwrap(),
        fused.visibility
    );
}
