//! End-to-end mapping over a synthetic scene with a perfect database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aperture_features::db::{Database, DbCamera, TwoViewGeometry};
use aperture_features::Keypoint;
use aperture_sfm::{IncrementalMapperController, MapperControllerOptions, MapperEvent};
use nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};

const FOCAL: f64 = 500.0;
const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 480.0;

struct SyntheticScene {
    database: Database,
}

/// Four cameras along the x axis looking down +z at a random point cloud.
/// Every projection is exact, so the mapper should reproduce the geometry
/// up to scale.
fn build_scene(num_points: usize, seed: u64) -> SyntheticScene {
    let mut rng = StdRng::seed_from_u64(seed);
    let points: Vec<Vector3<f64>> = (0..num_points)
        .map(|_| {
            Vector3::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-1.5..1.5),
                rng.random_range(4.0..8.0),
            )
        })
        .collect();
    let centers: Vec<Vector3<f64>> = (0..4)
        .map(|i| Vector3::new(0.5 * i as f64, 0.0, 0.0))
        .collect();

    let mut database = Database::default();
    let camera_id = database.add_camera(DbCamera {
        model_id: 1, // PINHOLE
        width: WIDTH as u64,
        height: HEIGHT as u64,
        params: vec![FOCAL, FOCAL, WIDTH / 2.0, HEIGHT / 2.0],
        prior_focal_length: true,
    });

    // Project points; remember which feature index each point got per image.
    let mut feature_index: Vec<BTreeMap<usize, u32>> = Vec::new();
    let mut image_ids = Vec::new();
    for center in &centers {
        let image_id = database.add_image(format!("view{}.png", image_ids.len()), camera_id);
        let mut keypoints = Vec::new();
        let mut indices = BTreeMap::new();
        for (point_idx, point) in points.iter().enumerate() {
            let cam = point - center;
            let x = FOCAL * cam.x / cam.z + WIDTH / 2.0;
            let y = FOCAL * cam.y / cam.z + HEIGHT / 2.0;
            if x < 0.0 || x >= WIDTH || y < 0.0 || y >= HEIGHT {
                continue;
            }
            indices.insert(point_idx, keypoints.len() as u32);
            keypoints.push(Keypoint {
                x: x as f32,
                y: y as f32,
                scale: 1.0,
                orientation: 0.0,
            });
        }
        database.set_keypoints(image_id, keypoints);
        feature_index.push(indices);
        image_ids.push(image_id);
    }

    for i in 0..image_ids.len() {
        for j in i + 1..image_ids.len() {
            let matches: Vec<(u32, u32)> = feature_index[i]
                .iter()
                .filter_map(|(point_idx, &feat_i)| {
                    feature_index[j].get(point_idx).map(|&feat_j| (feat_i, feat_j))
                })
                .collect();
            if matches.len() >= 15 {
                database.set_two_view_geometry(
                    image_ids[i],
                    image_ids[j],
                    TwoViewGeometry {
                        inlier_matches: matches,
                        fundamental: [[0.0; 3]; 3],
                    },
                );
            }
        }
    }

    SyntheticScene { database }
}

fn controller_options() -> MapperControllerOptions {
    let mut options = MapperControllerOptions::default();
    options.mapper.init_min_tri_angle_deg = 4.0;
    options.mapper.abs_pose_min_num_inliers = 15;
    options.min_model_size = 3;
    options
}

#[test]
fn test_maps_full_synthetic_scene() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("database.bin");
    build_scene(250, 7).database.save(&db_path).unwrap();

    let registered = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let mut controller = IncrementalMapperController::new(&db_path, controller_options());
    let registered_count = Arc::clone(&registered);
    controller.add_callback(MapperEvent::ImageRegistered, move |_| {
        registered_count.fetch_add(1, Ordering::SeqCst);
    });
    let finished_count = Arc::clone(&finished);
    controller.add_callback(MapperEvent::LastImageRegistered, move |manager| {
        assert!(!manager.is_empty());
        finished_count.fetch_add(1, Ordering::SeqCst);
    });

    let manager = controller.run().unwrap();

    assert_eq!(manager.len(), 1);
    let recon = manager.get(0).unwrap();
    assert_eq!(recon.num_registered_images(), 4);
    assert!(
        recon.points3d.len() >= 100,
        "only {} points",
        recon.points3d.len()
    );
    let mean_error = recon.mean_reprojection_error();
    assert!(mean_error < 0.1, "mean reprojection error {}", mean_error);

    // Two images were registered incrementally after the initial pair.
    assert_eq!(registered.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_mean_track_length_covers_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("database.bin");
    build_scene(250, 11).database.save(&db_path).unwrap();

    let manager = IncrementalMapperController::new(&db_path, controller_options())
        .run()
        .unwrap();
    let recon = manager.get(0).unwrap();
    // Most points are visible in more than two views.
    assert!(
        recon.mean_track_length() > 2.2,
        "mean track length {}",
        recon.mean_track_length()
    );
}

#[test]
fn test_resume_keeps_model() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("database.bin");
    build_scene(200, 3).database.save(&db_path).unwrap();

    let manager = IncrementalMapperController::new(&db_path, controller_options())
        .run()
        .unwrap();
    let model_path = dir.path().join("model");
    std::fs::create_dir(&model_path).unwrap();
    manager.get(0).unwrap().write(&model_path).unwrap();

    // Reload the model and continue: everything is already registered, so
    // the resumed run must terminate with the same image set.
    let mut resumed = aperture_sfm::ReconstructionManager::new();
    resumed.read(&model_path).unwrap();
    let controller = IncrementalMapperController::with_manager(
        &db_path,
        controller_options(),
        resumed,
    );
    let manager2 = controller.run().unwrap();
    assert_eq!(manager2.len(), 1);
    assert_eq!(
        manager2.get(0).unwrap().num_registered_images(),
        manager.get(0).unwrap().num_registered_images()
    );
}

#[test]
fn test_no_geometry_yields_no_model() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("database.bin");

    // A database with images but no verified pairs cannot initialize.
    let mut db = Database::default();
    let camera_id = db.add_camera(DbCamera {
        model_id: 1,
        width: 100,
        height: 100,
        params: vec![100.0, 100.0, 50.0, 50.0],
        prior_focal_length: true,
    });
    db.add_image("a.png", camera_id);
    db.add_image("b.png", camera_id);
    db.save(&db_path).unwrap();

    let manager = IncrementalMapperController::new(&db_path, MapperControllerOptions::default())
        .run()
        .unwrap();
    assert!(manager.is_empty());
}
