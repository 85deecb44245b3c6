//! The incremental mapper: initialize from a strong pair, then register,
//! triangulate, refine and filter until no image can be added.

use std::collections::{HashMap, HashSet};

use aperture_core::{Camera, Rigid3};
use aperture_scene::{Point2, Reconstruction, SceneImage, TrackElement};
use nalgebra::Vector3;

use crate::graph::CorrespondenceGraph;
use crate::init::{estimate_relative_pose, RelativePoseOptions};
use crate::pnp::{estimate_absolute_pose, AbsolutePoseOptions};
use crate::refine::{refine_point, refine_pose, refine_reconstruction, RefineReconstructionOptions};
use crate::triangulate::{depth, triangulate_point, triangulation_angle};

/// Placeholder color for points before image colors are sampled.
const UNCOLORED: [u8; 3] = [128, 128, 128];

/// Options steering the incremental mapper.
#[derive(Debug, Clone)]
pub struct MapperOptions {
    /// Ignore pairs with fewer verified matches than this.
    pub min_num_matches: usize,
    /// Minimum two-view inliers to accept an initial pair.
    pub init_min_num_inliers: usize,
    /// Minimum median triangulation angle of an initial pair, degrees.
    pub init_min_tri_angle_deg: f64,
    /// Maximum epipolar error during initialization, pixels.
    pub init_max_error_px: f64,
    /// Maximum reprojection error for absolute pose inliers, pixels.
    pub abs_pose_max_error_px: f64,
    /// Minimum inliers to accept an absolute pose.
    pub abs_pose_min_num_inliers: usize,
    /// Registration attempts per image before it is abandoned.
    pub max_reg_trials: usize,
    /// Observation filter threshold, pixels.
    pub max_reproj_error_px: f64,
    /// Point filter threshold on the best track angle, degrees.
    pub min_tri_angle_deg: f64,
    /// RANSAC iteration cap for both estimators.
    pub ransac_max_iterations: usize,
    /// Sampling seed.
    pub seed: u64,
    /// Refine the new pose and its points after each registration.
    pub local_refine: bool,
    /// Run a global refinement when the model grew by this factor.
    pub global_refine_growth_ratio: f64,
    /// Parameters of the global refinement passes.
    pub refine: RefineReconstructionOptions,
    /// Restrict mapping to these image names.
    pub image_names: Option<HashSet<String>>,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            min_num_matches: 15,
            init_min_num_inliers: 30,
            init_min_tri_angle_deg: 6.0,
            init_max_error_px: 4.0,
            abs_pose_max_error_px: 4.0,
            abs_pose_min_num_inliers: 15,
            max_reg_trials: 2,
            max_reproj_error_px: 4.0,
            min_tri_angle_deg: 1.5,
            ransac_max_iterations: 1000,
            seed: 42,
            local_refine: true,
            global_refine_growth_ratio: 1.3,
            refine: RefineReconstructionOptions::default(),
            image_names: None,
        }
    }
}

/// Incrementally grows one reconstruction over a correspondence graph.
pub struct IncrementalMapper<'a> {
    graph: &'a CorrespondenceGraph,
    options: MapperOptions,
    /// The reconstruction being grown.
    pub recon: Reconstruction,
    tried_init_pairs: HashSet<(u32, u32)>,
    excluded_images: HashSet<u32>,
    failed_registrations: HashMap<u32, usize>,
    num_images_at_last_global: usize,
}

impl<'a> IncrementalMapper<'a> {
    /// Creates a mapper; `excluded_images` are never registered (images
    /// already claimed by earlier models).
    pub fn new(
        graph: &'a CorrespondenceGraph,
        options: MapperOptions,
        excluded_images: HashSet<u32>,
    ) -> Self {
        Self {
            graph,
            options,
            recon: Reconstruction::new(),
            tried_init_pairs: HashSet::new(),
            excluded_images,
            failed_registrations: HashMap::new(),
            num_images_at_last_global: 0,
        }
    }

    /// Creates a mapper that continues registering into an existing model.
    pub fn resume(
        graph: &'a CorrespondenceGraph,
        options: MapperOptions,
        recon: Reconstruction,
        excluded_images: &HashSet<u32>,
    ) -> Self {
        let num_registered = recon.num_registered_images();
        let mut excluded: HashSet<u32> = excluded_images.clone();
        for &image_id in recon.registered_image_ids() {
            excluded.remove(&image_id);
        }
        Self {
            graph,
            options,
            recon,
            tried_init_pairs: HashSet::new(),
            excluded_images: excluded,
            failed_registrations: HashMap::new(),
            num_images_at_last_global: num_registered.max(1),
        }
    }

    fn allowed(&self, image_id: u32) -> bool {
        if self.excluded_images.contains(&image_id) {
            return false;
        }
        match (&self.options.image_names, self.graph.images.get(&image_id)) {
            (Some(names), Some(node)) => names.contains(&node.name),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    fn normalized(&self, camera: &Camera, xy: &[f64; 2]) -> [f64; 2] {
        let (u, v) = camera.cam_from_img(xy[0], xy[1]);
        [u, v]
    }

    /// Attempts initialization over pairs ordered by match strength.
    ///
    /// Returns the registered pair on success.
    pub fn initialize(&mut self) -> Option<(u32, u32)> {
        let pairs = self.graph.pairs_by_strength();
        for (id1, id2, num_matches) in pairs {
            if num_matches < self.options.min_num_matches.max(self.options.init_min_num_inliers) {
                continue;
            }
            if !self.allowed(id1) || !self.allowed(id2) {
                continue;
            }
            if !self.tried_init_pairs.insert((id1, id2)) {
                continue;
            }
            if self.try_initialize(id1, id2) {
                log::info!("Initialized model from pair ({}, {})", id1, id2);
                return Some((id1, id2));
            }
        }
        None
    }

    fn try_initialize(&mut self, id1: u32, id2: u32) -> bool {
        let (Some(camera1), Some(camera2)) = (self.graph.camera_of(id1), self.graph.camera_of(id2))
        else {
            return false;
        };
        let node1 = &self.graph.images[&id1];
        let node2 = &self.graph.images[&id2];
        let matches = self.graph.matches_between(id1, id2);

        let norm1: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(a, _)| self.normalized(camera1, &node1.keypoints[a as usize]))
            .collect();
        let norm2: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(_, b)| self.normalized(camera2, &node2.keypoints[b as usize]))
            .collect();

        let mean_focal = (camera1.mean_focal_length() + camera2.mean_focal_length()) / 2.0;
        let pose_options = RelativePoseOptions {
            max_error: self.options.init_max_error_px / mean_focal,
            confidence: 0.999,
            max_iterations: self.options.ransac_max_iterations,
            seed: self.options.seed,
        };
        let Some(two_view) = estimate_relative_pose(&norm1, &norm2, &pose_options) else {
            return false;
        };
        if two_view.inliers.len() < self.options.init_min_num_inliers {
            return false;
        }
        if two_view.median_tri_angle < self.options.init_min_tri_angle_deg.to_radians() {
            log::debug!(
                "Pair ({}, {}) rejected: triangulation angle {:.2} deg too small",
                id1,
                id2,
                two_view.median_tri_angle.to_degrees()
            );
            return false;
        }

        self.recon.add_camera(camera1.clone());
        self.recon.add_camera(camera2.clone());
        self.add_image_to_recon(id1, Rigid3::identity());
        self.add_image_to_recon(id2, two_view.cam2_from_cam1);

        // Triangulate the verified inliers.
        let pose1 = Rigid3::identity();
        let pose2 = two_view.cam2_from_cam1;
        let proj1 = pose1.matrix3x4();
        let proj2 = pose2.matrix3x4();
        let max_error1 = self.options.max_reproj_error_px / camera1.mean_focal_length();
        let max_error2 = self.options.max_reproj_error_px / camera2.mean_focal_length();
        let min_angle = self.options.min_tri_angle_deg.to_radians();
        let center2 = pose2.projection_center();

        let mut num_points = 0;
        for &i in &two_view.inliers {
            let Some(point) = triangulate_point(&proj1, &proj2, &norm1[i], &norm2[i]) else {
                continue;
            };
            if depth(&pose1, &point) <= 0.0 || depth(&pose2, &point) <= 0.0 {
                continue;
            }
            if triangulation_angle(&Vector3::zeros(), &center2, &point) < min_angle {
                continue;
            }
            if !reprojects_within(&pose1, &point, &norm1[i], max_error1)
                || !reprojects_within(&pose2, &point, &norm2[i], max_error2)
            {
                continue;
            }
            let (idx1, idx2) = matches[i];
            self.recon.add_point3d(
                [point.x, point.y, point.z],
                UNCOLORED,
                vec![
                    TrackElement {
                        image_id: id1,
                        point2_idx: idx1,
                    },
                    TrackElement {
                        image_id: id2,
                        point2_idx: idx2,
                    },
                ],
            );
            num_points += 1;
        }

        if num_points < self.options.init_min_num_inliers / 2 {
            // Unstable pair: roll back.
            self.recon = Reconstruction::new();
            return false;
        }

        self.num_images_at_last_global = 2;
        true
    }

    fn add_image_to_recon(&mut self, image_id: u32, pose: Rigid3) {
        let node = &self.graph.images[&image_id];
        self.recon.add_image(SceneImage {
            image_id,
            camera_id: node.camera_id,
            name: node.name.clone(),
            cam_from_world: pose,
            points2: node
                .keypoints
                .iter()
                .map(|&xy| Point2 {
                    xy,
                    point3d_id: None,
                })
                .collect(),
        });
    }

    /// 2D-3D correspondences of an unregistered image via its registered
    /// neighbors, deduplicated per (feature, point) pair.
    fn collect_correspondences(&self, image_id: u32) -> Vec<(u32, u64)> {
        let mut seen = HashSet::new();
        let mut correspondences = Vec::new();
        for neighbor in self.graph.neighbors(image_id) {
            if !self.recon.is_registered(neighbor) {
                continue;
            }
            let neighbor_image = &self.recon.images[&neighbor];
            for (own_idx, other_idx) in self.graph.matches_between(image_id, neighbor) {
                if let Some(point3d_id) =
                    neighbor_image.points2[other_idx as usize].point3d_id
                {
                    if seen.insert((own_idx, point3d_id)) {
                        correspondences.push((own_idx, point3d_id));
                    }
                }
            }
        }
        correspondences
    }

    /// Ranks unregistered images by visible-point count and registers the
    /// best one that passes absolute pose estimation.
    pub fn register_next_image(&mut self) -> Option<u32> {
        let mut candidates: Vec<(usize, u32)> = self
            .graph
            .images
            .keys()
            .filter(|&&id| {
                !self.recon.is_registered(id)
                    && self.allowed(id)
                    && self.failed_registrations.get(&id).copied().unwrap_or(0)
                        < self.options.max_reg_trials
            })
            .map(|&id| (self.collect_correspondences(id).len(), id))
            .filter(|&(count, _)| count >= self.options.abs_pose_min_num_inliers)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (num_visible, image_id) in candidates {
            log::debug!(
                "Trying to register image {} ({} visible points)",
                image_id,
                num_visible
            );
            if self.try_register(image_id) {
                self.maybe_global_refine();
                return Some(image_id);
            }
            *self.failed_registrations.entry(image_id).or_insert(0) += 1;
        }
        None
    }

    fn try_register(&mut self, image_id: u32) -> bool {
        let Some(camera) = self.graph.camera_of(image_id) else {
            return false;
        };
        let node = &self.graph.images[&image_id];
        let correspondences = self.collect_correspondences(image_id);

        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        for &(own_idx, point3d_id) in &correspondences {
            let Some(point) = self.recon.points3d.get(&point3d_id) else {
                continue;
            };
            points3d.push(Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]));
            points2d.push(self.normalized(camera, &node.keypoints[own_idx as usize]));
        }
        if points3d.len() < self.options.abs_pose_min_num_inliers {
            return false;
        }

        let pose_options = AbsolutePoseOptions {
            max_error: self.options.abs_pose_max_error_px / camera.mean_focal_length(),
            confidence: 0.999,
            max_iterations: self.options.ransac_max_iterations,
            seed: self.options.seed,
            refinement: self.options.refine.lm.clone(),
        };
        let Some((pose, inliers)) = estimate_absolute_pose(&points3d, &points2d, &pose_options)
        else {
            return false;
        };
        if inliers.len() < self.options.abs_pose_min_num_inliers {
            return false;
        }

        self.recon.add_camera(camera.clone());
        self.add_image_to_recon(image_id, pose);

        // Continue the inlier tracks into the new image.
        let max_error = self.options.abs_pose_max_error_px / camera.mean_focal_length();
        for &k in &inliers {
            let (own_idx, point3d_id) = correspondences[k];
            let still_free = self.recon.images[&image_id].points2[own_idx as usize]
                .point3d_id
                .is_none();
            if !still_free || !self.recon.points3d.contains_key(&point3d_id) {
                continue;
            }
            if !reprojects_within(&pose, &points3d[k], &points2d[k], max_error) {
                continue;
            }
            self.recon.add_observation(
                point3d_id,
                TrackElement {
                    image_id,
                    point2_idx: own_idx,
                },
            );
        }

        let num_new = self.triangulate_image(image_id);
        log::info!(
            "Registered image {} ({} inliers, {} new points)",
            image_id,
            inliers.len(),
            num_new
        );

        if self.options.local_refine {
            self.local_refine(image_id);
        }
        true
    }

    /// Triangulates new tracks and continues existing ones for a freshly
    /// registered image. Returns the number of new points.
    pub fn triangulate_image(&mut self, image_id: u32) -> usize {
        let camera = self.graph.camera_of(image_id).cloned().expect("registered image");
        let pose = self.recon.images[&image_id].cam_from_world;
        let proj = pose.matrix3x4();
        let center = pose.projection_center();
        let max_error = self.options.max_reproj_error_px / camera.mean_focal_length();
        let min_angle = self.options.min_tri_angle_deg.to_radians();

        let mut num_new = 0;
        for neighbor in self.graph.neighbors(image_id) {
            if neighbor == image_id || !self.recon.is_registered(neighbor) {
                continue;
            }
            let neighbor_camera = self.graph.camera_of(neighbor).cloned().expect("camera");
            let neighbor_pose = self.recon.images[&neighbor].cam_from_world;
            let neighbor_proj = neighbor_pose.matrix3x4();
            let neighbor_center = neighbor_pose.projection_center();
            let neighbor_max_error =
                self.options.max_reproj_error_px / neighbor_camera.mean_focal_length();

            for (own_idx, other_idx) in self.graph.matches_between(image_id, neighbor) {
                let own_point3d =
                    self.recon.images[&image_id].points2[own_idx as usize].point3d_id;
                let other_point3d =
                    self.recon.images[&neighbor].points2[other_idx as usize].point3d_id;

                match (own_point3d, other_point3d) {
                    (Some(_), _) => {}
                    (None, Some(point3d_id)) => {
                        // Continue the existing track into this image.
                        let Some(point) = self.recon.points3d.get(&point3d_id) else {
                            continue;
                        };
                        let position =
                            Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]);
                        let own_norm = self.normalized(
                            &camera,
                            &self.graph.images[&image_id].keypoints[own_idx as usize],
                        );
                        if reprojects_within(&pose, &position, &own_norm, max_error) {
                            self.recon.add_observation(
                                point3d_id,
                                TrackElement {
                                    image_id,
                                    point2_idx: own_idx,
                                },
                            );
                        }
                    }
                    (None, None) => {
                        let own_norm = self.normalized(
                            &camera,
                            &self.graph.images[&image_id].keypoints[own_idx as usize],
                        );
                        let other_norm = self.normalized(
                            &neighbor_camera,
                            &self.graph.images[&neighbor].keypoints[other_idx as usize],
                        );
                        let Some(point) =
                            triangulate_point(&proj, &neighbor_proj, &own_norm, &other_norm)
                        else {
                            continue;
                        };
                        if depth(&pose, &point) <= 0.0 || depth(&neighbor_pose, &point) <= 0.0 {
                            continue;
                        }
                        if triangulation_angle(&center, &neighbor_center, &point) < min_angle {
                            continue;
                        }
                        if !reprojects_within(&pose, &point, &own_norm, max_error)
                            || !reprojects_within(
                                &neighbor_pose,
                                &point,
                                &other_norm,
                                neighbor_max_error,
                            )
                        {
                            continue;
                        }
                        self.recon.add_point3d(
                            [point.x, point.y, point.z],
                            UNCOLORED,
                            vec![
                                TrackElement {
                                    image_id,
                                    point2_idx: own_idx,
                                },
                                TrackElement {
                                    image_id: neighbor,
                                    point2_idx: other_idx,
                                },
                            ],
                        );
                        num_new += 1;
                    }
                }
            }
        }
        num_new
    }

    fn local_refine(&mut self, image_id: u32) {
        let Some(camera) = self.recon.cameras.get(
            &self.recon.images[&image_id].camera_id,
        ) else {
            return;
        };
        let camera = camera.clone();

        // Pose against its own observations.
        let image = &self.recon.images[&image_id];
        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        let mut observed_points = Vec::new();
        for point2 in image.points2.iter() {
            let Some(point3d_id) = point2.point3d_id else {
                continue;
            };
            let Some(point) = self.recon.points3d.get(&point3d_id) else {
                continue;
            };
            observed_points.push(point3d_id);
            points3d.push(Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]));
            points2d.push(self.normalized(&camera, &point2.xy));
        }
        if points3d.len() >= 6 {
            let mut pose = self.recon.images[&image_id].cam_from_world;
            refine_pose(&points3d, &points2d, &mut pose, &self.options.refine.lm);
            self.recon.images.get_mut(&image_id).unwrap().cam_from_world = pose;
        }

        // Polish the points this image observes.
        for point3d_id in observed_points {
            let Some(point) = self.recon.points3d.get(&point3d_id) else {
                continue;
            };
            let mut poses = Vec::new();
            let mut observations = Vec::new();
            for element in &point.track {
                let Some(track_image) = self.recon.images.get(&element.image_id) else {
                    continue;
                };
                let Some(track_camera) = self.recon.cameras.get(&track_image.camera_id) else {
                    continue;
                };
                poses.push(track_image.cam_from_world);
                observations.push(self.normalized(
                    track_camera,
                    &track_image.points2[element.point2_idx as usize].xy,
                ));
            }
            if poses.len() < 2 {
                continue;
            }
            let current = self.recon.points3d[&point3d_id].xyz;
            let mut position = Vector3::new(current[0], current[1], current[2]);
            refine_point(&poses, &observations, &mut position, &self.options.refine.lm);
            self.recon.points3d.get_mut(&point3d_id).unwrap().xyz =
                [position.x, position.y, position.z];
        }
    }

    fn maybe_global_refine(&mut self) {
        let num_images = self.recon.num_registered_images();
        if (num_images as f64)
            >= self.num_images_at_last_global as f64 * self.options.global_refine_growth_ratio
        {
            log::info!("Global refinement at {} images", num_images);
            refine_reconstruction(&mut self.recon, &self.options.refine);
            self.filter_points();
            self.num_images_at_last_global = num_images;
        }
    }

    /// Removes high-error observations and badly conditioned points.
    ///
    /// Returns the number of deleted observations.
    pub fn filter_points(&mut self) -> usize {
        let max_error = self.options.max_reproj_error_px;
        let min_angle = self.options.min_tri_angle_deg.to_radians();

        let mut to_delete: Vec<(u64, u32, u32)> = Vec::new();
        let mut points_to_drop: Vec<u64> = Vec::new();

        for (&point3d_id, point) in &self.recon.points3d {
            let position = Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]);
            let mut centers = Vec::new();
            for element in &point.track {
                let image = &self.recon.images[&element.image_id];
                let behind = depth(&image.cam_from_world, &position) <= 0.0;
                let error = self.recon.reprojection_error(point, element);
                if behind || error.is_none() || error.unwrap() > max_error {
                    to_delete.push((point3d_id, element.image_id, element.point2_idx));
                } else {
                    centers.push(image.cam_from_world.projection_center());
                }
            }

            let mut best_angle = 0.0f64;
            for i in 0..centers.len() {
                for j in i + 1..centers.len() {
                    best_angle =
                        best_angle.max(triangulation_angle(&centers[i], &centers[j], &position));
                }
            }
            if best_angle < min_angle {
                points_to_drop.push(point3d_id);
            }
        }

        let num_filtered = to_delete.len();
        for (point3d_id, image_id, point2_idx) in to_delete {
            self.recon.delete_observation(point3d_id, image_id, point2_idx);
        }
        for point3d_id in points_to_drop {
            self.recon.delete_point3d(point3d_id);
        }
        num_filtered
    }

    /// Final global refinement, filtering and error bookkeeping.
    pub fn finalize(&mut self) {
        refine_reconstruction(&mut self.recon, &self.options.refine);
        let num_filtered = self.filter_points();
        self.recon.update_point_errors();
        log::info!(
            "Model finalized: {} images, {} points ({} observations filtered)",
            self.recon.num_registered_images(),
            self.recon.points3d.len(),
            num_filtered
        );
    }
}

fn reprojects_within(
    pose: &Rigid3,
    point: &Vector3<f64>,
    observed: &[f64; 2],
    max_error: f64,
) -> bool {
    crate::triangulate::reprojection_error_normalized(pose, point, observed)
        .is_some_and(|e| e < max_error)
}
