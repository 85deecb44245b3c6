//! CPU patch-match stereo over a dense workspace.
//!
//! Per-pixel plane hypotheses (depth + normal in the reference camera
//! frame) are initialized randomly, then improved by alternating forward
//! and backward propagation sweeps with random refinement. Matching cost is
//! one minus the normalized cross-correlation of plane-warped windows,
//! averaged over the best half of the source images.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use aperture_core::{Camera, Rigid3};
use aperture_image::{Bitmap, GrayBuffer};
use nalgebra::{Matrix3, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::depth_map::BinaryMap;
use crate::error::MvsError;
use crate::workspace::Workspace;

const MAX_COST: f64 = 2.0;

/// Options for patch-match stereo.
#[derive(Debug, Clone)]
pub struct PatchMatchOptions {
    /// Half window size of the matching patch.
    pub window_radius: usize,
    /// Sampling step inside the window.
    pub window_step: usize,
    /// Number of propagation sweeps.
    pub num_iterations: usize,
    /// Number of source images per reference image.
    pub max_num_src_images: usize,
    /// Depth range lower bound; non-positive derives it from the model.
    pub depth_min: f64,
    /// Depth range upper bound; non-positive derives it from the model.
    pub depth_max: f64,
    /// Cost threshold above which a pixel keeps no depth.
    pub max_cost: f64,
    /// Write geometric maps filtered by cross-view depth consistency.
    pub geom_consistency: bool,
    /// Maximum relative depth difference for geometric consistency.
    pub geom_max_rel_depth_error: f64,
    /// Minimum number of consistent source views.
    pub geom_min_consistent: usize,
    /// Sampling seed.
    pub seed: u64,
}

impl Default for PatchMatchOptions {
    fn default() -> Self {
        Self {
            window_radius: 5,
            window_step: 2,
            num_iterations: 5,
            max_num_src_images: 8,
            depth_min: -1.0,
            depth_max: -1.0,
            max_cost: 1.2,
            geom_consistency: true,
            geom_max_rel_depth_error: 0.01,
            geom_min_consistent: 2,
            seed: 0,
        }
    }
}

/// One line pair of the stereo configuration: a reference image and its
/// source selection.
#[derive(Debug, Clone)]
enum SourceSpec {
    Auto(usize),
    Named(Vec<String>),
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    reference: String,
    sources: SourceSpec,
}

fn read_config(path: &PathBuf) -> Result<Vec<ConfigEntry>, MvsError> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    let mut entries = Vec::new();
    for chunk in lines.chunks(2) {
        if chunk.len() != 2 {
            break;
        }
        let sources = if chunk[1].starts_with("__auto__") {
            let count = chunk[1]
                .split(',')
                .nth(1)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(20);
            SourceSpec::Auto(count)
        } else {
            SourceSpec::Named(
                chunk[1]
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )
        };
        entries.push(ConfigEntry {
            reference: chunk[0].clone(),
            sources,
        });
    }
    Ok(entries)
}

struct ViewData {
    camera: Camera,
    pose: Rigid3,
    gray: GrayBuffer,
}

/// A per-pixel plane hypothesis.
#[derive(Debug, Clone, Copy)]
struct Plane {
    depth: f64,
    normal: Vector3<f64>,
}

/// Computes photometric (and optionally geometric) depth and normal maps
/// for every configured reference image.
pub struct PatchMatchController {
    workspace: Workspace,
    options: PatchMatchOptions,
}

impl PatchMatchController {
    /// Creates a controller over a loaded workspace.
    pub fn new(workspace: Workspace, options: PatchMatchOptions) -> Self {
        Self { workspace, options }
    }

    /// Runs stereo for all reference images and writes the maps.
    pub fn run(self) -> Result<(), MvsError> {
        std::fs::create_dir_all(self.workspace.depth_map_dir())?;
        std::fs::create_dir_all(self.workspace.normal_map_dir())?;

        let config_path = self.workspace.patch_match_config_file();
        let entries = if config_path.is_file() {
            read_config(&config_path)?
        } else {
            self.workspace
                .image_names
                .iter()
                .map(|(_, name)| ConfigEntry {
                    reference: name.clone(),
                    sources: SourceSpec::Auto(self.options.max_num_src_images),
                })
                .collect()
        };

        let name_to_id: HashMap<&str, u32> = self
            .workspace
            .image_names
            .iter()
            .map(|(id, name)| (name.as_str(), *id))
            .collect();

        entries.par_iter().try_for_each(|entry| {
            let Some(&ref_id) = name_to_id.get(entry.reference.as_str()) else {
                log::warn!("stereo config references unknown image {}", entry.reference);
                return Ok(());
            };
            let src_ids = self.select_sources(ref_id, &entry.sources, &name_to_id);
            if src_ids.is_empty() {
                log::warn!("no source images for {}", entry.reference);
                return Ok(());
            }
            log::info!(
                "Patch-match stereo for {} with {} sources",
                entry.reference,
                src_ids.len()
            );
            self.process_reference(ref_id, &entry.reference, &src_ids)
        })?;

        if self.options.geom_consistency {
            self.geometric_filter(&entries, &name_to_id)?;
        }
        Ok(())
    }

    /// Ranks candidate sources by shared sparse points.
    fn select_sources(
        &self,
        ref_id: u32,
        spec: &SourceSpec,
        name_to_id: &HashMap<&str, u32>,
    ) -> Vec<u32> {
        match spec {
            SourceSpec::Named(names) => names
                .iter()
                .filter_map(|n| name_to_id.get(n.as_str()).copied())
                .filter(|&id| id != ref_id)
                .collect(),
            SourceSpec::Auto(count) => {
                let mut shared: HashMap<u32, usize> = HashMap::new();
                for point in self.workspace.model.points3d.values() {
                    let sees_ref = point.track.iter().any(|el| el.image_id == ref_id);
                    if !sees_ref {
                        continue;
                    }
                    for element in &point.track {
                        if element.image_id != ref_id {
                            *shared.entry(element.image_id).or_insert(0) += 1;
                        }
                    }
                }
                let mut ranked: Vec<(usize, u32)> =
                    shared.into_iter().map(|(id, n)| (n, id)).collect();
                ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                let mut ids: Vec<u32> = ranked.into_iter().map(|(_, id)| id).collect();
                if ids.is_empty() {
                    // No sparse support (e.g. PMVS workspaces): use every
                    // other image in model order.
                    ids = self
                        .workspace
                        .image_names
                        .iter()
                        .map(|(id, _)| *id)
                        .filter(|&id| id != ref_id)
                        .collect();
                }
                ids.truncate(*count);
                ids
            }
        }
    }

    fn load_view(&self, image_id: u32) -> Result<ViewData, MvsError> {
        let image = &self.workspace.model.images[&image_id];
        let camera = self
            .workspace
            .camera_of(image_id)
            .cloned()
            .expect("camera of posed image");
        let bitmap = Bitmap::load(self.workspace.image_file(&image.name))?;
        Ok(ViewData {
            camera,
            pose: image.cam_from_world,
            gray: bitmap.to_gray(),
        })
    }

    /// Depth range from the sparse points observed by the reference image.
    fn depth_range(&self, ref_id: u32, ref_pose: &Rigid3) -> (f64, f64) {
        if self.options.depth_min > 0.0 && self.options.depth_max > self.options.depth_min {
            return (self.options.depth_min, self.options.depth_max);
        }
        let mut depths: Vec<f64> = self
            .workspace
            .model
            .points3d
            .values()
            .filter(|p| p.track.iter().any(|el| el.image_id == ref_id))
            .map(|p| {
                ref_pose
                    .transform_point(&Vector3::new(p.xyz[0], p.xyz[1], p.xyz[2]))
                    .z
            })
            .filter(|&d| d > 0.0)
            .collect();
        if depths.is_empty() {
            return (0.1, 100.0);
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let lo = depths[(depths.len() as f64 * 0.02) as usize];
        let hi = depths[((depths.len() as f64 * 0.98) as usize).min(depths.len() - 1)];
        (lo * 0.75, hi * 1.25)
    }

    fn process_reference(
        &self,
        ref_id: u32,
        ref_name: &str,
        src_ids: &[u32],
    ) -> Result<(), MvsError> {
        let reference = self.load_view(ref_id)?;
        let sources: Vec<ViewData> = src_ids
            .iter()
            .map(|&id| self.load_view(id))
            .collect::<Result<Vec<_>, _>>()?;
        let (depth_min, depth_max) = self.depth_range(ref_id, &reference.pose);

        let width = reference.gray.width();
        let height = reference.gray.height();
        let mut rng = StdRng::seed_from_u64(self.options.seed ^ ref_id as u64);

        // Precompute source-from-reference relative transforms and the
        // intrinsic matrices for plane homographies.
        let ref_k_inv = intrinsics(&reference.camera).try_inverse().expect("invertible K");
        let relative: Vec<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> = sources
            .iter()
            .map(|src| {
                let src_from_ref = src.pose.compose(&reference.pose.inverse());
                (
                    src_from_ref.rotation_matrix(),
                    src_from_ref.translation,
                    intrinsics(&src.camera),
                )
            })
            .collect();

        let mut planes: Vec<Plane> = (0..width * height)
            .map(|_| random_plane(&mut rng, depth_min, depth_max))
            .collect();
        let mut costs: Vec<f64> = vec![MAX_COST; width * height];
        for y in 0..height {
            for x in 0..width {
                costs[y * width + x] = self.plane_cost(
                    &reference,
                    &relative,
                    &ref_k_inv,
                    x,
                    y,
                    &planes[y * width + x],
                    &sources,
                );
            }
        }

        for iteration in 0..self.options.num_iterations {
            let forward = iteration % 2 == 0;
            let ys: Vec<usize> = if forward {
                (0..height).collect()
            } else {
                (0..height).rev().collect()
            };
            for y in ys {
                let xs: Vec<usize> = if forward {
                    (0..width).collect()
                } else {
                    (0..width).rev().collect()
                };
                for x in xs {
                    let idx = y * width + x;
                    let mut best_plane = planes[idx];
                    let mut best_cost = costs[idx];

                    // Spatial propagation from the already-updated
                    // neighbors of this sweep.
                    let neighbor_offsets: [(i64, i64); 2] = if forward {
                        [(-1, 0), (0, -1)]
                    } else {
                        [(1, 0), (0, 1)]
                    };
                    for (dx, dy) in neighbor_offsets {
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx as usize >= width || ny as usize >= height {
                            continue;
                        }
                        let candidate = planes[ny as usize * width + nx as usize];
                        let cost = self.plane_cost(
                            &reference, &relative, &ref_k_inv, x, y, &candidate, &sources,
                        );
                        if cost < best_cost {
                            best_cost = cost;
                            best_plane = candidate;
                        }
                    }

                    // Random refinement with shrinking search range, plus a
                    // fronto-parallel probe and a fresh random sample.
                    let range = (depth_max - depth_min) * 0.5f64.powi(iteration as i32 + 1);
                    let candidates = [
                        Plane {
                            depth: (best_plane.depth
                                + rng.random_range(-range..range))
                            .clamp(depth_min, depth_max),
                            normal: best_plane.normal,
                        },
                        Plane {
                            depth: best_plane.depth,
                            normal: perturb_normal(&mut rng, &best_plane.normal, 0.2),
                        },
                        Plane {
                            depth: best_plane.depth,
                            normal: Vector3::new(0.0, 0.0, -1.0),
                        },
                        random_plane(&mut rng, depth_min, depth_max),
                    ];
                    for candidate in candidates {
                        let cost = self.plane_cost(
                            &reference, &relative, &ref_k_inv, x, y, &candidate, &sources,
                        );
                        if cost < best_cost {
                            best_cost = cost;
                            best_plane = candidate;
                        }
                    }

                    planes[idx] = best_plane;
                    costs[idx] = best_cost;
                }
            }
        }

        let mut depth_map = BinaryMap::new(width, height, 1);
        let mut normal_map = BinaryMap::new(width, height, 3);
        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                if costs[idx] <= self.options.max_cost {
                    depth_map.set(x, y, 0, planes[idx].depth as f32);
                    for c in 0..3 {
                        normal_map.set(x, y, c, planes[idx].normal[c] as f32);
                    }
                }
            }
        }
        depth_map.write(self.workspace.depth_map_file(ref_name, "photometric"))?;
        normal_map.write(self.workspace.normal_map_file(ref_name, "photometric"))?;
        Ok(())
    }

    /// Matching cost of one plane hypothesis, averaged over the best half
    /// of the source views.
    #[allow(clippy::too_many_arguments)]
    fn plane_cost(
        &self,
        reference: &ViewData,
        relative: &[(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)],
        ref_k_inv: &Matrix3<f64>,
        x: usize,
        y: usize,
        plane: &Plane,
        sources: &[ViewData],
    ) -> f64 {
        if plane.depth <= 0.0 {
            return MAX_COST;
        }
        // Point on the plane in reference camera coordinates.
        let pixel = Vector3::new(x as f64 + 0.5, y as f64 + 0.5, 1.0);
        let ray = ref_k_inv * pixel;
        let point = ray * (plane.depth / ray.z);
        let plane_d = plane.normal.dot(&point);
        if plane_d.abs() < 1e-9 {
            return MAX_COST;
        }

        let mut view_costs: Vec<f64> = Vec::with_capacity(sources.len());
        for ((r, t, k_src), source) in relative.iter().zip(sources.iter()) {
            let h = k_src * (r + t * plane.normal.transpose() / plane_d) * ref_k_inv;
            view_costs.push(self.ncc_cost(&reference.gray, &source.gray, x, y, &h));
        }
        view_costs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let keep = view_costs.len().div_ceil(2);
        view_costs.truncate(keep);
        view_costs.iter().sum::<f64>() / keep as f64
    }

    /// One minus the NCC between the reference window and its warp in the
    /// source image.
    fn ncc_cost(
        &self,
        ref_gray: &GrayBuffer,
        src_gray: &GrayBuffer,
        x: usize,
        y: usize,
        h: &Matrix3<f64>,
    ) -> f64 {
        let radius = self.options.window_radius as i64;
        let step = self.options.window_step.max(1) as i64;

        let mut sum_r = 0.0;
        let mut sum_s = 0.0;
        let mut sum_rr = 0.0;
        let mut sum_ss = 0.0;
        let mut sum_rs = 0.0;
        let mut n = 0.0;

        let mut dy = -radius;
        while dy <= radius {
            let mut dx = -radius;
            while dx <= radius {
                let rx = x as i64 + dx;
                let ry = y as i64 + dy;
                let Some(rv) = ref_gray.get_checked(rx, ry) else {
                    dx += step;
                    continue;
                };
                let warped = h * Vector3::new(rx as f64 + 0.5, ry as f64 + 0.5, 1.0);
                if warped.z.abs() < 1e-12 {
                    return MAX_COST;
                }
                let sx = warped.x / warped.z - 0.5;
                let sy = warped.y / warped.z - 0.5;
                let Some(sv) = src_gray.bilinear(sx, sy) else {
                    dx += step;
                    continue;
                };
                let rv = rv as f64;
                sum_r += rv;
                sum_s += sv;
                sum_rr += rv * rv;
                sum_ss += sv * sv;
                sum_rs += rv * sv;
                n += 1.0;
                dx += step;
            }
            dy += step;
        }

        if n < 5.0 {
            return MAX_COST;
        }
        let var_r = sum_rr - sum_r * sum_r / n;
        let var_s = sum_ss - sum_s * sum_s / n;
        if var_r < 1e-8 || var_s < 1e-8 {
            return MAX_COST;
        }
        let covar = sum_rs - sum_r * sum_s / n;
        let ncc = (covar / (var_r * var_s).sqrt()).clamp(-1.0, 1.0);
        1.0 - ncc
    }

    /// Filters photometric maps by cross-view depth agreement and writes
    /// the geometric maps.
    fn geometric_filter(
        &self,
        entries: &[ConfigEntry],
        name_to_id: &HashMap<&str, u32>,
    ) -> Result<(), MvsError> {
        // Load all photometric maps once.
        let mut maps: HashMap<u32, BinaryMap> = HashMap::new();
        for (id, name) in &self.workspace.image_names {
            let path = self.workspace.depth_map_file(name, "photometric");
            if path.is_file() {
                maps.insert(*id, BinaryMap::read(&path)?);
            }
        }

        for entry in entries {
            let Some(&ref_id) = name_to_id.get(entry.reference.as_str()) else {
                continue;
            };
            let Some(ref_depths) = maps.get(&ref_id) else {
                continue;
            };
            let ref_image = &self.workspace.model.images[&ref_id];
            let ref_camera = self.workspace.camera_of(ref_id).expect("camera");
            let ref_pose = ref_image.cam_from_world;
            let world_from_ref = ref_pose.inverse();
            let src_ids = self.select_sources(ref_id, &entry.sources, name_to_id);

            let width = ref_depths.width();
            let height = ref_depths.height();
            let mut filtered = BinaryMap::new(width, height, 1);

            for y in 0..height {
                for x in 0..width {
                    let depth = ref_depths.get(x, y, 0) as f64;
                    if depth <= 0.0 {
                        continue;
                    }
                    let (u, v) = ref_camera.cam_from_img(x as f64 + 0.5, y as f64 + 0.5);
                    let world = world_from_ref
                        .transform_point(&Vector3::new(u * depth, v * depth, depth));

                    let mut consistent = 0;
                    for &src_id in &src_ids {
                        let Some(src_depths) = maps.get(&src_id) else {
                            continue;
                        };
                        let src_image = &self.workspace.model.images[&src_id];
                        let src_camera = self.workspace.camera_of(src_id).expect("camera");
                        let cam = src_image.cam_from_world.transform_point(&world);
                        if cam.z <= 0.0 {
                            continue;
                        }
                        let Some((px, py)) = src_camera.project(&[cam.x, cam.y, cam.z]) else {
                            continue;
                        };
                        let sx = px as i64;
                        let sy = py as i64;
                        if sx < 0
                            || sy < 0
                            || sx as usize >= src_depths.width()
                            || sy as usize >= src_depths.height()
                        {
                            continue;
                        }
                        let src_depth = src_depths.get(sx as usize, sy as usize, 0) as f64;
                        if src_depth <= 0.0 {
                            continue;
                        }
                        if ((cam.z - src_depth) / src_depth).abs()
                            < self.options.geom_max_rel_depth_error
                        {
                            consistent += 1;
                        }
                    }
                    if consistent >= self.options.geom_min_consistent {
                        filtered.set(x, y, 0, depth as f32);
                    }
                }
            }

            filtered.write(self.workspace.depth_map_file(&entry.reference, "geometric"))?;
            // Normals pass through unchanged for surviving pixels.
            let photometric_normals =
                BinaryMap::read(self.workspace.normal_map_file(&entry.reference, "photometric"))?;
            let mut geometric_normals = BinaryMap::new(width, height, 3);
            for y in 0..height {
                for x in 0..width {
                    if filtered.get(x, y, 0) > 0.0 {
                        for c in 0..3 {
                            geometric_normals.set(x, y, c, photometric_normals.get(x, y, c));
                        }
                    }
                }
            }
            geometric_normals
                .write(self.workspace.normal_map_file(&entry.reference, "geometric"))?;
        }
        Ok(())
    }
}

fn intrinsics(camera: &Camera) -> Matrix3<f64> {
    let (fx, fy) = camera.focal();
    let (cx, cy) = camera.principal_point();
    Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}

fn random_plane(rng: &mut StdRng, depth_min: f64, depth_max: f64) -> Plane {
    Plane {
        depth: rng.random_range(depth_min..depth_max),
        normal: random_normal(rng),
    }
}

/// A random unit normal facing the camera (negative z).
fn random_normal(rng: &mut StdRng) -> Vector3<f64> {
    let x = rng.random_range(-1.0..1.0);
    let y = rng.random_range(-1.0..1.0);
    let z = -rng.random_range(0.2..1.0f64);
    Vector3::new(x, y, z).normalize()
}

fn perturb_normal(rng: &mut StdRng, normal: &Vector3<f64>, magnitude: f64) -> Vector3<f64> {
    let perturbed = normal
        + Vector3::new(
            rng.random_range(-magnitude..magnitude),
            rng.random_range(-magnitude..magnitude),
            rng.random_range(-magnitude..magnitude),
        );
    let perturbed = perturbed.normalize();
    if perturbed.z >= 0.0 {
        *normal
    } else {
        perturbed
    }
}
