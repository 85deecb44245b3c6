//! Fusion of per-image depth maps into a consistent point cloud.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use aperture_image::Bitmap;
use aperture_scene::PointCloud;
use nalgebra::Vector3;

use crate::depth_map::BinaryMap;
use crate::error::MvsError;
use crate::workspace::Workspace;

/// Which stereo maps to fuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoInputType {
    /// Raw patch-match output.
    Photometric,
    /// Consistency-filtered output.
    Geometric,
}

impl StereoInputType {
    /// Parses an input type name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, MvsError> {
        match value.to_lowercase().as_str() {
            "photometric" => Ok(Self::Photometric),
            "geometric" => Ok(Self::Geometric),
            _ => Err(MvsError::InvalidChoice {
                option: "input_type",
                value: value.to_string(),
                supported: "'photometric' and 'geometric'",
            }),
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::Photometric => "photometric",
            Self::Geometric => "geometric",
        }
    }
}

/// Options for stereo fusion.
#[derive(Debug, Clone)]
pub struct FusionOptions {
    /// Which maps to fuse.
    pub input_type: StereoInputType,
    /// Minimum number of agreeing pixels for a fused point.
    pub min_num_pixels: usize,
    /// Maximum relative depth difference between agreeing views.
    pub max_rel_depth_error: f64,
    /// Maximum angle between normals of agreeing views, degrees.
    pub max_normal_error_deg: f64,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            input_type: StereoInputType::Geometric,
            min_num_pixels: 3,
            max_rel_depth_error: 0.01,
            max_normal_error_deg: 15.0,
        }
    }
}

/// The fused cloud with per-point visibility.
#[derive(Debug)]
pub struct FusedCloud {
    /// Fused points with colors and normals.
    pub cloud: PointCloud,
    /// Per point, the indices of contributing images (into the workspace
    /// image order).
    pub visibility: Vec<Vec<u32>>,
}

/// Fuses all depth maps of a workspace into one point cloud.
pub struct StereoFusion {
    workspace: Workspace,
    options: FusionOptions,
}

struct FusionView {
    image_idx: u32,
    depth: BinaryMap,
    normal: BinaryMap,
    color: Bitmap,
    world_from_cam: aperture_core::Rigid3,
    cam_from_world: aperture_core::Rigid3,
    camera: aperture_core::Camera,
    visited: Vec<bool>,
}

impl StereoFusion {
    /// Creates a fusion controller over a loaded workspace.
    pub fn new(workspace: Workspace, options: FusionOptions) -> Self {
        Self { workspace, options }
    }

    /// Runs fusion over every image with a depth map.
    pub fn run(self) -> Result<FusedCloud, MvsError> {
        let suffix = self.options.input_type.suffix();
        let mut views: Vec<FusionView> = Vec::new();
        for (image_idx, (image_id, name)) in self.workspace.image_names.iter().enumerate() {
            let depth_path = self.workspace.depth_map_file(name, suffix);
            if !depth_path.is_file() {
                log::warn!("missing {} depth map for {}", suffix, name);
                continue;
            }
            let depth = BinaryMap::read(&depth_path)?;
            let normal = BinaryMap::read(self.workspace.normal_map_file(name, suffix))?;
            let color = Bitmap::load(self.workspace.image_file(name))?;
            let image = &self.workspace.model.images[image_id];
            let camera = self.workspace.camera_of(*image_id).expect("camera").clone();
            let visited = vec![false; depth.width() * depth.height()];
            views.push(FusionView {
                image_idx: image_idx as u32,
                world_from_cam: image.cam_from_world.inverse(),
                cam_from_world: image.cam_from_world,
                depth,
                normal,
                color,
                camera,
                visited,
            });
        }
        if views.is_empty() {
            return Err(MvsError::IncompleteWorkspace {
                path: self.workspace.path.clone(),
                what: format!("{} depth maps", suffix),
            });
        }

        let max_normal_error = self.options.max_normal_error_deg.to_radians();
        let mut points = Vec::new();
        let mut colors = Vec::new();
        let mut normals = Vec::new();
        let mut visibility = Vec::new();

        for seed_view in 0..views.len() {
            let (width, height) = (views[seed_view].depth.width(), views[seed_view].depth.height());
            for y in 0..height {
                for x in 0..width {
                    if views[seed_view].visited[y * width + x] {
                        continue;
                    }
                    let depth = views[seed_view].depth.get(x, y, 0) as f64;
                    if depth <= 0.0 {
                        continue;
                    }

                    let (world, world_normal, color) =
                        pixel_to_world(&views[seed_view], x, y, depth);
                    views[seed_view].visited[y * width + x] = true;

                    let mut sum_pos = world;
                    let mut sum_normal = world_normal;
                    let mut sum_color = color;
                    let mut support = vec![views[seed_view].image_idx];

                    for (other_idx, other) in views.iter_mut().enumerate() {
                        if other_idx == seed_view {
                            continue;
                        }
                        let cam = other.cam_from_world.transform_point(&world);
                        if cam.z <= 0.0 {
                            continue;
                        }
                        let Some((px, py)) = other.camera.project(&[cam.x, cam.y, cam.z])
                        else {
                            continue;
                        };
                        let (ox, oy) = (px.floor() as i64, py.floor() as i64);
                        if ox < 0
                            || oy < 0
                            || ox as usize >= other.depth.width()
                            || oy as usize >= other.depth.height()
                        {
                            continue;
                        }
                        let (ox, oy) = (ox as usize, oy as usize);
                        if other.visited[oy * other.depth.width() + ox] {
                            continue;
                        }
                        let other_depth = other.depth.get(ox, oy, 0) as f64;
                        if other_depth <= 0.0 {
                            continue;
                        }
                        if ((cam.z - other_depth) / other_depth).abs()
                            > self.options.max_rel_depth_error
                        {
                            continue;
                        }
                        let (other_world, other_normal, other_color) =
                            pixel_to_world(other, ox, oy, other_depth);
                        let cos = world_normal.dot(&other_normal).clamp(-1.0, 1.0);
                        if cos.acos() > max_normal_error {
                            continue;
                        }
                        other.visited[oy * other.depth.width() + ox] = true;
                        sum_pos += other_world;
                        sum_normal += other_normal;
                        sum_color += other_color;
                        support.push(other.image_idx);
                    }

                    if support.len() < self.options.min_num_pixels {
                        continue;
                    }
                    let n = support.len() as f64;
                    let normal = sum_normal.normalize();
                    points.push([sum_pos.x / n, sum_pos.y / n, sum_pos.z / n]);
                    normals.push([normal.x, normal.y, normal.z]);
                    colors.push([
                        (sum_color.x / n).round().clamp(0.0, 255.0) as u8,
                        (sum_color.y / n).round().clamp(0.0, 255.0) as u8,
                        (sum_color.z / n).round().clamp(0.0, 255.0) as u8,
                    ]);
                    support.sort_unstable();
                    visibility.push(support);
                }
            }
        }

        log::info!("Fused {} points", points.len());
        Ok(FusedCloud {
            cloud: PointCloud::new(points, Some(colors), Some(normals)),
            visibility,
        })
    }
}

/// Backprojects a pixel into the world: position, normal and color.
fn pixel_to_world(
    view: &FusionView,
    x: usize,
    y: usize,
    depth: f64,
) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let (u, v) = view.camera.cam_from_img(x as f64 + 0.5, y as f64 + 0.5);
    let world = view
        .world_from_cam
        .transform_point(&Vector3::new(u * depth, v * depth, depth));
    let cam_normal = Vector3::new(
        view.normal.get(x, y, 0) as f64,
        view.normal.get(x, y, 1) as f64,
        view.normal.get(x, y, 2) as f64,
    );
    let world_normal = if cam_normal.norm() > 1e-6 {
        (view.world_from_cam.rotation * cam_normal).normalize()
    } else {
        Vector3::new(0.0, 0.0, -1.0)
    };
    let rgb = view.color.get(x.min(view.color.width() - 1), y.min(view.color.height() - 1));
    (
        world,
        world_normal,
        Vector3::new(rgb[0] as f64, rgb[1] as f64, rgb[2] as f64),
    )
}

/// Writes the visibility sidecar: point count, then per point the number of
/// contributing images followed by their indices.
pub fn write_visibility(path: impl AsRef<Path>, visibility: &[Vec<u32>]) -> Result<(), MvsError> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&(visibility.len() as u64).to_le_bytes())?;
    for support in visibility {
        w.write_all(&(support.len() as u32).to_le_bytes())?;
        for idx in support {
            w.write_all(&idx.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Reads a visibility sidecar.
pub fn read_visibility(path: impl AsRef<Path>) -> Result<Vec<Vec<u32>>, MvsError> {
    let mut r = BufReader::new(File::open(path)?);
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8)?;
    let count = u64::from_le_bytes(buf8);
    let mut visibility = Vec::with_capacity(count as usize);
    let mut buf4 = [0u8; 4];
    for _ in 0..count {
        r.read_exact(&mut buf4)?;
        let n = u32::from_le_bytes(buf4);
        let mut support = Vec::with_capacity(n as usize);
        for _ in 0..n {
            r.read_exact(&mut buf4)?;
            support.push(u32::from_le_bytes(buf4));
        }
        visibility.push(support);
    }
    Ok(visibility)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_type_parse() {
        assert_eq!(
            StereoInputType::parse("Photometric").unwrap(),
            StereoInputType::Photometric
        );
        assert_eq!(
            StereoInputType::parse("GEOMETRIC").unwrap(),
            StereoInputType::Geometric
        );
        assert!(matches!(
            StereoInputType::parse("radiometric"),
            Err(MvsError::InvalidChoice { .. })
        ));
    }

    #[test]
    fn test_visibility_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fused.ply.vis");
        let visibility = vec![vec![0, 2, 5], vec![1], vec![]];
        write_visibility(&path, &visibility).unwrap();
        assert_eq!(read_visibility(&path).unwrap(), visibility);
    }
}
