//! Surface meshing: fused points are splatted into a truncated signed
//! distance volume and polygonized with marching cubes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aperture_scene::io::ply;
use aperture_scene::{PointCloud, Reconstruction, TriangleMesh};
use nalgebra::{Matrix3, Vector3};

use crate::error::MvsError;
use crate::mc_tables::{EDGE_TABLE, TRIANGLE_TABLE};

/// Meshing input selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshInputType {
    /// A fused dense point cloud (PLY with normals).
    Dense,
    /// A sparse reconstruction; normals are estimated from neighbors.
    Sparse,
}

impl MeshInputType {
    /// Parses an input type name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, MvsError> {
        match value.to_lowercase().as_str() {
            "dense" => Ok(Self::Dense),
            "sparse" => Ok(Self::Sparse),
            _ => Err(MvsError::InvalidChoice {
                option: "input_type",
                value: value.to_string(),
                supported: "'sparse' and 'dense'",
            }),
        }
    }
}

/// Options for the implicit-surface mesher.
#[derive(Debug, Clone)]
pub struct MeshingOptions {
    /// Input kind.
    pub input_type: MeshInputType,
    /// Voxel edge length; non-positive derives it from the cloud extent.
    pub voxel_size: f64,
    /// Truncation distance as a multiple of the voxel size.
    pub trunc_factor: f64,
    /// Minimum accumulated weight for a voxel to participate.
    pub min_weight: f64,
    /// Grid resolution cap along the longest axis for derived voxel sizes.
    pub max_grid_resolution: usize,
    /// Neighborhood size for sparse normal estimation.
    pub num_neighbors: usize,
}

impl Default for MeshingOptions {
    fn default() -> Self {
        Self {
            input_type: MeshInputType::Dense,
            voxel_size: -1.0,
            trunc_factor: 3.0,
            min_weight: 0.5,
            max_grid_resolution: 192,
            num_neighbors: 16,
        }
    }
}

/// A truncated signed distance volume with color accumulation.
pub struct TsdfVolume {
    dims: [usize; 3],
    origin: Vector3<f64>,
    voxel_size: f64,
    trunc: f64,
    tsdf: Vec<f32>,
    weight: Vec<f32>,
    color: Vec<[f32; 3]>,
}

impl TsdfVolume {
    /// Creates a volume covering `(min, max)` with the given voxel size.
    pub fn new(min: [f64; 3], max: [f64; 3], voxel_size: f64, trunc: f64) -> Self {
        let margin = trunc + voxel_size;
        let origin = Vector3::new(min[0] - margin, min[1] - margin, min[2] - margin);
        let dims = [
            (((max[0] - min[0] + 2.0 * margin) / voxel_size).ceil() as usize).max(2),
            (((max[1] - min[1] + 2.0 * margin) / voxel_size).ceil() as usize).max(2),
            (((max[2] - min[2] + 2.0 * margin) / voxel_size).ceil() as usize).max(2),
        ];
        let len = dims[0] * dims[1] * dims[2];
        Self {
            dims,
            origin,
            voxel_size,
            trunc,
            tsdf: vec![0.0; len],
            weight: vec![0.0; len],
            color: vec![[0.0; 3]; len],
        }
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.dims[1] + y) * self.dims[0] + x
    }

    fn voxel_center(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        self.origin
            + Vector3::new(
                (x as f64 + 0.5) * self.voxel_size,
                (y as f64 + 0.5) * self.voxel_size,
                (z as f64 + 0.5) * self.voxel_size,
            )
    }

    /// Splats one oriented point: voxels within the truncation band get a
    /// weighted signed-distance update along the point normal.
    pub fn integrate_point(&mut self, position: &[f64; 3], normal: &[f64; 3], color: &[u8; 3]) {
        let p = Vector3::new(position[0], position[1], position[2]);
        let n = Vector3::new(normal[0], normal[1], normal[2]);
        let n = if n.norm() > 1e-9 {
            n.normalize()
        } else {
            return;
        };

        let reach = self.trunc;
        let lo = p - Vector3::repeat(reach);
        let hi = p + Vector3::repeat(reach);
        let to_cell = |v: f64, o: f64| ((v - o) / self.voxel_size - 0.5).floor() as i64;
        let x0 = to_cell(lo.x, self.origin.x).max(0) as usize;
        let y0 = to_cell(lo.y, self.origin.y).max(0) as usize;
        let z0 = to_cell(lo.z, self.origin.z).max(0) as usize;
        let x1 = (to_cell(hi.x, self.origin.x) + 1).clamp(0, self.dims[0] as i64 - 1) as usize;
        let y1 = (to_cell(hi.y, self.origin.y) + 1).clamp(0, self.dims[1] as i64 - 1) as usize;
        let z1 = (to_cell(hi.z, self.origin.z) + 1).clamp(0, self.dims[2] as i64 - 1) as usize;

        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let center = self.voxel_center(x, y, z);
                    let offset = center - p;
                    if offset.norm() > reach {
                        continue;
                    }
                    let sdf = offset.dot(&n);
                    if sdf.abs() > self.trunc {
                        continue;
                    }
                    let value = (sdf / self.trunc) as f32;
                    let w = (1.0 - sdf.abs() / self.trunc) as f32;
                    if w <= 0.0 {
                        continue;
                    }
                    let idx = self.index(x, y, z);
                    let w_old = self.weight[idx];
                    let w_new = w_old + w;
                    self.tsdf[idx] = (self.tsdf[idx] * w_old + value * w) / w_new;
                    for c in 0..3 {
                        self.color[idx][c] =
                            (self.color[idx][c] * w_old + color[c] as f32 * w) / w_new;
                    }
                    self.weight[idx] = w_new;
                }
            }
        }
    }

    fn value(&self, x: usize, y: usize, z: usize) -> Option<(f32, [f32; 3])> {
        let idx = self.index(x, y, z);
        (self.weight[idx] > 0.0).then(|| (self.tsdf[idx], self.color[idx]))
    }

    /// Polygonizes the zero level set.
    pub fn extract_mesh(&self, min_weight: f64) -> TriangleMesh {
        const CORNER_OFFSETS: [(usize, usize, usize); 8] = [
            (0, 0, 0),
            (1, 0, 0),
            (1, 1, 0),
            (0, 1, 0),
            (0, 0, 1),
            (1, 0, 1),
            (1, 1, 1),
            (0, 1, 1),
        ];
        const EDGE_CORNERS: [(usize, usize); 12] = [
            (0, 1),
            (1, 2),
            (2, 3),
            (3, 0),
            (4, 5),
            (5, 6),
            (6, 7),
            (7, 4),
            (0, 4),
            (1, 5),
            (2, 6),
            (3, 7),
        ];

        let mut mesh = TriangleMesh::new();
        // Shared vertices: one per crossed cell edge.
        let mut edge_vertices: HashMap<(usize, usize, usize, usize), u32> = HashMap::new();

        for z in 0..self.dims[2] - 1 {
            for y in 0..self.dims[1] - 1 {
                for x in 0..self.dims[0] - 1 {
                    let mut values = [0.0f32; 8];
                    let mut colors = [[0.0f32; 3]; 8];
                    let mut observed = true;
                    for (i, (dx, dy, dz)) in CORNER_OFFSETS.iter().enumerate() {
                        let idx = self.index(x + dx, y + dy, z + dz);
                        if (self.weight[idx] as f64) < min_weight {
                            observed = false;
                            break;
                        }
                        match self.value(x + dx, y + dy, z + dz) {
                            Some((v, c)) => {
                                values[i] = v;
                                colors[i] = c;
                            }
                            None => {
                                observed = false;
                                break;
                            }
                        }
                    }
                    if !observed {
                        continue;
                    }

                    let mut cube_index = 0usize;
                    for (i, v) in values.iter().enumerate() {
                        if *v < 0.0 {
                            cube_index |= 1 << i;
                        }
                    }
                    if EDGE_TABLE[cube_index] == 0 {
                        continue;
                    }

                    let mut cell_edge_vertex = [u32::MAX; 12];
                    for (edge, &(a, b)) in EDGE_CORNERS.iter().enumerate() {
                        if EDGE_TABLE[cube_index] & (1 << edge) == 0 {
                            continue;
                        }
                        let (ax, ay, az) = CORNER_OFFSETS[a];
                        let (bx, by, bz) = CORNER_OFFSETS[b];
                        // Canonical key: the lower corner plus axis id.
                        let corner_a = (x + ax, y + ay, z + az);
                        let corner_b = (x + bx, y + by, z + bz);
                        let (lo, hi) = if corner_a <= corner_b {
                            (corner_a, corner_b)
                        } else {
                            (corner_b, corner_a)
                        };
                        let axis = if hi.0 != lo.0 {
                            0
                        } else if hi.1 != lo.1 {
                            1
                        } else {
                            2
                        };
                        let key = (lo.0, lo.1, lo.2, axis);

                        let vertex_idx = *edge_vertices.entry(key).or_insert_with(|| {
                            let va = values[a] as f64;
                            let vb = values[b] as f64;
                            let t = if (va - vb).abs() < 1e-12 {
                                0.5
                            } else {
                                va / (va - vb)
                            };
                            let pa = self.voxel_center(x + ax, y + ay, z + az);
                            let pb = self.voxel_center(x + bx, y + by, z + bz);
                            let position = pa + (pb - pa) * t;
                            let color = [
                                (colors[a][0] as f64 + (colors[b][0] - colors[a][0]) as f64 * t)
                                    .clamp(0.0, 255.0) as u8,
                                (colors[a][1] as f64 + (colors[b][1] - colors[a][1]) as f64 * t)
                                    .clamp(0.0, 255.0) as u8,
                                (colors[a][2] as f64 + (colors[b][2] - colors[a][2]) as f64 * t)
                                    .clamp(0.0, 255.0) as u8,
                            ];
                            let idx = mesh.vertices.len() as u32;
                            mesh.vertices.push([position.x, position.y, position.z]);
                            mesh.colors.push(color);
                            idx
                        });
                        cell_edge_vertex[edge] = vertex_idx;
                    }

                    let fan = &TRIANGLE_TABLE[cube_index];
                    let mut i = 0;
                    while fan[i] != -1 {
                        mesh.triangles.push([
                            cell_edge_vertex[fan[i] as usize],
                            cell_edge_vertex[fan[i + 1] as usize],
                            cell_edge_vertex[fan[i + 2] as usize],
                        ]);
                        i += 3;
                    }
                }
            }
        }
        mesh
    }
}

/// Estimates unit normals from the `k` nearest neighbors of each point via
/// the smallest principal component, oriented toward `orientation_target`.
pub fn estimate_normals(
    points: &[[f64; 3]],
    k: usize,
    orientation_target: &[f64; 3],
) -> Vec<[f64; 3]> {
    let n = points.len();
    let target = Vector3::new(
        orientation_target[0],
        orientation_target[1],
        orientation_target[2],
    );
    let mut normals = vec![[0.0, 0.0, 1.0]; n];
    if n < 3 {
        return normals;
    }
    let k = k.min(n - 1).max(2);

    for i in 0..n {
        let p = Vector3::new(points[i][0], points[i][1], points[i][2]);
        // Brute-force k nearest neighbors.
        let mut distances: Vec<(f64, usize)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| {
                let q = Vector3::new(points[j][0], points[j][1], points[j][2]);
                ((q - p).norm_squared(), j)
            })
            .collect();
        distances.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        distances.truncate(k);

        let mut centroid = p;
        for &(_, j) in &distances {
            centroid += Vector3::new(points[j][0], points[j][1], points[j][2]);
        }
        centroid /= (distances.len() + 1) as f64;

        let mut covariance = Matrix3::<f64>::zeros();
        let mut accumulate = |q: Vector3<f64>| {
            let d = q - centroid;
            covariance += d * d.transpose();
        };
        accumulate(p);
        for &(_, j) in &distances {
            accumulate(Vector3::new(points[j][0], points[j][1], points[j][2]));
        }

        let eigen = covariance.symmetric_eigen();
        // Eigenvector of the smallest eigenvalue.
        let mut min_idx = 0;
        for d in 1..3 {
            if eigen.eigenvalues[d] < eigen.eigenvalues[min_idx] {
                min_idx = d;
            }
        }
        let mut normal = eigen.eigenvectors.column(min_idx).into_owned();
        if normal.dot(&(target - p)) < 0.0 {
            normal = -normal;
        }
        normals[i] = [normal.x, normal.y, normal.z];
    }
    normals
}

/// Statistics of a meshing run.
#[derive(Debug, Clone, Copy)]
pub struct MeshStats {
    /// Number of vertices in the output mesh.
    pub num_vertices: usize,
    /// Number of triangles in the output mesh.
    pub num_triangles: usize,
}

/// Meshes a fused cloud or a sparse model into a PLY surface.
pub struct Mesher {
    input_path: PathBuf,
    output_path: PathBuf,
    options: MeshingOptions,
}

impl Mesher {
    /// Creates a mesher over the given paths.
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        options: MeshingOptions,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            options,
        }
    }

    /// Runs meshing and writes the output PLY.
    pub fn run(self) -> Result<MeshStats, MvsError> {
        let cloud = match self.options.input_type {
            MeshInputType::Dense => ply::read_point_cloud(&self.input_path)?,
            MeshInputType::Sparse => sparse_cloud(&self.input_path, self.options.num_neighbors)?,
        };
        let mesh = mesh_cloud(&cloud, &self.options)?;
        ply::write_mesh(&self.output_path, &mesh)?;
        log::info!(
            "Meshed {} points into {} vertices / {} triangles",
            cloud.len(),
            mesh.vertices.len(),
            mesh.triangles.len()
        );
        Ok(MeshStats {
            num_vertices: mesh.vertices.len(),
            num_triangles: mesh.triangles.len(),
        })
    }
}

/// Reads a sparse model and converts it to an oriented point cloud.
fn sparse_cloud(model_path: &Path, num_neighbors: usize) -> Result<PointCloud, MvsError> {
    let recon = Reconstruction::read(model_path)?;
    let points: Vec<[f64; 3]> = recon.points3d.values().map(|p| p.xyz).collect();
    let colors: Vec<[u8; 3]> = recon.points3d.values().map(|p| p.color).collect();

    // Orient normals toward the centroid of the observing cameras.
    let mut camera_centroid = Vector3::zeros();
    let mut num_images = 0;
    for image in recon.images.values() {
        camera_centroid += image.cam_from_world.projection_center();
        num_images += 1;
    }
    if num_images > 0 {
        camera_centroid /= num_images as f64;
    }
    let normals = estimate_normals(
        &points,
        num_neighbors,
        &[camera_centroid.x, camera_centroid.y, camera_centroid.z],
    );
    Ok(PointCloud::new(points, Some(colors), Some(normals)))
}

/// Splats a cloud into a TSDF and polygonizes it.
pub fn mesh_cloud(cloud: &PointCloud, options: &MeshingOptions) -> Result<TriangleMesh, MvsError> {
    let Some((min, max)) = cloud.bounding_box() else {
        return Ok(TriangleMesh::new());
    };
    let normals = cloud.normals().ok_or_else(|| {
        MvsError::InvalidChoice {
            option: "input cloud",
            value: "points without normals".to_string(),
            supported: "oriented point clouds",
        }
    })?;

    let extent = (max[0] - min[0])
        .max(max[1] - min[1])
        .max(max[2] - min[2])
        .max(1e-6);
    let voxel_size = if options.voxel_size > 0.0 {
        options.voxel_size
    } else {
        extent / options.max_grid_resolution as f64
    };
    let trunc = options.trunc_factor.max(1.0) * voxel_size;

    let mut volume = TsdfVolume::new(min, max, voxel_size, trunc);
    let default_colors;
    let colors = match cloud.colors() {
        Some(colors) => colors,
        None => {
            default_colors = vec![[128u8, 128, 128]; cloud.len()];
            &default_colors
        }
    };
    for i in 0..cloud.len() {
        volume.integrate_point(&cloud.points()[i], &normals[i], &colors[i]);
    }
    Ok(volume.extract_mesh(options.min_weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Points uniformly sampled on a sphere with outward normals.
    fn sphere_cloud(radius: f64, count: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Vec::new();
        let mut normals = Vec::new();
        while points.len() < count {
            let v = Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0f64),
            );
            if v.norm() < 1e-3 {
                continue;
            }
            let n = v.normalize();
            points.push([n.x * radius, n.y * radius, n.z * radius]);
            normals.push([n.x, n.y, n.z]);
        }
        PointCloud::new(points, None, Some(normals))
    }

    #[test]
    fn test_mesh_sphere_radius() {
        let radius = 1.0;
        let cloud = sphere_cloud(radius, 4000, 9);
        let options = MeshingOptions {
            voxel_size: 0.05,
            ..MeshingOptions::default()
        };
        let mesh = mesh_cloud(&cloud, &options).unwrap();
        assert!(!mesh.triangles.is_empty());
        assert_eq!(mesh.vertices.len(), mesh.colors.len());

        for vertex in &mesh.vertices {
            let r = (vertex[0] * vertex[0] + vertex[1] * vertex[1] + vertex[2] * vertex[2]).sqrt();
            assert!(
                (r - radius).abs() < 2.0 * options.voxel_size,
                "vertex radius {}",
                r
            );
        }
        // All triangle indices reference existing vertices.
        for triangle in &mesh.triangles {
            for &idx in triangle {
                assert!((idx as usize) < mesh.vertices.len());
            }
        }
    }

    #[test]
    fn test_empty_cloud() {
        let mesh = mesh_cloud(&PointCloud::default(), &MeshingOptions::default()).unwrap();
        assert!(mesh.triangles.is_empty());
    }

    #[test]
    fn test_estimate_normals_on_plane() {
        // Points on z = 2: normals must align with the z axis.
        let mut points = Vec::new();
        for x in 0..10 {
            for y in 0..10 {
                points.push([x as f64 * 0.1, y as f64 * 0.1, 2.0]);
            }
        }
        let normals = estimate_normals(&points, 8, &[0.5, 0.5, 10.0]);
        for normal in &normals {
            assert!(normal[2] > 0.99, "normal {:?}", normal);
        }
    }

    #[test]
    fn test_input_type_parse() {
        assert_eq!(MeshInputType::parse("DENSE").unwrap(), MeshInputType::Dense);
        assert_eq!(MeshInputType::parse("sparse").unwrap(), MeshInputType::Sparse);
        assert!(MeshInputType::parse("poisson").is_err());
    }
}
