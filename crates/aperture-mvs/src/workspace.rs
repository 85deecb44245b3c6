//! Dense workspace layouts produced by the undistorter.

use std::path::{Path, PathBuf};

use aperture_core::{Camera, CameraModelId, Rigid3};
use aperture_scene::{Reconstruction, SceneImage};
use nalgebra::{Cholesky, Matrix3, Matrix3x4, UnitQuaternion, Vector3};

use crate::error::MvsError;

/// Supported dense workspace formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceFormat {
    /// `images/`, `sparse/` and `stereo/` subdirectories.
    Colmap,
    /// `visualize/`, `txt/` and `models/` subdirectories.
    Pmvs,
}

impl WorkspaceFormat {
    /// Parses a workspace format name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, MvsError> {
        match value.to_lowercase().as_str() {
            "colmap" => Ok(Self::Colmap),
            "pmvs" => Ok(Self::Pmvs),
            _ => Err(MvsError::InvalidChoice {
                option: "workspace_format",
                value: value.to_string(),
                supported: "'COLMAP' or 'PMVS'",
            }),
        }
    }
}

/// Decomposes `P = K [R | t]` with an upper-triangular positive-diagonal K.
pub fn decompose_projection(p: &Matrix3x4<f64>) -> Option<(Matrix3<f64>, Rigid3)> {
    let m = p.fixed_view::<3, 3>(0, 0).into_owned();
    let p4 = Vector3::new(p[(0, 3)], p[(1, 3)], p[(2, 3)]);

    // K K^T = M M^T, so (M M^T)^-1 = K^-T K^-1 with K^-T lower triangular:
    // a plain Cholesky factorization recovers K.
    let mmt = m * m.transpose();
    let inv = mmt.try_inverse()?;
    let chol = Cholesky::new(inv)?;
    let l = chol.l();
    let k_inv = l.transpose();
    let mut k = k_inv.try_inverse()?;
    let mut r = k_inv * m;
    let mut t = k_inv * p4;

    // Normalize K and make the rotation proper.
    if r.determinant() < 0.0 {
        r = -r;
        t = -t;
        k = -k;
    }
    let scale = k[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    k /= scale;
    Some((
        k,
        Rigid3::new(UnitQuaternion::from_matrix(&r), t),
    ))
}

/// Builds `P = K [R | t]` for a pinhole camera and pose.
pub fn projection_matrix(camera: &Camera, pose: &Rigid3) -> Matrix3x4<f64> {
    let (fx, fy) = camera.focal();
    let (cx, cy) = camera.principal_point();
    let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
    k * pose.matrix3x4()
}

/// A loaded dense workspace: posed pinhole images plus sparse support points.
#[derive(Debug)]
pub struct Workspace {
    /// Workspace root directory.
    pub path: PathBuf,
    /// Layout of the workspace.
    pub format: WorkspaceFormat,
    /// Sparse model; empty points for PMVS workspaces.
    pub model: Reconstruction,
    /// Registered image ids and names in model order.
    pub image_names: Vec<(u32, String)>,
}

impl Workspace {
    /// Loads a workspace of the given format.
    pub fn load(path: impl Into<PathBuf>, format: WorkspaceFormat) -> Result<Self, MvsError> {
        let path = path.into();
        let model = match format {
            WorkspaceFormat::Colmap => Reconstruction::read(path.join("sparse"))?,
            WorkspaceFormat::Pmvs => read_pmvs_model(&path)?,
        };
        let image_names: Vec<(u32, String)> = model
            .images
            .values()
            .map(|image| (image.image_id, image.name.clone()))
            .collect();
        if image_names.is_empty() {
            return Err(MvsError::IncompleteWorkspace {
                path,
                what: "posed images".to_string(),
            });
        }
        Ok(Self {
            path,
            format,
            model,
            image_names,
        })
    }

    /// Path of an undistorted image file.
    pub fn image_file(&self, name: &str) -> PathBuf {
        match self.format {
            WorkspaceFormat::Colmap => self.path.join("images").join(name),
            WorkspaceFormat::Pmvs => self.path.join("visualize").join(name),
        }
    }

    /// Directory holding depth maps; created on demand.
    pub fn depth_map_dir(&self) -> PathBuf {
        self.path.join("stereo").join("depth_maps")
    }

    /// Directory holding normal maps; created on demand.
    pub fn normal_map_dir(&self) -> PathBuf {
        self.path.join("stereo").join("normal_maps")
    }

    /// Depth map path of an image for the given input type suffix.
    pub fn depth_map_file(&self, name: &str, input_type: &str) -> PathBuf {
        self.depth_map_dir()
            .join(format!("{}.{}.bin", name, input_type))
    }

    /// Normal map path of an image for the given input type suffix.
    pub fn normal_map_file(&self, name: &str, input_type: &str) -> PathBuf {
        self.normal_map_dir()
            .join(format!("{}.{}.bin", name, input_type))
    }

    /// Stereo configuration file path (reference and source image lists).
    pub fn patch_match_config_file(&self) -> PathBuf {
        self.path.join("stereo").join("patch-match.cfg")
    }

    /// The pinhole camera of an image.
    pub fn camera_of(&self, image_id: u32) -> Option<&Camera> {
        let image = self.model.images.get(&image_id)?;
        self.model.cameras.get(&image.camera_id)
    }
}

/// Reads a PMVS workspace: `visualize/%08d.jpg` images with `txt/%08d.txt`
/// projection matrices.
fn read_pmvs_model(path: &Path) -> Result<Reconstruction, MvsError> {
    let mut recon = Reconstruction::new();
    let txt_dir = path.join("txt");
    if !txt_dir.is_dir() {
        return Err(MvsError::IncompleteWorkspace {
            path: path.to_path_buf(),
            what: "txt/ projection matrices".to_string(),
        });
    }

    let mut index = 0u32;
    loop {
        let txt_path = txt_dir.join(format!("{:08}.txt", index));
        if !txt_path.is_file() {
            break;
        }
        let contents = std::fs::read_to_string(&txt_path)?;
        let numbers: Vec<f64> = contents
            .split_whitespace()
            .filter(|tok| *tok != "CONTOUR")
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| MvsError::DegenerateProjection(txt_path.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if numbers.len() != 12 {
            return Err(MvsError::DegenerateProjection(txt_path));
        }
        let mut p = Matrix3x4::<f64>::zeros();
        for r in 0..3 {
            for c in 0..4 {
                p[(r, c)] = numbers[4 * r + c];
            }
        }
        let (k, pose) =
            decompose_projection(&p).ok_or(MvsError::DegenerateProjection(txt_path))?;

        let name = format!("{:08}.jpg", index);
        let image_file = path.join("visualize").join(&name);
        let (width, height) = image_dimensions(&image_file)
            .unwrap_or(((2.0 * k[(0, 2)]) as usize, (2.0 * k[(1, 2)]) as usize));

        let camera_id = index + 1;
        recon.add_camera(Camera {
            camera_id,
            model_id: CameraModelId::Pinhole,
            width,
            height,
            params: vec![k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]],
        });
        recon.add_image(SceneImage {
            image_id: index + 1,
            camera_id,
            name,
            cam_from_world: pose,
            points2: vec![],
        });
        index += 1;
    }

    Ok(recon)
}

fn image_dimensions(path: &Path) -> Option<(usize, usize)> {
    let bitmap = aperture_image::Bitmap::load(path).ok()?;
    Some((bitmap.width(), bitmap.height()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_format_parse() {
        assert_eq!(WorkspaceFormat::parse("COLMAP").unwrap(), WorkspaceFormat::Colmap);
        assert_eq!(WorkspaceFormat::parse("pmvs").unwrap(), WorkspaceFormat::Pmvs);
        assert!(matches!(
            WorkspaceFormat::parse("voxel"),
            Err(MvsError::InvalidChoice { .. })
        ));
    }

    #[test]
    fn test_projection_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 640,
            height: 480,
            params: vec![520.0, 535.0, 320.5, 239.5],
        };
        let pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.2, -0.4, 0.1),
            Vector3::new(0.5, -1.0, 2.0),
        );
        let p = projection_matrix(&camera, &pose);
        let (k, restored) = decompose_projection(&p).unwrap();

        assert_relative_eq!(k[(0, 0)], 520.0, epsilon = 1e-6);
        assert_relative_eq!(k[(1, 1)], 535.0, epsilon = 1e-6);
        assert_relative_eq!(k[(0, 2)], 320.5, epsilon = 1e-6);
        assert_relative_eq!(k[(1, 2)], 239.5, epsilon = 1e-6);
        assert_relative_eq!(k[(0, 1)], 0.0, epsilon = 1e-6);
        assert_relative_eq!(
            restored.rotation.angle_to(&pose.rotation),
            0.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(restored.translation, pose.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_projection_roundtrip_with_scale() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 640,
            height: 480,
            params: vec![400.0, 400.0, 320.0, 240.0],
        };
        let pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(-0.1, 0.3, 0.7),
            Vector3::new(1.0, 2.0, 3.0),
        );
        // Projection matrices are homogeneous; scaling must not matter.
        let p = projection_matrix(&camera, &pose) * -2.5;
        let (k, restored) = decompose_projection(&p).unwrap();
        assert_relative_eq!(k[(0, 0)], 400.0, epsilon = 1e-6);
        assert_relative_eq!(restored.translation, pose.translation, epsilon = 1e-9);
    }
}
