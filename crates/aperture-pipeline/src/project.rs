//! The project file: every pipeline option in one JSON document.
//!
//! All fields default, so a project may carry any subset of sections; each
//! operation validates the options it needs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Feature extraction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSection {
    /// Upper bound on keypoints per image.
    pub max_num_features: usize,
    /// Detection resolution cap; 0 disables.
    pub max_image_size: usize,
    /// FAST intensity threshold.
    pub fast_threshold: f32,
    /// Pyramid levels.
    pub num_scales: usize,
    /// Share one camera across all images.
    pub single_camera: bool,
    /// Camera model name.
    pub camera_model: String,
    /// Comma-separated camera parameters; empty derives defaults.
    pub camera_params: String,
    /// Optional file with one image name per line.
    pub image_list_path: Option<PathBuf>,
}

impl Default for ExtractionSection {
    fn default() -> Self {
        let options = aperture_features::ExtractionOptions::default();
        Self {
            max_num_features: options.max_num_features,
            max_image_size: options.max_image_size,
            fast_threshold: options.fast_threshold,
            num_scales: options.num_scales,
            single_camera: options.single_camera,
            camera_model: options.camera_model,
            camera_params: options.camera_params,
            image_list_path: None,
        }
    }
}

impl ExtractionSection {
    /// Converts to extractor options; the image list is injected separately.
    pub fn to_options(&self, image_list: Option<Vec<String>>) -> aperture_features::ExtractionOptions {
        aperture_features::ExtractionOptions {
            max_num_features: self.max_num_features,
            max_image_size: self.max_image_size,
            fast_threshold: self.fast_threshold,
            num_scales: self.num_scales,
            single_camera: self.single_camera,
            camera_model: self.camera_model.clone(),
            camera_params: self.camera_params.clone(),
            image_list,
            ..aperture_features::ExtractionOptions::default()
        }
    }
}

/// Exhaustive matching options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSection {
    /// Images per matching block.
    pub block_size: usize,
    /// Maximum Hamming distance.
    pub max_distance: u32,
    /// Lowe's ratio threshold.
    pub max_ratio: f32,
    /// Keep only mutual nearest neighbors.
    pub cross_check: bool,
    /// Minimum inliers for a verified pair.
    pub min_num_inliers: usize,
    /// Epipolar error threshold in pixels.
    pub max_epipolar_error: f64,
    /// RANSAC seed.
    pub seed: u64,
}

impl Default for MatchingSection {
    fn default() -> Self {
        let options = aperture_features::MatchingOptions::default();
        Self {
            block_size: options.block_size,
            max_distance: options.max_distance,
            max_ratio: options.max_ratio,
            cross_check: options.cross_check,
            min_num_inliers: options.min_num_inliers,
            max_epipolar_error: options.ransac.max_error,
            seed: options.ransac.seed,
        }
    }
}

impl MatchingSection {
    /// Converts to matcher options.
    pub fn to_options(&self) -> aperture_features::MatchingOptions {
        let mut options = aperture_features::MatchingOptions {
            block_size: self.block_size,
            max_distance: self.max_distance,
            max_ratio: self.max_ratio,
            cross_check: self.cross_check,
            min_num_inliers: self.min_num_inliers,
            ..aperture_features::MatchingOptions::default()
        };
        options.ransac.max_error = self.max_epipolar_error;
        options.ransac.seed = self.seed;
        options
    }
}

/// Incremental mapping options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperSection {
    /// Resume from this model directory.
    pub input_path: Option<PathBuf>,
    /// Directory receiving the reconstructed models.
    pub output_path: Option<PathBuf>,
    /// Optional file restricting mapping to listed image names.
    pub image_list_path: Option<PathBuf>,
    /// Minimum verified matches per usable pair.
    pub min_num_matches: usize,
    /// Minimum two-view inliers for initialization.
    pub init_min_num_inliers: usize,
    /// Minimum median triangulation angle for initialization, degrees.
    pub init_min_tri_angle: f64,
    /// Minimum inliers to register an image.
    pub abs_pose_min_num_inliers: usize,
    /// Observation filter threshold, pixels.
    pub max_reproj_error: f64,
    /// Point filter threshold, degrees.
    pub min_tri_angle: f64,
    /// Upper bound on discovered models.
    pub max_num_models: usize,
    /// Models smaller than this are discarded.
    pub min_model_size: usize,
    /// Sampling seed.
    pub seed: u64,
}

impl Default for MapperSection {
    fn default() -> Self {
        let controller = aperture_sfm::MapperControllerOptions::default();
        let mapper = controller.mapper;
        Self {
            input_path: None,
            output_path: None,
            image_list_path: None,
            min_num_matches: mapper.min_num_matches,
            init_min_num_inliers: mapper.init_min_num_inliers,
            init_min_tri_angle: mapper.init_min_tri_angle_deg,
            abs_pose_min_num_inliers: mapper.abs_pose_min_num_inliers,
            max_reproj_error: mapper.max_reproj_error_px,
            min_tri_angle: mapper.min_tri_angle_deg,
            max_num_models: controller.max_num_models,
            min_model_size: controller.min_model_size,
            seed: mapper.seed,
        }
    }
}

impl MapperSection {
    /// Converts to controller options; the name filter and image root are
    /// injected separately.
    pub fn to_options(
        &self,
        image_names: Option<std::collections::HashSet<String>>,
        image_path: Option<PathBuf>,
    ) -> aperture_sfm::MapperControllerOptions {
        let mut options = aperture_sfm::MapperControllerOptions {
            max_num_models: self.max_num_models,
            min_model_size: self.min_model_size,
            image_path,
            ..aperture_sfm::MapperControllerOptions::default()
        };
        options.mapper.min_num_matches = self.min_num_matches;
        options.mapper.init_min_num_inliers = self.init_min_num_inliers;
        options.mapper.init_min_tri_angle_deg = self.init_min_tri_angle;
        options.mapper.abs_pose_min_num_inliers = self.abs_pose_min_num_inliers;
        options.mapper.max_reproj_error_px = self.max_reproj_error;
        options.mapper.min_tri_angle_deg = self.min_tri_angle;
        options.mapper.seed = self.seed;
        options.mapper.image_names = image_names;
        options
    }
}

/// Undistortion options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UndistorterSection {
    /// Sparse model to undistort.
    pub input_path: Option<PathBuf>,
    /// Workspace output directory.
    pub output_path: Option<PathBuf>,
    /// Output layout: COLMAP, PMVS or CMP-MVS.
    pub output_type: String,
    /// Allowed blank-pixel fraction.
    pub blank_pixels: f64,
    /// Lower output scale clamp.
    pub min_scale: f64,
    /// Upper output scale clamp.
    pub max_scale: f64,
    /// Maximum output edge length; non-positive disables.
    pub max_image_size: i64,
    /// Region of interest minimum x, relative.
    pub roi_min_x: f64,
    /// Region of interest minimum y, relative.
    pub roi_min_y: f64,
    /// Region of interest maximum x, relative.
    pub roi_max_x: f64,
    /// Region of interest maximum y, relative.
    pub roi_max_y: f64,
}

impl Default for UndistorterSection {
    fn default() -> Self {
        let options = aperture_mvs::UndistortOptions::default();
        Self {
            input_path: None,
            output_path: None,
            output_type: "COLMAP".to_string(),
            blank_pixels: options.blank_pixels,
            min_scale: options.min_scale,
            max_scale: options.max_scale,
            max_image_size: options.max_image_size,
            roi_min_x: options.roi_min_x,
            roi_min_y: options.roi_min_y,
            roi_max_x: options.roi_max_x,
            roi_max_y: options.roi_max_y,
        }
    }
}

impl UndistorterSection {
    /// Converts to undistorter options.
    pub fn to_options(&self) -> aperture_mvs::UndistortOptions {
        aperture_mvs::UndistortOptions {
            blank_pixels: self.blank_pixels,
            min_scale: self.min_scale,
            max_scale: self.max_scale,
            max_image_size: self.max_image_size,
            roi_min_x: self.roi_min_x,
            roi_min_y: self.roi_min_y,
            roi_max_x: self.roi_max_x,
            roi_max_y: self.roi_max_y,
        }
    }
}

/// Patch-match stereo options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchMatchSection {
    /// Dense workspace directory.
    pub workspace_path: Option<PathBuf>,
    /// Workspace layout: COLMAP or PMVS.
    pub workspace_format: String,
    /// Matching window radius.
    pub window_radius: usize,
    /// Propagation sweeps.
    pub num_iterations: usize,
    /// Depth range lower bound; non-positive derives it.
    pub depth_min: f64,
    /// Depth range upper bound; non-positive derives it.
    pub depth_max: f64,
    /// Write consistency-filtered maps.
    pub geom_consistency: bool,
    /// Sampling seed.
    pub seed: u64,
}

impl Default for PatchMatchSection {
    fn default() -> Self {
        let options = aperture_mvs::PatchMatchOptions::default();
        Self {
            workspace_path: None,
            workspace_format: "COLMAP".to_string(),
            window_radius: options.window_radius,
            num_iterations: options.num_iterations,
            depth_min: options.depth_min,
            depth_max: options.depth_max,
            geom_consistency: options.geom_consistency,
            seed: options.seed,
        }
    }
}

impl PatchMatchSection {
    /// Converts to stereo options.
    pub fn to_options(&self) -> aperture_mvs::PatchMatchOptions {
        aperture_mvs::PatchMatchOptions {
            window_radius: self.window_radius,
            num_iterations: self.num_iterations,
            depth_min: self.depth_min,
            depth_max: self.depth_max,
            geom_consistency: self.geom_consistency,
            seed: self.seed,
            ..aperture_mvs::PatchMatchOptions::default()
        }
    }
}

/// Stereo fusion options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSection {
    /// Dense workspace directory.
    pub workspace_path: Option<PathBuf>,
    /// Workspace layout: COLMAP or PMVS.
    pub workspace_format: String,
    /// Output PLY path.
    pub output_path: Option<PathBuf>,
    /// Which maps to fuse: photometric or geometric.
    pub input_type: String,
    /// Minimum number of agreeing pixels.
    pub min_num_pixels: usize,
    /// Maximum relative depth error.
    pub max_rel_depth_error: f64,
    /// Maximum normal disagreement, degrees.
    pub max_normal_error: f64,
}

impl Default for FusionSection {
    fn default() -> Self {
        let options = aperture_mvs::FusionOptions::default();
        Self {
            workspace_path: None,
            workspace_format: "COLMAP".to_string(),
            output_path: None,
            input_type: "geometric".to_string(),
            min_num_pixels: options.min_num_pixels,
            max_rel_depth_error: options.max_rel_depth_error,
            max_normal_error: options.max_normal_error_deg,
        }
    }
}

impl FusionSection {
    /// Converts to fusion options for a parsed input type.
    pub fn to_options(
        &self,
        input_type: aperture_mvs::StereoInputType,
    ) -> aperture_mvs::FusionOptions {
        aperture_mvs::FusionOptions {
            input_type,
            min_num_pixels: self.min_num_pixels,
            max_rel_depth_error: self.max_rel_depth_error,
            max_normal_error_deg: self.max_normal_error,
        }
    }
}

/// Meshing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MesherSection {
    /// Fused PLY (dense) or model directory (sparse).
    pub input_path: Option<PathBuf>,
    /// Output mesh PLY path.
    pub output_path: Option<PathBuf>,
    /// Input kind: dense or sparse.
    pub input_type: String,
    /// Voxel edge length; non-positive derives it.
    pub voxel_size: f64,
    /// Truncation band in voxels.
    pub trunc_factor: f64,
    /// Minimum voxel weight.
    pub min_weight: f64,
}

impl Default for MesherSection {
    fn default() -> Self {
        let options = aperture_mvs::MeshingOptions::default();
        Self {
            input_path: None,
            output_path: None,
            input_type: "dense".to_string(),
            voxel_size: options.voxel_size,
            trunc_factor: options.trunc_factor,
            min_weight: options.min_weight,
        }
    }
}

impl MesherSection {
    /// Converts to meshing options for a parsed input type.
    pub fn to_options(&self, input_type: aperture_mvs::MeshInputType) -> aperture_mvs::MeshingOptions {
        aperture_mvs::MeshingOptions {
            input_type,
            voxel_size: self.voxel_size,
            trunc_factor: self.trunc_factor,
            min_weight: self.min_weight,
            ..aperture_mvs::MeshingOptions::default()
        }
    }
}

/// Model conversion options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSection {
    /// Model directory to read.
    pub input_path: Option<PathBuf>,
    /// Output path (directory or file depending on the type).
    pub output_path: Option<PathBuf>,
    /// Target format: BIN, TXT, NVM, Bundler, VRML or PLY.
    pub output_type: Option<String>,
}

/// A complete project document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    /// Feature database file.
    pub database_path: Option<PathBuf>,
    /// Root directory of the source images.
    pub image_path: Option<PathBuf>,
    /// Feature extraction section.
    pub extraction: ExtractionSection,
    /// Matching section.
    pub matching: MatchingSection,
    /// Mapping section.
    pub mapper: MapperSection,
    /// Undistortion section.
    pub undistorter: UndistorterSection,
    /// Dense stereo section.
    pub patch_match: PatchMatchSection,
    /// Fusion section.
    pub fusion: FusionSection,
    /// Meshing section.
    pub mesher: MesherSection,
    /// Conversion section.
    pub converter: ConverterSection,
}

impl Project {
    /// Reads a project from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the project as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The database path, required.
    pub fn require_database_path(&self) -> Result<&Path, PipelineError> {
        self.database_path
            .as_deref()
            .ok_or(PipelineError::MissingOption("database_path"))
    }

    /// The image root, required.
    pub fn require_image_path(&self) -> Result<&Path, PipelineError> {
        self.image_path
            .as_deref()
            .ok_or(PipelineError::MissingOption("image_path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");

        let mut project = Project::default();
        project.database_path = Some(PathBuf::from("/data/database.bin"));
        project.extraction.max_num_features = 1234;
        project.matching.max_ratio = 0.75;
        project.mapper.output_path = Some(PathBuf::from("/data/sparse"));
        project.converter.output_type = Some("PLY".to_string());
        project.save(&path).unwrap();

        let restored = Project::load(&path).unwrap();
        assert_eq!(
            restored.database_path.as_deref(),
            Some(Path::new("/data/database.bin"))
        );
        assert_eq!(restored.extraction.max_num_features, 1234);
        assert_eq!(restored.matching.max_ratio, 0.75);
        assert_eq!(restored.converter.output_type.as_deref(), Some("PLY"));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(&path, r#"{"database_path": "/tmp/db.bin"}"#).unwrap();
        let project = Project::load(&path).unwrap();
        assert!(project.image_path.is_none());
        assert_eq!(
            project.extraction.camera_model,
            ExtractionSection::default().camera_model
        );
        assert_eq!(project.fusion.input_type, "geometric");
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(
            &path,
            r#"{"database_path": "/tmp/db.bin", "legacy_option": 42}"#,
        )
        .unwrap();
        assert!(Project::load(&path).is_ok());
    }

    #[test]
    fn test_missing_required_options_are_named() {
        let project = Project::default();
        let err = project.require_database_path().unwrap_err();
        assert!(err.to_string().contains("database_path"));
        assert!(matches!(err, PipelineError::MissingOption("database_path")));
    }
}
