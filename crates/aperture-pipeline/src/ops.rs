//! Pipeline operations.
//!
//! Each function loads the project file, validates the options its stage
//! needs, builds the subsystem controller, runs it on a worker thread and
//! waits for it, mirroring the start/wait structure of the surrounding
//! tooling.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use aperture_features::{Database, ExhaustiveMatcher, FeatureExtractor};
use aperture_mvs::fusion::write_visibility;
use aperture_mvs::{
    FusionOptions, ImageUndistorter, MeshInputType, Mesher, PatchMatchController, StereoFusion,
    StereoInputType, UndistortLayout, Workspace, WorkspaceFormat,
};
use aperture_scene::io::{bundler, nvm, ply, vrml};
use aperture_scene::Reconstruction;
use aperture_sfm::{IncrementalMapperController, MapperEvent, ReconstructionManager};

use crate::error::PipelineError;
use crate::project::Project;

fn run_on_worker<T, F>(name: &'static str, job: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(job)?
        .join()
        .map_err(|_| PipelineError::WorkerPanic(name))?
}

fn read_name_list(path: &Path) -> Result<Vec<String>, PipelineError> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn require_dir(key: &'static str, path: &Path) -> Result<(), PipelineError> {
    if !path.is_dir() {
        return Err(PipelineError::NotADirectory {
            key,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Creates an empty feature database at the configured path.
pub fn create_database(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let database_path = project.require_database_path()?;
    Database::create(database_path)?;
    log::info!("Created database at {}", database_path.display());
    Ok(())
}

/// Extracts features for every image under the configured image root.
///
/// A configured but empty image list is a successful no-op.
pub fn extract_features(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let database_path = project.require_database_path()?.to_path_buf();
    let image_path = project.require_image_path()?.to_path_buf();

    aperture_core::verify_camera_params(
        &project.extraction.camera_model,
        &project.extraction.camera_params,
    )?;

    let image_list = match &project.extraction.image_list_path {
        Some(path) => Some(read_name_list(path)?),
        None => None,
    };
    let options = project.extraction.to_options(image_list);

    run_on_worker("feature extraction", move || {
        let extractor = FeatureExtractor::new(database_path, image_path, options);
        extractor.run().map_err(PipelineError::from)
    })?;
    Ok(())
}

/// Matches all image pairs exhaustively and verifies them.
pub fn match_features_exhaustively(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let database_path = project.require_database_path()?.to_path_buf();
    let options = project.matching.to_options();

    run_on_worker("feature matching", move || {
        let matcher = ExhaustiveMatcher::new(database_path, options);
        matcher.run().map_err(PipelineError::from)
    })?;
    Ok(())
}

/// Runs incremental mapping.
///
/// Without a mapper input path, every discovered model is written to
/// `output_path/<index>` as it completes, together with the effective
/// project file. With an input path the loaded model is extended and the
/// result is written flat into `output_path`.
pub fn reconstruct_sparse(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(&project_path)?;
    let database_path = project.require_database_path()?.to_path_buf();
    let output_path = project
        .mapper
        .output_path
        .clone()
        .ok_or(PipelineError::MissingOption("mapper.output_path"))?;
    require_dir("mapper.output_path", &output_path)?;

    let image_names: Option<HashSet<String>> = match &project.mapper.image_list_path {
        Some(path) => Some(read_name_list(path)?.into_iter().collect()),
        None => None,
    };
    let options = project
        .mapper
        .to_options(image_names, project.image_path.clone());

    let input_path = project.mapper.input_path.clone();
    let mut manager = ReconstructionManager::new();
    if let Some(input_path) = &input_path {
        require_dir("mapper.input_path", input_path)?;
        manager.read(input_path)?;
    }

    let mut controller =
        IncrementalMapperController::with_manager(database_path, options, manager);

    if input_path.is_none() {
        // Write each model out as soon as its last image is registered.
        let snapshot_project = project.clone();
        let snapshot_path = output_path.clone();
        let mut num_written = 0usize;
        controller.add_callback(MapperEvent::LastImageRegistered, move |manager| {
            while num_written < manager.len() {
                let model_path = snapshot_path.join(num_written.to_string());
                let result = fs::create_dir_all(&model_path)
                    .map_err(PipelineError::from)
                    .and_then(|_| {
                        manager
                            .get(num_written)
                            .expect("model index in range")
                            .write(&model_path)
                            .map_err(PipelineError::from)
                    })
                    .and_then(|_| snapshot_project.save(model_path.join("project.json")));
                if let Err(e) = result {
                    log::error!("failed to write model {}: {}", num_written, e);
                }
                num_written += 1;
            }
        });
    }

    let manager = run_on_worker("incremental mapping", move || {
        controller.run().map_err(PipelineError::from)
    })?;

    if input_path.is_some() && !manager.is_empty() {
        manager
            .get(0)
            .expect("model index in range")
            .write(&output_path)?;
    }
    Ok(())
}

/// Converts a sparse model to one of the supported output formats.
pub fn convert_model(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let input_path = project
        .converter
        .input_path
        .as_deref()
        .ok_or(PipelineError::MissingOption("converter.input_path"))?;
    let output_path = project
        .converter
        .output_path
        .clone()
        .ok_or(PipelineError::MissingOption("converter.output_path"))?;
    let output_type = project
        .converter
        .output_type
        .as_deref()
        .ok_or(PipelineError::MissingOption("converter.output_type"))?;

    let recon = Reconstruction::read(input_path)?;

    match output_type.to_lowercase().as_str() {
        "bin" => {
            fs::create_dir_all(&output_path)?;
            recon.write(&output_path)?;
        }
        "txt" => {
            fs::create_dir_all(&output_path)?;
            recon.write_text(&output_path)?;
        }
        "nvm" => nvm::export(&recon, &output_path)?,
        "bundler" => {
            let bundle_path = append_extension(&output_path, ".bundle.out");
            let list_path = append_extension(&output_path, ".list.txt");
            bundler::export(&recon, bundle_path, list_path)?;
        }
        "ply" => {
            let cloud = points_of(&recon);
            ply::write_point_cloud(&output_path, &cloud)?;
        }
        "vrml" => {
            let base = output_path.with_extension("");
            vrml::export_images(
                &recon,
                append_extension(&base, ".images.wrl"),
                1.0,
                [1.0, 0.0, 0.0],
            )?;
            vrml::export_points(&recon, append_extension(&base, ".points3D.wrl"))?;
        }
        other => {
            return Err(PipelineError::InvalidOption {
                key: "converter.output_type",
                value: other.to_string(),
                expected: "{BIN, TXT, NVM, Bundler, VRML, PLY}",
            })
        }
    }
    log::info!("Converted model to {}", output_type);
    Ok(())
}

fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn points_of(recon: &Reconstruction) -> aperture_scene::PointCloud {
    let points: Vec<[f64; 3]> = recon.points3d.values().map(|p| p.xyz).collect();
    let colors: Vec<[u8; 3]> = recon.points3d.values().map(|p| p.color).collect();
    aperture_scene::PointCloud::new(points, Some(colors), None)
}

/// Undistorts the images of a sparse model into a dense workspace.
pub fn undistort_images(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let image_path = project.require_image_path()?.to_path_buf();
    let input_path = project
        .undistorter
        .input_path
        .clone()
        .ok_or(PipelineError::MissingOption("undistorter.input_path"))?;
    let output_path = project
        .undistorter
        .output_path
        .clone()
        .ok_or(PipelineError::MissingOption("undistorter.output_path"))?;
    let layout = UndistortLayout::parse(&project.undistorter.output_type)?;
    let options = project.undistorter.to_options();

    let model = Reconstruction::read(&input_path)?;
    run_on_worker("image undistortion", move || {
        let undistorter = ImageUndistorter::new(model, image_path, output_path, layout, options);
        undistorter.run().map_err(PipelineError::from)
    })?;
    Ok(())
}

/// Computes depth and normal maps for a dense workspace.
pub fn patch_match_stereo(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let workspace_path = project
        .patch_match
        .workspace_path
        .clone()
        .ok_or(PipelineError::MissingOption("patch_match.workspace_path"))?;
    let format = WorkspaceFormat::parse(&project.patch_match.workspace_format)?;
    let options = project.patch_match.to_options();

    run_on_worker("patch-match stereo", move || {
        let workspace = Workspace::load(workspace_path, format)?;
        let controller = PatchMatchController::new(workspace, options);
        controller.run().map_err(PipelineError::from)
    })?;
    Ok(())
}

/// Fuses the depth maps of a workspace into a point cloud with visibility.
pub fn fuse_stereo(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let workspace_path = project
        .fusion
        .workspace_path
        .clone()
        .ok_or(PipelineError::MissingOption("fusion.workspace_path"))?;
    let output_path = project
        .fusion
        .output_path
        .clone()
        .ok_or(PipelineError::MissingOption("fusion.output_path"))?;
    let format = WorkspaceFormat::parse(&project.fusion.workspace_format)?;
    let input_type = StereoInputType::parse(&project.fusion.input_type)?;
    let options: FusionOptions = project.fusion.to_options(input_type);

    let fused = run_on_worker("stereo fusion", move || {
        let workspace = Workspace::load(workspace_path, format)?;
        let fusion = StereoFusion::new(workspace, options);
        fusion.run().map_err(PipelineError::from)
    })?;

    log::info!("Writing output: {}", output_path.display());
    ply::write_point_cloud(&output_path, &fused.cloud)?;
    write_visibility(append_extension(&output_path, ".vis"), &fused.visibility)?;
    Ok(())
}

/// Meshes a fused point cloud or a sparse model into a surface.
pub fn mesh_model(project_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let project = Project::load(project_path)?;
    let input_path = project
        .mesher
        .input_path
        .clone()
        .ok_or(PipelineError::MissingOption("mesher.input_path"))?;
    let output_path = project
        .mesher
        .output_path
        .clone()
        .ok_or(PipelineError::MissingOption("mesher.output_path"))?;
    let input_type = MeshInputType::parse(&project.mesher.input_type)?;
    let options = project.mesher.to_options(input_type);

    run_on_worker("meshing", move || {
        let mesher = Mesher::new(input_path, output_path, options);
        mesher.run().map_err(PipelineError::from)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_project(dir: &Path, project: &Project) -> PathBuf {
        let path = dir.join("project.json");
        project.save(&path).unwrap();
        path
    }

    #[test]
    fn test_create_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::default();
        project.database_path = Some(dir.path().join("database.bin"));
        let project_path = write_project(dir.path(), &project);

        create_database(&project_path).unwrap();
        let db = Database::open(dir.path().join("database.bin")).unwrap();
        assert_eq!(db.num_images(), 0);
    }

    #[test]
    fn test_create_database_requires_path() {
        let dir = tempfile::tempdir().unwrap();
        let project_path = write_project(dir.path(), &Project::default());
        assert!(matches!(
            create_database(&project_path),
            Err(PipelineError::MissingOption("database_path"))
        ));
    }

    #[test]
    fn test_extract_features_empty_list_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let list_path = dir.path().join("list.txt");
        std::fs::write(&list_path, "").unwrap();

        let mut project = Project::default();
        project.database_path = Some(dir.path().join("database.bin"));
        project.image_path = Some(dir.path().to_path_buf());
        project.extraction.image_list_path = Some(list_path);
        let project_path = write_project(dir.path(), &project);

        extract_features(&project_path).unwrap();
    }

    #[test]
    fn test_extract_features_rejects_bad_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::default();
        project.database_path = Some(dir.path().join("database.bin"));
        project.image_path = Some(dir.path().to_path_buf());
        project.extraction.camera_model = "NO_SUCH_MODEL".to_string();
        let project_path = write_project(dir.path(), &project);

        assert!(matches!(
            extract_features(&project_path),
            Err(PipelineError::Camera(_))
        ));
    }

    #[test]
    fn test_reconstruct_sparse_requires_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::default();
        project.database_path = Some(dir.path().join("database.bin"));
        project.mapper.output_path = Some(dir.path().join("missing"));
        let project_path = write_project(dir.path(), &project);

        assert!(matches!(
            reconstruct_sparse(&project_path),
            Err(PipelineError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_convert_model_rejects_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir(&model_dir).unwrap();
        Reconstruction::new().write(&model_dir).unwrap();

        let mut project = Project::default();
        project.converter.input_path = Some(model_dir);
        project.converter.output_path = Some(dir.path().join("out"));
        project.converter.output_type = Some("OBJ".to_string());
        let project_path = write_project(dir.path(), &project);

        let err = convert_model(&project_path).unwrap_err();
        assert!(err.to_string().contains("Bundler"));
    }

    #[test]
    fn test_convert_model_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir(&model_dir).unwrap();
        Reconstruction::new().write(&model_dir).unwrap();

        let mut project = Project::default();
        project.converter.input_path = Some(model_dir);
        project.converter.output_path = Some(dir.path().join("out.ply"));
        project.converter.output_type = Some("Ply".to_string());
        let project_path = write_project(dir.path(), &project);
        convert_model(&project_path).unwrap();
        assert!(dir.path().join("out.ply").is_file());
    }

    #[test]
    fn test_convert_model_txt_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir(&model_dir).unwrap();
        Reconstruction::new().write(&model_dir).unwrap();

        let out_dir = dir.path().join("txt");
        let mut project = Project::default();
        project.converter.input_path = Some(model_dir);
        project.converter.output_path = Some(out_dir.clone());
        project.converter.output_type = Some("TXT".to_string());
        let project_path = write_project(dir.path(), &project);
        convert_model(&project_path).unwrap();
        assert!(out_dir.join("cameras.txt").is_file());
        assert!(Reconstruction::read(&out_dir).is_ok());
    }

    #[test]
    fn test_patch_match_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::default();
        project.patch_match.workspace_path = Some(dir.path().to_path_buf());
        project.patch_match.workspace_format = "VOXEL".to_string();
        let project_path = write_project(dir.path(), &project);
        assert!(matches!(
            patch_match_stereo(&project_path),
            Err(PipelineError::Mvs(aperture_mvs::MvsError::InvalidChoice { .. }))
        ));
    }

    #[test]
    fn test_fusion_rejects_unknown_input_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::default();
        project.fusion.workspace_path = Some(dir.path().to_path_buf());
        project.fusion.output_path = Some(dir.path().join("fused.ply"));
        project.fusion.input_type = "radiometric".to_string();
        let project_path = write_project(dir.path(), &project);
        assert!(fuse_stereo(&project_path).is_err());
    }

    #[test]
    fn test_mesher_requires_paths() {
        let dir = tempfile::tempdir().unwrap();
        let project_path = write_project(dir.path(), &Project::default());
        assert!(matches!(
            mesh_model(&project_path),
            Err(PipelineError::MissingOption("mesher.input_path"))
        ));
    }
}
