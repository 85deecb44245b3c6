use std::path::PathBuf;

use aperture_pipeline::{ops, PipelineError, Project};
use argh::FromArgs;

#[derive(FromArgs)]
/// Project-driven photogrammetric reconstruction pipeline.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    ProjectGenerator(ProjectGenerator),
    DatabaseCreator(DatabaseCreator),
    FeatureExtractor(FeatureExtractor),
    ExhaustiveMatcher(ExhaustiveMatcher),
    Mapper(Mapper),
    ModelConverter(ModelConverter),
    ImageUndistorter(ImageUndistorter),
    PatchMatchStereo(PatchMatchStereo),
    StereoFusion(StereoFusion),
    Mesher(Mesher),
}

#[derive(FromArgs)]
/// Write a project file with default options.
#[argh(subcommand, name = "project_generator")]
struct ProjectGenerator {
    /// where to write the project file
    #[argh(option)]
    output_path: PathBuf,
}

#[derive(FromArgs)]
/// Create an empty feature database.
#[argh(subcommand, name = "database_creator")]
struct DatabaseCreator {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Extract features for all images.
#[argh(subcommand, name = "feature_extractor")]
struct FeatureExtractor {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Match all image pairs exhaustively.
#[argh(subcommand, name = "exhaustive_matcher")]
struct ExhaustiveMatcher {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Reconstruct a sparse model incrementally.
#[argh(subcommand, name = "mapper")]
struct Mapper {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Convert a sparse model to another format.
#[argh(subcommand, name = "model_converter")]
struct ModelConverter {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Undistort images into a dense workspace.
#[argh(subcommand, name = "image_undistorter")]
struct ImageUndistorter {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Compute depth and normal maps.
#[argh(subcommand, name = "patch_match_stereo")]
struct PatchMatchStereo {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Fuse depth maps into a point cloud.
#[argh(subcommand, name = "stereo_fusion")]
struct StereoFusion {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

#[derive(FromArgs)]
/// Mesh a fused cloud or sparse model.
#[argh(subcommand, name = "mesher")]
struct Mesher {
    /// path to the project file
    #[argh(option)]
    project_path: PathBuf,
}

fn run(args: Args) -> Result<(), PipelineError> {
    match args.command {
        Command::ProjectGenerator(cmd) => {
            Project::default().save(&cmd.output_path)?;
            log::info!("Wrote project template to {}", cmd.output_path.display());
            Ok(())
        }
        Command::DatabaseCreator(cmd) => ops::create_database(cmd.project_path),
        Command::FeatureExtractor(cmd) => ops::extract_features(cmd.project_path),
        Command::ExhaustiveMatcher(cmd) => ops::match_features_exhaustively(cmd.project_path),
        Command::Mapper(cmd) => ops::reconstruct_sparse(cmd.project_path),
        Command::ModelConverter(cmd) => ops::convert_model(cmd.project_path),
        Command::ImageUndistorter(cmd) => ops::undistort_images(cmd.project_path),
        Command::PatchMatchStereo(cmd) => ops::patch_match_stereo(cmd.project_path),
        Command::StereoFusion(cmd) => ops::fuse_stereo(cmd.project_path),
        Command::Mesher(cmd) => ops::mesh_model(cmd.project_path),
    }
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
