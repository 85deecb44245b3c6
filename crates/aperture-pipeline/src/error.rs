use std::path::PathBuf;

use aperture_core::CameraError;
use aperture_features::FeatureError;
use aperture_mvs::MvsError;
use aperture_scene::SceneError;
use aperture_sfm::SfmError;

/// Error types for the pipeline layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// The project file did not parse.
    #[error("invalid project file: {0}")]
    Json(#[from] serde_json::Error),

    /// A required option is missing from the project.
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),

    /// A path option must point to an existing directory.
    #[error("`{key}` is not a directory: {path}")]
    NotADirectory {
        /// Option name.
        key: &'static str,
        /// Offending path.
        path: PathBuf,
    },

    /// The feature subsystem failed.
    #[error(transparent)]
    Feature(#[from] FeatureError),

    /// The mapping subsystem failed.
    #[error(transparent)]
    Sfm(#[from] SfmError),

    /// Sparse model I/O failed.
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// The dense subsystem failed.
    #[error(transparent)]
    Mvs(#[from] MvsError),

    /// Camera model or parameters were invalid.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// A selector option has an unsupported value.
    #[error("invalid `{key}` {value:?} - supported values are {expected}")]
    InvalidOption {
        /// Option name.
        key: &'static str,
        /// Rejected value.
        value: String,
        /// Human-readable list of supported values.
        expected: &'static str,
    },

    /// A worker thread panicked.
    #[error("{0} worker panicked")]
    WorkerPanic(&'static str),
}
