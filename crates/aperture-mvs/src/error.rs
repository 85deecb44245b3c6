use std::path::PathBuf;

use aperture_core::CameraError;
use aperture_image::BitmapError;
use aperture_scene::SceneError;

/// Error types for the dense reconstruction subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MvsError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// An image failed to load or decode.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    /// Sparse model I/O failed.
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// A camera in the model was invalid.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// A selector string did not match any supported value.
    #[error("invalid {option} {value:?} - supported values are {supported}")]
    InvalidChoice {
        /// Option name.
        option: &'static str,
        /// Rejected value.
        value: String,
        /// Human-readable list of supported values.
        supported: &'static str,
    },

    /// A map file header did not parse.
    #[error("invalid map header in {0}")]
    InvalidMapHeader(PathBuf),

    /// A workspace is missing a required entry.
    #[error("workspace at {path} is missing {what}")]
    IncompleteWorkspace {
        /// Workspace root.
        path: PathBuf,
        /// Missing piece.
        what: String,
    },

    /// A projection matrix could not be decomposed.
    #[error("projection matrix in {0} is degenerate")]
    DegenerateProjection(PathBuf),
}
