use std::path::PathBuf;

use aperture_core::CameraError;

/// Binary sparse model format.
pub mod binary;
/// Bundler export.
pub mod bundler;
/// NVM export.
pub mod nvm;
/// PLY point cloud and mesh I/O.
pub mod ply;
/// Text sparse model format.
pub mod text;
/// VRML export.
pub mod vrml;

/// Error types for scene I/O.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// A file did not parse as the expected format.
    #[error("parse error: {0}")]
    Parse(String),

    /// A camera entry was invalid.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// No sparse model was found at the given path.
    #[error("no sparse model found at {0}")]
    NotFound(PathBuf),

    /// The PLY file uses a layout this reader does not support.
    #[error("unsupported PLY layout: {0}")]
    UnsupportedPly(String),

    /// A camera model cannot be represented in the requested export format.
    #[error("camera {camera_id} with model {model} cannot be exported to {format}")]
    UnsupportedExportCamera {
        /// Offending camera id.
        camera_id: u32,
        /// Offending camera model name.
        model: &'static str,
        /// Target export format.
        format: &'static str,
    },
}
