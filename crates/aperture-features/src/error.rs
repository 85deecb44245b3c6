use std::path::PathBuf;

use aperture_core::CameraError;
use aperture_image::BitmapError;

/// Error types for the feature subsystem.
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// Database serialization failed.
    #[error("database serialization error: {0}")]
    Bincode(String),

    /// An image failed to load or decode.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    /// Camera model or parameters were invalid.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// Images taken with a shared camera must have equal dimensions.
    #[error(
        "single camera requested but {name} is {width}x{height}, expected {expected_width}x{expected_height}"
    )]
    ImageSizeMismatch {
        /// Offending image name.
        name: String,
        /// Offending image width.
        width: usize,
        /// Offending image height.
        height: usize,
        /// Width of the first image.
        expected_width: usize,
        /// Height of the first image.
        expected_height: usize,
    },

    /// The database does not exist at the given path.
    #[error("database not found at {0}")]
    DatabaseNotFound(PathBuf),

    /// The database references an unknown image id.
    #[error("unknown image id {0} in database")]
    UnknownImage(u32),
}
