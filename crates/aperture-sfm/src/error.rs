use aperture_core::CameraError;
use aperture_features::FeatureError;
use aperture_scene::SceneError;

/// Error types for the mapping subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SfmError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// Feature database access failed.
    #[error(transparent)]
    Feature(#[from] FeatureError),

    /// Sparse model I/O failed.
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// A camera entry in the database was invalid.
    #[error(transparent)]
    Camera(#[from] CameraError),
}
