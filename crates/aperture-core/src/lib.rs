#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Camera models with projection, distortion and parameter verification.
pub mod camera;

/// Rigid body transforms (unit quaternion + translation).
pub mod rigid;

pub use camera::{params_from_csv, verify_camera_params, Camera, CameraError, CameraModelId};
pub use rigid::Rigid3;
