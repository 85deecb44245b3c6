#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Binary depth and normal map format.
pub mod depth_map;

mod error;
mod mc_tables;

/// Depth map fusion into a point cloud.
pub mod fusion;

/// Surface meshing from fused or sparse points.
pub mod meshing;

/// CPU patch-match stereo.
pub mod patch_match;

/// Image undistortion into dense workspaces.
pub mod undistort;

/// Dense workspace layouts.
pub mod workspace;

pub use error::MvsError;
pub use fusion::{FusionOptions, StereoFusion, StereoInputType};
pub use meshing::{MeshInputType, Mesher, MeshingOptions};
pub use patch_match::{PatchMatchController, PatchMatchOptions};
pub use undistort::{ImageUndistorter, UndistortLayout, UndistortOptions};
pub use workspace::{Workspace, WorkspaceFormat};
