#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// On-disk formats: sparse model text/binary, PLY, NVM, Bundler, VRML.
pub mod io;

/// Point cloud and triangle mesh containers.
pub mod pointcloud;

/// The sparse reconstruction data model.
pub mod reconstruction;

pub use io::SceneError;
pub use pointcloud::{PointCloud, TriangleMesh};
pub use reconstruction::{Point2, Point3d, Reconstruction, SceneImage, TrackElement};
