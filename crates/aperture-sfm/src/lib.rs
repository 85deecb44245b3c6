#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// The mapping controller and reconstruction manager.
pub mod controller;

mod error;

/// The correspondence graph over verified image pairs.
pub mod graph;

/// Two-view initialization.
pub mod init;

/// The incremental mapper core.
pub mod mapper;

/// Absolute pose estimation.
pub mod pnp;

/// Pose and point refinement.
pub mod refine;

/// Point triangulation.
pub mod triangulate;

pub use controller::{
    IncrementalMapperController, MapperControllerOptions, MapperEvent, ReconstructionManager,
};
pub use error::SfmError;
pub use graph::CorrespondenceGraph;
pub use mapper::{IncrementalMapper, MapperOptions};
