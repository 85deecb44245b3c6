#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;

/// Pipeline operations: one entry point per reconstruction stage.
pub mod ops;

/// The project file.
pub mod project;

pub use error::PipelineError;
pub use project::Project;
