#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Oriented binary descriptors.
pub mod brief;

/// The single-file feature database.
pub mod db;

mod error;

/// The feature extraction controller.
pub mod extractor;

/// FAST corner detection.
pub mod fast;

/// Descriptor matching and the exhaustive matching controller.
pub mod matcher;

/// Two-view geometric verification.
pub mod two_view;

pub use db::{Database, DbCamera, DbImage, Keypoint, TwoViewGeometry};
pub use error::FeatureError;
pub use extractor::{ExtractionOptions, ExtractionSummary, FeatureExtractor};
pub use matcher::{ExhaustiveMatcher, MatchingOptions, MatchingSummary};
