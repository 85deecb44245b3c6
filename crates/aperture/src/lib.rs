#![doc = env!("CARGO_PKG_DESCRIPTION")]

#[doc(inline)]
pub use aperture_core as core;

#[doc(inline)]
pub use aperture_image as image;

#[doc(inline)]
pub use aperture_scene as scene;

#[doc(inline)]
pub use aperture_features as features;

#[doc(inline)]
pub use aperture_sfm as sfm;

#[doc(inline)]
pub use aperture_mvs as mvs;

#[doc(inline)]
pub use aperture_pipeline as pipeline;
