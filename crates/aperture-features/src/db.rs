//! Single-file feature database.
//!
//! The database holds everything the mapper needs between pipeline stages:
//! cameras, images, keypoints, descriptors, raw matches and verified
//! two-view geometries. Pairs are keyed order-independently; match indices
//! are stored relative to the image with the smaller id.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use bincode::{Decode, Encode};

use crate::error::FeatureError;

/// A detected feature point.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Keypoint {
    /// x position in pixels at full resolution.
    pub x: f32,
    /// y position in pixels at full resolution.
    pub y: f32,
    /// Pyramid scale the point was detected at.
    pub scale: f32,
    /// Orientation in radians.
    pub orientation: f32,
}

/// A camera row in the database.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct DbCamera {
    /// Numeric camera model id.
    pub model_id: i32,
    /// Sensor width in pixels.
    pub width: u64,
    /// Sensor height in pixels.
    pub height: u64,
    /// Intrinsic parameters.
    pub params: Vec<f64>,
    /// True when the focal length came from the user rather than a heuristic.
    pub prior_focal_length: bool,
}

/// An image row in the database.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct DbImage {
    /// File name relative to the image root.
    pub name: String,
    /// Camera the image was taken with.
    pub camera_id: u32,
}

/// A geometrically verified image pair.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TwoViewGeometry {
    /// Inlier matches, indices relative to the smaller image id first.
    pub inlier_matches: Vec<(u32, u32)>,
    /// Fundamental matrix, row-major.
    pub fundamental: [[f64; 3]; 3],
}

/// Builds the order-independent pair key; the flag is true when the
/// arguments were swapped.
pub fn pair_id(image_id1: u32, image_id2: u32) -> (u64, bool) {
    if image_id1 <= image_id2 {
        (((image_id1 as u64) << 32) | image_id2 as u64, false)
    } else {
        (((image_id2 as u64) << 32) | image_id1 as u64, true)
    }
}

/// Splits a pair key back into (smaller, larger) image ids.
pub fn pair_from_id(pair_id: u64) -> (u32, u32) {
    ((pair_id >> 32) as u32, (pair_id & 0xffff_ffff) as u32)
}

/// The feature database.
#[derive(Debug, Default, Clone, Encode, Decode)]
pub struct Database {
    cameras: BTreeMap<u32, DbCamera>,
    images: BTreeMap<u32, DbImage>,
    keypoints: BTreeMap<u32, Vec<Keypoint>>,
    descriptors: BTreeMap<u32, Vec<[u8; 32]>>,
    matches: BTreeMap<u64, Vec<(u32, u32)>>,
    two_view_geometries: BTreeMap<u64, TwoViewGeometry>,
}

impl Database {
    /// Creates an empty database file; the parent directory must exist.
    pub fn create(path: impl AsRef<Path>) -> Result<(), FeatureError> {
        Database::default().save(path)
    }

    /// Loads a database from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FeatureError::DatabaseNotFound(path.to_path_buf()));
        }
        let mut reader = BufReader::new(File::open(path)?);
        bincode::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| FeatureError::Bincode(e.to_string()))
    }

    /// Persists the database to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FeatureError> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| FeatureError::Bincode(e.to_string()))?;
        Ok(())
    }

    /// Adds a camera and returns its id.
    pub fn add_camera(&mut self, camera: DbCamera) -> u32 {
        let camera_id = self.cameras.keys().next_back().map_or(1, |id| id + 1);
        self.cameras.insert(camera_id, camera);
        camera_id
    }

    /// Adds an image and returns its id.
    pub fn add_image(&mut self, name: impl Into<String>, camera_id: u32) -> u32 {
        let image_id = self.images.keys().next_back().map_or(1, |id| id + 1);
        self.images.insert(
            image_id,
            DbImage {
                name: name.into(),
                camera_id,
            },
        );
        image_id
    }

    /// Camera by id.
    pub fn camera(&self, camera_id: u32) -> Option<&DbCamera> {
        self.cameras.get(&camera_id)
    }

    /// Image by id.
    pub fn image(&self, image_id: u32) -> Option<&DbImage> {
        self.images.get(&image_id)
    }

    /// Looks up an image id by name.
    pub fn image_id_by_name(&self, name: &str) -> Option<u32> {
        self.images
            .iter()
            .find(|(_, image)| image.name == name)
            .map(|(&id, _)| id)
    }

    /// All image ids in ascending order.
    pub fn image_ids(&self) -> Vec<u32> {
        self.images.keys().copied().collect()
    }

    /// Number of images.
    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// Stores the keypoints of an image.
    pub fn set_keypoints(&mut self, image_id: u32, keypoints: Vec<Keypoint>) {
        self.keypoints.insert(image_id, keypoints);
    }

    /// Keypoints of an image, empty when none were extracted.
    pub fn keypoints(&self, image_id: u32) -> &[Keypoint] {
        self.keypoints.get(&image_id).map_or(&[], Vec::as_slice)
    }

    /// Stores the descriptors of an image.
    pub fn set_descriptors(&mut self, image_id: u32, descriptors: Vec<[u8; 32]>) {
        self.descriptors.insert(image_id, descriptors);
    }

    /// Descriptors of an image, empty when none were extracted.
    pub fn descriptors(&self, image_id: u32) -> &[[u8; 32]] {
        self.descriptors.get(&image_id).map_or(&[], Vec::as_slice)
    }

    /// Stores raw matches for a pair, in either id order.
    pub fn set_matches(&mut self, image_id1: u32, image_id2: u32, matches: Vec<(u32, u32)>) {
        let (id, swapped) = pair_id(image_id1, image_id2);
        let matches = if swapped {
            matches.into_iter().map(|(a, b)| (b, a)).collect()
        } else {
            matches
        };
        self.matches.insert(id, matches);
    }

    /// Raw matches for a pair, reindexed to the query order.
    pub fn matches(&self, image_id1: u32, image_id2: u32) -> Vec<(u32, u32)> {
        let (id, swapped) = pair_id(image_id1, image_id2);
        let stored = self.matches.get(&id).cloned().unwrap_or_default();
        if swapped {
            stored.into_iter().map(|(a, b)| (b, a)).collect()
        } else {
            stored
        }
    }

    /// Stores a verified two-view geometry for a pair, in either id order.
    pub fn set_two_view_geometry(
        &mut self,
        image_id1: u32,
        image_id2: u32,
        mut geometry: TwoViewGeometry,
    ) {
        let (id, swapped) = pair_id(image_id1, image_id2);
        if swapped {
            geometry.inlier_matches = geometry
                .inlier_matches
                .into_iter()
                .map(|(a, b)| (b, a))
                .collect();
        }
        self.two_view_geometries.insert(id, geometry);
    }

    /// Verified geometry for a pair, reindexed to the query order.
    pub fn two_view_geometry(&self, image_id1: u32, image_id2: u32) -> Option<TwoViewGeometry> {
        let (id, swapped) = pair_id(image_id1, image_id2);
        let mut geometry = self.two_view_geometries.get(&id).cloned()?;
        if swapped {
            geometry.inlier_matches = geometry
                .inlier_matches
                .into_iter()
                .map(|(a, b)| (b, a))
                .collect();
        }
        Some(geometry)
    }

    /// Pair keys of all verified geometries.
    pub fn geometry_pair_ids(&self) -> Vec<u64> {
        self.two_view_geometries.keys().copied().collect()
    }

    /// Number of verified pairs.
    pub fn num_verified_pairs(&self) -> usize {
        self.two_view_geometries.len()
    }
}
