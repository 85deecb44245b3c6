//! The correspondence graph built from verified two-view geometries.

use std::collections::BTreeMap;

use aperture_core::{Camera, CameraModelId};
use aperture_features::db::{pair_from_id, pair_id, Database};

use crate::error::SfmError;

/// Per-image data the mapper needs.
#[derive(Debug, Clone)]
pub struct ImageNode {
    /// Image file name.
    pub name: String,
    /// Camera the image was taken with.
    pub camera_id: u32,
    /// Keypoint positions in pixels.
    pub keypoints: Vec<[f64; 2]>,
}

/// Images, cameras and verified pairwise inlier matches.
#[derive(Debug, Clone, Default)]
pub struct CorrespondenceGraph {
    /// Image nodes by id.
    pub images: BTreeMap<u32, ImageNode>,
    /// Cameras by id.
    pub cameras: BTreeMap<u32, Camera>,
    /// Inlier matches per verified pair, indexed smaller image id first.
    pairs: BTreeMap<u64, Vec<(u32, u32)>>,
}

impl CorrespondenceGraph {
    /// Builds the graph from a feature database.
    pub fn from_database(db: &Database) -> Result<Self, SfmError> {
        let mut graph = CorrespondenceGraph::default();

        for image_id in db.image_ids() {
            let image = db
                .image(image_id)
                .ok_or(aperture_features::FeatureError::UnknownImage(image_id))?;
            if !graph.cameras.contains_key(&image.camera_id) {
                let db_camera = db
                    .camera(image.camera_id)
                    .ok_or(aperture_features::FeatureError::UnknownImage(image_id))?;
                graph.cameras.insert(
                    image.camera_id,
                    Camera {
                        camera_id: image.camera_id,
                        model_id: CameraModelId::from_id(db_camera.model_id)?,
                        width: db_camera.width as usize,
                        height: db_camera.height as usize,
                        params: db_camera.params.clone(),
                    },
                );
            }
            graph.images.insert(
                image_id,
                ImageNode {
                    name: image.name.clone(),
                    camera_id: image.camera_id,
                    keypoints: db
                        .keypoints(image_id)
                        .iter()
                        .map(|kp| [kp.x as f64, kp.y as f64])
                        .collect(),
                },
            );
        }

        for id in db.geometry_pair_ids() {
            let (a, b) = pair_from_id(id);
            if let Some(geometry) = db.two_view_geometry(a, b) {
                graph.pairs.insert(id, geometry.inlier_matches);
            }
        }

        Ok(graph)
    }

    /// Verified pairs as (smaller id, larger id, inlier count), sorted by
    /// descending inlier count.
    pub fn pairs_by_strength(&self) -> Vec<(u32, u32, usize)> {
        let mut pairs: Vec<(u32, u32, usize)> = self
            .pairs
            .iter()
            .map(|(&id, matches)| {
                let (a, b) = pair_from_id(id);
                (a, b, matches.len())
            })
            .collect();
        pairs.sort_by(|x, y| y.2.cmp(&x.2).then(x.0.cmp(&y.0)).then(x.1.cmp(&y.1)));
        pairs
    }

    /// Inlier matches between two images, reindexed to the query order.
    pub fn matches_between(&self, image_id1: u32, image_id2: u32) -> Vec<(u32, u32)> {
        let (id, swapped) = pair_id(image_id1, image_id2);
        let matches = self.pairs.get(&id).cloned().unwrap_or_default();
        if swapped {
            matches.into_iter().map(|(a, b)| (b, a)).collect()
        } else {
            matches
        }
    }

    /// Ids of images that share a verified pair with the given image.
    pub fn neighbors(&self, image_id: u32) -> Vec<u32> {
        let mut neighbors = Vec::new();
        for &id in self.pairs.keys() {
            let (a, b) = pair_from_id(id);
            if a == image_id {
                neighbors.push(b);
            } else if b == image_id {
                neighbors.push(a);
            }
        }
        neighbors
    }

    /// Camera of an image.
    pub fn camera_of(&self, image_id: u32) -> Option<&Camera> {
        let node = self.images.get(&image_id)?;
        self.cameras.get(&node.camera_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_features::db::{DbCamera, TwoViewGeometry};
    use aperture_features::Keypoint;

    fn test_database() -> Database {
        let mut db = Database::default();
        let camera_id = db.add_camera(DbCamera {
            model_id: 1,
            width: 640,
            height: 480,
            params: vec![500.0, 500.0, 320.0, 240.0],
            prior_focal_length: true,
        });
        for name in ["a.png", "b.png", "c.png"] {
            let image_id = db.add_image(name, camera_id);
            db.set_keypoints(
                image_id,
                (0..4)
                    .map(|i| Keypoint {
                        x: i as f32 * 10.0,
                        y: i as f32 * 5.0,
                        scale: 1.0,
                        orientation: 0.0,
                    })
                    .collect(),
            );
        }
        db.set_two_view_geometry(
            1,
            2,
            TwoViewGeometry {
                inlier_matches: vec![(0, 1), (1, 2), (2, 3)],
                fundamental: [[0.0; 3]; 3],
            },
        );
        db.set_two_view_geometry(
            2,
            3,
            TwoViewGeometry {
                inlier_matches: vec![(0, 0)],
                fundamental: [[0.0; 3]; 3],
            },
        );
        db
    }

    #[test]
    fn test_from_database() {
        let graph = CorrespondenceGraph::from_database(&test_database()).unwrap();
        assert_eq!(graph.images.len(), 3);
        assert_eq!(graph.cameras.len(), 1);
        assert_eq!(graph.images[&1].keypoints.len(), 4);
        assert_eq!(graph.camera_of(1).unwrap().model_id as i32, 1);
    }

    #[test]
    fn test_pairs_by_strength_sorted() {
        let graph = CorrespondenceGraph::from_database(&test_database()).unwrap();
        let pairs = graph.pairs_by_strength();
        assert_eq!(pairs[0], (1, 2, 3));
        assert_eq!(pairs[1], (2, 3, 1));
    }

    #[test]
    fn test_matches_between_orders() {
        let graph = CorrespondenceGraph::from_database(&test_database()).unwrap();
        assert_eq!(graph.matches_between(1, 2), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(graph.matches_between(2, 1), vec![(1, 0), (2, 1), (3, 2)]);
        assert!(graph.matches_between(1, 3).is_empty());
    }

    #[test]
    fn test_neighbors() {
        let graph = CorrespondenceGraph::from_database(&test_database()).unwrap();
        assert_eq!(graph.neighbors(2), vec![1, 3]);
        assert_eq!(graph.neighbors(1), vec![2]);
    }
}
