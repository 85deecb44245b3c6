use std::collections::BTreeMap;
use std::path::Path;

use aperture_core::{Camera, Rigid3};
use nalgebra::Vector3;

use crate::io::SceneError;

/// A 2D feature observation in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Point2 {
    /// Pixel position.
    pub xy: [f64; 2],
    /// Id of the observed 3D point, if the observation is part of a track.
    pub point3d_id: Option<u64>,
}

/// One observation reference inside a 3D point track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackElement {
    /// Image the observation belongs to.
    pub image_id: u32,
    /// Index into the image's 2D point list.
    pub point2_idx: u32,
}

/// A registered image with its pose and observations.
#[derive(Debug, Clone)]
pub struct SceneImage {
    /// Unique image id.
    pub image_id: u32,
    /// Id of the camera the image was taken with.
    pub camera_id: u32,
    /// File name relative to the image root.
    pub name: String,
    /// Camera-from-world pose.
    pub cam_from_world: Rigid3,
    /// 2D feature observations.
    pub points2: Vec<Point2>,
}

impl SceneImage {
    /// Number of observations that are part of a 3D point track.
    pub fn num_points3d(&self) -> usize {
        self.points2.iter().filter(|p| p.point3d_id.is_some()).count()
    }
}

/// A triangulated 3D point with its color, error and track.
#[derive(Debug, Clone)]
pub struct Point3d {
    /// World position.
    pub xyz: [f64; 3],
    /// RGB color.
    pub color: [u8; 3],
    /// Mean reprojection error in pixels, negative when not yet computed.
    pub error: f64,
    /// Observations of the point.
    pub track: Vec<TrackElement>,
}

/// A sparse reconstruction: cameras, registered images and 3D points.
///
/// Images are added when they are registered, so the image map and the
/// registration order cover the same set of ids.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    /// Cameras by id.
    pub cameras: BTreeMap<u32, Camera>,
    /// Registered images by id.
    pub images: BTreeMap<u32, SceneImage>,
    /// 3D points by id.
    pub points3d: BTreeMap<u64, Point3d>,
    registered_order: Vec<u32>,
    next_point3d_id: u64,
}

impl Reconstruction {
    /// Creates an empty reconstruction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a camera, replacing any camera with the same id.
    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.insert(camera.camera_id, camera);
    }

    /// Adds an image and marks it registered.
    pub fn add_image(&mut self, image: SceneImage) {
        let image_id = image.image_id;
        if self.images.insert(image_id, image).is_none() {
            self.registered_order.push(image_id);
        }
    }

    /// Removes an image and all its observations.
    pub fn remove_image(&mut self, image_id: u32) {
        let point_ids: Vec<u64> = match self.images.get(&image_id) {
            Some(image) => image.points2.iter().filter_map(|p| p.point3d_id).collect(),
            None => return,
        };
        for point3d_id in point_ids {
            if let Some(point) = self.points3d.get_mut(&point3d_id) {
                point.track.retain(|t| t.image_id != image_id);
                if point.track.len() < 2 {
                    self.delete_point3d(point3d_id);
                }
            }
        }
        self.images.remove(&image_id);
        self.registered_order.retain(|&id| id != image_id);
    }

    /// Image ids in registration order.
    pub fn registered_image_ids(&self) -> &[u32] {
        &self.registered_order
    }

    /// Number of registered images.
    pub fn num_registered_images(&self) -> usize {
        self.registered_order.len()
    }

    /// True if the image id is registered.
    pub fn is_registered(&self, image_id: u32) -> bool {
        self.images.contains_key(&image_id)
    }

    /// Adds a 3D point and links the track observations to it.
    ///
    /// Returns the new point id.
    pub fn add_point3d(&mut self, xyz: [f64; 3], color: [u8; 3], track: Vec<TrackElement>) -> u64 {
        let point3d_id = self.next_point3d_id;
        self.next_point3d_id += 1;
        for element in &track {
            if let Some(image) = self.images.get_mut(&element.image_id) {
                image.points2[element.point2_idx as usize].point3d_id = Some(point3d_id);
            }
        }
        self.points3d.insert(
            point3d_id,
            Point3d {
                xyz,
                color,
                error: -1.0,
                track,
            },
        );
        point3d_id
    }

    /// Appends an observation to an existing point's track.
    pub fn add_observation(&mut self, point3d_id: u64, element: TrackElement) {
        if let Some(point) = self.points3d.get_mut(&point3d_id) {
            if let Some(image) = self.images.get_mut(&element.image_id) {
                image.points2[element.point2_idx as usize].point3d_id = Some(point3d_id);
            }
            point.track.push(element);
        }
    }

    /// Removes one observation from a point, deleting the point when its
    /// track shrinks below two elements.
    pub fn delete_observation(&mut self, point3d_id: u64, image_id: u32, point2_idx: u32) {
        let delete_point = if let Some(point) = self.points3d.get_mut(&point3d_id) {
            point
                .track
                .retain(|t| !(t.image_id == image_id && t.point2_idx == point2_idx));
            if let Some(image) = self.images.get_mut(&image_id) {
                image.points2[point2_idx as usize].point3d_id = None;
            }
            point.track.len() < 2
        } else {
            false
        };
        if delete_point {
            self.delete_point3d(point3d_id);
        }
    }

    /// Deletes a point and clears all links to it.
    pub fn delete_point3d(&mut self, point3d_id: u64) {
        if let Some(point) = self.points3d.remove(&point3d_id) {
            for element in point.track {
                if let Some(image) = self.images.get_mut(&element.image_id) {
                    image.points2[element.point2_idx as usize].point3d_id = None;
                }
            }
        }
    }

    /// Reserves point ids at or above `min_id` for future points.
    pub fn bump_point3d_id(&mut self, min_id: u64) {
        self.next_point3d_id = self.next_point3d_id.max(min_id);
    }

    /// Mean track length over all points, 0 when empty.
    pub fn mean_track_length(&self) -> f64 {
        if self.points3d.is_empty() {
            return 0.0;
        }
        let total: usize = self.points3d.values().map(|p| p.track.len()).sum();
        total as f64 / self.points3d.len() as f64
    }

    /// Mean reprojection error over all observations, in pixels.
    pub fn mean_reprojection_error(&self) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for point in self.points3d.values() {
            for element in &point.track {
                if let Some(error) = self.reprojection_error(point, element) {
                    total += error;
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Reprojection error of a single observation, `None` when the point is
    /// behind the camera or the reference is dangling.
    pub fn reprojection_error(&self, point: &Point3d, element: &TrackElement) -> Option<f64> {
        let image = self.images.get(&element.image_id)?;
        let camera = self.cameras.get(&image.camera_id)?;
        let world = Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]);
        let cam = image.cam_from_world.transform_point(&world);
        let (px, py) = camera.project(&[cam.x, cam.y, cam.z])?;
        let observed = &image.points2[element.point2_idx as usize].xy;
        Some(((px - observed[0]).powi(2) + (py - observed[1]).powi(2)).sqrt())
    }

    /// Recomputes the per-point mean reprojection errors.
    pub fn update_point_errors(&mut self) {
        let ids: Vec<u64> = self.points3d.keys().copied().collect();
        for id in ids {
            let point = self.points3d[&id].clone();
            let mut total = 0.0;
            let mut count = 0usize;
            for element in &point.track {
                if let Some(error) = self.reprojection_error(&point, element) {
                    total += error;
                    count += 1;
                }
            }
            let error = if count == 0 { -1.0 } else { total / count as f64 };
            self.points3d.get_mut(&id).unwrap().error = error;
        }
    }

    /// Writes the reconstruction in binary format to a directory.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), SceneError> {
        crate::io::binary::write(self, path)
    }

    /// Writes the reconstruction in text format to a directory.
    pub fn write_text(&self, path: impl AsRef<Path>) -> Result<(), SceneError> {
        crate::io::text::write(self, path)
    }

    /// Reads a reconstruction from a directory, preferring the binary format
    /// when both are present.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, SceneError> {
        let path = path.as_ref();
        if path.join("cameras.bin").is_file() {
            crate::io::binary::read(path)
        } else if path.join("cameras.txt").is_file() {
            crate::io::text::read(path)
        } else {
            Err(SceneError::NotFound(path.to_path_buf()))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use aperture_core::CameraModelId;
    use nalgebra::UnitQuaternion;

    /// A small two-camera, three-image reconstruction with linked tracks,
    /// shared by the format round-trip tests.
    pub(crate) fn sample_reconstruction() -> Reconstruction {
        let mut recon = Reconstruction::new();
        recon.add_camera(Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 640,
            height: 480,
            params: vec![525.0, 530.0, 320.0, 240.0],
        });
        recon.add_camera(Camera {
            camera_id: 2,
            model_id: CameraModelId::SimpleRadial,
            width: 800,
            height: 600,
            params: vec![700.0, 400.0, 300.0, 0.015],
        });

        for (image_id, camera_id) in [(1u32, 1u32), (2, 1), (3, 2)] {
            let pose = Rigid3::new(
                UnitQuaternion::from_euler_angles(
                    0.01 * image_id as f64,
                    -0.02 * image_id as f64,
                    0.05,
                ),
                Vector3::new(image_id as f64 * 0.5, 0.0, 0.1),
            );
            recon.add_image(SceneImage {
                image_id,
                camera_id,
                name: format!("frame{:04}.png", image_id),
                cam_from_world: pose,
                points2: (0..5)
                    .map(|i| Point2 {
                        xy: [10.0 * i as f64 + 0.25, 7.0 * i as f64 + 0.75],
                        point3d_id: None,
                    })
                    .collect(),
            });
        }

        recon.add_point3d(
            [0.5, -0.25, 4.0],
            [200, 100, 50],
            vec![
                TrackElement {
                    image_id: 1,
                    point2_idx: 0,
                },
                TrackElement {
                    image_id: 2,
                    point2_idx: 1,
                },
            ],
        );
        recon.add_point3d(
            [-1.0, 0.75, 6.5],
            [10, 220, 30],
            vec![
                TrackElement {
                    image_id: 1,
                    point2_idx: 2,
                },
                TrackElement {
                    image_id: 2,
                    point2_idx: 3,
                },
                TrackElement {
                    image_id: 3,
                    point2_idx: 0,
                },
            ],
        );
        recon.update_point_errors();
        recon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_core::CameraModelId;

    fn test_image(image_id: u32, num_points: usize) -> SceneImage {
        SceneImage {
            image_id,
            camera_id: 1,
            name: format!("image{:03}.png", image_id),
            cam_from_world: Rigid3::identity(),
            points2: (0..num_points)
                .map(|i| Point2 {
                    xy: [i as f64, i as f64 + 0.5],
                    point3d_id: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_register_and_order() {
        let mut recon = Reconstruction::new();
        recon.add_image(test_image(3, 2));
        recon.add_image(test_image(1, 2));
        assert_eq!(recon.registered_image_ids(), &[3, 1]);
        assert!(recon.is_registered(3));
        assert!(!recon.is_registered(2));
    }

    #[test]
    fn test_track_bookkeeping() {
        let mut recon = Reconstruction::new();
        recon.add_camera(Camera::with_default_params(
            1,
            CameraModelId::SimplePinhole,
            640,
            480,
            1.2,
        ));
        recon.add_image(test_image(1, 4));
        recon.add_image(test_image(2, 4));
        recon.add_image(test_image(3, 4));

        let id = recon.add_point3d(
            [0.0, 0.0, 5.0],
            [255, 0, 0],
            vec![
                TrackElement {
                    image_id: 1,
                    point2_idx: 0,
                },
                TrackElement {
                    image_id: 2,
                    point2_idx: 1,
                },
            ],
        );
        assert_eq!(recon.images[&1].points2[0].point3d_id, Some(id));
        assert_eq!(recon.images[&2].points2[1].point3d_id, Some(id));

        recon.add_observation(
            id,
            TrackElement {
                image_id: 3,
                point2_idx: 2,
            },
        );
        assert_eq!(recon.points3d[&id].track.len(), 3);

        recon.delete_observation(id, 3, 2);
        assert_eq!(recon.points3d[&id].track.len(), 2);
        assert_eq!(recon.images[&3].points2[2].point3d_id, None);

        // Dropping below two observations deletes the point entirely.
        recon.delete_observation(id, 2, 1);
        assert!(!recon.points3d.contains_key(&id));
        assert_eq!(recon.images[&1].points2[0].point3d_id, None);
    }

    #[test]
    fn test_remove_image_prunes_tracks() {
        let mut recon = Reconstruction::new();
        recon.add_image(test_image(1, 2));
        recon.add_image(test_image(2, 2));
        let id = recon.add_point3d(
            [1.0, 2.0, 3.0],
            [0, 0, 0],
            vec![
                TrackElement {
                    image_id: 1,
                    point2_idx: 0,
                },
                TrackElement {
                    image_id: 2,
                    point2_idx: 0,
                },
            ],
        );
        recon.remove_image(2);
        assert!(!recon.points3d.contains_key(&id));
        assert_eq!(recon.registered_image_ids(), &[1]);
    }

    #[test]
    fn test_mean_track_length() {
        let mut recon = Reconstruction::new();
        recon.add_image(test_image(1, 4));
        recon.add_image(test_image(2, 4));
        recon.add_point3d(
            [0.0; 3],
            [0; 3],
            vec![
                TrackElement {
                    image_id: 1,
                    point2_idx: 0,
                },
                TrackElement {
                    image_id: 2,
                    point2_idx: 0,
                },
            ],
        );
        assert!((recon.mean_track_length() - 2.0).abs() < 1e-12);
    }
}
