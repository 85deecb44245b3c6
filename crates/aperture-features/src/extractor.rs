//! The feature extraction controller.

use std::path::PathBuf;

use aperture_core::{params_from_csv, verify_camera_params, Camera, CameraModelId};
use aperture_image::{list_image_files, Bitmap, GrayBuffer};
use rayon::prelude::*;

use crate::brief;
use crate::db::{Database, DbCamera, Keypoint};
use crate::error::FeatureError;
use crate::fast;

/// Options for feature extraction.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Upper bound on keypoints per image, strongest first.
    pub max_num_features: usize,
    /// Images larger than this along either edge are downscaled before
    /// detection; keypoints are reported at full resolution. Zero disables.
    pub max_image_size: usize,
    /// FAST intensity threshold on [0, 1] values.
    pub fast_threshold: f32,
    /// Required contiguous arc length of the FAST segment test.
    pub fast_arc_length: usize,
    /// Number of pyramid levels.
    pub num_scales: usize,
    /// Downscale factor between pyramid levels.
    pub scale_factor: f64,
    /// Gaussian blur applied before computing descriptors.
    pub patch_blur_sigma: f32,
    /// Share one camera across all images.
    pub single_camera: bool,
    /// Camera model name for new camera rows.
    pub camera_model: String,
    /// Comma-separated camera parameters; empty derives defaults from the
    /// image size.
    pub camera_params: String,
    /// Focal length factor for derived defaults.
    pub default_focal_length_factor: f64,
    /// Restrict extraction to these image names. An empty list is a no-op.
    pub image_list: Option<Vec<String>>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_num_features: 8192,
            max_image_size: 3200,
            fast_threshold: 0.02,
            fast_arc_length: 9,
            num_scales: 5,
            scale_factor: 1.2,
            patch_blur_sigma: 2.0,
            single_camera: false,
            camera_model: "SIMPLE_RADIAL".to_string(),
            camera_params: String::new(),
            default_focal_length_factor: 1.2,
            image_list: None,
        }
    }
}

/// Totals reported by an extraction run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionSummary {
    /// Number of images processed.
    pub num_images: usize,
    /// Total number of keypoints written.
    pub num_features: usize,
}

struct ExtractedImage {
    name: String,
    width: usize,
    height: usize,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<[u8; 32]>,
}

/// Detects keypoints and descriptors for every image under the image root
/// and writes them into the database.
pub struct FeatureExtractor {
    database_path: PathBuf,
    image_path: PathBuf,
    options: ExtractionOptions,
}

impl FeatureExtractor {
    /// Creates an extraction controller.
    pub fn new(
        database_path: impl Into<PathBuf>,
        image_path: impl Into<PathBuf>,
        options: ExtractionOptions,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            image_path: image_path.into(),
            options,
        }
    }

    /// Runs extraction and saves the database.
    pub fn run(self) -> Result<ExtractionSummary, FeatureError> {
        verify_camera_params(&self.options.camera_model, &self.options.camera_params)?;
        let model_id = CameraModelId::from_name(&self.options.camera_model)?;

        let image_names: Vec<String> = match &self.options.image_list {
            Some(names) => {
                if names.is_empty() {
                    log::warn!("image list is empty, nothing to extract");
                    return Ok(ExtractionSummary::default());
                }
                names.clone()
            }
            None => list_image_files(&self.image_path)?
                .into_iter()
                .filter_map(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.to_string())
                })
                .collect(),
        };

        log::info!("Extracting features for {} images", image_names.len());

        let extracted: Vec<ExtractedImage> = image_names
            .par_iter()
            .map(|name| self.extract_one(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut db = if self.database_path.is_file() {
            Database::open(&self.database_path)?
        } else {
            Database::default()
        };

        if self.options.single_camera {
            if let Some(first) = extracted.first() {
                for image in &extracted {
                    if image.width != first.width || image.height != first.height {
                        return Err(FeatureError::ImageSizeMismatch {
                            name: image.name.clone(),
                            width: image.width,
                            height: image.height,
                            expected_width: first.width,
                            expected_height: first.height,
                        });
                    }
                }
            }
        }

        let explicit_params = params_from_csv(&self.options.camera_params)?;
        let mut shared_camera_id = None;
        let mut summary = ExtractionSummary::default();

        for image in extracted {
            let image_id = match db.image_id_by_name(&image.name) {
                Some(id) => id,
                None => {
                    let camera_id = match (self.options.single_camera, shared_camera_id) {
                        (true, Some(id)) => id,
                        _ => {
                            let camera = self.make_camera(
                                model_id,
                                image.width,
                                image.height,
                                &explicit_params,
                            );
                            let id = db.add_camera(camera);
                            if self.options.single_camera {
                                shared_camera_id = Some(id);
                            }
                            id
                        }
                    };
                    db.add_image(image.name.clone(), camera_id)
                }
            };
            log::debug!(
                "{}: {} features",
                image.name,
                image.keypoints.len()
            );
            summary.num_images += 1;
            summary.num_features += image.keypoints.len();
            db.set_keypoints(image_id, image.keypoints);
            db.set_descriptors(image_id, image.descriptors);
        }

        db.save(&self.database_path)?;
        log::info!(
            "Extracted {} features in {} images",
            summary.num_features,
            summary.num_images
        );
        Ok(summary)
    }

    fn make_camera(
        &self,
        model_id: CameraModelId,
        width: usize,
        height: usize,
        explicit_params: &[f64],
    ) -> DbCamera {
        let prior = !explicit_params.is_empty();
        let camera = if prior {
            Camera {
                camera_id: 0,
                model_id,
                width,
                height,
                params: explicit_params.to_vec(),
            }
        } else {
            Camera::with_default_params(
                0,
                model_id,
                width,
                height,
                self.options.default_focal_length_factor,
            )
        };
        DbCamera {
            model_id: model_id as i32,
            width: width as u64,
            height: height as u64,
            params: camera.params,
            prior_focal_length: prior,
        }
    }

    fn extract_one(&self, name: &str) -> Result<ExtractedImage, FeatureError> {
        let bitmap = Bitmap::load(self.image_path.join(name))?;
        let (width, height) = (bitmap.width(), bitmap.height());
        let mut gray = bitmap.to_gray();

        // Work at reduced resolution for oversized inputs, reporting
        // keypoints in full-resolution coordinates.
        let mut base_scale = 1.0f64;
        if self.options.max_image_size > 0 {
            let max_dim = width.max(height);
            if max_dim > self.options.max_image_size {
                base_scale = max_dim as f64 / self.options.max_image_size as f64;
                gray = gray.downscale(base_scale);
            }
        }

        let (keypoints, descriptors) = self.extract_pyramid(&gray, base_scale);
        Ok(ExtractedImage {
            name: name.to_string(),
            width,
            height,
            keypoints,
            descriptors,
        })
    }

    fn extract_pyramid(
        &self,
        base: &GrayBuffer,
        base_scale: f64,
    ) -> (Vec<Keypoint>, Vec<[u8; 32]>) {
        let mut scored: Vec<(f32, Keypoint, [u8; 32])> = Vec::new();
        let mut level_image = base.clone();
        let mut level_scale = base_scale;

        for level in 0..self.options.num_scales {
            if level > 0 {
                level_image = level_image.downscale(self.options.scale_factor);
                level_scale *= self.options.scale_factor;
                if level_image.width() < 2 * brief::BORDER_MARGIN
                    || level_image.height() < 2 * brief::BORDER_MARGIN
                {
                    break;
                }
            }

            let blurred = level_image.gaussian_blur(self.options.patch_blur_sigma);
            let corners = fast::detect(
                &level_image,
                self.options.fast_threshold,
                self.options.fast_arc_length,
            );
            for corner in corners {
                let orientation = brief::orientation(&level_image, corner.x, corner.y);
                let Some(descriptor) =
                    brief::describe(&blurred, corner.x as f32, corner.y as f32, orientation)
                else {
                    continue;
                };
                scored.push((
                    corner.score,
                    Keypoint {
                        x: (corner.x as f64 * level_scale) as f32,
                        y: (corner.y as f64 * level_scale) as f32,
                        scale: level_scale as f32,
                        orientation,
                    },
                    descriptor,
                ));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.options.max_num_features);

        let keypoints = scored.iter().map(|(_, kp, _)| *kp).collect();
        let descriptors = scored.iter().map(|(_, _, d)| *d).collect();
        (keypoints, descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Renders a grid of isolated dark squares; their L-shaped corners are
    /// textbook FAST responses (checkerboard X-junctions are not).
    fn square_grid(path: &std::path::Path, width: usize, height: usize, cell: usize) {
        let mut bitmap = Bitmap::filled(width, height, [255, 255, 255]);
        for y in 0..height {
            for x in 0..width {
                if (x % (2 * cell)) < cell && (y % (2 * cell)) < cell {
                    bitmap.set(x, y, [0, 0, 0]);
                }
            }
        }
        bitmap.save(path).unwrap();
    }

    #[test]
    fn test_extract_checkerboard() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        std::fs::create_dir(&image_dir).unwrap();
        square_grid(&image_dir.join("board.png"), 200, 160, 20);

        let db_path = dir.path().join("database.bin");
        let extractor = FeatureExtractor::new(
            &db_path,
            &image_dir,
            ExtractionOptions {
                num_scales: 2,
                ..ExtractionOptions::default()
            },
        );
        let summary = extractor.run().unwrap();
        assert_eq!(summary.num_images, 1);
        assert!(summary.num_features > 10, "{} features", summary.num_features);

        let db = Database::open(&db_path).unwrap();
        let image_id = db.image_id_by_name("board.png").unwrap();
        assert_eq!(db.keypoints(image_id).len(), db.descriptors(image_id).len());
        let camera = db.camera(db.image(image_id).unwrap().camera_id).unwrap();
        assert_eq!(camera.width, 200);
        assert!(!camera.prior_focal_length);
    }

    #[test]
    fn test_empty_image_list_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FeatureExtractor::new(
            dir.path().join("database.bin"),
            dir.path(),
            ExtractionOptions {
                image_list: Some(vec![]),
                ..ExtractionOptions::default()
            },
        );
        let summary = extractor.run().unwrap();
        assert_eq!(summary.num_images, 0);
    }

    #[test]
    fn test_invalid_camera_params_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FeatureExtractor::new(
            dir.path().join("database.bin"),
            dir.path(),
            ExtractionOptions {
                camera_params: "100,200".to_string(),
                ..ExtractionOptions::default()
            },
        );
        assert!(matches!(
            extractor.run(),
            Err(FeatureError::Camera(_))
        ));
    }

    #[test]
    fn test_single_camera_shares_row() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        std::fs::create_dir(&image_dir).unwrap();
        square_grid(&image_dir.join("a.png"), 120, 100, 10);
        square_grid(&image_dir.join("b.png"), 120, 100, 12);

        let db_path = dir.path().join("database.bin");
        FeatureExtractor::new(
            &db_path,
            &image_dir,
            ExtractionOptions {
                single_camera: true,
                num_scales: 1,
                ..ExtractionOptions::default()
            },
        )
        .run()
        .unwrap();

        let db = Database::open(&db_path).unwrap();
        let id_a = db.image_id_by_name("a.png").unwrap();
        let id_b = db.image_id_by_name("b.png").unwrap();
        assert_eq!(
            db.image(id_a).unwrap().camera_id,
            db.image(id_b).unwrap().camera_id
        );
    }

    #[test]
    fn test_single_camera_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        std::fs::create_dir(&image_dir).unwrap();
        square_grid(&image_dir.join("a.png"), 120, 100, 10);
        square_grid(&image_dir.join("b.png"), 100, 120, 10);

        let result = FeatureExtractor::new(
            dir.path().join("database.bin"),
            &image_dir,
            ExtractionOptions {
                single_camera: true,
                num_scales: 1,
                ..ExtractionOptions::default()
            },
        )
        .run();
        assert!(matches!(
            result,
            Err(FeatureError::ImageSizeMismatch { .. })
        ));
    }
}
