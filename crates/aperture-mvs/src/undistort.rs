//! Image undistortion into COLMAP, PMVS and CMP-MVS dense workspaces.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use aperture_core::{Camera, CameraModelId, Rigid3};
use aperture_image::Bitmap;
use aperture_scene::{Point2, Reconstruction, SceneImage};
use rayon::prelude::*;

use crate::error::MvsError;
use crate::workspace::projection_matrix;

/// Options controlling the undistorted camera fit.
#[derive(Debug, Clone)]
pub struct UndistortOptions {
    /// Fraction of blank pixels allowed in the output: 0 crops to valid
    /// content, 1 keeps every source pixel.
    pub blank_pixels: f64,
    /// Lower clamp on the output/input size ratio.
    pub min_scale: f64,
    /// Upper clamp on the output/input size ratio.
    pub max_scale: f64,
    /// Maximum output edge length; non-positive disables the clamp.
    pub max_image_size: i64,
    /// Region of interest, relative coordinates in [0, 1].
    pub roi_min_x: f64,
    /// Minimum y of the region of interest.
    pub roi_min_y: f64,
    /// Maximum x of the region of interest.
    pub roi_max_x: f64,
    /// Maximum y of the region of interest.
    pub roi_max_y: f64,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        Self {
            blank_pixels: 0.0,
            min_scale: 0.2,
            max_scale: 2.0,
            max_image_size: -1,
            roi_min_x: 0.0,
            roi_min_y: 0.0,
            roi_max_x: 1.0,
            roi_max_y: 1.0,
        }
    }
}

/// The output workspace layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndistortLayout {
    /// images/, sparse/, stereo/ plus stereo configuration files.
    Colmap,
    /// visualize/, txt/, models/ plus a PMVS option file.
    Pmvs,
    /// Flat %05d.jpg images with %05d_P.txt projection matrices.
    CmpMvs,
}

impl UndistortLayout {
    /// Parses an output type name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, MvsError> {
        match value.to_uppercase().as_str() {
            "COLMAP" => Ok(Self::Colmap),
            "PMVS" => Ok(Self::Pmvs),
            "CMP-MVS" => Ok(Self::CmpMvs),
            _ => Err(MvsError::InvalidChoice {
                option: "output_type",
                value: value.to_string(),
                supported: "{'COLMAP', 'PMVS', 'CMP-MVS'}",
            }),
        }
    }
}

/// Fits the undistorted pinhole camera for a source camera.
///
/// The focal length is kept; the output frame is the bounding box of the
/// undistorted source border blended between the no-blank and all-content
/// extents by `blank_pixels`, then clamped by the scale and size options.
pub fn undistort_camera(options: &UndistortOptions, camera: &Camera) -> Camera {
    let (fx, fy) = camera.focal();
    let (cx, cy) = camera.principal_point();

    // Trace the source border through the undistortion.
    let mut left_max = f64::MIN;
    let mut right_min = f64::MAX;
    let mut top_max = f64::MIN;
    let mut bottom_min = f64::MAX;
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;

    let width = camera.width;
    let height = camera.height;
    // Sample the outer edges so an undistorted pinhole maps to itself.
    for y in 0..=height {
        let (u, _v) = camera.cam_from_img(0.0, y as f64);
        let x_img = fx * u + cx;
        left_max = left_max.max(x_img);
        min_x = min_x.min(x_img);
        let (u, _v) = camera.cam_from_img(width as f64, y as f64);
        let x_img = fx * u + cx;
        right_min = right_min.min(x_img);
        max_x = max_x.max(x_img);
    }
    for x in 0..=width {
        let (_u, v) = camera.cam_from_img(x as f64, 0.0);
        let y_img = fy * v + cy;
        top_max = top_max.max(y_img);
        min_y = min_y.min(y_img);
        let (_u, v) = camera.cam_from_img(x as f64, height as f64);
        let y_img = fy * v + cy;
        bottom_min = bottom_min.min(y_img);
        max_y = max_y.max(y_img);
    }

    let blend = options.blank_pixels.clamp(0.0, 1.0);
    let left = left_max * (1.0 - blend) + min_x * blend;
    let right = right_min * (1.0 - blend) + max_x * blend;
    let top = top_max * (1.0 - blend) + min_y * blend;
    let bottom = bottom_min * (1.0 - blend) + max_y * blend;

    let mut new_width = (right - left).max(1.0);
    let mut new_height = (bottom - top).max(1.0);
    let mut new_cx = cx - left;
    let mut new_cy = cy - top;

    // Clamp the growth/shrink ratio.
    let scale_x = (new_width / width as f64).clamp(options.min_scale, options.max_scale);
    let scale_y = (new_height / height as f64).clamp(options.min_scale, options.max_scale);
    let clamped_width = width as f64 * scale_x;
    let clamped_height = height as f64 * scale_y;
    // Keep the principal point centered on the same content when clamping.
    new_cx += (clamped_width - new_width) / 2.0;
    new_cy += (clamped_height - new_height) / 2.0;
    new_width = clamped_width;
    new_height = clamped_height;

    let mut new_fx = fx;
    let mut new_fy = fy;
    if options.max_image_size > 0 {
        let max_size = options.max_image_size as f64;
        let factor = (max_size / new_width).min(max_size / new_height);
        if factor < 1.0 {
            new_width *= factor;
            new_height *= factor;
            new_cx *= factor;
            new_cy *= factor;
            new_fx *= factor;
            new_fy *= factor;
        }
    }

    // Crop to the region of interest.
    let roi_min_x = options.roi_min_x.clamp(0.0, 1.0);
    let roi_min_y = options.roi_min_y.clamp(0.0, 1.0);
    let roi_max_x = options.roi_max_x.clamp(roi_min_x, 1.0);
    let roi_max_y = options.roi_max_y.clamp(roi_min_y, 1.0);
    if roi_min_x > 0.0 || roi_min_y > 0.0 || roi_max_x < 1.0 || roi_max_y < 1.0 {
        new_cx -= roi_min_x * new_width;
        new_cy -= roi_min_y * new_height;
        new_width *= roi_max_x - roi_min_x;
        new_height *= roi_max_y - roi_min_y;
    }

    Camera {
        camera_id: camera.camera_id,
        model_id: CameraModelId::Pinhole,
        width: (new_width.round() as usize).max(1),
        height: (new_height.round() as usize).max(1),
        params: vec![new_fx, new_fy, new_cx, new_cy],
    }
}

/// Remaps a source bitmap into the undistorted camera frame.
///
/// Output pixels whose source sample falls outside the input are black.
pub fn undistort_bitmap(
    source: &Bitmap,
    source_camera: &Camera,
    undistorted_camera: &Camera,
) -> Bitmap {
    let width = undistorted_camera.width;
    let height = undistorted_camera.height;
    let mut out = Bitmap::filled(width, height, [0, 0, 0]);
    for y in 0..height {
        for x in 0..width {
            let (u, v) = undistorted_camera.cam_from_img(x as f64 + 0.5, y as f64 + 0.5);
            let (sx, sy) = source_camera.img_from_cam(u, v);
            if let Some(color) = source.bilinear(sx - 0.5, sy - 0.5) {
                out.set(
                    x,
                    y,
                    [color[0].round() as u8, color[1].round() as u8, color[2].round() as u8],
                );
            }
        }
    }
    out
}

/// Summary of an undistortion run.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndistortSummary {
    /// Number of images written.
    pub num_images: usize,
}

/// Undistorts every registered image of a sparse model into a workspace.
pub struct ImageUndistorter {
    image_path: PathBuf,
    output_path: PathBuf,
    layout: UndistortLayout,
    options: UndistortOptions,
    model: Reconstruction,
}

impl ImageUndistorter {
    /// Creates an undistorter for a loaded model.
    pub fn new(
        model: Reconstruction,
        image_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        layout: UndistortLayout,
        options: UndistortOptions,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            output_path: output_path.into(),
            layout,
            options,
            model,
        }
    }

    /// Runs undistortion and writes the workspace.
    pub fn run(self) -> Result<UndistortSummary, MvsError> {
        std::fs::create_dir_all(&self.output_path)?;

        // Undistorted cameras and the rewritten sparse model.
        let mut undistorted = Reconstruction::new();
        for camera in self.model.cameras.values() {
            undistorted.add_camera(undistort_camera(&self.options, camera));
        }
        let mut max_point_id = 0;
        for image in self.model.images.values() {
            let source_camera = &self.model.cameras[&image.camera_id];
            let new_camera = &undistorted.cameras[&image.camera_id];
            let points2 = image
                .points2
                .iter()
                .map(|point2| {
                    let (u, v) = source_camera.cam_from_img(point2.xy[0], point2.xy[1]);
                    let (x, y) = new_camera.img_from_cam(u, v);
                    Point2 {
                        xy: [x, y],
                        point3d_id: point2.point3d_id,
                    }
                })
                .collect();
            undistorted.add_image(SceneImage {
                image_id: image.image_id,
                camera_id: image.camera_id,
                name: image.name.clone(),
                cam_from_world: image.cam_from_world,
                points2,
            });
        }
        for (&point3d_id, point) in &self.model.points3d {
            undistorted.points3d.insert(point3d_id, point.clone());
            max_point_id = max_point_id.max(point3d_id);
        }
        undistorted.bump_point3d_id(max_point_id + 1);

        match self.layout {
            UndistortLayout::Colmap => self.write_colmap(&undistorted),
            UndistortLayout::Pmvs => self.write_pmvs(&undistorted),
            UndistortLayout::CmpMvs => self.write_cmp_mvs(&undistorted),
        }
    }

    fn remap_one(
        &self,
        image: &SceneImage,
        undistorted: &Reconstruction,
        output_file: &Path,
    ) -> Result<(), MvsError> {
        let source = Bitmap::load(self.image_path.join(&image.name))?;
        let source_camera = &self.model.cameras[&image.camera_id];
        let new_camera = &undistorted.cameras[&image.camera_id];
        let remapped = undistort_bitmap(&source, source_camera, new_camera);
        if let Some(parent) = output_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remapped.save(output_file)?;
        Ok(())
    }

    fn write_colmap(&self, undistorted: &Reconstruction) -> Result<UndistortSummary, MvsError> {
        let images_dir = self.output_path.join("images");
        let sparse_dir = self.output_path.join("sparse");
        let stereo_dir = self.output_path.join("stereo");
        std::fs::create_dir_all(&images_dir)?;
        std::fs::create_dir_all(&sparse_dir)?;
        for sub in ["depth_maps", "normal_maps", "consistency_graphs"] {
            std::fs::create_dir_all(stereo_dir.join(sub))?;
        }

        let images: Vec<&SceneImage> = undistorted.images.values().collect();
        images
            .par_iter()
            .try_for_each(|image| {
                self.remap_one(image, undistorted, &images_dir.join(&image.name))
            })?;

        undistorted.write(&sparse_dir)?;

        let mut patch_match = BufWriter::new(File::create(stereo_dir.join("patch-match.cfg"))?);
        let mut fusion = BufWriter::new(File::create(stereo_dir.join("fusion.cfg"))?);
        for image in undistorted.images.values() {
            writeln!(patch_match, "{}", image.name)?;
            writeln!(patch_match, "__auto__, 20")?;
            writeln!(fusion, "{}", image.name)?;
        }

        log::info!(
            "Wrote COLMAP workspace with {} images to {}",
            undistorted.images.len(),
            self.output_path.display()
        );
        Ok(UndistortSummary {
            num_images: undistorted.images.len(),
        })
    }

    fn write_pmvs(&self, undistorted: &Reconstruction) -> Result<UndistortSummary, MvsError> {
        let visualize_dir = self.output_path.join("visualize");
        let txt_dir = self.output_path.join("txt");
        std::fs::create_dir_all(&visualize_dir)?;
        std::fs::create_dir_all(&txt_dir)?;
        std::fs::create_dir_all(self.output_path.join("models"))?;

        let images: Vec<(usize, &SceneImage)> =
            undistorted.images.values().enumerate().collect();
        images.par_iter().try_for_each(|(idx, image)| {
            self.remap_one(
                image,
                undistorted,
                &visualize_dir.join(format!("{:08}.jpg", idx)),
            )
        })?;

        for (idx, image) in &images {
            let camera = &undistorted.cameras[&image.camera_id];
            let p = projection_matrix(camera, &image.cam_from_world);
            let mut w = BufWriter::new(File::create(txt_dir.join(format!("{:08}.txt", idx)))?);
            writeln!(w, "CONTOUR")?;
            for r in 0..3 {
                writeln!(w, "{} {} {} {}", p[(r, 0)], p[(r, 1)], p[(r, 2)], p[(r, 3)])?;
            }
        }

        let mut options_file =
            BufWriter::new(File::create(self.output_path.join("option-all"))?);
        writeln!(options_file, "level 1")?;
        writeln!(options_file, "csize 2")?;
        writeln!(options_file, "threshold 0.7")?;
        writeln!(options_file, "wsize 7")?;
        writeln!(options_file, "minImageNum 3")?;
        writeln!(options_file, "CPU 4")?;
        writeln!(options_file, "setEdge 0")?;
        writeln!(options_file, "useBound 0")?;
        writeln!(options_file, "useVisData 0")?;
        writeln!(options_file, "sequence -1")?;
        writeln!(options_file, "maxAngle 10")?;
        writeln!(options_file, "quad 2.0")?;
        write!(options_file, "timages -1 0 {}", images.len())?;
        writeln!(options_file)?;
        writeln!(options_file, "oimages 0")?;

        log::info!(
            "Wrote PMVS workspace with {} images to {}",
            images.len(),
            self.output_path.display()
        );
        Ok(UndistortSummary {
            num_images: images.len(),
        })
    }

    fn write_cmp_mvs(&self, undistorted: &Reconstruction) -> Result<UndistortSummary, MvsError> {
        let images: Vec<(usize, &SceneImage)> =
            undistorted.images.values().enumerate().collect();
        images.par_iter().try_for_each(|(idx, image)| {
            self.remap_one(
                image,
                undistorted,
                &self.output_path.join(format!("{:05}.jpg", idx + 1)),
            )
        })?;

        for (idx, image) in &images {
            let camera = &undistorted.cameras[&image.camera_id];
            let p = projection_matrix(camera, &image.cam_from_world);
            let mut w = BufWriter::new(File::create(
                self.output_path.join(format!("{:05}_P.txt", idx + 1)),
            )?);
            writeln!(w, "CONTOUR")?;
            for r in 0..3 {
                writeln!(w, "{} {} {} {}", p[(r, 0)], p[(r, 1)], p[(r, 2)], p[(r, 3)])?;
            }
        }

        log::info!(
            "Wrote CMP-MVS workspace with {} images to {}",
            images.len(),
            self.output_path.display()
        );
        Ok(UndistortSummary {
            num_images: images.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pinhole_camera() -> Camera {
        Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 100,
            height: 80,
            params: vec![90.0, 90.0, 50.0, 40.0],
        }
    }

    #[test]
    fn test_undistort_pinhole_is_identity_sized() {
        let camera = pinhole_camera();
        let undistorted = undistort_camera(&UndistortOptions::default(), &camera);
        assert_eq!(undistorted.model_id, CameraModelId::Pinhole);
        assert_eq!(undistorted.width, 100);
        assert_eq!(undistorted.height, 80);
        assert_relative_eq!(undistorted.params[0], 90.0);
        assert_relative_eq!(undistorted.params[2], 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_undistort_radial_changes_extent() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::SimpleRadial,
            width: 100,
            height: 80,
            params: vec![90.0, 50.0, 40.0, 0.08],
        };
        let cropped = undistort_camera(&UndistortOptions::default(), &camera);
        let full = undistort_camera(
            &UndistortOptions {
                blank_pixels: 1.0,
                ..UndistortOptions::default()
            },
            &camera,
        );
        // Keeping all content needs a larger frame than cropping blanks.
        assert!(full.width > cropped.width);
        assert!(full.height > cropped.height);
    }

    #[test]
    fn test_max_image_size_clamp() {
        let camera = pinhole_camera();
        let undistorted = undistort_camera(
            &UndistortOptions {
                max_image_size: 50,
                ..UndistortOptions::default()
            },
            &camera,
        );
        assert!(undistorted.width <= 50);
        assert!(undistorted.height <= 50);
        // Focal scales together with the frame.
        assert!(undistorted.params[0] < 90.0);
    }

    #[test]
    fn test_roi_crop() {
        let camera = pinhole_camera();
        let undistorted = undistort_camera(
            &UndistortOptions {
                roi_min_x: 0.25,
                roi_min_y: 0.0,
                roi_max_x: 0.75,
                roi_max_y: 0.5,
                ..UndistortOptions::default()
            },
            &camera,
        );
        assert_eq!(undistorted.width, 50);
        assert_eq!(undistorted.height, 40);
    }

    #[test]
    fn test_undistort_bitmap_identity() {
        let camera = pinhole_camera();
        let mut source = Bitmap::filled(100, 80, [10, 10, 10]);
        source.set(30, 20, [200, 100, 50]);
        let out = undistort_bitmap(&source, &camera, &camera);
        assert_eq!(out.width(), 100);
        assert_eq!(out.height(), 80);
        assert_eq!(out.get(30, 20), [200, 100, 50]);
    }

    #[test]
    fn test_layout_parse() {
        assert_eq!(UndistortLayout::parse("colmap").unwrap(), UndistortLayout::Colmap);
        assert_eq!(UndistortLayout::parse("CMP-MVS").unwrap(), UndistortLayout::CmpMvs);
        let err = UndistortLayout::parse("weird").unwrap_err();
        assert!(err.to_string().contains("CMP-MVS"));
    }
}
