//! Export to VRML 2.0: one file with camera frusta, one with the point set.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::SceneError;
use crate::reconstruction::Reconstruction;

/// Writes camera frusta as indexed face sets.
///
/// Each registered image becomes a pyramid from the projection center to the
/// image plane at distance `scale`, colored with `rgb` (components in [0, 1]).
pub fn export_images(
    recon: &Reconstruction,
    path: impl AsRef<Path>,
    scale: f64,
    rgb: [f64; 3],
) -> Result<(), SceneError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "#VRML V2.0 utf8")?;

    for image in recon.images.values() {
        let camera = &recon.cameras[&image.camera_id];
        let f = camera.mean_focal_length();
        let half_w = camera.width as f64 / 2.0 / f * scale;
        let half_h = camera.height as f64 / 2.0 / f * scale;

        let world_from_cam = image.cam_from_world.inverse();
        let corners = [
            [0.0, 0.0, 0.0],
            [-half_w, -half_h, scale],
            [half_w, -half_h, scale],
            [half_w, half_h, scale],
            [-half_w, half_h, scale],
        ];

        writeln!(w, "Shape {{")?;
        writeln!(w, " appearance Appearance {{")?;
        writeln!(w, "  material Material {{")?;
        writeln!(
            w,
            "   diffuseColor {} {} {}",
            rgb[0], rgb[1], rgb[2]
        )?;
        writeln!(w, "  }}")?;
        writeln!(w, " }}")?;
        writeln!(w, " geometry IndexedFaceSet {{")?;
        writeln!(w, "  coord Coordinate {{")?;
        writeln!(w, "   point [")?;
        for corner in corners {
            let p = world_from_cam
                .transform_point(&nalgebra::Vector3::new(corner[0], corner[1], corner[2]));
            writeln!(w, "    {} {} {}", p.x, p.y, p.z)?;
        }
        writeln!(w, "   ]")?;
        writeln!(w, "  }}")?;
        writeln!(
            w,
            "  coordIndex [ 0 1 2 -1 0 2 3 -1 0 3 4 -1 0 4 1 -1 1 4 3 2 -1 ]"
        )?;
        writeln!(w, " }}")?;
        writeln!(w, "}}")?;
    }

    Ok(())
}

/// Writes the 3D points as a colored VRML point set.
pub fn export_points(recon: &Reconstruction, path: impl AsRef<Path>) -> Result<(), SceneError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "#VRML V2.0 utf8")?;
    writeln!(w, "Shape {{")?;
    writeln!(w, " appearance Appearance {{ material Material {{ }} }}")?;
    writeln!(w, " geometry PointSet {{")?;
    writeln!(w, "  coord Coordinate {{")?;
    writeln!(w, "   point [")?;
    for point in recon.points3d.values() {
        writeln!(w, "    {} {} {}", point.xyz[0], point.xyz[1], point.xyz[2])?;
    }
    writeln!(w, "   ]")?;
    writeln!(w, "  }}")?;
    writeln!(w, "  color Color {{")?;
    writeln!(w, "   color [")?;
    for point in recon.points3d.values() {
        writeln!(
            w,
            "    {} {} {}",
            point.color[0] as f64 / 255.0,
            point.color[1] as f64 / 255.0,
            point.color[2] as f64 / 255.0
        )?;
    }
    writeln!(w, "   ]")?;
    writeln!(w, "  }}")?;
    writeln!(w, " }}")?;
    writeln!(w, "}}")?;
    Ok(())
}
