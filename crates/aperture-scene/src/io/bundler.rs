//! Export to the Bundler v0.3 format.
//!
//! Bundler cameras look down the negative z axis with y up, so the second
//! and third rows of the rotation (and the matching translation components)
//! are negated, and measurements are principal-point centered with y
//! pointing up.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use aperture_core::CameraModelId;

use super::SceneError;
use crate::reconstruction::Reconstruction;

/// Writes `<path>.bundle.out` content to `bundle_path` and the image name
/// list to `list_path`.
pub fn export(
    recon: &Reconstruction,
    bundle_path: impl AsRef<Path>,
    list_path: impl AsRef<Path>,
) -> Result<(), SceneError> {
    let mut list = BufWriter::new(File::create(list_path)?);
    for image in recon.images.values() {
        writeln!(list, "{}", image.name)?;
    }
    drop(list);

    let mut w = BufWriter::new(File::create(bundle_path)?);
    writeln!(w, "# Bundle file v0.3")?;
    writeln!(w, "{} {}", recon.images.len(), recon.points3d.len())?;

    for image in recon.images.values() {
        let camera = &recon.cameras[&image.camera_id];
        let (k1, k2) = match camera.model_id {
            CameraModelId::SimpleRadial => (camera.params[3], 0.0),
            CameraModelId::Radial => (camera.params[3], camera.params[4]),
            _ => (0.0, 0.0),
        };
        writeln!(w, "{} {} {}", camera.mean_focal_length(), k1, k2)?;
        let r = image.cam_from_world.rotation_matrix();
        let t = image.cam_from_world.translation_array();
        writeln!(w, "{} {} {}", r[(0, 0)], r[(0, 1)], r[(0, 2)])?;
        writeln!(w, "{} {} {}", -r[(1, 0)], -r[(1, 1)], -r[(1, 2)])?;
        writeln!(w, "{} {} {}", -r[(2, 0)], -r[(2, 1)], -r[(2, 2)])?;
        writeln!(w, "{} {} {}", t[0], -t[1], -t[2])?;
    }

    let image_idx: BTreeMap<u32, usize> = recon
        .images
        .keys()
        .enumerate()
        .map(|(idx, &id)| (id, idx))
        .collect();

    for point in recon.points3d.values() {
        writeln!(w, "{} {} {}", point.xyz[0], point.xyz[1], point.xyz[2])?;
        writeln!(
            w,
            "{} {} {}",
            point.color[0], point.color[1], point.color[2]
        )?;
        write!(w, "{}", point.track.len())?;
        for element in &point.track {
            let image = &recon.images[&element.image_id];
            let camera = &recon.cameras[&image.camera_id];
            let (cx, cy) = camera.principal_point();
            let xy = &image.points2[element.point2_idx as usize].xy;
            write!(
                w,
                " {} {} {} {}",
                image_idx[&element.image_id],
                element.point2_idx,
                xy[0] - cx,
                -(xy[1] - cy)
            )?;
        }
        writeln!(w)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::test_fixtures::sample_reconstruction;

    #[test]
    fn test_export_structure() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("model.bundle.out");
        let list = dir.path().join("model.list.txt");
        let recon = sample_reconstruction();
        export(&recon, &bundle, &list).unwrap();

        let list_contents = std::fs::read_to_string(&list).unwrap();
        assert_eq!(list_contents.lines().count(), recon.images.len());

        let contents = std::fs::read_to_string(&bundle).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("# Bundle file v0.3"));
        assert_eq!(lines.next(), Some("3 2"));
        // 5 lines per camera, 3 lines per point.
        assert_eq!(contents.lines().count(), 2 + 5 * 3 + 3 * 2);
    }
}
