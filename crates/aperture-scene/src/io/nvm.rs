//! Export to the NVM_V3 format used by VisualSFM.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use aperture_core::CameraModelId;

use super::SceneError;
use crate::reconstruction::Reconstruction;

/// Writes the reconstruction as a single NVM_V3 file.
///
/// NVM models a single focal length plus one radial distortion coefficient
/// per camera, so only `SIMPLE_PINHOLE` and `SIMPLE_RADIAL` cameras can be
/// exported.
pub fn export(recon: &Reconstruction, path: impl AsRef<Path>) -> Result<(), SceneError> {
    for camera in recon.cameras.values() {
        match camera.model_id {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial => {}
            other => {
                return Err(SceneError::UnsupportedExportCamera {
                    camera_id: camera.camera_id,
                    model: other.name(),
                    format: "NVM",
                })
            }
        }
    }

    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "NVM_V3")?;
    writeln!(w)?;
    writeln!(w, "{}", recon.images.len())?;

    // NVM refers to images by their position in this list.
    let image_idx: BTreeMap<u32, usize> = recon
        .images
        .keys()
        .enumerate()
        .map(|(idx, &id)| (id, idx))
        .collect();

    for image in recon.images.values() {
        let camera = &recon.cameras[&image.camera_id];
        let k = if camera.model_id == CameraModelId::SimpleRadial {
            camera.params[3]
        } else {
            0.0
        };
        let q = image.cam_from_world.quaternion_wxyz();
        let c = image.cam_from_world.projection_center();
        writeln!(
            w,
            "{} {} {} {} {} {} {} {} {} {} 0",
            image.name,
            camera.mean_focal_length(),
            q[0],
            q[1],
            q[2],
            q[3],
            c.x,
            c.y,
            c.z,
            k
        )?;
    }

    writeln!(w)?;
    writeln!(w, "{}", recon.points3d.len())?;
    for point in recon.points3d.values() {
        write!(
            w,
            "{} {} {} {} {} {} {}",
            point.xyz[0],
            point.xyz[1],
            point.xyz[2],
            point.color[0],
            point.color[1],
            point.color[2],
            point.track.len()
        )?;
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
                xy[1] - cy
            )?;
        }
        writeln!(w)?;
    }

    Ok(())
}
