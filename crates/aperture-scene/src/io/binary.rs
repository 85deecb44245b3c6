//! Binary sparse model format.
//!
//! Little-endian throughout: `cameras.bin`, `images.bin`, `points3D.bin`.
//! Image names are null-terminated; unobserved 2D points store -1.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use aperture_core::{Camera, CameraModelId, Rigid3};

use super::SceneError;
use crate::reconstruction::{Point2, Point3d, Reconstruction, SceneImage, TrackElement};

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_u8<R: Read>(r: &mut R) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_cstring<R: Read>(r: &mut R) -> Result<String, SceneError> {
    let mut bytes = Vec::new();
    loop {
        let b = read_u8(r)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| SceneError::Parse(format!("image name: {}", e)))
}

/// Reads a binary-format sparse model from a directory.
pub fn read(path: impl AsRef<Path>) -> Result<Reconstruction, SceneError> {
    let path = path.as_ref();
    let mut recon = Reconstruction::new();

    let mut r = BufReader::new(File::open(path.join("cameras.bin"))?);
    let num_cameras = read_u64(&mut r)?;
    for _ in 0..num_cameras {
        let camera_id = read_u32(&mut r)?;
        let model_id = CameraModelId::from_id(read_i32(&mut r)?)?;
        let width = read_u64(&mut r)? as usize;
        let height = read_u64(&mut r)? as usize;
        let mut params = Vec::with_capacity(model_id.num_params());
        for _ in 0..model_id.num_params() {
            params.push(read_f64(&mut r)?);
        }
        recon.add_camera(Camera {
            camera_id,
            model_id,
            width,
            height,
            params,
        });
    }

    let mut r = BufReader::new(File::open(path.join("images.bin"))?);
    let num_images = read_u64(&mut r)?;
    for _ in 0..num_images {
        let image_id = read_u32(&mut r)?;
        let q = [
            read_f64(&mut r)?,
            read_f64(&mut r)?,
            read_f64(&mut r)?,
            read_f64(&mut r)?,
        ];
        let t = [read_f64(&mut r)?, read_f64(&mut r)?, read_f64(&mut r)?];
        let camera_id = read_u32(&mut r)?;
        let name = read_cstring(&mut r)?;
        let num_points2 = read_u64(&mut r)?;
        let mut points2 = Vec::with_capacity(num_points2 as usize);
        for _ in 0..num_points2 {
            let x = read_f64(&mut r)?;
            let y = read_f64(&mut r)?;
            let point3d_id = read_i64(&mut r)?;
            points2.push(Point2 {
                xy: [x, y],
                point3d_id: (point3d_id >= 0).then_some(point3d_id as u64),
            });
        }
        recon.add_image(SceneImage {
            image_id,
            camera_id,
            name,
            cam_from_world: Rigid3::from_quaternion_wxyz(q, t),
            points2,
        });
    }

    let mut r = BufReader::new(File::open(path.join("points3D.bin"))?);
    let num_points = read_u64(&mut r)?;
    let mut max_point_id = 0u64;
    for _ in 0..num_points {
        let point3d_id = read_u64(&mut r)?;
        max_point_id = max_point_id.max(point3d_id);
        let xyz = [read_f64(&mut r)?, read_f64(&mut r)?, read_f64(&mut r)?];
        let color = [read_u8(&mut r)?, read_u8(&mut r)?, read_u8(&mut r)?];
        let error = read_f64(&mut r)?;
        let track_len = read_u64(&mut r)?;
        let mut track = Vec::with_capacity(track_len as usize);
        for _ in 0..track_len {
            track.push(TrackElement {
                image_id: read_u32(&mut r)?,
                point2_idx: read_u32(&mut r)?,
            });
        }
        for element in &track {
            if let Some(image) = recon.images.get_mut(&element.image_id) {
                image.points2[element.point2_idx as usize].point3d_id = Some(point3d_id);
            }
        }
        recon.points3d.insert(
            point3d_id,
            Point3d {
                xyz,
                color,
                error,
                track,
            },
        );
    }
    recon.bump_point3d_id(max_point_id + 1);

    Ok(recon)
}

/// Writes a binary-format sparse model into a directory.
pub fn write(recon: &Reconstruction, path: impl AsRef<Path>) -> Result<(), SceneError> {
    let path = path.as_ref();

    let mut w = BufWriter::new(File::create(path.join("cameras.bin"))?);
    w.write_all(&(recon.cameras.len() as u64).to_le_bytes())?;
    for camera in recon.cameras.values() {
        w.write_all(&camera.camera_id.to_le_bytes())?;
        w.write_all(&(camera.model_id as i32).to_le_bytes())?;
        w.write_all(&(camera.width as u64).to_le_bytes())?;
        w.write_all(&(camera.height as u64).to_le_bytes())?;
        for p in &camera.params {
            w.write_all(&p.to_le_bytes())?;
        }
    }

    let mut w = BufWriter::new(File::create(path.join("images.bin"))?);
    w.write_all(&(recon.images.len() as u64).to_le_bytes())?;
    for image in recon.images.values() {
        w.write_all(&image.image_id.to_le_bytes())?;
        for v in image.cam_from_world.quaternion_wxyz() {
            w.write_all(&v.to_le_bytes())?;
        }
        for v in image.cam_from_world.translation_array() {
            w.write_all(&v.to_le_bytes())?;
        }
        w.write_all(&image.camera_id.to_le_bytes())?;
        w.write_all(image.name.as_bytes())?;
        w.write_all(&[0u8])?;
        w.write_all(&(image.points2.len() as u64).to_le_bytes())?;
        for point in &image.points2 {
            w.write_all(&point.xy[0].to_le_bytes())?;
            w.write_all(&point.xy[1].to_le_bytes())?;
            let id = point.point3d_id.map(|id| id as i64).unwrap_or(-1);
            w.write_all(&id.to_le_bytes())?;
        }
    }

    let mut w = BufWriter::new(File::create(path.join("points3D.bin"))?);
    w.write_all(&(recon.points3d.len() as u64).to_le_bytes())?;
    for (point3d_id, point) in &recon.points3d {
        w.write_all(&point3d_id.to_le_bytes())?;
        for v in point.xyz {
            w.write_all(&v.to_le_bytes())?;
        }
        w.write_all(&point.color)?;
        w.write_all(&point.error.to_le_bytes())?;
        w.write_all(&(point.track.len() as u64).to_le_bytes())?;
        for element in &point.track {
            w.write_all(&element.image_id.to_le_bytes())?;
            w.write_all(&element.point2_idx.to_le_bytes())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::test_fixtures::sample_reconstruction;

    #[test]
    fn test_binary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let recon = sample_reconstruction();
        write(&recon, dir.path()).unwrap();
        let restored = read(dir.path()).unwrap();

        assert_eq!(restored.cameras.len(), recon.cameras.len());
        assert_eq!(restored.images.len(), recon.images.len());
        assert_eq!(restored.points3d.len(), recon.points3d.len());

        for (id, camera) in &recon.cameras {
            assert_eq!(&restored.cameras[id], camera);
        }
        for (id, image) in &recon.images {
            let restored_image = &restored.images[id];
            assert_eq!(restored_image.name, image.name);
            assert_eq!(restored_image.camera_id, image.camera_id);
            assert_eq!(restored_image.points2, image.points2);
            assert_eq!(
                restored_image.cam_from_world.quaternion_wxyz(),
                image.cam_from_world.quaternion_wxyz()
            );
        }
        for (id, point) in &recon.points3d {
            let restored_point = &restored.points3d[id];
            assert_eq!(restored_point.xyz, point.xyz);
            assert_eq!(restored_point.color, point.color);
            assert_eq!(restored_point.track, point.track);
        }
    }

    #[test]
    fn test_auto_detect_prefers_binary() {
        let dir = tempfile::tempdir().unwrap();
        let recon = sample_reconstruction();
        write(&recon, dir.path()).unwrap();

        // A stale, truncated text model next to the binary one is ignored.
        std::fs::write(dir.path().join("cameras.txt"), "# stale\n").unwrap();
        std::fs::write(dir.path().join("images.txt"), "# stale\n").unwrap();
        std::fs::write(dir.path().join("points3D.txt"), "# stale\n").unwrap();

        let restored = Reconstruction::read(dir.path()).unwrap();
        assert_eq!(restored.cameras.len(), recon.cameras.len());
    }

    #[test]
    fn test_read_missing_model_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Reconstruction::read(dir.path()),
            Err(SceneError::NotFound(_))
        ));
    }
}
