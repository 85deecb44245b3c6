use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use aperture_core::{Camera, CameraModelId, Rigid3};

use super::SceneError;
use crate::reconstruction::{Point2, Point3d, Reconstruction, SceneImage, TrackElement};

fn parse_part<T: std::str::FromStr>(s: &str) -> Result<T, SceneError>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| SceneError::Parse(format!("{}: {}", s, e)))
}

fn data_lines(path: &Path) -> Result<Vec<String>, SceneError> {
    Ok(data_lines_keep_empty(path)?
        .into_iter()
        .filter(|l| !l.is_empty())
        .collect())
}

/// Comment lines are dropped, empty lines kept. The image file needs empty
/// lines: an image without observations still owns its second line.
fn data_lines_keep_empty(path: &Path) -> Result<Vec<String>, SceneError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        lines.push(trimmed.to_string());
    }
    Ok(lines)
}

/// Reads a text-format sparse model from a directory.
pub fn read(path: impl AsRef<Path>) -> Result<Reconstruction, SceneError> {
    let path = path.as_ref();
    let mut recon = Reconstruction::new();

    for line in data_lines(&path.join("cameras.txt"))? {
        recon.add_camera(parse_camera_line(&line)?);
    }

    let image_lines = data_lines_keep_empty(&path.join("images.txt"))?;
    if image_lines.len() % 2 != 0 {
        return Err(SceneError::Parse(
            "images.txt has an odd number of data lines".to_string(),
        ));
    }
    for chunk in image_lines.chunks(2) {
        recon.add_image(parse_image_lines(&chunk[0], &chunk[1])?);
    }

    let mut max_point_id = 0u64;
    for line in data_lines(&path.join("points3D.txt"))? {
        let (point3d_id, point) = parse_point3d_line(&line)?;
        max_point_id = max_point_id.max(point3d_id);
        for element in &point.track {
            if let Some(image) = recon.images.get_mut(&element.image_id) {
                image.points2[element.point2_idx as usize].point3d_id = Some(point3d_id);
            }
        }
        recon.points3d.insert(point3d_id, point);
    }
    recon.bump_point3d_id(max_point_id + 1);

    Ok(recon)
}

/// Writes a text-format sparse model into a directory.
pub fn write(recon: &Reconstruction, path: impl AsRef<Path>) -> Result<(), SceneError> {
    let path = path.as_ref();
    write_cameras(recon, &path.join("cameras.txt"))?;
    write_images(recon, &path.join("images.txt"))?;
    write_points3d(recon, &path.join("points3D.txt"))?;
    Ok(())
}

/// CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]
fn parse_camera_line(line: &str) -> Result<Camera, SceneError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(SceneError::Parse(format!(
            "camera line has {} fields",
            parts.len()
        )));
    }
    Ok(Camera {
        camera_id: parse_part(parts[0])?,
        model_id: CameraModelId::from_name(parts[1])?,
        width: parse_part(parts[2])?,
        height: parse_part(parts[3])?,
        params: parts[4..]
            .iter()
            .map(|s| parse_part(s))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

/// IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME
/// POINTS2D[] as (X, Y, POINT3D_ID)
fn parse_image_lines(line1: &str, line2: &str) -> Result<SceneImage, SceneError> {
    let parts: Vec<&str> = line1.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(SceneError::Parse(format!(
            "image line has {} fields",
            parts.len()
        )));
    }
    let q = [
        parse_part(parts[1])?,
        parse_part(parts[2])?,
        parse_part(parts[3])?,
        parse_part(parts[4])?,
    ];
    let t = [
        parse_part(parts[5])?,
        parse_part(parts[6])?,
        parse_part(parts[7])?,
    ];
    let points2 = line2
        .split_whitespace()
        .collect::<Vec<_>>()
        .chunks_exact(3)
        .map(|chunk| -> Result<Point2, SceneError> {
            let point3d_id: i64 = parse_part(chunk[2])?;
            Ok(Point2 {
                xy: [parse_part(chunk[0])?, parse_part(chunk[1])?],
                point3d_id: (point3d_id >= 0).then_some(point3d_id as u64),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SceneImage {
        image_id: parse_part(parts[0])?,
        camera_id: parse_part(parts[8])?,
        name: parts[9].to_string(),
        cam_from_world: Rigid3::from_quaternion_wxyz(q, t),
        points2,
    })
}

/// POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)
fn parse_point3d_line(line: &str) -> Result<(u64, Point3d), SceneError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(SceneError::Parse(format!(
            "point3D line has {} fields",
            parts.len()
        )));
    }
    let track = parts[8..]
        .chunks_exact(2)
        .map(|chunk| -> Result<TrackElement, SceneError> {
            Ok(TrackElement {
                image_id: parse_part(chunk[0])?,
                point2_idx: parse_part(chunk[1])?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((
        parse_part(parts[0])?,
        Point3d {
            xyz: [
                parse_part(parts[1])?,
                parse_part(parts[2])?,
                parse_part(parts[3])?,
            ],
            color: [
                parse_part(parts[4])?,
                parse_part(parts[5])?,
                parse_part(parts[6])?,
            ],
            error: parse_part(parts[7])?,
            track,
        },
    ))
}

fn write_cameras(recon: &Reconstruction, path: &Path) -> Result<(), SceneError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# Camera list with one line of data per camera:")?;
    writeln!(writer, "#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]")?;
    writeln!(writer, "# Number of cameras: {}", recon.cameras.len())?;
    for camera in recon.cameras.values() {
        write!(
            writer,
            "{} {} {} {}",
            camera.camera_id,
            camera.model_id.name(),
            camera.width,
            camera.height
        )?;
        for p in &camera.params {
            write!(writer, " {}", p)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

fn write_images(recon: &Reconstruction, path: &Path) -> Result<(), SceneError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# Image list with two lines of data per image:")?;
    writeln!(
        writer,
        "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME"
    )?;
    writeln!(writer, "#   POINTS2D[] as (X, Y, POINT3D_ID)")?;
    writeln!(writer, "# Number of images: {}", recon.images.len())?;
    for image in recon.images.values() {
        let q = image.cam_from_world.quaternion_wxyz();
        let t = image.cam_from_world.translation_array();
        writeln!(
            writer,
            "{} {} {} {} {} {} {} {} {} {}",
            image.image_id, q[0], q[1], q[2], q[3], t[0], t[1], t[2], image.camera_id, image.name
        )?;
        let mut first = true;
        for point in &image.points2 {
            if !first {
                write!(writer, " ")?;
            }
            first = false;
            let id = point.point3d_id.map(|id| id as i64).unwrap_or(-1);
            write!(writer, "{} {} {}", point.xy[0], point.xy[1], id)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

fn write_points3d(recon: &Reconstruction, path: &Path) -> Result<(), SceneError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "# 3D point list with one line of data per point:")?;
    writeln!(
        writer,
        "#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)"
    )?;
    writeln!(
        writer,
        "# Number of points: {}, mean track length: {}",
        recon.points3d.len(),
        recon.mean_track_length()
    )?;
    for (point3d_id, point) in &recon.points3d {
        write!(
            writer,
            "{} {} {} {} {} {} {} {}",
            point3d_id,
            point.xyz[0],
            point.xyz[1],
            point.xyz[2],
            point.color[0],
            point.color[1],
            point.color[2],
            point.error
        )?;
        for element in &point.track {
            write!(writer, " {} {}", element.image_id, element.point2_idx)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}
