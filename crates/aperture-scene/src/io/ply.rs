//! PLY I/O for point clouds and triangle meshes.
//!
//! Only the binary little-endian encoding is supported; the vertex layout is
//! detected from the header properties.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::SceneError;
use crate::pointcloud::{PointCloud, TriangleMesh};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlyDataType {
    Float32,
    Float64,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
}

impl PlyDataType {
    fn parse(type_str: &str) -> Result<Self, SceneError> {
        match type_str {
            "float" | "float32" => Ok(Self::Float32),
            "double" | "float64" => Ok(Self::Float64),
            "char" | "int8" => Ok(Self::Int8),
            "uchar" | "uint8" => Ok(Self::UInt8),
            "short" | "int16" => Ok(Self::Int16),
            "ushort" | "uint16" => Ok(Self::UInt16),
            "int" | "int32" => Ok(Self::Int32),
            "uint" | "uint32" => Ok(Self::UInt32),
            _ => Err(SceneError::UnsupportedPly(format!(
                "property type {}",
                type_str
            ))),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Float32 | Self::Int32 | Self::UInt32 => 4,
            Self::Float64 => 8,
        }
    }

    fn read_as_f64(&self, bytes: &[u8]) -> f64 {
        match self {
            Self::Float32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Self::Float64 => f64::from_le_bytes(bytes.try_into().unwrap()),
            Self::Int8 => bytes[0] as i8 as f64,
            Self::UInt8 => bytes[0] as f64,
            Self::Int16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Self::UInt16 => u16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Self::Int32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Self::UInt32 => u32::from_le_bytes(bytes.try_into().unwrap()) as f64,
        }
    }
}

struct PlyProperty {
    name: String,
    data_type: PlyDataType,
    offset: usize,
}

struct PlyHeader {
    vertex_count: usize,
    properties: Vec<PlyProperty>,
    vertex_size: usize,
}

impl PlyHeader {
    fn find(&self, name: &str) -> Option<&PlyProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    fn value(&self, name: &str, vertex: &[u8]) -> Option<f64> {
        let prop = self.find(name)?;
        let bytes = &vertex[prop.offset..prop.offset + prop.data_type.size()];
        Some(prop.data_type.read_as_f64(bytes))
    }
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<PlyHeader, SceneError> {
    let mut line = String::new();
    let mut vertex_count = None;
    let mut is_binary_little_endian = false;
    let mut is_ply = false;
    let mut properties: Vec<PlyProperty> = Vec::new();
    let mut offset = 0usize;
    let mut in_vertex_element = false;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim();

        if trimmed == "ply" {
            is_ply = true;
            continue;
        }
        if trimmed == "end_header" {
            break;
        }
        if trimmed.starts_with("comment") {
            continue;
        }
        if trimmed.starts_with("format binary_little_endian") {
            is_binary_little_endian = true;
        } else if trimmed.starts_with("element vertex") {
            in_vertex_element = true;
            vertex_count = Some(
                trimmed
                    .split_whitespace()
                    .last()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            );
        } else if trimmed.starts_with("element") {
            in_vertex_element = false;
        } else if trimmed.starts_with("property") && in_vertex_element {
            let parts: Vec<&str> = trimmed.split_whitespace().collect();
            if parts.len() >= 3 {
                if parts[1] == "list" {
                    return Err(SceneError::UnsupportedPly(
                        "list property in vertex element".to_string(),
                    ));
                }
                let data_type = PlyDataType::parse(parts[1])?;
                properties.push(PlyProperty {
                    name: parts[2].to_string(),
                    data_type,
                    offset,
                });
                offset += data_type.size();
            }
        }
    }

    if !is_ply || !is_binary_little_endian {
        return Err(SceneError::UnsupportedPly(
            "expected binary little-endian PLY".to_string(),
        ));
    }
    let vertex_count =
        vertex_count.ok_or_else(|| SceneError::UnsupportedPly("missing vertex element".into()))?;

    Ok(PlyHeader {
        vertex_count,
        properties,
        vertex_size: offset,
    })
}

/// Reads a binary little-endian PLY point cloud.
///
/// Positions are required; colors and normals are extracted when the header
/// declares them.
pub fn read_point_cloud(path: impl AsRef<Path>) -> Result<PointCloud, SceneError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let header = parse_header(&mut reader)?;

    for required in ["x", "y", "z"] {
        if header.find(required).is_none() {
            return Err(SceneError::UnsupportedPly(format!(
                "missing property {}",
                required
            )));
        }
    }
    let has_colors = ["red", "green", "blue"]
        .iter()
        .all(|n| header.find(n).is_some());
    let has_normals = ["nx", "ny", "nz"].iter().all(|n| header.find(n).is_some());

    let mut buffer = vec![0u8; header.vertex_size];
    let mut points = Vec::with_capacity(header.vertex_count);
    let mut colors = has_colors.then(|| Vec::with_capacity(header.vertex_count));
    let mut normals = has_normals.then(|| Vec::with_capacity(header.vertex_count));

    for _ in 0..header.vertex_count {
        reader.read_exact(&mut buffer)?;
        points.push([
            header.value("x", &buffer).unwrap(),
            header.value("y", &buffer).unwrap(),
            header.value("z", &buffer).unwrap(),
        ]);
        if let Some(colors) = colors.as_mut() {
            colors.push([
                header.value("red", &buffer).unwrap() as u8,
                header.value("green", &buffer).unwrap() as u8,
                header.value("blue", &buffer).unwrap() as u8,
            ]);
        }
        if let Some(normals) = normals.as_mut() {
            normals.push([
                header.value("nx", &buffer).unwrap(),
                header.value("ny", &buffer).unwrap(),
                header.value("nz", &buffer).unwrap(),
            ]);
        }
    }

    Ok(PointCloud::new(points, colors, normals))
}

/// Writes a point cloud as binary little-endian PLY.
///
/// Property order: position, then normals when present, then colors when
/// present.
pub fn write_point_cloud(
    path: impl AsRef<Path>,
    cloud: &PointCloud,
) -> Result<(), SceneError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "element vertex {}", cloud.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    if cloud.normals().is_some() {
        writeln!(w, "property float nx")?;
        writeln!(w, "property float ny")?;
        writeln!(w, "property float nz")?;
    }
    if cloud.colors().is_some() {
        writeln!(w, "property uchar red")?;
        writeln!(w, "property uchar green")?;
        writeln!(w, "property uchar blue")?;
    }
    writeln!(w, "end_header")?;

    for i in 0..cloud.len() {
        for v in cloud.points()[i] {
            w.write_all(&(v as f32).to_le_bytes())?;
        }
        if let Some(normals) = cloud.normals() {
            for v in normals[i] {
                w.write_all(&(v as f32).to_le_bytes())?;
            }
        }
        if let Some(colors) = cloud.colors() {
            w.write_all(&colors[i])?;
        }
    }
    Ok(())
}

/// Writes a triangle mesh as binary little-endian PLY with vertex colors.
pub fn write_mesh(path: impl AsRef<Path>, mesh: &TriangleMesh) -> Result<(), SceneError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "element vertex {}", mesh.vertices.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    writeln!(w, "property uchar red")?;
    writeln!(w, "property uchar green")?;
    writeln!(w, "property uchar blue")?;
    writeln!(w, "element face {}", mesh.triangles.len())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;

    for (vertex, color) in mesh.vertices.iter().zip(mesh.colors.iter()) {
        for v in vertex {
            w.write_all(&(*v as f32).to_le_bytes())?;
        }
        w.write_all(color)?;
    }
    for triangle in &mesh.triangles {
        w.write_all(&[3u8])?;
        for idx in triangle {
            w.write_all(&(*idx as i32).to_le_bytes())?;
        }
    }
    Ok(())
}
