//! Binary map format for depth and normal maps.
//!
//! The header is ASCII `width&height&channels&` followed by row-major
//! little-endian f32 samples, channel-interleaved.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::MvsError;

/// A row-major float map with one or more channels.
#[derive(Debug, Clone)]
pub struct BinaryMap {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl BinaryMap {
    /// Creates a zero-filled map.
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    /// Map width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Map height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Samples per pixel.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Value at (x, y, channel).
    #[inline]
    pub fn get(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + channel]
    }

    /// Sets the value at (x, y, channel).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, channel: usize, value: f32) {
        self.data[(y * self.width + x) * self.channels + channel] = value;
    }

    /// Writes the map to disk.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), MvsError> {
        let mut w = BufWriter::new(File::create(path)?);
        write!(w, "{}&{}&{}&", self.width, self.height, self.channels)?;
        for v in &self.data {
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a map from disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, MvsError> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path)?);

        let mut header = Vec::new();
        let mut dims = [0usize; 3];
        let mut dim_idx = 0;
        loop {
            let mut byte = [0u8; 1];
            r.read_exact(&mut byte)?;
            if byte[0] == b'&' {
                let text = std::str::from_utf8(&header)
                    .map_err(|_| MvsError::InvalidMapHeader(path.to_path_buf()))?;
                dims[dim_idx] = text
                    .parse()
                    .map_err(|_| MvsError::InvalidMapHeader(path.to_path_buf()))?;
                header.clear();
                dim_idx += 1;
                if dim_idx == 3 {
                    break;
                }
            } else {
                if header.len() > 20 {
                    return Err(MvsError::InvalidMapHeader(path.to_path_buf()));
                }
                header.push(byte[0]);
            }
        }

        let [width, height, channels] = dims;
        let mut data = vec![0.0f32; width * height * channels];
        let mut buf = [0u8; 4];
        for v in data.iter_mut() {
            r.read_exact(&mut buf)?;
            *v = f32::from_le_bytes(buf);
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }
}

/// A single-channel depth map.
pub type DepthMap = BinaryMap;

/// A three-channel normal map.
pub type NormalMap = BinaryMap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.bin");
        let mut map = BinaryMap::new(4, 3, 1);
        map.set(2, 1, 0, 5.25);
        map.set(3, 2, 0, -1.5);
        map.write(&path).unwrap();

        let restored = BinaryMap::read(&path).unwrap();
        assert_eq!(restored.width(), 4);
        assert_eq!(restored.height(), 3);
        assert_eq!(restored.channels(), 1);
        assert_eq!(restored.get(2, 1, 0), 5.25);
        assert_eq!(restored.get(3, 2, 0), -1.5);
        assert_eq!(restored.get(0, 0, 0), 0.0);
    }

    #[test]
    fn test_roundtrip_normals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.bin");
        let mut map = BinaryMap::new(2, 2, 3);
        map.set(1, 0, 2, -1.0);
        map.write(&path).unwrap();
        let restored = BinaryMap::read(&path).unwrap();
        assert_eq!(restored.channels(), 3);
        assert_eq!(restored.get(1, 0, 2), -1.0);
    }

    #[test]
    fn test_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"nonsense&2&1&").unwrap();
        assert!(matches!(
            BinaryMap::read(&path),
            Err(MvsError::InvalidMapHeader(_))
        ));
    }
}
