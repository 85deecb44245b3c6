use std::path::Path;

use crate::gray::GrayBuffer;

/// Error types for bitmap loading and saving.
#[derive(Debug, thiserror::Error)]
pub enum BitmapError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// Error decoding or encoding an image.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// Image dimensions do not match the pixel buffer.
    #[error("invalid image dimensions {width}x{height} for buffer of {len} pixels")]
    InvalidDimensions {
        /// Requested width.
        width: usize,
        /// Requested height.
        height: usize,
        /// Pixel buffer length.
        len: usize,
    },
}

/// An 8-bit RGB image held in memory.
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: usize,
    height: usize,
    data: Vec<[u8; 3]>,
}

impl Bitmap {
    /// Creates a bitmap from a pixel buffer in row-major order.
    pub fn from_pixels(width: usize, height: usize, data: Vec<[u8; 3]>) -> Result<Self, BitmapError> {
        if data.len() != width * height {
            return Err(BitmapError::InvalidDimensions {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Creates a bitmap filled with a constant color.
    pub fn filled(width: usize, height: usize, color: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: vec![color; width * height],
        }
    }

    /// Decodes an image file into an RGB bitmap.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BitmapError> {
        let rgb = image::open(path)?.to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let data = rgb
            .pixels()
            .map(|p| [p.0[0], p.0[1], p.0[2]])
            .collect::<Vec<_>>();
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Encodes the bitmap to a file; the format is derived from the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BitmapError> {
        let mut raw = Vec::with_capacity(self.data.len() * 3);
        for p in &self.data {
            raw.extend_from_slice(p);
        }
        let buffer = image::RgbImage::from_raw(self.width as u32, self.height as u32, raw)
            .expect("buffer length matches dimensions");
        buffer.save(path)?;
        Ok(())
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel at (x, y); panics when out of bounds.
    pub fn get(&self, x: usize, y: usize) -> [u8; 3] {
        self.data[y * self.width + x]
    }

    /// Sets the pixel at (x, y); panics when out of bounds.
    pub fn set(&mut self, x: usize, y: usize, color: [u8; 3]) {
        self.data[y * self.width + x] = color;
    }

    /// Bilinearly interpolated color at a fractional position.
    ///
    /// Returns `None` when the sample footprint leaves the image.
    pub fn bilinear(&self, x: f64, y: f64) -> Option<[f64; 3]> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = x0 + 1;
        let y1 = y0 + 1;
        if x1 >= self.width || y1 >= self.height {
            // Accept samples exactly on the last row/column.
            if x0 + 1 == self.width && (x - x0 as f64).abs() < 1e-9
                || y0 + 1 == self.height && (y - y0 as f64).abs() < 1e-9
            {
                if x0 < self.width && y0 < self.height {
                    let p = self.get(x0, y0);
                    return Some([p[0] as f64, p[1] as f64, p[2] as f64]);
                }
            }
            return None;
        }
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;
        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);
        let mut out = [0.0; 3];
        for c in 0..3 {
            let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
            let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
            out[c] = top * (1.0 - fy) + bottom * fy;
        }
        Some(out)
    }

    /// Converts to a grayscale buffer with values in [0, 1].
    pub fn to_gray(&self) -> GrayBuffer {
        let data = self
            .data
            .iter()
            .map(|p| {
                (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0
            })
            .collect();
        GrayBuffer::from_data(self.width, self.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_pixels_checks_dimensions() {
        assert!(Bitmap::from_pixels(2, 2, vec![[0, 0, 0]; 3]).is_err());
        assert!(Bitmap::from_pixels(2, 2, vec![[0, 0, 0]; 4]).is_ok());
    }

    #[test]
    fn test_bilinear_interpolation() {
        let mut bitmap = Bitmap::filled(2, 2, [0, 0, 0]);
        bitmap.set(1, 0, [100, 100, 100]);
        bitmap.set(0, 1, [100, 100, 100]);
        bitmap.set(1, 1, [200, 200, 200]);
        let center = bitmap.bilinear(0.5, 0.5).unwrap();
        assert_relative_eq!(center[0], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bilinear_out_of_bounds() {
        let bitmap = Bitmap::filled(4, 4, [10, 20, 30]);
        assert!(bitmap.bilinear(-0.5, 1.0).is_none());
        assert!(bitmap.bilinear(3.5, 1.0).is_none());
        assert!(bitmap.bilinear(1.0, 1.0).is_some());
    }

    #[test]
    fn test_to_gray_range() {
        let bitmap = Bitmap::filled(3, 3, [255, 255, 255]);
        let gray = bitmap.to_gray();
        assert_relative_eq!(gray.get(1, 1), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.png");
        let mut bitmap = Bitmap::filled(8, 6, [0, 0, 0]);
        bitmap.set(3, 2, [255, 128, 64]);
        bitmap.save(&path).unwrap();
        let loaded = Bitmap::load(&path).unwrap();
        assert_eq!(loaded.width(), 8);
        assert_eq!(loaded.height(), 6);
        assert_eq!(loaded.get(3, 2), [255, 128, 64]);
    }
}
