//! Oriented BRIEF descriptors over blurred grayscale patches.

use std::sync::OnceLock;

use aperture_image::GrayBuffer;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Descriptor length in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Maximum offset of a sampling point from the keypoint center.
const PATTERN_RADIUS: i32 = 12;

/// Margin required around a keypoint; covers the rotated pattern.
pub const BORDER_MARGIN: usize = 18;

/// Radius of the intensity-centroid orientation window.
pub const ORIENTATION_RADIUS: usize = 7;

fn sampling_pattern() -> &'static [([i32; 2], [i32; 2]); 256] {
    static PATTERN: OnceLock<[([i32; 2], [i32; 2]); 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Fixed seed: the pattern is part of the descriptor definition and
        // must not change between runs.
        let mut rng = StdRng::seed_from_u64(0x5143_4242);
        let mut pattern = [([0i32; 2], [0i32; 2]); 256];
        for pair in pattern.iter_mut() {
            *pair = (
                [
                    rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                ],
                [
                    rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                ],
            );
        }
        pattern
    })
}

/// Dominant orientation of a patch via the intensity centroid.
pub fn orientation(img: &GrayBuffer, x: usize, y: usize) -> f32 {
    let radius = ORIENTATION_RADIUS as i64;
    let mut m10 = 0f64;
    let mut m01 = 0f64;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            if let Some(v) = img.get_checked(x as i64 + dx, y as i64 + dy) {
                m10 += dx as f64 * v as f64;
                m01 += dy as f64 * v as f64;
            }
        }
    }
    m01.atan2(m10) as f32
}

/// Computes the rotated 256-bit descriptor at a keypoint.
///
/// Returns `None` when the rotated pattern would leave the image.
pub fn describe(
    img: &GrayBuffer,
    x: f32,
    y: f32,
    orientation: f32,
) -> Option<[u8; DESCRIPTOR_BYTES]> {
    let (sin, cos) = orientation.sin_cos();
    let width = img.width() as i64;
    let height = img.height() as i64;
    let xc = x.round() as i64;
    let yc = y.round() as i64;

    let margin = BORDER_MARGIN as i64;
    if xc < margin || yc < margin || xc + margin >= width || yc + margin >= height {
        return None;
    }

    let rotate = |p: [i32; 2]| -> (i64, i64) {
        let rx = cos * p[0] as f32 - sin * p[1] as f32;
        let ry = sin * p[0] as f32 + cos * p[1] as f32;
        (xc + rx.round() as i64, yc + ry.round() as i64)
    };

    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    for (bit, (a, b)) in sampling_pattern().iter().enumerate() {
        let (ax, ay) = rotate(*a);
        let (bx, by) = rotate(*b);
        let va = img.get_checked(ax, ay)?;
        let vb = img.get_checked(bx, by)?;
        if va < vb {
            descriptor[bit / 8] |= 1 << (bit % 8);
        }
    }
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: usize, height: usize) -> GrayBuffer {
        let mut img = GrayBuffer::filled(width, height, 0.0);
        for y in 0..height {
            for x in 0..width {
                img.set(x, y, (x as f32 * 0.7 + y as f32 * 0.3) / (width + height) as f32);
            }
        }
        img
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let a = sampling_pattern();
        let b = sampling_pattern();
        assert_eq!(a[0], b[0]);
        assert_eq!(a[255], b[255]);
    }

    #[test]
    fn test_describe_is_reproducible() {
        let img = gradient_image(64, 64);
        let d1 = describe(&img, 32.0, 32.0, 0.5).unwrap();
        let d2 = describe(&img, 32.0, 32.0, 0.5).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn test_describe_rejects_border_keypoints() {
        let img = gradient_image(64, 64);
        assert!(describe(&img, 2.0, 32.0, 0.0).is_none());
        assert!(describe(&img, 32.0, 62.0, 0.0).is_none());
    }

    #[test]
    fn test_orientation_follows_gradient() {
        // Intensity increases with x, so the centroid points along +x.
        let mut img = GrayBuffer::filled(32, 32, 0.0);
        for y in 0..32 {
            for x in 0..32 {
                img.set(x, y, x as f32 / 32.0);
            }
        }
        let angle = orientation(&img, 16, 16);
        assert!(angle.abs() < 0.2, "angle = {}", angle);
    }

    #[test]
    fn test_distinct_patches_differ() {
        let img = gradient_image(64, 64);
        let mut img2 = img.clone();
        for y in 24..40 {
            for x in 24..40 {
                img2.set(x, y, 1.0 - img2.get(x, y));
            }
        }
        let d1 = describe(&img, 32.0, 32.0, 0.0).unwrap();
        let d2 = describe(&img2, 32.0, 32.0, 0.0).unwrap();
        assert_ne!(d1, d2);
    }
}
