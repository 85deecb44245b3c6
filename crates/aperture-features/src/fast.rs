//! FAST segment-test corner detection on grayscale buffers.

use aperture_image::GrayBuffer;

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const RING: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// A corner candidate with its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastCorner {
    /// Column of the corner.
    pub x: usize,
    /// Row of the corner.
    pub y: usize,
    /// Sum of absolute ring differences beyond the threshold.
    pub score: f32,
}

/// Longest circular run of set bits in a 16-bit ring mask.
fn longest_circular_run(mask: u16) -> u32 {
    if mask == u16::MAX {
        return 16;
    }
    // Doubling the mask turns circular runs into linear ones.
    let extended = ((mask as u32) << 16) | mask as u32;
    let mut best = 0u32;
    let mut run = 0u32;
    for bit in 0..32 {
        if extended & (1 << bit) != 0 {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best.min(16)
}

/// Detects FAST corners with non-maximum suppression.
///
/// A pixel is a corner when at least `arc_length` contiguous ring pixels are
/// all brighter than `center + threshold` or all darker than
/// `center - threshold`. The returned corners survive a 3x3 score
/// suppression and lie at least 3 pixels from the border.
pub fn detect(img: &GrayBuffer, threshold: f32, arc_length: usize) -> Vec<FastCorner> {
    let width = img.width();
    let height = img.height();
    if width < 7 || height < 7 {
        return vec![];
    }

    let mut scores = vec![0f32; width * height];
    for y in 3..height - 3 {
        for x in 3..width - 3 {
            let center = img.get(x, y);
            let mut bright_mask = 0u16;
            let mut dark_mask = 0u16;
            let mut ring_values = [0f32; 16];
            for (i, (dx, dy)) in RING.iter().enumerate() {
                let v = img.get((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                ring_values[i] = v;
                if v > center + threshold {
                    bright_mask |= 1 << i;
                } else if v < center - threshold {
                    dark_mask |= 1 << i;
                }
            }

            let is_bright = longest_circular_run(bright_mask) >= arc_length as u32;
            let is_dark = longest_circular_run(dark_mask) >= arc_length as u32;
            if !is_bright && !is_dark {
                continue;
            }

            let mask = if is_bright { bright_mask } else { dark_mask };
            let mut score = 0f32;
            for (i, v) in ring_values.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    score += (v - center).abs() - threshold;
                }
            }
            scores[y * width + x] = score;
        }
    }

    // 3x3 non-maximum suppression on the score map.
    let mut corners = Vec::new();
    for y in 3..height - 3 {
        for x in 3..width - 3 {
            let score = scores[y * width + x];
            if score <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'neighbors: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i32 + dx) as usize;
                    let ny = (y as i32 + dy) as usize;
                    if scores[ny * width + nx] > score {
                        is_max = false;
                        break 'neighbors;
                    }
                }
            }
            if is_max {
                corners.push(FastCorner { x, y, score });
            }
        }
    }
    corners
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_circular_run() {
        assert_eq!(longest_circular_run(0), 0);
        assert_eq!(longest_circular_run(0b0000_0000_0000_1111), 4);
        // Wraps around the ring boundary.
        assert_eq!(longest_circular_run(0b1100_0000_0000_0011), 4);
        assert_eq!(longest_circular_run(u16::MAX), 16);
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let img = GrayBuffer::filled(32, 32, 0.5);
        assert!(detect(&img, 0.05, 9).is_empty());
    }

    #[test]
    fn test_bright_square_corner_detected() {
        let mut img = GrayBuffer::filled(32, 32, 0.0);
        for y in 12..32 {
            for x in 12..32 {
                img.set(x, y, 1.0);
            }
        }
        let corners = detect(&img, 0.1, 9);
        assert!(!corners.is_empty());
        // The strongest response sits near the square corner.
        let best = corners
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap())
            .unwrap();
        assert!(best.x.abs_diff(12) <= 2, "x = {}", best.x);
        assert!(best.y.abs_diff(12) <= 2, "y = {}", best.y);
    }

    #[test]
    fn test_dark_corner_detected() {
        let mut img = GrayBuffer::filled(32, 32, 1.0);
        for y in 0..16 {
            for x in 0..16 {
                img.set(x, y, 0.0);
            }
        }
        assert!(!detect(&img, 0.1, 9).is_empty());
    }

    #[test]
    fn test_edge_is_not_a_corner() {
        // A straight vertical edge has arcs of at most ~half the ring.
        let mut img = GrayBuffer::filled(32, 32, 0.0);
        for y in 0..32 {
            for x in 16..32 {
                img.set(x, y, 1.0);
            }
        }
        let corners = detect(&img, 0.1, 12);
        assert!(corners.is_empty(), "found {} corners", corners.len());
    }
}
