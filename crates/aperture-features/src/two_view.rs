//! Two-view geometric verification via fundamental-matrix RANSAC.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Parameters for the robust fundamental estimation.
#[derive(Debug, Clone)]
pub struct RansacOptions {
    /// Maximum Sampson error in pixels for an inlier.
    pub max_error: f64,
    /// Desired probability of sampling at least one outlier-free set.
    pub confidence: f64,
    /// Upper bound on the number of iterations.
    pub max_iterations: usize,
    /// Seed for reproducible sampling.
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0,
            confidence: 0.999,
            max_iterations: 2000,
            seed: 0,
        }
    }
}

/// Hartley normalization: centroid to the origin, mean distance sqrt(2).
fn normalizing_transform(points: &[[f64; 2]]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let (mut cx, mut cy) = (0.0, 0.0);
    for p in points {
        cx += p[0];
        cy += p[1];
    }
    cx /= n;
    cy /= n;
    let mut mean_dist = 0.0;
    for p in points {
        mean_dist += ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt();
    }
    mean_dist /= n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0)
}

/// Estimates the fundamental matrix from at least 8 correspondences using
/// the normalized eight-point algorithm with rank-2 enforcement.
///
/// The constraint direction is `x2^T * F * x1 = 0`.
pub fn fundamental_from_correspondences(
    points1: &[[f64; 2]],
    points2: &[[f64; 2]],
) -> Option<Matrix3<f64>> {
    let n = points1.len();
    if n < 8 || n != points2.len() {
        return None;
    }

    let t1 = normalizing_transform(points1);
    let t2 = normalizing_transform(points2);

    // Accumulate A^T A of the constraint system; its eigenvector with the
    // smallest eigenvalue is the null vector even for the minimal sample.
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for i in 0..n {
        let p1 = t1 * Vector3::new(points1[i][0], points1[i][1], 1.0);
        let p2 = t2 * Vector3::new(points2[i][0], points2[i][1], 1.0);
        let (x1, y1) = (p1.x, p1.y);
        let (x2, y2) = (p2.x, p2.y);
        let row = SVector::<f64, 9>::from_column_slice(&[
            x2 * x1,
            x2 * y1,
            x2,
            y2 * x1,
            y2 * y1,
            y2,
            x1,
            y1,
            1.0,
        ]);
        ata += row * row.transpose();
    }

    let eigen = ata.symmetric_eigen();
    let mut min_idx = 0;
    for d in 1..9 {
        if eigen.eigenvalues[d] < eigen.eigenvalues[min_idx] {
            min_idx = d;
        }
    }
    let f_vec = eigen.eigenvectors.column(min_idx);
    let f_norm = Matrix3::new(
        f_vec[0], f_vec[1], f_vec[2], f_vec[3], f_vec[4], f_vec[5], f_vec[6], f_vec[7], f_vec[8],
    );

    // Enforce rank 2.
    let svd3 = f_norm.svd(true, true);
    let u = svd3.u?;
    let v_t3 = svd3.v_t?;
    let mut singular = svd3.singular_values;
    singular[2] = 0.0;
    let f_rank2 = u * Matrix3::from_diagonal(&singular) * v_t3;

    Some(t2.transpose() * f_rank2 * t1)
}

/// Sampson distance of a correspondence to an epipolar geometry, in pixels.
pub fn sampson_error(f: &Matrix3<f64>, p1: &[f64; 2], p2: &[f64; 2]) -> f64 {
    let x1 = Vector3::new(p1[0], p1[1], 1.0);
    let x2 = Vector3::new(p2[0], p2[1], 1.0);
    let fx1 = f * x1;
    let ftx2 = f.transpose() * x2;
    let numerator = x2.dot(&fx1);
    let denominator = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
    if denominator < 1e-24 {
        return f64::MAX;
    }
    (numerator * numerator / denominator).sqrt()
}

fn count_inliers(
    f: &Matrix3<f64>,
    points1: &[[f64; 2]],
    points2: &[[f64; 2]],
    max_error: f64,
) -> Vec<usize> {
    points1
        .iter()
        .zip(points2.iter())
        .enumerate()
        .filter(|(_, (p1, p2))| sampson_error(f, p1, p2) < max_error)
        .map(|(i, _)| i)
        .collect()
}

/// Robustly estimates a fundamental matrix.
///
/// Returns the model and the inlier indices, or `None` when no sample
/// produced a model with at least 8 inliers. The iteration count adapts to
/// the best inlier ratio seen so far.
pub fn estimate_fundamental_ransac(
    points1: &[[f64; 2]],
    points2: &[[f64; 2]],
    options: &RansacOptions,
) -> Option<(Matrix3<f64>, Vec<usize>)> {
    let n = points1.len();
    if n < 8 || n != points2.len() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut best_f = None;
    let mut required_iterations = options.max_iterations;

    let mut iteration = 0;
    while iteration < required_iterations {
        iteration += 1;
        indices.shuffle(&mut rng);
        let sample = &indices[..8];

        let sample1: Vec<[f64; 2]> = sample.iter().map(|&i| points1[i]).collect();
        let sample2: Vec<[f64; 2]> = sample.iter().map(|&i| points2[i]).collect();
        let Some(f) = fundamental_from_correspondences(&sample1, &sample2) else {
            continue;
        };

        let inliers = count_inliers(&f, points1, points2, options.max_error);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_f = Some(f);

            // Shrink the iteration cap as the inlier ratio improves.
            let ratio = best_inliers.len() as f64 / n as f64;
            let failure = 1.0 - ratio.powi(8);
            if failure < 1e-12 {
                break;
            }
            let needed =
                ((1.0 - options.confidence).ln() / failure.ln()).ceil() as usize;
            required_iterations = required_iterations.min(needed.max(1));
        }
    }

    let f = best_f?;
    if best_inliers.len() < 8 {
        return None;
    }

    // Refit on all inliers for the final model.
    let inlier1: Vec<[f64; 2]> = best_inliers.iter().map(|&i| points1[i]).collect();
    let inlier2: Vec<[f64; 2]> = best_inliers.iter().map(|&i| points2[i]).collect();
    let final_f = fundamental_from_correspondences(&inlier1, &inlier2).unwrap_or(f);
    let final_inliers = count_inliers(&final_f, points1, points2, options.max_error);
    if final_inliers.len() >= best_inliers.len() {
        Some((final_f, final_inliers))
    } else {
        Some((f, best_inliers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Builds correspondences from a known stereo geometry with points on a
    /// textured plane plus depth variation.
    fn synthetic_pair(
        num_points: usize,
        num_outliers: usize,
        seed: u64,
    ) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let f = 500.0;
        let (cx, cy) = (320.0, 240.0);
        // Camera 2 is translated along x and slightly rotated around y.
        let angle: f64 = 0.05;
        let (sin, cos) = angle.sin_cos();
        let baseline = 0.4;

        let mut points1 = Vec::new();
        let mut points2 = Vec::new();
        for _ in 0..num_points {
            let x = rng.random_range(-1.0..1.0);
            let y = rng.random_range(-0.75..0.75);
            let z = rng.random_range(3.0..8.0);
            points1.push([f * x / z + cx, f * y / z + cy]);
            // x_cam2 = R * p - R * c with c = (baseline, 0, 0).
            let xc = cos * (x - baseline) + sin * z;
            let zc = -sin * (x - baseline) + cos * z;
            points2.push([f * xc / zc + cx, f * y / zc + cy]);
        }
        for _ in 0..num_outliers {
            points1.push([
                rng.random_range(0.0..640.0),
                rng.random_range(0.0..480.0),
            ]);
            points2.push([
                rng.random_range(0.0..640.0),
                rng.random_range(0.0..480.0),
            ]);
        }
        (points1, points2)
    }

    #[test]
    fn test_eight_point_fits_exact_data() {
        let (p1, p2) = synthetic_pair(30, 0, 7);
        let f = fundamental_from_correspondences(&p1, &p2).unwrap();
        for (a, b) in p1.iter().zip(p2.iter()) {
            assert!(sampson_error(&f, a, b) < 1e-6);
        }
    }

    #[test]
    fn test_ransac_recovers_inliers() {
        let (p1, p2) = synthetic_pair(60, 20, 11);
        let (f, inliers) =
            estimate_fundamental_ransac(&p1, &p2, &RansacOptions::default()).unwrap();
        assert!(inliers.len() >= 60, "only {} inliers", inliers.len());
        // All planted inliers must satisfy the recovered geometry.
        for i in 0..60 {
            assert!(sampson_error(&f, &p1[i], &p2[i]) < 4.0);
        }
    }

    #[test]
    fn test_ransac_needs_eight_points() {
        let (p1, p2) = synthetic_pair(7, 0, 3);
        assert!(estimate_fundamental_ransac(&p1, &p2, &RansacOptions::default()).is_none());
    }

    #[test]
    fn test_ransac_is_deterministic() {
        let (p1, p2) = synthetic_pair(40, 10, 5);
        let a = estimate_fundamental_ransac(&p1, &p2, &RansacOptions::default()).unwrap();
        let b = estimate_fundamental_ransac(&p1, &p2, &RansacOptions::default()).unwrap();
        assert_eq!(a.1, b.1);
    }
}
