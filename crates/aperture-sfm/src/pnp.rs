//! Absolute pose estimation: DLT inside RANSAC with local refinement.

use aperture_core::Rigid3;
use nalgebra::{DMatrix, Matrix3, Matrix3x4, UnitQuaternion, Vector3};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::refine::{refine_pose, LmOptions};
use crate::triangulate::reprojection_error_normalized;

/// Options for robust absolute pose estimation.
#[derive(Debug, Clone)]
pub struct AbsolutePoseOptions {
    /// Maximum reprojection error in normalized coordinates.
    pub max_error: f64,
    /// RANSAC confidence.
    pub confidence: f64,
    /// RANSAC iteration cap.
    pub max_iterations: usize,
    /// Sampling seed.
    pub seed: u64,
    /// Refinement parameters applied to the final inlier set.
    pub refinement: LmOptions,
}

impl Default for AbsolutePoseOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0 / 500.0,
            confidence: 0.999,
            max_iterations: 1000,
            seed: 0,
            refinement: LmOptions::default(),
        }
    }
}

/// Direct linear transform pose from at least 6 correspondences in
/// normalized camera coordinates.
pub fn pose_from_dlt(points3d: &[Vector3<f64>], points2d: &[[f64; 2]]) -> Option<Rigid3> {
    let n = points3d.len();
    if n < 6 || n != points2d.len() {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for i in 0..n {
        let p = &points3d[i];
        let (x, y) = (points2d[i][0], points2d[i][1]);
        let row = 2 * i;
        for (j, v) in [p.x, p.y, p.z, 1.0].iter().enumerate() {
            a[(row, j)] = *v;
            a[(row, 8 + j)] = -x * v;
            a[(row + 1, 4 + j)] = *v;
            a[(row + 1, 8 + j)] = -y * v;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let p_vec = v_t.row(11);
    let mut proj = Matrix3x4::<f64>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            proj[(r, c)] = p_vec[4 * r + c];
        }
    }

    // Fix the overall sign so the sample points have positive depth.
    let mut num_positive = 0;
    for p in points3d {
        let z = proj[(2, 0)] * p.x + proj[(2, 1)] * p.y + proj[(2, 2)] * p.z + proj[(2, 3)];
        if z > 0.0 {
            num_positive += 1;
        }
    }
    if num_positive * 2 < n {
        proj = -proj;
    }

    // Normalize by the third rotation row, then snap M to the closest
    // rotation matrix.
    let m = proj.fixed_view::<3, 3>(0, 0).into_owned();
    let scale = m.row(2).norm();
    if scale < 1e-12 {
        return None;
    }
    let m = m / scale;
    let t = proj.column(3) / scale;

    let svd3 = m.svd(true, true);
    let u = svd3.u?;
    let v_t3 = svd3.v_t?;
    let mut r: Matrix3<f64> = u * v_t3;
    if r.determinant() < 0.0 {
        r = -r;
    }

    Some(Rigid3::new(
        UnitQuaternion::from_matrix(&r),
        Vector3::new(t[0], t[1], t[2]),
    ))
}

fn classify_inliers(
    pose: &Rigid3,
    points3d: &[Vector3<f64>],
    points2d: &[[f64; 2]],
    max_error: f64,
) -> Vec<usize> {
    (0..points3d.len())
        .filter(|&i| {
            reprojection_error_normalized(pose, &points3d[i], &points2d[i])
                .is_some_and(|e| e < max_error)
        })
        .collect()
}

/// Robustly estimates the camera-from-world pose of an image.
///
/// Returns the refined pose and the inlier indices, or `None` when no
/// sample reaches 6 inliers.
pub fn estimate_absolute_pose(
    points3d: &[Vector3<f64>],
    points2d: &[[f64; 2]],
    options: &AbsolutePoseOptions,
) -> Option<(Rigid3, Vec<usize>)> {
    let n = points3d.len();
    if n < 6 || n != points2d.len() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut best_pose: Option<Rigid3> = None;
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut required_iterations = options.max_iterations;

    let mut iteration = 0;
    while iteration < required_iterations {
        iteration += 1;
        indices.shuffle(&mut rng);
        let sample = &indices[..6];
        let sample3d: Vec<Vector3<f64>> = sample.iter().map(|&i| points3d[i]).collect();
        let sample2d: Vec<[f64; 2]> = sample.iter().map(|&i| points2d[i]).collect();

        let Some(pose) = pose_from_dlt(&sample3d, &sample2d) else {
            continue;
        };
        let inliers = classify_inliers(&pose, points3d, points2d, options.max_error);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_pose = Some(pose);

            let ratio = best_inliers.len() as f64 / n as f64;
            let failure = 1.0 - ratio.powi(6);
            if failure < 1e-12 {
                break;
            }
            let needed = ((1.0 - options.confidence).ln() / failure.ln()).ceil() as usize;
            required_iterations = required_iterations.min(needed.max(1));
        }
    }

    let mut pose = best_pose?;
    if best_inliers.len() < 6 {
        return None;
    }

    // Refine on all inliers and reclassify.
    let inlier3d: Vec<Vector3<f64>> = best_inliers.iter().map(|&i| points3d[i]).collect();
    let inlier2d: Vec<[f64; 2]> = best_inliers.iter().map(|&i| points2d[i]).collect();
    refine_pose(&inlier3d, &inlier2d, &mut pose, &options.refinement);
    let refined_inliers = classify_inliers(&pose, points3d, points2d, options.max_error);
    if refined_inliers.len() >= best_inliers.len() {
        Some((pose, refined_inliers))
    } else {
        Some((best_pose?, best_inliers))
    }
}
