//! Two-view initialization from an essential-matrix decomposition.

use aperture_core::Rigid3;
use aperture_features::two_view::{estimate_fundamental_ransac, RansacOptions};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::triangulate::{depth, triangulate_point, triangulation_angle};

/// Options for relative pose estimation.
#[derive(Debug, Clone)]
pub struct RelativePoseOptions {
    /// Maximum Sampson error in normalized coordinates.
    pub max_error: f64,
    /// RANSAC confidence.
    pub confidence: f64,
    /// RANSAC iteration cap.
    pub max_iterations: usize,
    /// Sampling seed.
    pub seed: u64,
}

impl Default for RelativePoseOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0 / 500.0,
            confidence: 0.999,
            max_iterations: 1000,
            seed: 0,
        }
    }
}

/// A relative pose with its support.
#[derive(Debug, Clone)]
pub struct TwoViewPose {
    /// Pose of the second camera relative to the first (unit baseline).
    pub cam2_from_cam1: Rigid3,
    /// Indices of correspondences consistent with the epipolar geometry and
    /// triangulating in front of both cameras.
    pub inliers: Vec<usize>,
    /// Median triangulation angle over the inliers, in radians.
    pub median_tri_angle: f64,
}

/// Projects a fundamental-style matrix onto the essential manifold.
fn essential_from_fundamental(f: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = f.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
    Some(u * Matrix3::from_diagonal(&Vector3::new(s, s, 0.0)) * v_t)
}

/// The four (R, t) decompositions of an essential matrix.
fn decompose_essential(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();
    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Estimates the relative pose between two views from normalized
/// correspondences.
///
/// The translation has unit norm; the returned inliers pass both the
/// epipolar test and the cheirality check.
pub fn estimate_relative_pose(
    points1: &[[f64; 2]],
    points2: &[[f64; 2]],
    options: &RelativePoseOptions,
) -> Option<TwoViewPose> {
    let ransac = RansacOptions {
        max_error: options.max_error,
        confidence: options.confidence,
        max_iterations: options.max_iterations,
        seed: options.seed,
    };
    let (f, epipolar_inliers) = estimate_fundamental_ransac(points1, points2, &ransac)?;
    let e = essential_from_fundamental(&f)?;
    let candidates = decompose_essential(&e)?;

    let identity = Rigid3::identity();
    let mut best: Option<(TwoViewPose, usize)> = None;

    for (r, t) in candidates {
        let rotation = UnitQuaternion::from_matrix(&r);
        let pose = Rigid3::new(rotation, t);
        let proj1 = identity.matrix3x4();
        let proj2 = pose.matrix3x4();
        let center2 = pose.projection_center();

        let mut inliers = Vec::new();
        let mut angles = Vec::new();
        for &i in &epipolar_inliers {
            let Some(point) = triangulate_point(&proj1, &proj2, &points1[i], &points2[i]) else {
                continue;
            };
            if depth(&identity, &point) <= 0.0 || depth(&pose, &point) <= 0.0 {
                continue;
            }
            angles.push(triangulation_angle(&Vector3::zeros(), &center2, &point));
            inliers.push(i);
        }

        let support = inliers.len();
        if support == 0 {
            continue;
        }
        angles.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median_tri_angle = angles[angles.len() / 2];
        let candidate = TwoViewPose {
            cam2_from_cam1: pose,
            inliers,
            median_tri_angle,
        };
        if best.as_ref().map_or(true, |(_, s)| support > *s) {
            best = Some((candidate, support));
        }
    }

    best.map(|(pose, _)| pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn project(pose: &Rigid3, point: &Vector3<f64>) -> [f64; 2] {
        let cam = pose.transform_point(point);
        [cam.x / cam.z, cam.y / cam.z]
    }

    fn synthetic_views(
        pose2: &Rigid3,
        num_points: usize,
        seed: u64,
    ) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let pose1 = Rigid3::identity();
        let mut points1 = Vec::new();
        let mut points2 = Vec::new();
        for _ in 0..num_points {
            let point = Vector3::new(
                rng.random_range(-1.5..1.5),
                rng.random_range(-1.0..1.0),
                rng.random_range(4.0..9.0),
            );
            points1.push(project(&pose1, &point));
            points2.push(project(pose2, &point));
        }
        (points1, points2)
    }

    #[test]
    fn test_recovers_known_pose() {
        let true_pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.08, 0.01),
            // Unit-norm baseline so the scale matches the estimate.
            Vector3::new(-0.8, 0.0, 0.6),
        );
        let (p1, p2) = synthetic_views(&true_pose, 60, 21);
        let result =
            estimate_relative_pose(&p1, &p2, &RelativePoseOptions::default()).unwrap();

        assert!(result.inliers.len() >= 55, "{} inliers", result.inliers.len());
        assert_relative_eq!(
            result.cam2_from_cam1.rotation.angle_to(&true_pose.rotation),
            0.0,
            epsilon = 1e-6
        );
        // Translation is recovered up to sign-free unit scale.
        let estimated = result.cam2_from_cam1.translation.normalize();
        let expected = true_pose.translation.normalize();
        assert_relative_eq!((estimated - expected).norm(), 0.0, epsilon = 1e-6);
        assert!(result.median_tri_angle > 0.0);
    }

    #[test]
    fn test_pure_translation() {
        let true_pose = Rigid3::new(UnitQuaternion::identity(), Vector3::new(-1.0, 0.0, 0.0));
        let (p1, p2) = synthetic_views(&true_pose, 40, 5);
        let result =
            estimate_relative_pose(&p1, &p2, &RelativePoseOptions::default()).unwrap();
        assert!(result.inliers.len() >= 38);
        assert_relative_eq!(
            result.cam2_from_cam1.rotation.angle(),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_too_few_points() {
        let true_pose = Rigid3::new(UnitQuaternion::identity(), Vector3::new(-1.0, 0.0, 0.0));
        let (p1, p2) = synthetic_views(&true_pose, 5, 5);
        assert!(estimate_relative_pose(&p1, &p2, &RelativePoseOptions::default()).is_none());
    }
}
