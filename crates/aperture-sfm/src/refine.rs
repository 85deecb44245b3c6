//! Levenberg-Marquardt refinement of poses and points.
//!
//! Jacobians come from central differences; the full reconstruction pass
//! alternates camera resection and point intersection instead of a joint
//! bundle solve.

use aperture_core::Rigid3;
use aperture_scene::Reconstruction;
use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};

use crate::triangulate::triangulate_multiview;

/// Levenberg-Marquardt parameters.
#[derive(Debug, Clone)]
pub struct LmOptions {
    /// Maximum iterations.
    pub max_iters: usize,
    /// Convergence threshold on the squared-error decrease.
    pub eps: f64,
    /// Initial damping.
    pub lambda_init: f64,
    /// Damping up/down factor.
    pub lambda_mul: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iters: 30,
            eps: 1e-12,
            lambda_init: 1e-3,
            lambda_mul: 10.0,
        }
    }
}

const DIFF_STEP: f64 = 1e-7;

fn pose_from_params(x: &[f64; 6]) -> Rigid3 {
    Rigid3::new(
        UnitQuaternion::from_scaled_axis(Vector3::new(x[0], x[1], x[2])),
        Vector3::new(x[3], x[4], x[5]),
    )
}

fn residuals_sq(
    x: &[f64; 6],
    points3d: &[Vector3<f64>],
    points2d: &[[f64; 2]],
    out: &mut [f64],
) -> f64 {
    let pose = pose_from_params(x);
    let mut sum = 0.0;
    for (i, (p, obs)) in points3d.iter().zip(points2d.iter()).enumerate() {
        let cam = pose.transform_point(p);
        let (du, dv) = if cam.z > f64::EPSILON {
            (cam.x / cam.z - obs[0], cam.y / cam.z - obs[1])
        } else {
            // Behind the camera: a large, smooth penalty keeps the solver
            // pointed back toward valid poses.
            (10.0 + cam.z.abs(), 10.0 + cam.z.abs())
        };
        out[2 * i] = du;
        out[2 * i + 1] = dv;
        sum += du * du + dv * dv;
    }
    sum
}

/// Refines a camera-from-world pose by minimizing reprojection error in
/// normalized coordinates.
///
/// Returns the final RMSE and whether the optimization converged.
pub fn refine_pose(
    points3d: &[Vector3<f64>],
    points2d: &[[f64; 2]],
    pose: &mut Rigid3,
    options: &LmOptions,
) -> (f64, bool) {
    let n = points3d.len();
    if n < 3 || n != points2d.len() {
        return (f64::MAX, false);
    }

    let axis = pose.rotation.scaled_axis();
    let mut x = [
        axis.x,
        axis.y,
        axis.z,
        pose.translation.x,
        pose.translation.y,
        pose.translation.z,
    ];

    let mut residuals = vec![0.0; 2 * n];
    let mut residuals_plus = vec![0.0; 2 * n];
    let mut residuals_minus = vec![0.0; 2 * n];
    let mut jacobian = vec![[0.0; 6]; 2 * n];

    let mut error = residuals_sq(&x, points3d, points2d, &mut residuals);
    let mut lambda = options.lambda_init;
    let mut converged = false;

    for _ in 0..options.max_iters {
        // Central-difference Jacobian.
        for k in 0..6 {
            let mut xp = x;
            let mut xm = x;
            xp[k] += DIFF_STEP;
            xm[k] -= DIFF_STEP;
            residuals_sq(&xp, points3d, points2d, &mut residuals_plus);
            residuals_sq(&xm, points3d, points2d, &mut residuals_minus);
            for r in 0..2 * n {
                jacobian[r][k] = (residuals_plus[r] - residuals_minus[r]) / (2.0 * DIFF_STEP);
            }
        }

        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        for r in 0..2 * n {
            for a in 0..6 {
                jtr[a] += jacobian[r][a] * residuals[r];
                for b in 0..6 {
                    jtj[(a, b)] += jacobian[r][a] * jacobian[r][b];
                }
            }
        }

        let mut improved = false;
        for _ in 0..10 {
            let mut damped = jtj;
            for d in 0..6 {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(delta) = damped.lu().solve(&(-jtr)) else {
                lambda *= options.lambda_mul;
                continue;
            };

            let mut x_new = x;
            for k in 0..6 {
                x_new[k] += delta[k];
            }
            let error_new = residuals_sq(&x_new, points3d, points2d, &mut residuals_plus);
            if error_new < error {
                let decrease = error - error_new;
                x = x_new;
                std::mem::swap(&mut residuals, &mut residuals_plus);
                error = error_new;
                lambda = (lambda / options.lambda_mul).max(1e-12);
                improved = true;
                if decrease < options.eps {
                    converged = true;
                }
                break;
            }
            lambda *= options.lambda_mul;
        }

        if !improved {
            converged = true;
            break;
        }
        if converged {
            break;
        }
    }

    *pose = pose_from_params(&x);
    ((error / n as f64).sqrt(), converged)
}

/// Refines a 3D point against fixed poses by Gauss-Newton on the
/// reprojection error.
pub fn refine_point(
    poses: &[Rigid3],
    observations: &[[f64; 2]],
    point: &mut Vector3<f64>,
    options: &LmOptions,
) -> f64 {
    let n = poses.len();
    if n < 2 || n != observations.len() {
        return f64::MAX;
    }

    let eval = |p: &Vector3<f64>| -> f64 {
        let mut sum = 0.0;
        for (pose, obs) in poses.iter().zip(observations.iter()) {
            let cam = pose.transform_point(p);
            if cam.z > f64::EPSILON {
                sum += (cam.x / cam.z - obs[0]).powi(2) + (cam.y / cam.z - obs[1]).powi(2);
            } else {
                sum += 100.0;
            }
        }
        sum
    };

    let mut error = eval(point);
    let mut lambda = options.lambda_init;

    for _ in 0..options.max_iters {
        // Residuals and 3-column Jacobian by central differences.
        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for (pose, obs) in poses.iter().zip(observations.iter()) {
            let cam = pose.transform_point(point);
            if cam.z <= f64::EPSILON {
                continue;
            }
            let residual = [cam.x / cam.z - obs[0], cam.y / cam.z - obs[1]];
            let mut jac = [[0.0; 3]; 2];
            for k in 0..3 {
                let mut pp = *point;
                let mut pm = *point;
                pp[k] += DIFF_STEP;
                pm[k] -= DIFF_STEP;
                let cp = pose.transform_point(&pp);
                let cm = pose.transform_point(&pm);
                if cp.z <= f64::EPSILON || cm.z <= f64::EPSILON {
                    continue;
                }
                jac[0][k] = (cp.x / cp.z - cm.x / cm.z) / (2.0 * DIFF_STEP);
                jac[1][k] = (cp.y / cp.z - cm.y / cm.z) / (2.0 * DIFF_STEP);
            }
            for r in 0..2 {
                for a in 0..3 {
                    jtr[a] += jac[r][a] * residual[r];
                    for b in 0..3 {
                        jtj[(a, b)] += jac[r][a] * jac[r][b];
                    }
                }
            }
        }

        let mut improved = false;
        for _ in 0..10 {
            let mut damped = jtj;
            for d in 0..3 {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(delta) = damped.lu().solve(&(-jtr)) else {
                lambda *= options.lambda_mul;
                continue;
            };
            let candidate = *point + delta;
            let error_new = eval(&candidate);
            if error_new < error {
                let decrease = error - error_new;
                *point = candidate;
                error = error_new;
                lambda = (lambda / options.lambda_mul).max(1e-12);
                improved = true;
                if decrease < options.eps {
                    return error;
                }
                break;
            }
            lambda *= options.lambda_mul;
        }
        if !improved {
            break;
        }
    }
    error
}

/// Options for the alternating reconstruction refinement.
#[derive(Debug, Clone)]
pub struct RefineReconstructionOptions {
    /// Number of resection/intersection sweeps.
    pub num_sweeps: usize,
    /// Per-solve parameters.
    pub lm: LmOptions,
    /// Re-triangulate points from scratch before polishing them.
    pub retriangulate: bool,
}

impl Default for RefineReconstructionOptions {
    fn default() -> Self {
        Self {
            num_sweeps: 2,
            lm: LmOptions::default(),
            retriangulate: true,
        }
    }
}

/// Alternates pose refinement over all registered images with point
/// re-triangulation and refinement over all tracks.
pub fn refine_reconstruction(recon: &mut Reconstruction, options: &RefineReconstructionOptions) {
    for _ in 0..options.num_sweeps {
        // Resection: each camera against its current points.
        let image_ids: Vec<u32> = recon.registered_image_ids().to_vec();
        for image_id in image_ids {
            let Some(image) = recon.images.get(&image_id) else {
                continue;
            };
            let Some(camera) = recon.cameras.get(&image.camera_id) else {
                continue;
            };
            let mut points3d = Vec::new();
            let mut points2d = Vec::new();
            for point2 in &image.points2 {
                let Some(point3d_id) = point2.point3d_id else {
                    continue;
                };
                let Some(point) = recon.points3d.get(&point3d_id) else {
                    continue;
                };
                points3d.push(Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]));
                points2d.push({
                    let (u, v) = camera.cam_from_img(point2.xy[0], point2.xy[1]);
                    [u, v]
                });
            }
            if points3d.len() < 6 {
                continue;
            }
            let mut pose = image.cam_from_world;
            refine_pose(&points3d, &points2d, &mut pose, &options.lm);
            recon.images.get_mut(&image_id).unwrap().cam_from_world = pose;
        }

        // Intersection: each point against the refreshed poses.
        let point_ids: Vec<u64> = recon.points3d.keys().copied().collect();
        for point3d_id in point_ids {
            let Some(point) = recon.points3d.get(&point3d_id) else {
                continue;
            };
            let mut poses = Vec::new();
            let mut observations = Vec::new();
            for element in &point.track {
                let Some(image) = recon.images.get(&element.image_id) else {
                    continue;
                };
                let Some(camera) = recon.cameras.get(&image.camera_id) else {
                    continue;
                };
                let xy = &image.points2[element.point2_idx as usize].xy;
                let (u, v) = camera.cam_from_img(xy[0], xy[1]);
                poses.push(image.cam_from_world);
                observations.push([u, v]);
            }
            if poses.len() < 2 {
                continue;
            }

            let mut position = Vector3::new(point.xyz[0], point.xyz[1], point.xyz[2]);
            if options.retriangulate {
                let projs: Vec<_> = poses.iter().map(|p| p.matrix3x4()).collect();
                if let Some(initial) = triangulate_multiview(&projs, &observations) {
                    position = initial;
                }
            }
            refine_point(&poses, &observations, &mut position, &options.lm);
            recon.points3d.get_mut(&point3d_id).unwrap().xyz =
                [position.x, position.y, position.z];
        }
    }
    recon.update_point_errors();
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn scene(seed: u64, n: usize) -> (Vec<Vector3<f64>>, Rigid3) {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..n)
            .map(|_| {
                Vector3::new(
                    rng.random_range(-2.0..2.0),
                    rng.random_range(-1.5..1.5),
                    rng.random_range(4.0..9.0),
                )
            })
            .collect();
        let pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.05),
            Vector3::new(0.3, 0.1, -0.2),
        );
        (points, pose)
    }

    #[test]
    fn test_refine_pose_from_perturbed_start() {
        let (points3d, pose) = scene(1, 40);
        let points2d: Vec<[f64; 2]> = points3d
            .iter()
            .map(|p| {
                let c = pose.transform_point(p);
                [c.x / c.z, c.y / c.z]
            })
            .collect();

        let mut estimate = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.12, -0.17, 0.08),
            Vector3::new(0.35, 0.05, -0.15),
        );
        let (rmse, _) = refine_pose(&points3d, &points2d, &mut estimate, &LmOptions::default());

        assert!(rmse < 1e-8, "rmse = {}", rmse);
        assert_relative_eq!(estimate.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-6);
        assert_relative_eq!(estimate.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_refine_pose_needs_three_points() {
        let (points3d, pose) = scene(2, 2);
        let points2d = vec![[0.0, 0.0]; 2];
        let mut estimate = pose;
        let (rmse, converged) =
            refine_pose(&points3d, &points2d, &mut estimate, &LmOptions::default());
        assert_eq!(rmse, f64::MAX);
        assert!(!converged);
    }

    #[test]
    fn test_refine_point_recovers_position() {
        let truth = Vector3::new(0.4, -0.3, 6.0);
        let poses: Vec<Rigid3> = (0..3)
            .map(|i| {
                Rigid3::new(
                    UnitQuaternion::from_euler_angles(0.0, 0.03 * i as f64, 0.0),
                    Vector3::new(-0.4 * i as f64, 0.0, 0.0),
                )
            })
            .collect();
        let observations: Vec<[f64; 2]> = poses
            .iter()
            .map(|p| {
                let c = p.transform_point(&truth);
                [c.x / c.z, c.y / c.z]
            })
            .collect();

        let mut estimate = truth + Vector3::new(0.05, -0.04, 0.2);
        let error = refine_point(&poses, &observations, &mut estimate, &LmOptions::default());
        assert!(error < 1e-12, "error = {}", error);
        assert_relative_eq!(estimate, truth, epsilon = 1e-5);
    }
}
