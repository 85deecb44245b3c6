//! DLT triangulation in normalized camera coordinates.

use aperture_core::Rigid3;
use nalgebra::{DMatrix, Matrix3x4, Matrix4, Vector3};

/// Triangulates a point from two views.
///
/// `p1` and `p2` are normalized camera coordinates (z = 1 plane); the
/// projection matrices are `[R | t]` of the camera-from-world poses.
/// Returns `None` for points at infinity.
pub fn triangulate_point(
    proj1: &Matrix3x4<f64>,
    proj2: &Matrix3x4<f64>,
    p1: &[f64; 2],
    p2: &[f64; 2],
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = p1[0] * proj1[(2, j)] - proj1[(0, j)];
        a[(1, j)] = p1[1] * proj1[(2, j)] - proj1[(1, j)];
        a[(2, j)] = p2[0] * proj2[(2, j)] - proj2[(0, j)];
        a[(3, j)] = p2[1] * proj2[(2, j)] - proj2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let solution = v_t.row(3);
    let w = solution[3];
    if w.abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(
        solution[0] / w,
        solution[1] / w,
        solution[2] / w,
    ))
}

/// Triangulates a point from any number of views (at least two).
pub fn triangulate_multiview(
    projs: &[Matrix3x4<f64>],
    points: &[[f64; 2]],
) -> Option<Vector3<f64>> {
    let n = projs.len();
    if n < 2 || n != points.len() {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 4);
    for i in 0..n {
        for j in 0..4 {
            a[(2 * i, j)] = points[i][0] * projs[i][(2, j)] - projs[i][(0, j)];
            a[(2 * i + 1, j)] = points[i][1] * projs[i][(2, j)] - projs[i][(1, j)];
        }
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let solution = v_t.row(3);
    let w = solution[3];
    if w.abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(
        solution[0] / w,
        solution[1] / w,
        solution[2] / w,
    ))
}

/// Depth of a world point in a camera frame.
pub fn depth(pose: &Rigid3, point: &Vector3<f64>) -> f64 {
    pose.transform_point(point).z
}

/// Angle in radians between the rays from two projection centers to a point.
pub fn triangulation_angle(
    center1: &Vector3<f64>,
    center2: &Vector3<f64>,
    point: &Vector3<f64>,
) -> f64 {
    let ray1 = point - center1;
    let ray2 = point - center2;
    let denom = ray1.norm() * ray2.norm();
    if denom < 1e-12 {
        return 0.0;
    }
    (ray1.dot(&ray2) / denom).clamp(-1.0, 1.0).acos()
}

/// Reprojection error of a world point in one view, in normalized units.
pub fn reprojection_error_normalized(
    pose: &Rigid3,
    point: &Vector3<f64>,
    observed: &[f64; 2],
) -> Option<f64> {
    let cam = pose.transform_point(point);
    if cam.z <= f64::EPSILON {
        return None;
    }
    let u = cam.x / cam.z;
    let v = cam.y / cam.z;
    Some(((u - observed[0]).powi(2) + (v - observed[1]).powi(2)).sqrt())
}
