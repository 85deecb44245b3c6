use nalgebra::{Matrix3, Matrix3x4, Quaternion, Rotation3, UnitQuaternion, Vector3};

/// A rigid body transform, stored as a unit quaternion and a translation.
///
/// Image poses are camera-from-world transforms: `x_cam = R * x_world + t`.
/// The quaternion is exposed in (w, x, y, z) order to match the sparse model
/// file formats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rigid3 {
    /// Rotation component.
    pub rotation: UnitQuaternion<f64>,
    /// Translation component.
    pub translation: Vector3<f64>,
}

impl Default for Rigid3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Rigid3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Creates a transform from a rotation and a translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Creates a transform from a (w, x, y, z) quaternion and a translation.
    ///
    /// The quaternion is normalized on construction.
    pub fn from_quaternion_wxyz(q: [f64; 4], t: [f64; 3]) -> Self {
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));
        Self {
            rotation,
            translation: Vector3::new(t[0], t[1], t[2]),
        }
    }

    /// Creates a transform from a rotation matrix and a translation.
    pub fn from_matrix(r: &Matrix3<f64>, t: &Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r));
        Self {
            rotation,
            translation: *t,
        }
    }

    /// Returns the quaternion in (w, x, y, z) order.
    pub fn quaternion_wxyz(&self) -> [f64; 4] {
        let q = self.rotation.quaternion();
        [q.w, q.i, q.j, q.k]
    }

    /// Returns the translation as an array.
    pub fn translation_array(&self) -> [f64; 3] {
        [self.translation.x, self.translation.y, self.translation.z]
    }

    /// Returns the rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Applies the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        Self {
            rotation: inv_rotation,
            translation: -(inv_rotation * self.translation),
        }
    }

    /// Composes two transforms: `(a * b)(x) = a(b(x))`.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// The 3x4 matrix `[R | t]`.
    pub fn matrix3x4(&self) -> Matrix3x4<f64> {
        let r = self.rotation_matrix();
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        m.column_mut(3).copy_from(&self.translation);
        m
    }

    /// The position of the transform origin in the source frame.
    ///
    /// For a camera-from-world pose this is the camera projection center in
    /// world coordinates: `-R^T * t`.
    pub fn projection_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// The rotation angle between two transforms, in radians.
    pub fn angle_to(&self, other: &Self) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl std::ops::Mul for Rigid3 {
    type Output = Rigid3;

    fn mul(self, rhs: Rigid3) -> Rigid3 {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity() {
        let t = Rigid3::identity();
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(t.transform_point(&p), p);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.7),
            Vector3::new(1.0, -2.0, 0.5),
        );
        let p = Vector3::new(0.1, 4.0, -1.5);
        let q = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(p, q, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let a = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let b = Rigid3::new(
            UnitQuaternion::from_euler_angles(-0.4, 0.0, 0.25),
            Vector3::new(0.0, 2.0, -1.0),
        );
        let p = Vector3::new(0.5, -0.5, 2.0);
        let composed = (a * b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn test_projection_center() {
        // Camera rotated 90 degrees around z, one unit along x in camera frame.
        let pose = Rigid3::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let center = pose.projection_center();
        // x_cam = R * c + t = 0 at the projection center.
        let back = pose.transform_point(&center);
        assert_relative_eq!(back, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_quaternion_wxyz_roundtrip() {
        let pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.5, -0.1, 0.9),
            Vector3::new(3.0, 2.0, 1.0),
        );
        let q = pose.quaternion_wxyz();
        let t = pose.translation_array();
        let restored = Rigid3::from_quaternion_wxyz(q, t);
        assert_relative_eq!(
            pose.rotation.angle_to(&restored.rotation),
            0.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(pose.translation, restored.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix3x4_projection() {
        let pose = Rigid3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.1, -0.3),
            Vector3::new(0.5, 1.5, -2.5),
        );
        let p = Vector3::new(1.0, 2.0, 3.0);
        let homogeneous = nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        let via_matrix = pose.matrix3x4() * homogeneous;
        assert_relative_eq!(via_matrix, pose.transform_point(&p), epsilon = 1e-12);
    }
}
